use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::limits::DEFAULT_LIMIT;
use crate::message::{Message, MessagePatch};
use crate::persistence::{MemoryStatePersistence, PersistenceError, StatePersistence};
use crate::text2sql::GenerationMode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            conversation_id: None,
            mode: GenerationMode::default(),
            limit: DEFAULT_LIMIT,
        }
    }
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug)]
struct StoreInner {
    state: ConversationState,
    epoch: u64,
    /// Bumped by every mutation; orders snapshots handed to persistence.
    revision: u64,
}

/// Shared conversation state.
///
/// Every operation runs inside one critical section, so readers never see a
/// half-applied mutation. After each mutation a snapshot of the whole state
/// is written to the persistence backend once the state lock is released;
/// write failures are logged and otherwise ignored.
pub struct ConversationStore {
    inner: Mutex<StoreInner>,
    persistence: Box<dyn StatePersistence>,
    /// Revision of the last snapshot handed to `persistence`.
    saved_revision: Mutex<u64>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl ConversationStore {
    /// Starts from the persisted snapshot, or from an empty state when there is
    /// none or it cannot be read.
    #[must_use]
    pub fn restore(persistence: impl StatePersistence + 'static) -> Self {
        let state = match persistence.load() {
            Ok(Some(state)) => {
                tracing::debug!(messages = state.messages.len(), "restored conversation state");
                state
            }
            Ok(None) => ConversationState::default(),
            Err(error) => {
                tracing::warn!(%error, "ignoring unreadable conversation state");
                if matches!(error, PersistenceError::Parse { .. }) {
                    match persistence.quarantine() {
                        Ok(Some(backup)) => tracing::warn!(
                            backup = %backup.display(),
                            "moved unreadable conversation state aside"
                        ),
                        Ok(None) => {}
                        Err(error) => tracing::error!(%error, "could not keep unreadable conversation state"),
                    }
                }
                ConversationState::default()
            }
        };

        Self {
            inner: Mutex::new(StoreInner {
                state,
                epoch: 0,
                revision: 0,
            }),
            persistence: Box::new(persistence),
            saved_revision: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::restore(MemoryStatePersistence::new())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.lock();
        let result = apply(&mut inner);
        self.commit(inner);
        result
    }

    /// Releases the state lock, then persists the snapshot taken under it.
    fn commit(&self, mut inner: MutexGuard<'_, StoreInner>) {
        inner.revision += 1;
        let revision = inner.revision;
        let state = inner.state.clone();
        drop(inner);

        let mut saved_revision = self
            .saved_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *saved_revision >= revision {
            return;
        }
        *saved_revision = revision;
        if let Err(error) = self.persistence.save(&state) {
            tracing::warn!(%error, "failed to persist conversation state");
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationState {
        self.lock().state.clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.lock().state.messages.clone()
    }

    #[must_use]
    pub fn message(&self, id: &str) -> Option<Message> {
        self.lock()
            .state
            .messages
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.lock().state.conversation_id.clone()
    }

    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.lock().state.mode
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.lock().state.limit
    }

    /// Incremented by every [`clear_history`](Self::clear_history).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn add_message(&self, message: Message) {
        self.mutate(|inner| inner.state.messages.push(message));
    }

    /// Appends an assistant reply and adopts the conversation id it carries,
    /// unless history was cleared after `epoch` was read.
    pub fn append_reply(
        &self,
        epoch: u64,
        message: Message,
        conversation_id: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.state.messages.push(message);
        if let Some(conversation_id) = conversation_id {
            inner.state.conversation_id = Some(conversation_id);
        }
        self.commit(inner);
        true
    }

    /// Merges `patch` into the first message with `id`. Returns `false` and
    /// leaves the state untouched when no such message exists.
    pub fn update_message(&self, id: &str, patch: &MessagePatch) -> bool {
        let mut inner = self.lock();
        let Some(message) = inner
            .state
            .messages
            .iter_mut()
            .find(|message| message.id == id)
        else {
            return false;
        };
        patch.apply(message);
        self.commit(inner);
        true
    }

    /// Applies a run outcome to message `id` and adopts the returned
    /// conversation id in the same critical section. Nothing changes when the
    /// message no longer exists.
    pub fn apply_run(
        &self,
        id: &str,
        patch: &MessagePatch,
        conversation_id: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(message) = inner
            .state
            .messages
            .iter_mut()
            .find(|message| message.id == id)
        else {
            return false;
        };
        patch.apply(message);
        if let Some(conversation_id) = conversation_id {
            inner.state.conversation_id = Some(conversation_id);
        }
        self.commit(inner);
        true
    }

    pub fn set_conversation_id(&self, conversation_id: Option<String>) {
        self.mutate(|inner| inner.state.conversation_id = conversation_id);
    }

    pub fn set_mode(&self, mode: GenerationMode) {
        self.mutate(|inner| inner.state.mode = mode);
    }

    pub fn set_limit(&self, limit: u32) {
        self.mutate(|inner| inner.state.limit = limit);
    }

    pub fn clear_history(&self) {
        self.mutate(|inner| {
            inner.state.messages.clear();
            inner.state.conversation_id = None;
            inner.epoch += 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex, OnceLock, Weak};

    use serde_json::json;
    use tempfile::TempDir;

    use super::{ConversationState, ConversationStore};
    use crate::message::{Message, MessagePatch};
    use crate::persistence::{
        FileStatePersistence, MemoryStatePersistence, PersistenceError, StatePersistence,
    };
    use crate::text2sql::GenerationMode;

    struct FailingPersistence;

    impl StatePersistence for FailingPersistence {
        fn load(&self) -> Result<Option<ConversationState>, PersistenceError> {
            Ok(None)
        }

        fn save(&self, _state: &ConversationState) -> Result<(), PersistenceError> {
            Err(PersistenceError::Serialize {
                source: serde_json::from_str::<()>("x").expect_err("invalid json"),
            })
        }
    }

    struct SharedPersistence(Arc<MemoryStatePersistence>);

    impl StatePersistence for SharedPersistence {
        fn load(&self) -> Result<Option<ConversationState>, PersistenceError> {
            self.0.load()
        }

        fn save(&self, state: &ConversationState) -> Result<(), PersistenceError> {
            self.0.save(state)
        }
    }

    /// Records, on every save, whether the store's state lock was free.
    #[derive(Default)]
    struct LockCheckingPersistence {
        store: Arc<OnceLock<Weak<ConversationStore>>>,
        lock_free_on_save: Arc<Mutex<Vec<bool>>>,
    }

    impl StatePersistence for LockCheckingPersistence {
        fn load(&self) -> Result<Option<ConversationState>, PersistenceError> {
            Ok(None)
        }

        fn save(&self, _state: &ConversationState) -> Result<(), PersistenceError> {
            if let Some(store) = self.store.get().and_then(Weak::upgrade) {
                let free = store.inner.try_lock().is_ok();
                self.lock_free_on_save
                    .lock()
                    .expect("observations lock")
                    .push(free);
            }
            Ok(())
        }
    }

    #[test]
    fn starts_with_default_state() {
        let store = ConversationStore::in_memory();
        let state = store.snapshot();
        assert!(state.messages.is_empty());
        assert!(state.conversation_id.is_none());
        assert_eq!(state.mode, GenerationMode::Conversational);
        assert_eq!(state.limit, 100);
    }

    #[test]
    fn add_message_preserves_call_order_without_loss() {
        let store = ConversationStore::in_memory();
        let messages = (0..25)
            .map(|index| Message::user(format!("prompt {index}")))
            .collect::<Vec<_>>();
        for message in &messages {
            store.add_message(message.clone());
        }

        assert_eq!(store.messages(), messages);
    }

    #[test]
    fn update_message_for_unknown_id_leaves_state_unchanged() {
        let store = ConversationStore::in_memory();
        store.add_message(Message::user("hello"));
        store.set_conversation_id(Some("conv-1".to_string()));
        let before = store.snapshot();

        let patch = MessagePatch::run_outcome(Some(Vec::new()), None, 10);
        assert!(!store.update_message("missing", &patch));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn update_message_changes_only_patched_fields() {
        let store = ConversationStore::in_memory();
        let mut assistant = Message::assistant("Lists users");
        assistant.sql = Some("SELECT * FROM users".to_string());
        assistant.explanation = Some("Lists users".to_string());
        assistant.run_error = Some("old error".to_string());
        let id = assistant.id.clone();
        store.add_message(Message::user("list users"));
        store.add_message(assistant.clone());

        let rows = vec![json!({"id": 1}).as_object().cloned().expect("object row")];
        assert!(store.update_message(&id, &MessagePatch::run_outcome(Some(rows.clone()), None, 500)));

        let updated = store.message(&id).expect("message should exist");
        assert_eq!(updated.results, Some(rows));
        assert!(updated.run_error.is_none());
        assert_eq!(updated.results_limit, Some(500));
        assert_eq!(updated.sql, assistant.sql);
        assert_eq!(updated.explanation, assistant.explanation);
        assert_eq!(updated.timestamp, assistant.timestamp);
        assert_eq!(store.messages().len(), 2);
    }

    #[test]
    fn clear_history_keeps_mode_and_limit() {
        let store = ConversationStore::in_memory();
        store.add_message(Message::user("hello"));
        store.set_conversation_id(Some("conv-1".to_string()));
        store.set_mode(GenerationMode::OneShot);
        store.set_limit(250);
        let epoch = store.epoch();

        store.clear_history();

        let state = store.snapshot();
        assert!(state.messages.is_empty());
        assert!(state.conversation_id.is_none());
        assert_eq!(state.mode, GenerationMode::OneShot);
        assert_eq!(state.limit, 250);
        assert_eq!(store.epoch(), epoch + 1);

        store.clear_history();
        assert!(store.snapshot().messages.is_empty());
    }

    #[test]
    fn append_reply_rejects_stale_writers() {
        let store = ConversationStore::in_memory();
        let epoch = store.epoch();
        store.clear_history();

        assert!(!store.append_reply(epoch, Message::assistant("late reply"), Some("old".to_string())));
        assert!(store.messages().is_empty());
        assert!(store.conversation_id().is_none());

        assert!(store.append_reply(
            store.epoch(),
            Message::assistant("fresh reply"),
            Some("conv-3".to_string())
        ));
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.conversation_id().as_deref(), Some("conv-3"));
    }

    #[test]
    fn apply_run_on_cleared_message_changes_nothing() {
        let store = ConversationStore::in_memory();
        let message = Message::assistant("Selects one");
        let id = message.id.clone();
        store.add_message(message);
        store.clear_history();

        let patch = MessagePatch::run_outcome(Some(Vec::new()), None, 100);
        assert!(!store.apply_run(&id, &patch, Some("conv-4".to_string())));
        assert!(store.conversation_id().is_none());
    }

    #[test]
    fn every_mutation_is_persisted_and_restorable() {
        let backing = Arc::new(MemoryStatePersistence::new());
        let store = ConversationStore::restore(SharedPersistence(Arc::clone(&backing)));
        store.add_message(Message::user("hello"));
        store.set_mode(GenerationMode::OneShot);
        store.set_conversation_id(Some("conv-2".to_string()));

        let saved = backing.saved().expect("state should be saved");
        assert_eq!(saved, store.snapshot());

        let restored = ConversationStore::restore(SharedPersistence(backing));
        assert_eq!(restored.snapshot(), store.snapshot());
    }

    #[test]
    fn persistence_failures_do_not_block_mutations() {
        let store = ConversationStore::restore(FailingPersistence);
        store.add_message(Message::user("still stored"));
        store.set_limit(5);

        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.limit(), 5);
    }

    #[test]
    fn concurrent_writers_never_lose_messages() {
        let store = Arc::new(ConversationStore::in_memory());
        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for index in 0..50 {
                        store.add_message(Message::user(format!("{worker}-{index}")));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("writer panicked");
        }

        let messages = store.messages();
        assert_eq!(messages.len(), 200);
        let mut ids = messages.iter().map(|m| m.id.clone()).collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn saves_run_after_the_state_lock_is_released() {
        let persistence = LockCheckingPersistence::default();
        let slot = Arc::clone(&persistence.store);
        let observations = Arc::clone(&persistence.lock_free_on_save);
        let store = Arc::new(ConversationStore::restore(persistence));
        slot.set(Arc::downgrade(&store))
            .expect("store slot should be empty");

        let message = Message::assistant("Selects one");
        let id = message.id.clone();
        store.add_message(message);
        store.set_limit(500);
        assert!(store.apply_run(&id, &MessagePatch::run_outcome(Some(Vec::new()), None, 500), None));
        assert!(store.append_reply(store.epoch(), Message::assistant("again"), None));

        let observations = observations.lock().expect("observations lock").clone();
        assert_eq!(observations, vec![true; 4]);
    }

    #[test]
    fn concurrent_writers_leave_latest_state_persisted() {
        let backing = Arc::new(MemoryStatePersistence::new());
        let store = Arc::new(ConversationStore::restore(SharedPersistence(Arc::clone(
            &backing,
        ))));
        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for index in 0..25 {
                        store.add_message(Message::user(format!("{worker}-{index}")));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("writer panicked");
        }

        assert_eq!(backing.saved(), Some(store.snapshot()));
        assert_eq!(store.messages().len(), 100);
    }

    #[test]
    fn empty_state_file_restores_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("chat-storage.json");
        fs::write(&path, "").expect("failed to write file");

        let store = ConversationStore::restore(FileStatePersistence::from_path(&path));
        assert_eq!(store.snapshot(), ConversationState::default());
    }

    #[test]
    fn unparsable_state_file_is_kept_aside_before_next_save() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("chat-storage.json");
        fs::write(&path, "{\"messages\": [oops").expect("failed to write file");

        let store = ConversationStore::restore(FileStatePersistence::from_path(&path));
        assert_eq!(store.snapshot(), ConversationState::default());

        let backups = fs::read_dir(temp_dir.path())
            .expect("failed to list temp directory")
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|candidate| candidate != &path)
            .collect::<Vec<_>>();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            fs::read_to_string(&backups[0]).expect("backup should be readable"),
            "{\"messages\": [oops"
        );

        store.add_message(Message::user("hello again"));
        let saved: ConversationState =
            serde_json::from_str(&fs::read_to_string(&path).expect("state should be written"))
                .expect("state should be valid JSON");
        assert_eq!(saved.messages.len(), 1);
        assert_eq!(
            fs::read_to_string(&backups[0]).expect("backup should survive the save"),
            "{\"messages\": [oops"
        );
    }
}
