use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::conversation_store::ConversationStore;
use crate::generation_client::{GenerationClient, LoadingGuard};
use crate::message::{Message, MessagePatch};
use crate::text2sql::{GenerationBackend, GenerationError, Text2SqlRequest, Text2SqlResponse};

pub const FALLBACK_REPLY: &str =
    "Sorry, I encountered an error processing your request. Please try again.";
pub const DEFAULT_REPLY: &str = "Generated SQL query";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("message `{0}` was not found")]
    MessageNotFound(String),
    #[error("message `{0}` has no SQL to run")]
    NoSql(String),
    #[error("a run is already in progress for message `{0}`")]
    RunAlreadyInFlight(String),
    #[error("history was cleared before the reply arrived")]
    HistoryCleared,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Sent as `connectionID` on every request when set.
    pub connection_id: Option<String>,
    /// Execute freshly generated SQL right away instead of waiting for a run.
    pub run_on_send: bool,
}

/// Conversation workflow on top of a store and a generation client.
///
/// Runs are exclusive per message: while one is in flight for a message id,
/// further runs for that id are refused before any request is sent. Sends
/// are tracked apart from runs, so a pending run never blocks the prompt.
#[derive(Debug)]
pub struct ChatSession<B> {
    store: Arc<ConversationStore>,
    client: GenerationClient<B>,
    options: SessionOptions,
    sending: AtomicUsize,
    running: Mutex<HashSet<String>>,
}

struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    message_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.message_id);
    }
}

impl<B: GenerationBackend> ChatSession<B> {
    #[must_use]
    pub fn new(store: Arc<ConversationStore>, backend: B, options: SessionOptions) -> Self {
        Self {
            store,
            client: GenerationClient::new(backend),
            options,
            sending: AtomicUsize::new(0),
            running: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    #[must_use]
    pub fn client(&self) -> &GenerationClient<B> {
        &self.client
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// True while any request is in flight, sends and runs alike.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.client.is_loading()
    }

    /// True while a prompt sent through [`Self::send_prompt`] awaits its reply.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn is_running(&self, message_id: &str) -> bool {
        self.running_set().contains(message_id)
    }

    fn running_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_run(&self, message_id: &str) -> Result<RunGuard<'_>, SessionError> {
        if !self.running_set().insert(message_id.to_string()) {
            return Err(SessionError::RunAlreadyInFlight(message_id.to_string()));
        }
        Ok(RunGuard {
            running: &self.running,
            message_id: message_id.to_string(),
        })
    }

    /// Sends a new prompt and appends the reply as an assistant message.
    ///
    /// On a failed request the fallback reply is appended instead and the
    /// error is returned.
    pub async fn send_prompt(&self, content: &str) -> Result<Message, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let _sending = LoadingGuard::enter(&self.sending);

        let epoch = self.store.epoch();
        self.store.add_message(Message::user(content));

        let limit = self.store.limit();
        let request = Text2SqlRequest {
            prompt: content.to_string(),
            run_query: Some(self.options.run_on_send),
            limit: Some(limit),
            conversation_id: self.store.conversation_id(),
            mode: Some(self.store.mode()),
            connection_id: self.options.connection_id.clone(),
        };

        match self.client.generate_sql(&request).await {
            Ok(response) => {
                let conversation_id = non_empty(response.conversation_id.clone());
                let reply = reply_from_response(response, limit);
                if self
                    .store
                    .append_reply(epoch, reply.clone(), conversation_id)
                {
                    Ok(reply)
                } else {
                    tracing::debug!("dropping reply for cleared conversation");
                    Err(SessionError::HistoryCleared)
                }
            }
            Err(error) => {
                self.store
                    .append_reply(epoch, Message::assistant(FALLBACK_REPLY), None);
                Err(error.into())
            }
        }
    }

    /// Re-executes the SQL already attached to `message_id` with `limit`.
    ///
    /// The SQL goes back to the service as the prompt with `runQuery` set, and
    /// the outcome replaces that message's results in place. Returns `None`
    /// when the message disappeared (history cleared) before the reply came
    /// back.
    pub async fn rerun_with_limit(
        &self,
        message_id: &str,
        limit: u32,
    ) -> Result<Option<Message>, SessionError> {
        let message = self
            .store
            .message(message_id)
            .ok_or_else(|| SessionError::MessageNotFound(message_id.to_string()))?;
        let sql = message
            .sql
            .filter(|sql| !sql.trim().is_empty())
            .ok_or_else(|| SessionError::NoSql(message_id.to_string()))?;

        let _run = self.begin_run(message_id)?;
        self.store.set_limit(limit);

        let request = Text2SqlRequest {
            prompt: sql,
            run_query: Some(true),
            limit: Some(limit),
            conversation_id: self.store.conversation_id(),
            mode: Some(self.store.mode()),
            connection_id: self.options.connection_id.clone(),
        };
        let response = self.client.generate_sql(&request).await?;

        let conversation_id = non_empty(response.conversation_id);
        let patch = MessagePatch::run_outcome(response.results, response.run_error, limit);
        if self.store.apply_run(message_id, &patch, conversation_id) {
            Ok(self.store.message(message_id))
        } else {
            tracing::debug!(message_id, "run finished for a message that no longer exists");
            Ok(None)
        }
    }

    /// Runs the message's SQL with the store's current limit.
    pub async fn run_query(&self, message_id: &str) -> Result<Option<Message>, SessionError> {
        let limit = self.store.limit();
        self.rerun_with_limit(message_id, limit).await
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn reply_from_response(response: Text2SqlResponse, limit: u32) -> Message {
    let content = if response.explanation.trim().is_empty() {
        DEFAULT_REPLY.to_string()
    } else {
        response.explanation.clone()
    };

    let mut reply = Message::assistant(content);
    reply.sql = response.output;
    reply.explanation = Some(response.explanation).filter(|text| !text.is_empty());
    reply.results_limit = Some(limit);
    reply.results = response.results;
    reply.run_error = response.run_error;
    reply.database_type = response.database_type;
    reply
}
