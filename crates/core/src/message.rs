use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row as returned by the generation service: column name to JSON value.
pub type Row = Map<String, Value>;

static MESSAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_limit: Option<u32>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            content: content.into(),
            role,
            timestamp: Utc::now(),
            sql: None,
            explanation: None,
            results: None,
            run_error: None,
            database_type: None,
            results_limit: None,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// SQL with a single trailing newline removed, if the message carries any.
    #[must_use]
    pub fn display_sql(&self) -> Option<&str> {
        self.sql
            .as_deref()
            .map(|sql| sql.strip_suffix('\n').unwrap_or(sql))
    }
}

/// Fields a re-run is allowed to overwrite on an existing message.
///
/// Each field is `None` when it should be left alone and `Some(value)` when it
/// should be replaced, so `Some(None)` clears a previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub results: Option<Option<Vec<Row>>>,
    pub run_error: Option<Option<String>>,
    pub results_limit: Option<Option<u32>>,
}

impl MessagePatch {
    /// Patch that replaces the whole outcome of a run.
    #[must_use]
    pub fn run_outcome(
        results: Option<Vec<Row>>,
        run_error: Option<String>,
        results_limit: u32,
    ) -> Self {
        Self {
            results: Some(results),
            run_error: Some(run_error),
            results_limit: Some(Some(results_limit)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_none() && self.run_error.is_none() && self.results_limit.is_none()
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(results) = &self.results {
            message.results.clone_from(results);
        }
        if let Some(run_error) = &self.run_error {
            message.run_error.clone_from(run_error);
        }
        if let Some(results_limit) = self.results_limit {
            message.results_limit = results_limit;
        }
    }
}

/// Client-side id: wall-clock millis plus a process-wide sequence so that two
/// messages created in the same millisecond never collide.
#[must_use]
pub fn next_message_id() -> String {
    let sequence = MESSAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{sequence}", Utc::now().timestamp_millis())
}
