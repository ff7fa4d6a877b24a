use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::Row;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub enum GenerationMode {
    #[default]
    #[serde(rename = "conversational")]
    Conversational,
    #[serde(rename = "one-shot")]
    OneShot,
}

impl GenerationMode {
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::Conversational => Self::OneShot,
            Self::OneShot => Self::Conversational,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Conversational => "Conversational",
            Self::OneShot => "One-Shot",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Conversational => {
                "Conversational mode: Allows clarifying questions when the request is ambiguous"
            }
            Self::OneShot => "One-shot mode: Immediate SQL generation",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Conversational => "conversational",
            Self::OneShot => "one-shot",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Text2SqlRequest {
    pub prompt: String,
    #[serde(rename = "runQuery", default, skip_serializing_if = "Option::is_none")]
    pub run_query: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(
        rename = "conversationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GenerationMode>,
    #[serde(
        rename = "connectionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_id: Option<String>,
}

impl Text2SqlRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn wants_results(&self) -> bool {
        self.run_query.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Text2SqlResponse {
    /// Generated SQL; `None` when the service could not produce a statement.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Row>>,
    #[serde(rename = "runError", default, skip_serializing_if = "Option::is_none")]
    pub run_error: Option<String>,
    #[serde(
        rename = "conversationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
    #[serde(
        rename = "databaseType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub database_type: Option<String>,
    /// Fields this client does not model, kept so proxies forward them untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("text2sql service is not configured: {0}")]
    Configuration(String),
    #[error("failed to reach text2sql service: {0}")]
    Transport(String),
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("invalid response from text2sql service: {0}")]
    Decode(String),
}

impl GenerationError {
    /// Builds an upstream error from a non-success status and its raw body.
    ///
    /// The message is the body's `error` field when present, otherwise a
    /// status-line description.
    #[must_use]
    pub fn from_status(status: u16, reason: Option<&str>, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|message| !message.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                format!("API request failed: {status} {}", reason.unwrap_or_default())
                    .trim_end()
                    .to_string()
            });
        Self::Upstream { status, message }
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_sql(
        &self,
        request: &Text2SqlRequest,
    ) -> Result<Text2SqlResponse, GenerationError>;
}
