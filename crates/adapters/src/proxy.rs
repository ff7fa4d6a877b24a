//! Credential-injecting proxy in front of the hosted generation API.
//!
//! The browser-side client never sees the API key or the default connection
//! id; both are held here and added to every forwarded request.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde_json::{json, Map, Value};
use sqlchat_core::settings::ProxySettings;
use sqlchat_core::text2sql::{GenerationError, Text2SqlResponse};
use thiserror::Error;

use crate::http_client::{HttpGenerationBackend, PROXY_ROUTE};

pub const HEALTH_ROUTE: &str = "/api/health";
pub const MISSING_API_KEY_MESSAGE: &str = "TEXT2SQL_API_KEY is not configured";
pub const PROXY_FAILURE_MESSAGE: &str = "Failed to process request";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("TEXT2SQL_API_KEY is not configured")]
    MissingApiKey,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error(transparent)]
    Upstream(#[from] GenerationError),
}

impl From<JsonRejection> for ProxyError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            ProxyError::MissingApiKey | ProxyError::Upstream(GenerationError::Configuration(_)) => {
                tracing::error!("text2sql proxy called without an API key");
                MISSING_API_KEY_MESSAGE
            }
            ProxyError::InvalidBody(_) | ProxyError::Upstream(_) => {
                tracing::error!(error = %self, "text2sql proxy request failed");
                PROXY_FAILURE_MESSAGE
            }
        };

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": message })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyState {
    settings: Arc<ProxySettings>,
    upstream: HttpGenerationBackend,
}

impl ProxyState {
    #[must_use]
    pub fn new(settings: ProxySettings) -> Self {
        Self::with_client(settings, Client::new())
    }

    #[must_use]
    pub fn with_client(settings: ProxySettings, client: Client) -> Self {
        let upstream = HttpGenerationBackend::direct_with_client(
            client,
            &settings.base_url,
            settings.api_key.clone(),
        );
        Self {
            settings: Arc::new(settings),
            upstream,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(PROXY_ROUTE, post(generate_sql))
        .route(HEALTH_ROUTE, get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn generate_sql(
    State(state): State<ProxyState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<Text2SqlResponse>, ProxyError> {
    if !state.upstream.has_api_key() {
        return Err(ProxyError::MissingApiKey);
    }
    let Json(mut body) = payload?;

    let wants_results = body.get("runQuery").is_some_and(is_truthy);
    body.insert("runQuery".to_string(), Value::Bool(true));
    match &state.settings.connection_id {
        Some(connection_id) => {
            body.insert(
                "connectionID".to_string(),
                Value::String(connection_id.clone()),
            );
        }
        None => {
            body.remove("connectionID");
        }
    }
    tracing::info!(
        wants_results,
        limit = body.get("limit").and_then(serde_json::Value::as_u64),
        has_conversation = body.get("conversationID").is_some_and(is_truthy),
        "forwarding text2sql request"
    );

    let mut response = state.upstream.forward(&body).await?;
    if !wants_results {
        response.results = None;
    }
    Ok(Json(response))
}

/// JSON truthiness as loosely typed clients send it (`"runQuery": 1`).
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n.abs() > 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
