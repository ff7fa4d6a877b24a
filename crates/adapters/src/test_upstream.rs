//! In-process HTTP server standing in for the hosted generation API.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::Value;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub path: String,
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    status: StatusCode,
    body: Arc<str>,
}

pub(crate) struct FakeUpstream {
    pub base_url: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl FakeUpstream {
    pub(crate) async fn start(status: StatusCode, body: Value) -> Self {
        Self::start_raw(status, &body.to_string()).await
    }

    pub(crate) async fn start_raw(status: StatusCode, body: &str) -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = UpstreamState {
            calls: Arc::clone(&calls),
            status,
            body: Arc::from(body),
        };
        let app = Router::new().fallback(record).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake upstream");
        let address = listener.local_addr().expect("missing local address");
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("fake upstream stopped");
        });

        Self {
            base_url: format!("http://{address}"),
            calls,
        }
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

async fn record(
    State(state): State<UpstreamState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.calls.lock().expect("calls lock").push(RecordedCall {
        path: uri.path().to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
    });

    (
        state.status,
        [(header::CONTENT_TYPE, "application/json")],
        state.body.to_string(),
    )
        .into_response()
}
