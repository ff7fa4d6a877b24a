use std::sync::atomic::{AtomicUsize, Ordering};

use crate::text2sql::{GenerationBackend, GenerationError, Text2SqlRequest, Text2SqlResponse};

/// Wraps a [`GenerationBackend`] and tracks whether any request is in flight.
///
/// Failures are logged and handed back to the caller untouched; nothing is retried.
#[derive(Debug)]
pub struct GenerationClient<B> {
    backend: B,
    in_flight: AtomicUsize,
}

/// Holds one count on an in-flight counter until dropped.
pub(crate) struct LoadingGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> LoadingGuard<'a> {
    pub(crate) fn enter(in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<B: GenerationBackend> GenerationClient<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub async fn generate_sql(
        &self,
        request: &Text2SqlRequest,
    ) -> Result<Text2SqlResponse, GenerationError> {
        let _loading = LoadingGuard::enter(&self.in_flight);
        tracing::debug!(
            run_query = request.wants_results(),
            limit = request.limit,
            has_conversation = request.conversation_id.is_some(),
            "sending text2sql request"
        );

        match self.backend.generate_sql(request).await {
            Ok(response) => {
                tracing::debug!(
                    has_sql = response.output.is_some(),
                    rows = response.results.as_ref().map(Vec::len),
                    run_error = response.run_error.is_some(),
                    "text2sql request completed"
                );
                Ok(response)
            }
            Err(error) => {
                tracing::error!(%error, "text2sql request failed");
                Err(error)
            }
        }
    }
}
