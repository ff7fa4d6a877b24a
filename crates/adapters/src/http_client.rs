use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlchat_core::text2sql::{
    GenerationBackend, GenerationError, Text2SqlRequest, Text2SqlResponse,
};

/// Route served by the local proxy.
pub const PROXY_ROUTE: &str = "/api/text2sql";
/// Route of the hosted generation API.
pub const GENERATE_SQL_ROUTE: &str = "/api/external/generate-sql";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Credentials {
    None,
    Bearer(Option<String>),
}

/// [`GenerationBackend`] speaking JSON over HTTP, either to the proxy or
/// straight to the hosted API.
#[derive(Debug, Clone)]
pub struct HttpGenerationBackend {
    client: Client,
    endpoint: String,
    credentials: Credentials,
}

impl HttpGenerationBackend {
    #[must_use]
    pub fn via_proxy(base_url: &str) -> Self {
        Self::via_proxy_with_client(Client::new(), base_url)
    }

    #[must_use]
    pub fn via_proxy_with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: join_url(base_url, PROXY_ROUTE),
            credentials: Credentials::None,
        }
    }

    /// A missing key is reported as a configuration error on the first call,
    /// before anything is sent.
    #[must_use]
    pub fn direct(base_url: &str, api_key: Option<String>) -> Self {
        Self::direct_with_client(Client::new(), base_url, api_key)
    }

    #[must_use]
    pub fn direct_with_client(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: join_url(base_url, GENERATE_SQL_ROUTE),
            credentials: Credentials::Bearer(api_key.filter(|key| !key.trim().is_empty())),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn has_api_key(&self) -> bool {
        matches!(self.credentials, Credentials::Bearer(Some(_)))
    }

    /// Posts an arbitrary JSON object, keeping fields the typed request does
    /// not model.
    pub async fn forward(
        &self,
        body: &Map<String, Value>,
    ) -> Result<Text2SqlResponse, GenerationError> {
        self.post(body).await
    }

    async fn post<T>(&self, body: &T) -> Result<Text2SqlResponse, GenerationError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let mut builder = self.client.post(&self.endpoint).json(body);
        match &self.credentials {
            Credentials::None => {}
            Credentials::Bearer(Some(api_key)) => builder = builder.bearer_auth(api_key),
            Credentials::Bearer(None) => {
                return Err(GenerationError::Configuration(
                    "TEXT2SQL_API_KEY is not configured".to_string(),
                ));
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|error| GenerationError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| GenerationError::Transport(error.to_string()))?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), endpoint = %self.endpoint, "text2sql request rejected");
            return Err(GenerationError::from_status(
                status.as_u16(),
                status.canonical_reason(),
                &body,
            ));
        }

        serde_json::from_str(&body).map_err(|error| GenerationError::Decode(error.to_string()))
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate_sql(
        &self,
        request: &Text2SqlRequest,
    ) -> Result<Text2SqlResponse, GenerationError> {
        self.post(request).await
    }
}

fn join_url(base_url: &str, route: &str) -> String {
    format!("{}{route}", base_url.trim().trim_end_matches('/'))
}
