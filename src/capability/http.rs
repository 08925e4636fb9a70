//! HTTP-backed capability provider.
//!
//! Thin JSON transport for a capability service exposing the requirement
//! endpoints (`/evaluate`, `/suggest`, `/rewrite`, `/mine`, `/graph/build`,
//! `/search`). Transport failures and 408/429/5xx responses classify as
//! transient; other client errors are fatal.

use std::env;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CallError;
use crate::workflow::types::RequirementItem;

use super::{Atom, Evaluation, GraphDelta, MinedRequirement, RequirementProvider, SearchHit};

/// Default timeout for a single HTTP request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Capability client for a JSON HTTP API.
pub struct HttpProvider {
    /// Base URL for the capability API.
    api_base: String,
    /// Optional bearer token for authentication.
    api_key: Option<String>,
    /// HTTP client for making API requests.
    http_client: Client,
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct RewriteRequest<'a> {
    text: &'a str,
    atoms: &'a [Atom],
}

#[derive(Deserialize)]
struct RewriteResponse {
    text: String,
}

#[derive(Serialize)]
struct MineRequest<'a> {
    document: &'a str,
}

#[derive(Deserialize)]
struct MineResponse {
    requirements: Vec<MinedRequirement>,
}

#[derive(Serialize)]
struct GraphBuildRequest<'a> {
    items: &'a [RequirementItem],
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SuggestResponse {
    atoms: Vec<Atom>,
}

impl HttpProvider {
    /// Creates a new provider for the given API base URL.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: None,
            http_client: Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Sets the bearer token used for authentication.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Creates a provider from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `REQFORGE_API_BASE`: Base URL for the API (required)
    /// - `REQFORGE_API_KEY`: Bearer token for authentication (optional)
    ///
    /// # Errors
    ///
    /// Returns `CallError::Fatal` if `REQFORGE_API_BASE` is not set.
    pub fn from_env() -> Result<Self, CallError> {
        let api_base = env::var("REQFORGE_API_BASE")
            .map_err(|_| CallError::fatal("REQFORGE_API_BASE is not set"))?;
        let mut provider = Self::new(api_base);
        if let Ok(key) = env::var("REQFORGE_API_KEY") {
            provider = provider.with_api_key(key);
        }
        Ok(provider)
    }

    /// Returns the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Posts a JSON body and decodes a JSON response.
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, CallError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.api_base.trim_end_matches('/'), path);
        debug!(url = %url, "Capability API call");

        let mut request = self.http_client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| CallError::fatal(format!("invalid response body: {}", e)))
        } else {
            let detail = response.text().await.unwrap_or_default();
            Err(classify_status(status, &detail))
        }
    }
}

/// Classifies a reqwest transport error.
fn classify_transport_error(err: reqwest::Error) -> CallError {
    if err.is_timeout() || err.is_connect() {
        CallError::transient(format!("request failed: {}", err))
    } else {
        CallError::fatal(format!("request failed: {}", err))
    }
}

/// Classifies a non-success HTTP status.
fn classify_status(status: StatusCode, detail: &str) -> CallError {
    let message = format!("HTTP {}: {}", status.as_u16(), detail);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        CallError::transient(message)
    } else {
        CallError::fatal(message)
    }
}

#[async_trait::async_trait]
impl RequirementProvider for HttpProvider {
    async fn evaluate(&self, text: &str) -> Result<Evaluation, CallError> {
        self.post_json("evaluate", &TextRequest { text }).await
    }

    async fn suggest(&self, text: &str) -> Result<Vec<Atom>, CallError> {
        let response: SuggestResponse = self.post_json("suggest", &TextRequest { text }).await?;
        Ok(response.atoms)
    }

    async fn rewrite(&self, text: &str, atoms: &[Atom]) -> Result<String, CallError> {
        let response: RewriteResponse =
            self.post_json("rewrite", &RewriteRequest { text, atoms }).await?;
        Ok(response.text)
    }

    async fn mine(&self, document: &str) -> Result<Vec<MinedRequirement>, CallError> {
        let response: MineResponse = self.post_json("mine", &MineRequest { document }).await?;
        Ok(response.requirements)
    }

    async fn build_graph(&self, items: &[RequirementItem]) -> Result<GraphDelta, CallError> {
        self.post_json("graph/build", &GraphBuildRequest { items })
            .await
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, CallError> {
        let response: SearchResponse =
            self.post_json("search", &SearchRequest { query, top_k }).await?;
        Ok(response.hits)
    }
}
