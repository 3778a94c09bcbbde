//! HTTP Research Agent
//!
//! Talks to the research agent service over HTTP:
//! - `POST /research/stream` - start a query, response body is the frame stream
//! - `GET /health` - liveness probe
//!
//! The client has a connect timeout but no overall request timeout: a research
//! query may legitimately stream for minutes. Stalls are bounded by the relay,
//! which times out each individual chunk read instead.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::traits::{ChunkStream, ResearchAgent};
use crate::error::AbortReason;
use crate::messages::QueryRequest;

/// Default agent address
pub const DEFAULT_AGENT_URL: &str = "http://localhost:8001";

/// Longest upstream error body quoted in logs
const MAX_ERROR_BODY: usize = 512;

/// How long to wait for an error body before giving up on it
const ERROR_BODY_TIMEOUT: Duration = Duration::from_millis(250);

/// Research agent reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpResearchAgent {
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpResearchAgent {
    /// Create an agent client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> reqwest::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Create from environment variables
    ///
    /// Reads `RESEARCH_AGENT_URL`, falling back to `PYTHON_AGENT_URL`, then to
    /// [`DEFAULT_AGENT_URL`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_env() -> reqwest::Result<Self> {
        let url = std::env::var("RESEARCH_AGENT_URL")
            .or_else(|_| std::env::var("PYTHON_AGENT_URL"))
            .unwrap_or_else(|_| DEFAULT_AGENT_URL.to_string());
        Self::new(url, Duration::from_secs(10))
    }

    /// Base URL of the agent
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_url(&self) -> String {
        format!("{}/research/stream", self.base_url)
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    body
}

/// The start of an error response body, for logging
///
/// Reads at most [`MAX_ERROR_BODY`] bytes within [`ERROR_BODY_TIMEOUT`];
/// the rest of the body is dropped with the response.
async fn error_excerpt(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    let read = async {
        while let Some(Ok(chunk)) = chunks.next().await {
            body.extend_from_slice(&chunk);
            if body.len() >= MAX_ERROR_BODY {
                break;
            }
        }
    };
    if tokio::time::timeout(ERROR_BODY_TIMEOUT, read).await.is_err() {
        tracing::debug!("Gave up waiting for the agent's error body");
    }
    truncate(String::from_utf8_lossy(&body).into_owned())
}

#[async_trait]
impl ResearchAgent for HttpResearchAgent {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(self.health_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.health_url(), error = %e, "Agent health check failed");
                false
            }
        }
    }

    async fn open_stream(&self, request: &QueryRequest) -> Result<ChunkStream, AbortReason> {
        let response = self
            .http_client
            .post(self.stream_url())
            .json(&request.agent_body())
            .send()
            .await
            .map_err(|e| AbortReason::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = error_excerpt(response).await;
            tracing::warn!(%status, %body, "Research agent rejected query");
            return Err(AbortReason::UpstreamUnavailable(format!(
                "agent returned {status}"
            )));
        }

        tracing::debug!(thread_id = %request.thread_id, "Research stream opened");

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| AbortReason::UpstreamUnavailable(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}
