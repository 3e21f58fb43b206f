//! Wire transport behind a trait seam.
//!
//! The engine never talks to reqwest directly; every attempt goes through
//! [`Transport::send`], which takes a fully built URL, headers, and body
//! and returns the raw response text. Tests substitute a scripted
//! transport, production uses [`HttpTransport`].

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// HTTP connect timeout - time to establish the TCP connection.
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout - overall time for the entire request.
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 45;

/// Transport-level failures, classified for the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Gateway-class failure (502/503/504, request timeout). Retriable.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Unrecoverable server or client fault that waiting will not fix.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// Any other network failure. Retriable.
    #[error("network error: {0}")]
    Network(String),
}

/// One HTTP POST to the API endpoint.
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Full request URL including scheme and script path.
    pub url: String,
    /// Request headers (at minimum Content-Type).
    pub headers: Vec<(String, String)>,
    /// Serialized request body, form-urlencoded or multipart.
    pub body: Vec<u8>,
}

/// Abstract transport: one call issues exactly one HTTP request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the raw response body as text.
    async fn send(&self, request: WireRequest) -> Result<String, TransportError>;
}

/// Production transport backed by a shared reqwest [`Client`].
pub struct HttpTransport {
    client: Client,
    user_agent: String,
}

impl HttpTransport {
    /// Build a transport with explicit timeouts so requests never hang
    /// indefinitely. The cookie store is enabled so the session cookies
    /// issued by `action=login` persist across requests.
    pub fn new(user_agent: impl Into<String>) -> Result<Self, TransportError> {
        let user_agent = user_agent.into();
        let client = Client::builder()
            .user_agent(user_agent.clone())
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, user_agent })
    }

    /// The configured User-Agent string.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: WireRequest) -> Result<String, TransportError> {
        debug!(url = %request.url, body_len = request.body.len(), "Sending API request");

        let mut builder = self.client.post(&request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Gateway(format!("request timeout: {e}"))
            } else if e.is_builder() || e.is_request() {
                TransportError::Fatal(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if matches!(status.as_u16(), 502 | 503 | 504) {
            return Err(TransportError::Gateway(format!("server returned {status}")));
        }
        if status.is_server_error() || status.is_client_error() {
            return Err(TransportError::Network(format!("server returned {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read response body: {e}")))
    }
}
