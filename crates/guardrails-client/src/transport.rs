use std::collections::BTreeMap;
use std::time::Duration;

use guardrails_core::error::{AppError, NetworkErrorKind, TransportError};
use guardrails_core::models::RawResponse;
use guardrails_core::traits::Transport;
use reqwest::Client;
use url::Url;

const USER_AGENT: &str = "GuardrailsBot/1.0 (+https://example.com)";

/// HTTP transport using reqwest.
///
/// Issues a single GET per call and returns whatever status the server
/// answered with; retrying and classification happen in the engine.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, url: &str) -> Result<RawResponse, TransportError> {
        validate_scheme(url)?;

        let response = self.client.get(url).send().await.map_err(map_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::network(NetworkErrorKind::Timeout, e.to_string())
            } else {
                TransportError::network(
                    NetworkErrorKind::Body,
                    format!("Failed to read response body: {e}"),
                )
            }
        })?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// Only `http` and `https` URLs are fetched.
fn validate_scheme(url: &str) -> Result<(), TransportError> {
    let parsed =
        Url::parse(url).map_err(|e| TransportError::InvalidRequest(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(TransportError::InvalidRequest(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        return TransportError::InvalidRequest(e.to_string());
    }

    let kind = if e.is_timeout() {
        NetworkErrorKind::Timeout
    } else if e.is_connect() {
        if looks_like_dns_failure(&e) {
            NetworkErrorKind::Dns
        } else {
            NetworkErrorKind::Connect
        }
    } else if e.is_body() || e.is_decode() {
        NetworkErrorKind::Body
    } else {
        NetworkErrorKind::Reset
    };
    TransportError::network(kind, e.to_string())
}

/// reqwest folds resolver errors into connect errors; the source chain
/// still names them.
fn looks_like_dns_failure(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        let msg = err.to_string().to_lowercase();
        if msg.contains("dns") || msg.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}
