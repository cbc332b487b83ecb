use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;

/// Extract the target key from a URL (scheme://host:port).
///
/// Rate limiting and circuit state are scoped by this key, so
/// `https://example.com/a` and `https://example.com:443/b` share state.
pub fn target_key(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("{}://{}{}", url.scheme(), host, port))
}

/// One URL submitted to the orchestrator, alive until its result is produced.
#[derive(Debug)]
pub struct FetchRequest {
    url: String,
    target_key: String,
    attempt: u32,
    deadline: Duration,
    started: Instant,
}

impl FetchRequest {
    /// Fails with [`FetchError::InvalidRequest`] when no target key can be
    /// derived from `url`.
    pub fn new(url: impl Into<String>, deadline: Duration) -> Result<Self, FetchError> {
        let url = url.into();
        let target_key = target_key(&url)
            .ok_or_else(|| FetchError::InvalidRequest(format!("cannot derive host from '{url}'")))?;
        Ok(Self {
            url,
            target_key,
            attempt: 0,
            deadline,
            started: Instant::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the budget, `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_sub(self.elapsed())
            .filter(|d| !d.is_zero())
    }

    /// Start the next attempt and return its 1-indexed number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }
}

/// Raw response handed back by a transport. Header names are lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A successful response plus the time the transport call took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub latency: Duration,
}

impl FetchResponse {
    pub fn from_raw(raw: RawResponse, latency: Duration) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            latency,
        }
    }
}

/// Result of one attempt, or the final verdict for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(FetchResponse),
    TransientFailure(FetchError),
    PermanentFailure(FetchError),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Success(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Success(_) => None,
            FetchOutcome::TransientFailure(e) | FetchOutcome::PermanentFailure(e) => Some(e),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchOutcome::Success(resp) => Some(resp.status),
            FetchOutcome::TransientFailure(e) | FetchOutcome::PermanentFailure(e) => e.status(),
        }
    }
}

/// Terminal record for one submitted URL.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub target_key: String,
    pub outcome: FetchOutcome,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Structural fingerprint of the body, present only on success.
    pub fingerprint: Option<Fingerprint>,
    pub diff: Option<DiffRecord>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// True when the diff watcher flagged structural drift.
    pub fn struct_changed(&self) -> bool {
        self.diff.as_ref().is_some_and(|d| d.changed)
    }
}

/// Structural signature of a parsed document (64-char lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One element of a parsed document's skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralElement {
    pub tag: String,
    pub depth: usize,
    pub attributes: BTreeSet<String>,
}

impl StructuralElement {
    /// Tag and attribute names are lowercased; duplicate attribute names collapse.
    pub fn new<I, S>(tag: &str, depth: usize, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tag: tag.to_ascii_lowercase(),
            depth,
            attributes: attributes
                .into_iter()
                .map(|a| a.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

/// Outcome of comparing a fresh fingerprint against the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub key: String,
    pub previous: Option<Fingerprint>,
    pub current: Fingerprint,
    pub observed_at: DateTime<Utc>,
    pub changed: bool,
}

impl DiffRecord {
    /// First observation for this key.
    pub fn is_baseline(&self) -> bool {
        self.previous.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_key_extracts_authority() {
        assert_eq!(
            target_key("https://example.com/path?q=1"),
            Some("https://example.com:443".to_string())
        );
        assert_eq!(
            target_key("http://example.com:8080/page"),
            Some("http://example.com:8080".to_string())
        );
        assert_eq!(target_key("not-a-url"), None);
    }

    #[test]
    fn request_rejects_url_without_host() {
        let err = FetchRequest::new("mailto:someone@example.com", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn attempt_counter_is_monotonic() {
        let mut req = FetchRequest::new("https://example.com", Duration::from_secs(5)).unwrap();
        assert_eq!(req.attempt(), 0);
        assert_eq!(req.begin_attempt(), 1);
        assert_eq!(req.begin_attempt(), 2);
        assert_eq!(req.attempt(), 2);
    }

    #[test]
    fn remaining_is_none_for_zero_deadline() {
        let req = FetchRequest::new("https://example.com", Duration::ZERO).unwrap();
        assert!(req.remaining().is_none());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = RawResponse::new(503, "").with_header("Retry-After", "5");
        assert_eq!(raw.header("retry-after"), Some("5"));
        assert_eq!(raw.header("RETRY-AFTER"), Some("5"));
    }

    #[test]
    fn structural_element_normalizes_names() {
        let el = StructuralElement::new("DIV", 2, ["Class", "id", "class"]);
        assert_eq!(el.tag, "div");
        assert_eq!(el.attributes.len(), 2);
        assert!(el.attributes.contains("class"));
    }

    #[test]
    fn fingerprint_short_respects_char_boundaries() {
        assert_eq!(Fingerprint::new("0123456789abcdef").short(), "0123456789ab");
        assert_eq!(Fingerprint::new("abc").short(), "abc");
        assert_eq!(Fingerprint::new("ééééééééééééé").short(), "éééééééééééé");
    }
}
