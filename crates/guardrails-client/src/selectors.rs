//! Selector fallback sets.
//!
//! A field is described by an ordered list of candidates; the first one that
//! yields a non-empty value wins. The winning strategy and index are
//! reported with the value so drifting templates show up in the output
//! before extraction breaks outright.

use std::fmt;
use std::str::FromStr;

use scraper::{Html, Selector};
use serde::Serialize;

/// One way of extracting a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Text content of the first element matching the selector.
    Css(String),
    /// Value of `attribute` on the first element matching `selector`.
    Attr { selector: String, attribute: String },
}

impl Candidate {
    pub fn css(selector: impl Into<String>) -> Self {
        Candidate::Css(selector.into())
    }

    pub fn attr(selector: impl Into<String>, attribute: impl Into<String>) -> Self {
        Candidate::Attr {
            selector: selector.into(),
            attribute: attribute.into(),
        }
    }

    pub fn strategy(&self) -> SelectorStrategy {
        match self {
            Candidate::Css(_) => SelectorStrategy::Css,
            Candidate::Attr { .. } => SelectorStrategy::Attr,
        }
    }

    fn selector(&self) -> &str {
        match self {
            Candidate::Css(selector) | Candidate::Attr { selector, .. } => selector,
        }
    }
}

/// Parses `css:SELECTOR` or `attr:SELECTOR::ATTRIBUTE`.
impl FromStr for Candidate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (strategy, expr) = s
            .split_once(':')
            .ok_or_else(|| format!("Expected 'css:...' or 'attr:...', got: {s}"))?;
        match strategy {
            "css" if !expr.is_empty() => Ok(Candidate::css(expr)),
            "attr" => match expr.rsplit_once("::") {
                Some((selector, attribute)) if !selector.is_empty() && !attribute.is_empty() => {
                    Ok(Candidate::attr(selector, attribute))
                }
                _ => Err(format!("Expected 'attr:SELECTOR::ATTRIBUTE', got: {s}")),
            },
            _ => Err(format!("Unknown selector candidate: {s}")),
        }
    }
}

/// Which kind of candidate produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorStrategy {
    Css,
    Attr,
    None,
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectorStrategy::Css => "css",
            SelectorStrategy::Attr => "attr",
            SelectorStrategy::None => "none",
        };
        f.write_str(s)
    }
}

/// The extracted value together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorMatch {
    pub value: Option<String>,
    pub strategy: SelectorStrategy,
    /// Index of the winning candidate, `None` when nothing matched.
    pub idx: Option<usize>,
}

impl SelectorMatch {
    fn none() -> Self {
        Self {
            value: None,
            strategy: SelectorStrategy::None,
            idx: None,
        }
    }
}

/// Try `candidates` in order and return the first non-empty value.
///
/// Candidates whose selector does not parse are skipped. CSS candidates
/// yield the element's text nodes, each trimmed, concatenated without a
/// separator.
pub fn try_select(document: &Html, candidates: &[Candidate]) -> SelectorMatch {
    for (idx, candidate) in candidates.iter().enumerate() {
        let selector = match Selector::parse(candidate.selector()) {
            Ok(selector) => selector,
            Err(e) => {
                tracing::debug!(selector = candidate.selector(), error = %e, "Skipping invalid selector");
                continue;
            }
        };
        let Some(element) = document.select(&selector).next() else {
            continue;
        };

        let value = match candidate {
            Candidate::Css(_) => element.text().map(str::trim).collect::<String>(),
            Candidate::Attr { attribute, .. } => element
                .value()
                .attr(attribute)
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        };

        if !value.is_empty() {
            return SelectorMatch {
                value: Some(value),
                strategy: candidate.strategy(),
                idx: Some(idx),
            };
        }
    }

    SelectorMatch::none()
}

/// Headline candidates for a typical article or box-score page.
pub fn default_title_candidates() -> Vec<Candidate> {
    vec![
        Candidate::css("h1.headline"),
        Candidate::css("header h1"),
        Candidate::attr("meta[property='og:title']", "content"),
        Candidate::css("title"),
    ]
}
