//! Hierarchical topic names and subscription patterns.
//!
//! Topics are dot-separated keys such as `domain.sales.changed`. The bus
//! treats them as opaque channel names; patterns only exist so a consumer can
//! subscribe to a family of topics:
//!
//! - `*` matches exactly one segment (`domain.*.changed`)
//! - `#` as the last segment matches one or more remaining segments (`domain.#`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic '{0}' contains an empty segment")]
    EmptySegment(String),
    #[error("topic '{0}' contains wildcard characters")]
    Wildcard(String),
    #[error("pattern '{0}' may only use '#' as its last segment")]
    MisplacedHash(String),
}

/// A concrete topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        check_segments(&raw)?;
        if raw.contains('*') || raw.contains('#') {
            return Err(TopicError::Wildcard(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

/// A subscription pattern over topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern(String);

impl TopicPattern {
    pub fn new(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        check_segments(&raw)?;
        let segments: Vec<&str> = raw.split('.').collect();
        if let Some(pos) = segments.iter().position(|s| *s == "#") {
            if pos != segments.len() - 1 {
                return Err(TopicError::MisplacedHash(raw));
            }
        }
        Ok(Self(raw))
    }

    /// Pattern matching every topic.
    pub fn all() -> Self {
        Self("#".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut pattern = self.0.split('.');
        let mut candidate = topic.split('.');

        loop {
            match (pattern.next(), candidate.next()) {
                (Some("#"), Some(_)) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(p), Some(t)) if p == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl core::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TopicPattern::new(value)
    }
}

impl From<TopicPattern> for String {
    fn from(value: TopicPattern) -> Self {
        value.0
    }
}

impl From<Topic> for TopicPattern {
    fn from(value: Topic) -> Self {
        Self(value.0)
    }
}

fn check_segments(raw: &str) -> Result<(), TopicError> {
    if raw.trim().is_empty() {
        return Err(TopicError::Empty);
    }
    if raw.split('.').any(|s| s.trim().is_empty()) {
        return Err(TopicError::EmptySegment(raw.to_string()));
    }
    Ok(())
}
