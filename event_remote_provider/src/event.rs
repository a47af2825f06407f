// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event topic patterns.
//!
//! Handlers subscribe with event-admin style patterns: a literal topic, the
//! all-topics wildcard `*`, or a prefix pattern `prefix/*`. Matching is by
//! string prefix rather than MQTT level semantics; each pattern also maps
//! to the MQTT topic filter used for the broker subscription.

use std::cmp::{Eq, PartialEq};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

/// Error when parsing an event topic pattern
#[derive(Error, Debug)]
pub enum PatternParseError {
    /// The pattern is empty
    #[error("must be at least one character long")]
    Empty,
    /// `*` may only appear alone or as a trailing `/*` segment
    #[error("'*' may only be used alone or as a trailing '/*': {0}")]
    MisplacedWildcard(String),
    /// MQTT wildcard characters are not valid in event topics
    #[error("MQTT wildcard characters not allowed in event topic pattern: {0}")]
    MqttWildcard(String),
}

#[derive(Debug, Clone)]
enum PatternKind {
    /// Matches exactly one topic
    Exact,
    /// Matches every topic
    All,
    /// Matches every topic below the prefix (exclusive)
    Prefix(String),
}

/// An event-admin topic pattern.
#[derive(Debug, Clone)]
pub struct EventPattern {
    raw: String,
    kind: PatternKind,
}

impl EventPattern {
    /// Get the pattern formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Check if the pattern matches the given event topic.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match &self.kind {
            PatternKind::Exact => self.raw == topic,
            PatternKind::All => true,
            PatternKind::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    /// The MQTT topic filter used to receive topics matching this pattern.
    ///
    /// The filter may be wider than the pattern (an MQTT multi-level
    /// wildcard also matches its parent level); receivers re-match against
    /// the pattern before delivery.
    #[must_use]
    pub fn as_mqtt_filter(&self) -> String {
        match &self.kind {
            PatternKind::Exact => self.raw.clone(),
            PatternKind::All => "#".to_string(),
            PatternKind::Prefix(prefix) => format!("{prefix}#"),
        }
    }
}

impl FromStr for EventPattern {
    type Err = PatternParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PatternParseError::Empty);
        }
        if s.contains('+') || s.contains('#') {
            return Err(PatternParseError::MqttWildcard(s.to_string()));
        }
        let kind = if s == "*" {
            PatternKind::All
        } else if let Some(prefix) = s.strip_suffix("/*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(PatternParseError::MisplacedWildcard(s.to_string()));
            }
            PatternKind::Prefix(format!("{prefix}/"))
        } else if s.contains('*') {
            return Err(PatternParseError::MisplacedWildcard(s.to_string()));
        } else {
            PatternKind::Exact
        };
        Ok(EventPattern {
            raw: s.to_string(),
            kind,
        })
    }
}

impl Hash for EventPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The kind is derived from the raw pattern
        self.raw.hash(state);
    }
}

impl PartialEq for EventPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for EventPattern {}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case("sensor/temperature"; "literal")]
    #[test_case("*"; "all wildcard")]
    #[test_case("sensor/*"; "prefix wildcard")]
    #[test_case("a/b/c/*"; "deep prefix wildcard")]
    fn valid_patterns(pattern: &str) {
        let parsed = EventPattern::from_str(pattern).unwrap();
        assert_eq!(parsed.as_str(), pattern);
    }

    #[test_case(""; "empty")]
    #[test_case("/*"; "prefix wildcard without prefix")]
    #[test_case("sensor/*/temperature"; "embedded wildcard")]
    #[test_case("sensor*"; "wildcard inside segment")]
    #[test_case("sensor/*/*"; "double wildcard")]
    #[test_case("sensor/+"; "mqtt single level wildcard")]
    #[test_case("sensor/#"; "mqtt multi level wildcard")]
    fn invalid_patterns(pattern: &str) {
        assert!(EventPattern::from_str(pattern).is_err());
    }

    #[test_case("sensor/temperature", "sensor/temperature", true; "literal match")]
    #[test_case("sensor/temperature", "sensor/humidity", false; "literal mismatch")]
    #[test_case("*", "anything/at/all", true; "all matches everything")]
    #[test_case("sensor/*", "sensor/temperature", true; "prefix match")]
    #[test_case("sensor/*", "sensor/temperature/celsius", true; "deep prefix match")]
    #[test_case("sensor/*", "sensor", false; "prefix does not match the prefix itself")]
    #[test_case("sensor/*", "sensors/temperature", false; "prefix requires separator")]
    fn matching(pattern: &str, topic: &str, matches: bool) {
        let pattern = EventPattern::from_str(pattern).unwrap();
        assert_eq!(pattern.matches(topic), matches);
    }

    #[test_case("sensor/temperature", "sensor/temperature"; "literal maps to itself")]
    #[test_case("*", "#"; "all maps to multi level wildcard")]
    #[test_case("sensor/*", "sensor/#"; "prefix maps to multi level wildcard")]
    fn mqtt_filters(pattern: &str, filter: &str) {
        let pattern = EventPattern::from_str(pattern).unwrap();
        assert_eq!(pattern.as_mqtt_filter(), filter);
    }
}
