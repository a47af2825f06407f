// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT topic name and topic filter utilities

use std::cmp::{Eq, PartialEq};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

/// MQTT topic level separator
const LEVEL_SEPARATOR: &str = "/";
/// MQTT topic multi-level wildcard
const MULTI_LEVEL_WILDCARD: &str = "#";
/// MQTT topic single-level wildcard
const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Error when parsing a topic name or topic filter
#[derive(Error, Debug)]
pub enum TopicParseError {
    /// The topic name or topic filter is empty
    #[error("must be at least one character long")]
    Empty,
    /// The topic name contains a wildcard character (# or +)
    #[error("wildcard characters not allowed in topic name: {0}")]
    WildcardInTopicName(String),
    /// A wildcard character (# or +) does not occupy an entire level of the topic filter
    #[error("wildcard characters must occupy an entire level of the topic filter: {0}")]
    WildcardNotAlone(String),
    /// A multi-level wildcard (#) is not the last character of the topic filter
    #[error("multi-level wildcard must be the last character specified: {0}")]
    WildcardNotLast(String),
}

/// Represents an MQTT topic name
#[derive(Debug, Clone)]
pub struct TopicName {
    /// The MQTT topic name
    topic_name: String,
    /// The levels of the MQTT topic name
    levels: Vec<String>,
}

impl TopicName {
    /// Create a new [`TopicName`] from a [`String`]
    ///
    /// # Errors
    /// [`TopicParseError`] if the string is invalid for an MQTT topic name
    pub fn from_string(topic_name: String) -> Result<TopicName, TopicParseError> {
        TopicName::check_topic_name(&topic_name)?;
        let levels = topic_name
            .split(LEVEL_SEPARATOR)
            .map(ToString::to_string)
            .collect();
        Ok(TopicName { topic_name, levels })
    }

    /// Get the [`TopicName`] formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.topic_name.as_str()
    }

    /// Check if the [`TopicName`] matches the given [`TopicFilter`]
    #[must_use]
    pub fn matches_topic_filter(&self, topic_filter: &TopicFilter) -> bool {
        topic_matches(self, topic_filter)
    }

    /// Returns true if the string is a valid MQTT topic name
    #[must_use]
    pub fn is_valid_topic_name(topic_name: &str) -> bool {
        TopicName::check_topic_name(topic_name).is_ok()
    }

    fn check_topic_name(topic_name: &str) -> Result<(), TopicParseError> {
        // Topic names must be at least one character long (4.7.3)
        if topic_name.is_empty() {
            return Err(TopicParseError::Empty);
        }
        // Wildcard characters MUST NOT be used in Topic Names (4.7.1)
        if topic_name.contains(MULTI_LEVEL_WILDCARD) || topic_name.contains(SINGLE_LEVEL_WILDCARD) {
            return Err(TopicParseError::WildcardInTopicName(topic_name.to_string()));
        }
        // NOTE: Adjacent level separators ("/") are valid and indicate a zero length level (4.7.1.1)
        Ok(())
    }
}

impl FromStr for TopicName {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::from_string(s.to_string())
    }
}

impl Hash for TopicName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Levels are derived from the topic name, so the name alone is sufficient
        self.topic_name.hash(state);
    }
}

impl PartialEq for TopicName {
    fn eq(&self, other: &Self) -> bool {
        self.topic_name == other.topic_name
    }
}

impl Eq for TopicName {}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic_name)
    }
}

/// Represents an MQTT topic filter
#[derive(Debug, Clone)]
pub struct TopicFilter {
    /// The MQTT topic filter
    topic_filter: String,
    /// The levels of the MQTT topic filter
    levels: Vec<String>,
}

impl TopicFilter {
    /// Create a new [`TopicFilter`] from a [`String`]
    ///
    /// # Errors
    /// [`TopicParseError`] if the string is invalid for an MQTT topic filter
    pub fn from_string(topic_filter: String) -> Result<TopicFilter, TopicParseError> {
        TopicFilter::check_topic_filter(&topic_filter)?;
        let levels = topic_filter
            .split(LEVEL_SEPARATOR)
            .map(ToString::to_string)
            .collect();
        Ok(TopicFilter {
            topic_filter,
            levels,
        })
    }

    /// Get the [`TopicFilter`] formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.topic_filter.as_str()
    }

    /// Check if the [`TopicFilter`] matches the given [`TopicName`]
    #[must_use]
    pub fn matches_topic_name(&self, topic_name: &TopicName) -> bool {
        topic_matches(topic_name, self)
    }

    /// Returns true if the string is a valid MQTT topic filter
    #[must_use]
    pub fn is_valid_topic_filter(topic_filter: &str) -> bool {
        TopicFilter::check_topic_filter(topic_filter).is_ok()
    }

    fn check_topic_filter(topic_filter: &str) -> Result<(), TopicParseError> {
        // Topic filters must be at least one character long (4.7.3)
        if topic_filter.is_empty() {
            return Err(TopicParseError::Empty);
        }
        let levels: Vec<&str> = topic_filter.split(LEVEL_SEPARATOR).collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.contains(MULTI_LEVEL_WILDCARD) {
                // The multi-level wildcard must occupy an entire level (4.7.1.2)
                if *level != MULTI_LEVEL_WILDCARD {
                    return Err(TopicParseError::WildcardNotAlone(topic_filter.to_string()));
                }
                // ... and must be the last level of the filter (4.7.1.2)
                if i != last {
                    return Err(TopicParseError::WildcardNotLast(topic_filter.to_string()));
                }
            } else if level.contains(SINGLE_LEVEL_WILDCARD) && *level != SINGLE_LEVEL_WILDCARD {
                // The single-level wildcard must occupy an entire level (4.7.1.3)
                return Err(TopicParseError::WildcardNotAlone(topic_filter.to_string()));
            }
        }
        Ok(())
    }
}

impl FromStr for TopicFilter {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicFilter::from_string(s.to_string())
    }
}

impl Hash for TopicFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.topic_filter.hash(state);
    }
}

impl PartialEq for TopicFilter {
    fn eq(&self, other: &Self) -> bool {
        self.topic_filter == other.topic_filter
    }
}

impl Eq for TopicFilter {}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic_filter)
    }
}

/// Match a topic name against a topic filter per the MQTT v5 wildcard rules.
fn topic_matches(topic_name: &TopicName, topic_filter: &TopicFilter) -> bool {
    let mut name_levels = topic_name.levels.iter();
    for filter_level in &topic_filter.levels {
        match filter_level.as_str() {
            // Multi-level wildcard matches the remainder of the topic,
            // including the parent level (4.7.1.2)
            MULTI_LEVEL_WILDCARD => return true,
            SINGLE_LEVEL_WILDCARD => {
                if name_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if name_levels.next().map(String::as_str) != Some(literal) {
                    return false;
                }
            }
        }
    }
    // All filter levels matched; the topic must not have levels left over
    name_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case("sport/tennis/player1"; "multi level")]
    #[test_case("sport"; "single level")]
    #[test_case("sport/"; "trailing separator")]
    #[test_case("/sport"; "leading separator")]
    #[test_case("sport trophy/result"; "embedded space")]
    fn valid_topic_name(topic_name: &str) {
        assert!(TopicName::is_valid_topic_name(topic_name));
        assert!(TopicName::from_str(topic_name).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("sport/+/player1"; "single level wildcard")]
    #[test_case("sport/#"; "multi level wildcard")]
    fn invalid_topic_name(topic_name: &str) {
        assert!(!TopicName::is_valid_topic_name(topic_name));
        assert!(TopicName::from_str(topic_name).is_err());
    }

    #[test_case("sport/tennis/player1"; "no wildcard")]
    #[test_case("sport/+/player1"; "single level wildcard")]
    #[test_case("sport/#"; "multi level wildcard")]
    #[test_case("#"; "multi level wildcard only")]
    #[test_case("+/+/+"; "multiple single level wildcards")]
    fn valid_topic_filter(topic_filter: &str) {
        assert!(TopicFilter::is_valid_topic_filter(topic_filter));
        assert!(TopicFilter::from_str(topic_filter).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("sport/tennis#"; "multi level wildcard not alone")]
    #[test_case("sport/#/results"; "multi level wildcard not last")]
    #[test_case("sport+/results"; "single level wildcard not alone")]
    fn invalid_topic_filter(topic_filter: &str) {
        assert!(!TopicFilter::is_valid_topic_filter(topic_filter));
        assert!(TopicFilter::from_str(topic_filter).is_err());
    }

    #[test_case("sport/tennis/player1", "sport/tennis/player1", true; "exact match")]
    #[test_case("sport/tennis/player1", "sport/tennis/player2", false; "exact mismatch")]
    #[test_case("sport/tennis/player1", "sport/+/player1", true; "single level wildcard match")]
    #[test_case("sport/tennis/player1", "sport/+/player2", false; "single level wildcard mismatch")]
    #[test_case("sport/tennis/player1", "sport/#", true; "multi level wildcard match")]
    #[test_case("sport", "sport/#", true; "multi level wildcard parent match")]
    #[test_case("sport/tennis/player1", "finance/#", false; "multi level wildcard mismatch")]
    #[test_case("sport/tennis/player1", "#", true; "multi level wildcard only")]
    #[test_case("sport/tennis", "sport/tennis/player1", false; "name shorter than filter")]
    #[test_case("sport/tennis/player1", "sport/tennis", false; "name longer than filter")]
    #[test_case("sport/tennis/player1", "+/+/+", true; "all single level wildcards")]
    #[test_case("sport/tennis", "+/+/+", false; "too many single level wildcards")]
    fn topic_filter_matching(topic_name: &str, topic_filter: &str, matches: bool) {
        let topic_name = TopicName::from_str(topic_name).unwrap();
        let topic_filter = TopicFilter::from_str(topic_filter).unwrap();
        assert_eq!(topic_filter.matches_topic_name(&topic_name), matches);
        assert_eq!(topic_name.matches_topic_filter(&topic_filter), matches);
    }
}
