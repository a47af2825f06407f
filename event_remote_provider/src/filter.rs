// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! LDAP-style property filters for event handlers.
//!
//! Supports equality `(key=value)`, presence `(key=*)`, substring
//! `(key=ab*cd)`, and the composites `(&...)`, `(|...)` and `(!...)`,
//! evaluated against an event's property map.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error when parsing a property filter
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterParseError {
    /// The filter ended before the expression was complete
    #[error("unexpected end of filter")]
    UnexpectedEnd,
    /// Expected an opening parenthesis at the given position
    #[error("expected '(' at position {0}")]
    ExpectedOpenParen(usize),
    /// Expected a closing parenthesis at the given position
    #[error("expected ')' at position {0}")]
    ExpectedCloseParen(usize),
    /// An attribute name is empty
    #[error("empty attribute at position {0}")]
    EmptyAttribute(usize),
    /// A composite operator has no operands
    #[error("composite operator without operands at position {0}")]
    EmptyComposite(usize),
    /// Characters remain after the closing parenthesis
    #[error("trailing characters at position {0}")]
    TrailingCharacters(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Present(String),
    Equals(String, String),
    /// Substring match; parts are the segments between `*`s. An empty
    /// leading or trailing part anchors the match accordingly.
    Substring(String, Vec<String>),
}

/// A parsed LDAP-style property filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    raw: String,
    node: FilterNode,
}

impl Filter {
    /// Get the filter formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Evaluate the filter against a property map.
    #[must_use]
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        eval(&self.node, properties)
    }
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.chars().collect();
        let (node, pos) = parse_node(&chars, 0)?;
        if pos != chars.len() {
            return Err(FilterParseError::TrailingCharacters(pos));
        }
        Ok(Filter {
            raw: s.to_string(),
            node,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn eval(node: &FilterNode, properties: &BTreeMap<String, String>) -> bool {
    match node {
        FilterNode::And(operands) => operands.iter().all(|operand| eval(operand, properties)),
        FilterNode::Or(operands) => operands.iter().any(|operand| eval(operand, properties)),
        FilterNode::Not(operand) => !eval(operand, properties),
        FilterNode::Present(attribute) => properties.contains_key(attribute),
        FilterNode::Equals(attribute, value) => {
            properties.get(attribute).is_some_and(|v| v == value)
        }
        FilterNode::Substring(attribute, parts) => properties
            .get(attribute)
            .is_some_and(|v| substring_matches(v, parts)),
    }
}

fn substring_matches(value: &str, parts: &[String]) -> bool {
    let mut remainder = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // Leading part anchors at the start
            let Some(rest) = remainder.strip_prefix(part.as_str()) else {
                return false;
            };
            remainder = rest;
        } else if i == parts.len() - 1 {
            // Trailing part anchors at the end
            let Some(rest) = remainder.strip_suffix(part.as_str()) else {
                return false;
            };
            remainder = rest;
        } else {
            let Some(found) = remainder.find(part.as_str()) else {
                return false;
            };
            remainder = &remainder[found + part.len()..];
        }
    }
    true
}

/// Parse one parenthesized expression starting at `pos`.
/// Returns the node and the position after its closing parenthesis.
fn parse_node(chars: &[char], pos: usize) -> Result<(FilterNode, usize), FilterParseError> {
    if chars.get(pos) != Some(&'(') {
        return Err(FilterParseError::ExpectedOpenParen(pos));
    }
    let pos = pos + 1;
    match chars.get(pos) {
        None => Err(FilterParseError::UnexpectedEnd),
        Some('&') => {
            let (operands, pos) = parse_operands(chars, pos + 1)?;
            Ok((FilterNode::And(operands), pos))
        }
        Some('|') => {
            let (operands, pos) = parse_operands(chars, pos + 1)?;
            Ok((FilterNode::Or(operands), pos))
        }
        Some('!') => {
            let (operand, pos) = parse_node(chars, pos + 1)?;
            if chars.get(pos) != Some(&')') {
                return Err(FilterParseError::ExpectedCloseParen(pos));
            }
            Ok((FilterNode::Not(Box::new(operand)), pos + 1))
        }
        Some(_) => parse_comparison(chars, pos),
    }
}

/// Parse the operands of a composite, up to and including the composite's
/// closing parenthesis.
fn parse_operands(
    chars: &[char],
    mut pos: usize,
) -> Result<(Vec<FilterNode>, usize), FilterParseError> {
    let start = pos;
    let mut operands = Vec::new();
    loop {
        match chars.get(pos) {
            None => return Err(FilterParseError::UnexpectedEnd),
            Some(')') => {
                if operands.is_empty() {
                    return Err(FilterParseError::EmptyComposite(start));
                }
                return Ok((operands, pos + 1));
            }
            Some(_) => {
                let (operand, next) = parse_node(chars, pos)?;
                operands.push(operand);
                pos = next;
            }
        }
    }
}

/// Parse an `attribute=value` comparison, up to and including its closing
/// parenthesis. The opening parenthesis has already been consumed.
fn parse_comparison(chars: &[char], pos: usize) -> Result<(FilterNode, usize), FilterParseError> {
    let attr_start = pos;
    let mut pos = pos;
    while pos < chars.len() && chars[pos] != '=' && chars[pos] != ')' {
        pos += 1;
    }
    if pos >= chars.len() {
        return Err(FilterParseError::UnexpectedEnd);
    }
    if chars[pos] == ')' || pos == attr_start {
        return Err(FilterParseError::EmptyAttribute(attr_start));
    }
    let attribute: String = chars[attr_start..pos].iter().collect();
    pos += 1;

    let value_start = pos;
    while pos < chars.len() && chars[pos] != ')' {
        pos += 1;
    }
    if pos >= chars.len() {
        return Err(FilterParseError::UnexpectedEnd);
    }
    let value: String = chars[value_start..pos].iter().collect();
    pos += 1;

    let node = if value == "*" {
        FilterNode::Present(attribute)
    } else if value.contains('*') {
        let parts = value.split('*').map(ToString::to_string).collect();
        FilterNode::Substring(attribute, parts)
    } else {
        FilterNode::Equals(attribute, value)
    };
    Ok((node, pos))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    fn properties(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_case("(key=value)"; "equality")]
    #[test_case("(key=*)"; "presence")]
    #[test_case("(key=ab*cd)"; "substring")]
    #[test_case("(&(a=1)(b=2))"; "and")]
    #[test_case("(|(a=1)(b=2))"; "or")]
    #[test_case("(!(a=1))"; "not")]
    #[test_case("(&(a=1)(|(b=2)(!(c=3))))"; "nested")]
    #[test_case("(key=)"; "empty value")]
    fn valid_filters(filter: &str) {
        let parsed = Filter::from_str(filter).unwrap();
        assert_eq!(parsed.as_str(), filter);
    }

    #[test_case(""; "empty")]
    #[test_case("key=value"; "missing parens")]
    #[test_case("(key=value"; "unterminated")]
    #[test_case("(=value)"; "empty attribute")]
    #[test_case("(key)"; "no comparison")]
    #[test_case("(&)"; "and without operands")]
    #[test_case("(|)"; "or without operands")]
    #[test_case("(a=1)(b=2)"; "trailing expression")]
    #[test_case("(!(a=1)(b=2))"; "not with two operands")]
    fn invalid_filters(filter: &str) {
        assert!(Filter::from_str(filter).is_err());
    }

    #[test_case("(key=value)", &[("key", "value")], true; "equality match")]
    #[test_case("(key=value)", &[("key", "other")], false; "equality mismatch")]
    #[test_case("(key=value)", &[], false; "equality missing key")]
    #[test_case("(key=*)", &[("key", "anything")], true; "presence match")]
    #[test_case("(key=*)", &[("other", "x")], false; "presence mismatch")]
    #[test_case("(key=ab*)", &[("key", "abcd")], true; "prefix substring")]
    #[test_case("(key=*cd)", &[("key", "abcd")], true; "suffix substring")]
    #[test_case("(key=a*d)", &[("key", "abcd")], true; "bounded substring")]
    #[test_case("(key=a*d)", &[("key", "abce")], false; "bounded substring mismatch")]
    #[test_case("(key=*bc*)", &[("key", "abcd")], true; "inner substring")]
    #[test_case("(&(a=1)(b=2))", &[("a", "1"), ("b", "2")], true; "and match")]
    #[test_case("(&(a=1)(b=2))", &[("a", "1")], false; "and partial")]
    #[test_case("(|(a=1)(b=2))", &[("b", "2")], true; "or match")]
    #[test_case("(|(a=1)(b=2))", &[("c", "3")], false; "or mismatch")]
    #[test_case("(!(a=1))", &[("a", "2")], true; "not match")]
    #[test_case("(!(a=1))", &[("a", "1")], false; "not mismatch")]
    #[test_case("(&(unit=celsius)(|(floor=1)(floor=2)))", &[("unit", "celsius"), ("floor", "2")], true; "nested match")]
    fn evaluation(filter: &str, props: &[(&str, &str)], expected: bool) {
        let filter = Filter::from_str(filter).unwrap();
        assert_eq!(filter.matches(&properties(props)), expected);
    }
}
