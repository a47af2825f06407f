// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-message codec.
//!
//! Bijective encoder/decoder between in-memory control-message structs and
//! the on-wire JSON payloads. Field names are fixed; unknown fields are
//! ignored on decode; missing required fields produce a decode error.
//! Encoding is stable: struct fields serialize in declaration order and
//! map-valued data uses sorted keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error decoding a control-message payload
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload is not valid JSON or is missing required fields
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A Quality of Service value is outside 0..=2
    #[error("qos {0} out of range")]
    QosOutOfRange(u8),
}

/// Error encoding a control-message payload
#[derive(Error, Debug)]
#[error("could not encode payload: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// One remote handler descriptor as carried in handler-info messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDescription {
    /// Stable handler id, process-unique within the sending framework
    pub handler_id: u64,
    /// Topic patterns the handler subscribes to
    pub topics: Vec<String>,
    /// Optional LDAP-style property filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Minimum Quality of Service the handler wants for remote receipts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
}

/// Payload of a `handler/add` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandlerAdd {
    /// The handler being announced
    pub handler: HandlerDescription,
}

/// Payload of a `handler/remove` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRemove {
    /// Id of the handler being withdrawn
    pub handler_id: u64,
}

/// Payload of a `handler/update` message, replacing the sender's entire
/// handler set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandlerUpdate {
    /// The sender's complete current handler set; may be empty
    #[serde(default)]
    pub handlers: Vec<HandlerDescription>,
}

fn validate_qos(descriptions: &[&HandlerDescription]) -> Result<(), DecodeError> {
    for description in descriptions {
        if let Some(qos) = description.qos {
            if qos > 2 {
                return Err(DecodeError::QosOutOfRange(qos));
            }
        }
    }
    Ok(())
}

/// Encode a `handler/add` payload.
///
/// # Errors
/// Returns an [`EncodeError`] if serialization fails.
pub fn encode_handler_add(message: &HandlerAdd) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a `handler/add` payload.
///
/// # Errors
/// Returns a [`DecodeError`] if the payload is malformed.
pub fn decode_handler_add(payload: &[u8]) -> Result<HandlerAdd, DecodeError> {
    let message: HandlerAdd = serde_json::from_slice(payload)?;
    validate_qos(&[&message.handler])?;
    Ok(message)
}

/// Encode a `handler/remove` payload.
///
/// # Errors
/// Returns an [`EncodeError`] if serialization fails.
pub fn encode_handler_remove(message: &HandlerRemove) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a `handler/remove` payload.
///
/// # Errors
/// Returns a [`DecodeError`] if the payload is malformed.
pub fn decode_handler_remove(payload: &[u8]) -> Result<HandlerRemove, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a `handler/update` payload.
///
/// # Errors
/// Returns an [`EncodeError`] if serialization fails.
pub fn encode_handler_update(message: &HandlerUpdate) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a `handler/update` payload.
///
/// # Errors
/// Returns a [`DecodeError`] if the payload is malformed.
pub fn decode_handler_update(payload: &[u8]) -> Result<HandlerUpdate, DecodeError> {
    let message: HandlerUpdate = serde_json::from_slice(payload)?;
    validate_qos(&message.handlers.iter().collect::<Vec<_>>())?;
    Ok(message)
}

/// Encode an event property map as the data-message payload.
///
/// Properties serialize as a single JSON object with sorted keys; an empty
/// map encodes as `{}`.
///
/// # Errors
/// Returns an [`EncodeError`] if serialization fails.
pub fn encode_event_properties(
    properties: &BTreeMap<String, String>,
) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(properties)?)
}

/// Decode an event property map from a data-message payload.
///
/// An empty payload decodes as an empty map.
///
/// # Errors
/// Returns a [`DecodeError`] if the payload is malformed.
pub fn decode_event_properties(payload: &[u8]) -> Result<BTreeMap<String, String>, DecodeError> {
    if payload.is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(payload)?)
}
