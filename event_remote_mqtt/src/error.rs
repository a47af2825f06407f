// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use std::fmt;

use thiserror::Error;

/// Error type for MQTT connection
pub type ConnectionError = rumqttc::v5::ConnectionError;
/// Error type for MQTT client requests
pub type ClientError = rumqttc::v5::ClientError;
/// Error subtype for MQTT connection error caused by state
pub type StateError = rumqttc::v5::StateError;

/// Error establishing a broker connection
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ConnectError {
    kind: ConnectErrorKind,
}

impl ConnectError {
    /// Create a new [`ConnectError`]
    #[must_use]
    pub fn new(kind: ConnectErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`ConnectErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &ConnectErrorKind {
        &self.kind
    }
}

impl From<ConnectErrorKind> for ConnectError {
    fn from(kind: ConnectErrorKind) -> Self {
        Self { kind }
    }
}

/// An enumeration of categories of [`ConnectError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectErrorKind {
    /// A connection is already established or being established
    AlreadyConnected,
    /// The broker refused the connection
    Refused,
    /// The broker could not be reached within the connect attempt budget
    Unreachable,
    /// The session has been shut down and cannot connect again
    SessionClosed,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectErrorKind::AlreadyConnected => write!(f, "connection already established"),
            ConnectErrorKind::Refused => write!(f, "connection refused by broker"),
            ConnectErrorKind::Unreachable => write!(f, "broker unreachable"),
            ConnectErrorKind::SessionClosed => write!(f, "session closed"),
        }
    }
}

/// Error executing an MQTT publish
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct PublishError {
    kind: PublishErrorKind,
}

impl PublishError {
    /// Create a new [`PublishError`]
    #[must_use]
    pub fn new(kind: PublishErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`PublishErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl From<PublishErrorKind> for PublishError {
    fn from(kind: PublishErrorKind) -> Self {
        Self { kind }
    }
}

/// An enumeration of categories of [`PublishError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishErrorKind {
    /// No broker connection is available to send requests on
    NotConnected,
    /// The bounded outbound request queue refused the publish
    QueueFull,
    /// Invalid topic name provided
    InvalidTopicName,
    /// The broker did not acknowledge the publish within the deadline
    Timeout,
    /// The session ended before the publish was acknowledged
    SessionClosed,
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishErrorKind::NotConnected => write!(f, "no broker connection available"),
            PublishErrorKind::QueueFull => write!(f, "outbound request queue is full"),
            PublishErrorKind::InvalidTopicName => write!(f, "invalid topic name"),
            PublishErrorKind::Timeout => write!(f, "broker acknowledgement timed out"),
            PublishErrorKind::SessionClosed => write!(f, "session closed"),
        }
    }
}

/// Error executing an MQTT subscribe or unsubscribe
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SubscribeError {
    kind: SubscribeErrorKind,
}

impl SubscribeError {
    /// Create a new [`SubscribeError`]
    #[must_use]
    pub fn new(kind: SubscribeErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`SubscribeErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

impl From<SubscribeErrorKind> for SubscribeError {
    fn from(kind: SubscribeErrorKind) -> Self {
        Self { kind }
    }
}

/// An enumeration of categories of [`SubscribeError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeErrorKind {
    /// Invalid topic filter provided
    InvalidTopicFilter,
}

impl fmt::Display for SubscribeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeErrorKind::InvalidTopicFilter => write!(f, "invalid topic filter"),
        }
    }
}

/// Error delivered by a [`CompletionToken`](crate::session::CompletionToken)
/// when the broker acknowledgement cannot be observed.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct CompletionError {
    kind: CompletionErrorKind,
}

impl CompletionError {
    /// Create a new [`CompletionError`]
    #[must_use]
    pub fn new(kind: CompletionErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`CompletionErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &CompletionErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`CompletionError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionErrorKind {
    /// The session ended before the broker acknowledged the message
    SessionClosed,
}

impl fmt::Display for CompletionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionErrorKind::SessionClosed => write!(f, "session closed"),
        }
    }
}
