// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error type returned to the host by the remote provider.

use std::fmt;

use thiserror::Error;

/// Error raised by the remote provider. The type of error is specified by
/// the value of [`EarpmErrorKind`].
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct EarpmError {
    kind: EarpmErrorKind,
}

impl EarpmError {
    /// Create a new [`EarpmError`]
    #[must_use]
    pub fn new(kind: EarpmErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`EarpmErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &EarpmErrorKind {
        &self.kind
    }
}

impl From<EarpmErrorKind> for EarpmError {
    fn from(kind: EarpmErrorKind) -> Self {
        Self { kind }
    }
}

/// An enumeration of categories of [`EarpmError`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EarpmErrorKind {
    /// An argument was outside its domain
    InvalidArgument(String),
    /// A construction-time option failed validation
    InvalidConfig(String),
    /// The MQTT transport failed to connect or publish
    Transport(String),
    /// A synchronous send reached its deadline before all acknowledgements
    Timeout,
    /// A bounded queue refused the operation
    QueueFull,
    /// A malformed or version-incompatible control message was received.
    /// Never surfaced to the host; logged and contained within the engine.
    Protocol(String),
    /// The operation was cancelled because the provider is shutting down
    Shutdown,
}

impl fmt::Display for EarpmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EarpmErrorKind::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EarpmErrorKind::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            EarpmErrorKind::Transport(msg) => write!(f, "transport error: {msg}"),
            EarpmErrorKind::Timeout => write!(f, "synchronous event timed out"),
            EarpmErrorKind::QueueFull => write!(f, "queue full"),
            EarpmErrorKind::Protocol(msg) => write!(f, "protocol error: {msg}"),
            EarpmErrorKind::Shutdown => write!(f, "provider is shutting down"),
        }
    }
}

impl EarpmError {
    /// Shorthand for an [`EarpmErrorKind::InvalidArgument`] error
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        EarpmErrorKind::InvalidArgument(msg.into()).into()
    }

    /// Shorthand for an [`EarpmErrorKind::Transport`] error
    pub(crate) fn transport(msg: impl fmt::Display) -> Self {
        EarpmErrorKind::Transport(msg.to_string()).into()
    }
}
