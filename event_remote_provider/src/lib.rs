// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Event admin remote provider over MQTT v5.
//!
//! Bridges local event-admin events between cooperating processes through an
//! MQTT broker: local handler registrations are announced to peers on a
//! reserved control topic namespace, peer announcements populate a remote
//! framework map, asynchronous events are published fire-and-forget, and
//! synchronous events are correlated with per-peer acknowledgements.

pub mod codec;
pub mod common;
mod deliverer;
pub mod discovery;
pub mod event;
pub mod filter;
pub mod provider;

pub use crate::common::error::{EarpmError, EarpmErrorKind};
pub use crate::discovery::BrokerEndpoint;
pub use crate::provider::{
    session_last_will, DeliveryError, EventAdminSink, EventOptions, ProviderOptions,
    ProviderOptionsBuilder, ProviderOptionsBuilderError, RemoteProvider,
};

#[macro_use]
extern crate derive_builder;

#[cfg(test)]
pub(crate) mod test_support;
