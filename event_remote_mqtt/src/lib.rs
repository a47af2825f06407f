// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT version 5.0 session wrapper providing a single managed broker session
//! for decoupled asynchronous applications.

pub use crate::connection_settings::{
    ConnectionSettings, ConnectionSettingsBuilder, ConnectionSettingsBuilderError,
};

mod connection_settings;
pub mod control_packet;
pub mod error;
pub mod interface;
pub mod session;
pub mod topic;

#[macro_use]
extern crate derive_builder;
