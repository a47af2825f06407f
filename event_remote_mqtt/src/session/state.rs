// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for tracking the connection state of a [`crate::session::MqttSession`].

use std::fmt;
use std::sync::RwLock;

use tokio::sync::Notify;

/// Information used to track the state of the session.
pub(crate) struct ConnectionState {
    /// State information locked for concurrency protection
    state: RwLock<InnerConnectionState>,
    /// Notifier indicating a state change
    state_change: Notify,
}

struct InnerConnectionState {
    /// The part of the connection lifecycle the session is currently in
    phase: ConnectionPhase,
    /// Indicates whether a stop of the current connection is desired.
    /// Set by a graceful disconnect so connection errors that follow are
    /// not treated as failures.
    desire_stop: bool,
}

/// Phases of the session connection lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ConnectionPhase {
    /// No connection task is active
    Disconnected,
    /// A connection task is establishing the initial connection
    Connecting,
    /// Connected to the broker
    Connected,
    /// The connection dropped and the connection task is retrying
    Reconnecting,
}

impl ConnectionState {
    /// Return true if the session is currently connected (to the best of knowledge)
    pub(crate) fn is_connected(&self) -> bool {
        self.state.read().unwrap().phase == ConnectionPhase::Connected
    }

    /// Return true if a stop of the current connection is desired
    pub(crate) fn desire_stop(&self) -> bool {
        self.state.read().unwrap().desire_stop
    }

    /// Wait until the session is connected.
    /// Returns immediately if already connected.
    pub(crate) async fn condition_connected(&self) {
        loop {
            if self.is_connected() {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Wait until the session is not connected.
    /// Returns immediately if already not connected.
    pub(crate) async fn condition_disconnected(&self) {
        loop {
            if !self.is_connected() {
                break;
            }
            self.state_change.notified().await;
        }
    }

    /// Reset the state for a fresh connection attempt
    pub(crate) fn transition_connecting(&self) {
        let mut state = self.state.write().unwrap();
        state.phase = ConnectionPhase::Connecting;
        state.desire_stop = false;
        self.state_change.notify_waiters();
        log::debug!("{state:?}");
    }

    /// Update the state to reflect a connection
    pub(crate) fn transition_connected(&self) {
        let mut state = self.state.write().unwrap();
        if state.phase != ConnectionPhase::Connected {
            state.phase = ConnectionPhase::Connected;
            log::info!("Connected!");
            self.state_change.notify_waiters();
        }
        log::debug!("{state:?}");
    }

    /// Update the state to reflect a dropped connection that will be retried
    pub(crate) fn transition_reconnecting(&self) {
        let mut state = self.state.write().unwrap();
        if state.phase == ConnectionPhase::Connected {
            log::info!("Connection lost.");
        }
        state.phase = ConnectionPhase::Reconnecting;
        self.state_change.notify_waiters();
        log::debug!("{state:?}");
    }

    /// Update the state to reflect the end of the connection task
    pub(crate) fn transition_disconnected(&self) {
        let mut state = self.state.write().unwrap();
        if state.phase != ConnectionPhase::Disconnected {
            state.phase = ConnectionPhase::Disconnected;
            if state.desire_stop {
                log::info!("Disconnected due to requested session stop");
            } else {
                log::info!("Disconnected.");
            }
            self.state_change.notify_waiters();
        }
        log::debug!("{state:?}");
    }

    /// Update the state to reflect a requested stop of the current connection
    pub(crate) fn transition_desire_stop(&self) {
        let mut state = self.state.write().unwrap();
        state.desire_stop = true;
        self.state_change.notify_waiters();
        log::debug!("{state:?}");
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            state: RwLock::new(InnerConnectionState {
                phase: ConnectionPhase::Disconnected,
                desire_stop: false,
            }),
            state_change: Notify::new(),
        }
    }
}

// NOTE: Do NOT log ConnectionState directly within its own internal methods
// that hold the write lock, or you will deadlock. Log the inner state instead.
impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        fmt::Debug::fmt(&state, f)
    }
}

impl fmt::Debug for InnerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("phase", &self.phase)
            .field("desire_stop", &self.desire_stop)
            .finish()
    }
}
