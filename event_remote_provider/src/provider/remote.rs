// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Remote framework bookkeeping and in-flight synchronous events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use tokio::sync::oneshot;
use uuid::Uuid;

use event_remote_mqtt::control_packet::QoS;

use crate::codec::HandlerDescription;
use crate::event::EventPattern;
use crate::filter::Filter;
use crate::provider::handlers::{max_qos, qos_from_level};

/// A handler announced by a remote framework.
pub(crate) struct RemoteHandler {
    pub id: u64,
    pub patterns: Vec<EventPattern>,
    pub filter: Option<Filter>,
    /// Minimum Quality of Service the handler wants for remote receipts
    pub qos: Option<QoS>,
}

impl RemoteHandler {
    /// Build a [`RemoteHandler`] from a wire descriptor, validating its
    /// topic patterns and filter.
    pub(crate) fn from_description(description: &HandlerDescription) -> Result<Self, String> {
        if description.topics.is_empty() {
            return Err(format!("handler {} has no topics", description.handler_id));
        }
        let patterns = description
            .topics
            .iter()
            .map(|topic| EventPattern::from_str(topic))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let filter = description
            .filter
            .as_deref()
            .map(Filter::from_str)
            .transpose()
            .map_err(|e| e.to_string())?;
        let qos = description
            .qos
            .map(|level| {
                qos_from_level(level)
                    .ok_or_else(|| format!("handler {} qos out of range", description.handler_id))
            })
            .transpose()?;
        Ok(Self {
            id: description.handler_id,
            patterns,
            filter,
            qos,
        })
    }

    pub(crate) fn matches(&self, topic: &str, properties: &BTreeMap<String, String>) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(topic))
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(properties))
    }
}

/// One peer framework observed on the control namespace.
pub(crate) struct RemoteFramework {
    /// The peer's current handler descriptors
    pub handlers: HashMap<u64, RemoteHandler>,
    /// Correlation ids of sync events this peer still owes an
    /// acknowledgement for
    pub pending_acks: HashSet<u64>,
    /// Consecutive sync events the peer failed to acknowledge
    pub continuous_no_ack: u32,
    /// Demoted peers receive sync events fire-and-forget until they send
    /// any handler-info message again
    pub demoted: bool,
}

impl RemoteFramework {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pending_acks: HashSet::new(),
            continuous_no_ack: 0,
            demoted: false,
        }
    }

    /// Any handler-info message from the peer resets its no-acknowledgement
    /// accounting and clears a demotion.
    pub(crate) fn note_handler_info(&mut self) {
        self.continuous_no_ack = 0;
        self.demoted = false;
    }

    /// True if any of the peer's handlers is interested in the event.
    pub(crate) fn matches(&self, topic: &str, properties: &BTreeMap<String, String>) -> bool {
        self.match_required_qos(topic, properties).is_some()
    }

    /// If any of the peer's handlers is interested in the event, the highest
    /// Quality of Service those handlers want for its receipt.
    pub(crate) fn match_required_qos(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
    ) -> Option<QoS> {
        let mut required: Option<QoS> = None;
        for handler in self.handlers.values() {
            if handler.matches(topic, properties) {
                let handler_qos = handler.qos.unwrap_or(QoS::AtMostOnce);
                required = Some(required.map_or(handler_qos, |qos| max_qos(qos, handler_qos)));
            }
        }
        required
    }
}

/// Signal delivered to a waiting synchronous send.
pub(crate) enum SyncSignal {
    /// All obligations were satisfied (acknowledged or cleared)
    Done,
    /// The provider is shutting down
    Shutdown,
}

/// One in-flight synchronous send awaiting acknowledgements.
pub(crate) struct PendingSyncEvent {
    /// Topic of the event, used to re-evaluate obligations when peers
    /// withdraw handlers
    pub topic: String,
    /// Properties of the event, used for filter re-evaluation
    pub properties: BTreeMap<String, String>,
    /// Peers still owing an acknowledgement
    pub remaining: HashSet<Uuid>,
    /// Waiter; consumed when the event resolves
    pub tx: Option<oneshot::Sender<SyncSignal>>,
}
