// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local handler registrations and the per-pattern subscription aggregate.

use std::collections::{BTreeMap, HashMap};

use event_remote_mqtt::control_packet::QoS;

use crate::codec::HandlerDescription;
use crate::event::EventPattern;
use crate::filter::Filter;

/// One locally registered event handler.
pub(crate) struct LocalHandlerEntry {
    pub id: u64,
    pub patterns: Vec<EventPattern>,
    pub filter: Option<Filter>,
    pub qos: QoS,
}

impl LocalHandlerEntry {
    /// True if the handler is interested in an event with the given topic
    /// and properties.
    pub(crate) fn matches(&self, topic: &str, properties: &BTreeMap<String, String>) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(topic))
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(properties))
    }

    /// The wire descriptor announced to peers for this handler.
    pub(crate) fn description(&self) -> HandlerDescription {
        HandlerDescription {
            handler_id: self.id,
            topics: self
                .patterns
                .iter()
                .map(|pattern| pattern.as_str().to_string())
                .collect(),
            filter: self.filter.as_ref().map(|filter| filter.as_str().to_string()),
            qos: Some(qos_level(self.qos)),
        }
    }
}

pub(crate) fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub(crate) fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Returns the higher of two Quality of Service levels.
pub(crate) fn max_qos(a: QoS, b: QoS) -> QoS {
    if qos_level(a) >= qos_level(b) {
        a
    } else {
        b
    }
}

/// Aggregate of one subscribed pattern: the ordered contributor ids and the
/// effective Quality of Service (the max across contributors).
pub(crate) struct Subscription {
    pub contributors: Vec<u64>,
    pub effective_qos: QoS,
}

/// Per-pattern subscription bookkeeping for the local handler set.
///
/// Every active subscription has at least one contributor; the entry is
/// dropped when the last contributor is removed, at which point the caller
/// releases the broker subscription for the pattern.
#[derive(Default)]
pub(crate) struct SubscriptionAggregate {
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionAggregate {
    /// Record a handler's interest in a pattern. Returns true if the
    /// pattern was not subscribed before.
    pub(crate) fn add_contributor(
        &mut self,
        pattern: &EventPattern,
        handler_id: u64,
        qos: QoS,
    ) -> bool {
        if let Some(subscription) = self.subscriptions.get_mut(pattern.as_str()) {
            if let Err(pos) = subscription.contributors.binary_search(&handler_id) {
                subscription.contributors.insert(pos, handler_id);
            }
            subscription.effective_qos = max_qos(subscription.effective_qos, qos);
            false
        } else {
            self.subscriptions.insert(
                pattern.as_str().to_string(),
                Subscription {
                    contributors: vec![handler_id],
                    effective_qos: qos,
                },
            );
            true
        }
    }

    /// Remove a handler's interest in a pattern. Returns true if the last
    /// contributor was removed and the pattern released.
    pub(crate) fn remove_contributor(&mut self, pattern: &str, handler_id: u64) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(pattern) else {
            return false;
        };
        subscription.contributors.retain(|id| *id != handler_id);
        if subscription.contributors.is_empty() {
            self.subscriptions.remove(pattern);
            return true;
        }
        false
    }

    /// The subscription for a pattern, if any handler contributes to it.
    #[cfg(test)]
    pub(crate) fn get(&self, pattern: &str) -> Option<&Subscription> {
        self.subscriptions.get(pattern)
    }

    /// Number of active pattern subscriptions.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}
