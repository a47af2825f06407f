// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference counted subscription table.
//!
//! Tracks how many callers hold an interest in each topic filter and which
//! Quality of Service has been granted on the wire, so that the session
//! issues at most one SUBSCRIBE per effective change and can replay all
//! subscriptions after a reconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::control_packet::QoS;

/// Wire action required after a table update.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WireAction {
    /// No wire operation required
    None,
    /// Issue a SUBSCRIBE at the given Quality of Service
    Subscribe(QoS),
    /// Issue an UNSUBSCRIBE
    Unsubscribe,
}

struct SubscriptionEntry {
    count: usize,
    granted_qos: QoS,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
}

impl SubscriptionTable {
    /// Add an interest in the topic filter.
    ///
    /// Returns the wire action required: a SUBSCRIBE when the filter is new
    /// or the requested Quality of Service raises the granted one. The
    /// granted level is monotonic while the reference count is nonzero;
    /// removing a high-level interest never downgrades the subscription.
    pub(crate) fn add(&self, topic_filter: &str, qos: QoS) -> WireAction {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(topic_filter) {
            entry.count += 1;
            if qos_level(qos) > qos_level(entry.granted_qos) {
                entry.granted_qos = qos;
                return WireAction::Subscribe(qos);
            }
            WireAction::None
        } else {
            entries.insert(
                topic_filter.to_string(),
                SubscriptionEntry {
                    count: 1,
                    granted_qos: qos,
                },
            );
            WireAction::Subscribe(qos)
        }
    }

    /// Remove an interest in the topic filter.
    ///
    /// Returns the wire action required: an UNSUBSCRIBE when the last
    /// interest is removed. Removing an unknown filter is a benign no-op.
    pub(crate) fn remove(&self, topic_filter: &str) -> WireAction {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(topic_filter) else {
            return WireAction::None;
        };
        entry.count -= 1;
        if entry.count == 0 {
            entries.remove(topic_filter);
            return WireAction::Unsubscribe;
        }
        WireAction::None
    }

    /// Snapshot of all subscriptions for replay after a reconnect.
    pub(crate) fn snapshot(&self) -> Vec<(String, QoS)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(topic_filter, entry)| (topic_filter.clone(), entry.granted_qos))
            .collect()
    }
}

/// Numeric level of a Quality of Service, for effective-QoS comparison.
fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Balanced subscribe/unsubscribe sequences produce exactly one
    /// SUBSCRIBE and one UNSUBSCRIBE on the wire.
    #[test]
    fn refcounts_are_idempotent() {
        let table = SubscriptionTable::default();

        assert_eq!(
            table.add("t", QoS::AtMostOnce),
            WireAction::Subscribe(QoS::AtMostOnce)
        );
        assert_eq!(table.add("t", QoS::AtMostOnce), WireAction::None);
        assert_eq!(table.add("t", QoS::AtMostOnce), WireAction::None);

        assert_eq!(table.remove("t"), WireAction::None);
        assert_eq!(table.remove("t"), WireAction::None);
        assert_eq!(table.remove("t"), WireAction::Unsubscribe);

        // A fresh interest subscribes again
        assert_eq!(
            table.add("t", QoS::AtMostOnce),
            WireAction::Subscribe(QoS::AtMostOnce)
        );
    }

    /// Raising the effective Quality of Service re-subscribes exactly once;
    /// lowering it back by removal does not.
    #[test]
    fn effective_qos_is_monotonic() {
        let table = SubscriptionTable::default();

        assert_eq!(
            table.add("t", QoS::AtMostOnce),
            WireAction::Subscribe(QoS::AtMostOnce)
        );
        assert_eq!(
            table.add("t", QoS::AtLeastOnce),
            WireAction::Subscribe(QoS::AtLeastOnce)
        );
        // Same level again does not re-subscribe
        assert_eq!(table.add("t", QoS::AtLeastOnce), WireAction::None);
        // A lower level never re-subscribes
        assert_eq!(table.add("t", QoS::AtMostOnce), WireAction::None);

        // Removing the interest that raised the level does not downgrade
        assert_eq!(table.remove("t"), WireAction::None);
        assert_eq!(table.snapshot(), vec![("t".to_string(), QoS::AtLeastOnce)]);

        assert_eq!(table.remove("t"), WireAction::None);
        assert_eq!(table.remove("t"), WireAction::None);
        assert_eq!(table.remove("t"), WireAction::Unsubscribe);
    }

    #[test]
    fn remove_unknown_filter_is_benign() {
        let table = SubscriptionTable::default();
        assert_eq!(table.remove("unknown"), WireAction::None);
    }

    #[test]
    fn snapshot_reports_granted_qos() {
        let table = SubscriptionTable::default();
        table.add("a", QoS::AtMostOnce);
        table.add("b", QoS::ExactlyOnce);
        table.add("b", QoS::AtLeastOnce);

        let mut snapshot = table.snapshot();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            snapshot,
            vec![
                ("a".to_string(), QoS::AtMostOnce),
                ("b".to_string(), QoS::ExactlyOnce),
            ]
        );
    }
}
