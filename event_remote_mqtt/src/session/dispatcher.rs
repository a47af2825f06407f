// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dispatch of incoming publishes to registered receivers.

use std::collections::HashMap;
use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

use crate::control_packet::Publish;
use crate::topic::{TopicFilter, TopicName, TopicParseError};

#[derive(Error, Debug)]
pub(crate) enum DispatchError {
    /// No registered receiver accepted the publish
    #[error("no receiver accepted the publish")]
    NoReceiver,
    /// The topic of the publish could not be parsed
    #[error("could not get topic from publish: {0}")]
    InvalidPublish(#[from] InvalidPublish),
}

#[derive(Error, Debug)]
pub(crate) enum InvalidPublish {
    #[error("invalid UTF-8")]
    TopicNameUtf8(#[from] FromUtf8Error),
    #[error("invalid topic: {0}")]
    TopicNameFormat(#[from] TopicParseError),
}

/// Routes incoming publishes to receivers by topic filter.
///
/// Publishes matching no registered filter go to the unfiltered receivers.
/// Dispatch must not block the event loop, so sends use the non-blocking
/// path and a full receiver channel drops the publish for that receiver
/// with a log entry.
pub(crate) struct IncomingPublishDispatcher {
    channel_capacity: usize,
    filtered_txs: HashMap<TopicFilter, Vec<Sender<Publish>>>,
    unfiltered_txs: Vec<Sender<Publish>>,
}

impl IncomingPublishDispatcher {
    pub(crate) fn new(capacity: usize) -> Self {
        IncomingPublishDispatcher {
            channel_capacity: capacity,
            filtered_txs: HashMap::new(),
            unfiltered_txs: Vec::new(),
        }
    }

    /// Register a topic filter for dispatching.
    ///
    /// Returns a receiver that will receive incoming publishes published to
    /// the topic filter. Multiple receivers can be registered for the same
    /// topic filter. Closed receivers are pruned on registration and
    /// skipped during dispatch.
    pub(crate) fn register_filter(&mut self, topic_filter: &TopicFilter) -> Receiver<Publish> {
        self.prune();
        let (tx, rx) = channel(self.channel_capacity);
        self.filtered_txs
            .entry(topic_filter.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Register a receiver for publishes matching no registered filter.
    pub(crate) fn register_unfiltered(&mut self) -> Receiver<Publish> {
        self.prune();
        let (tx, rx) = channel(self.channel_capacity);
        self.unfiltered_txs.push(tx);
        rx
    }

    /// Dispatch a [`Publish`] to all registered filters that match its topic
    /// name, or to the unfiltered receivers if no filter matches.
    ///
    /// Returns the number of receivers that accepted the publish.
    ///
    /// # Errors
    /// Returns a [`DispatchError`] if the publish topic is invalid or no
    /// receiver accepted the publish.
    pub(crate) fn dispatch_publish(&mut self, publish: &Publish) -> Result<usize, DispatchError> {
        let topic_name = extract_publish_topic_name(publish)?;

        let mut num_dispatches = 0;
        let filtered = self
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(&topic_name));
        for (_, txs) in filtered {
            num_dispatches += send_to_all(txs, publish, topic_name.as_str());
        }
        // If no filter matched, fall through to the unfiltered receivers
        if num_dispatches == 0 {
            num_dispatches += send_to_all(&self.unfiltered_txs, publish, topic_name.as_str());
        }

        if num_dispatches == 0 {
            return Err(DispatchError::NoReceiver);
        }
        Ok(num_dispatches)
    }

    /// Remove any closed receivers.
    fn prune(&mut self) {
        self.filtered_txs.retain(|_, txs| {
            txs.retain(|tx| !tx.is_closed());
            !txs.is_empty()
        });
        self.unfiltered_txs.retain(|tx| !tx.is_closed());
    }
}

fn send_to_all(txs: &[Sender<Publish>], publish: &Publish, topic_name: &str) -> usize {
    let mut sent = 0;
    for tx in txs {
        match tx.try_send(publish.clone()) {
            Ok(()) => sent += 1,
            Err(TrySendError::Full(_)) => {
                log::warn!("Receiver queue full; dropping publish on {topic_name}");
            }
            Err(TrySendError::Closed(_)) => {
                // Pruned lazily on the next registration or dispatch
            }
        }
    }
    sent
}

fn extract_publish_topic_name(publish: &Publish) -> Result<TopicName, InvalidPublish> {
    Ok(TopicName::from_string(String::from_utf8(
        publish.topic.to_vec(),
    )?)?)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::control_packet::QoS;

    fn create_publish(topic_name: &TopicName, payload: &str) -> Publish {
        Publish::new(topic_name.as_str(), QoS::AtLeastOnce, payload.to_string(), None)
    }

    #[tokio::test]
    async fn dispatch_no_receivers() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();
        let publish = create_publish(&topic_name, "payload 1");
        assert!(matches!(
            dispatcher.dispatch_publish(&publish),
            Err(DispatchError::NoReceiver)
        ));
    }

    #[tokio::test]
    async fn dispatch_no_matching_filters() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();

        // Register a filter that does not match the topic name
        let topic_filter = TopicFilter::from_str("finance/banking/banker1").unwrap();
        let mut filtered_rx = dispatcher.register_filter(&topic_filter);
        let mut unfiltered_rx = dispatcher.register_unfiltered();

        // Dispatched publish goes to the unfiltered receiver only
        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 1);
        assert_eq!(unfiltered_rx.try_recv().unwrap(), publish);
        assert_eq!(filtered_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn dispatch_matching_filter_bypasses_unfiltered() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();

        let topic_filter = TopicFilter::from_str("sport/#").unwrap();
        let mut filtered_rx = dispatcher.register_filter(&topic_filter);
        let mut unfiltered_rx = dispatcher.register_unfiltered();

        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 1);
        assert_eq!(filtered_rx.try_recv().unwrap(), publish);
        assert_eq!(unfiltered_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn dispatch_multiple_matching_filters() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();

        let topic_filter1 = TopicFilter::from_str("sport/tennis/player1").unwrap();
        let topic_filter2 = TopicFilter::from_str("sport/+/player1").unwrap();
        let topic_filter3 = TopicFilter::from_str("finance/#").unwrap();
        let mut filtered_rx1 = dispatcher.register_filter(&topic_filter1);
        let mut filtered_rx2 = dispatcher.register_filter(&topic_filter2);
        let mut filtered_rx3 = dispatcher.register_filter(&topic_filter3);

        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 2);
        assert_eq!(filtered_rx1.try_recv().unwrap(), publish);
        assert_eq!(filtered_rx2.try_recv().unwrap(), publish);
        assert_eq!(filtered_rx3.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn dispatch_duplicate_filters() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();

        let topic_filter = TopicFilter::from_str("sport/#").unwrap();
        let mut filtered_rx1 = dispatcher.register_filter(&topic_filter);
        let mut filtered_rx2 = dispatcher.register_filter(&topic_filter);

        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 2);
        assert_eq!(filtered_rx1.try_recv().unwrap(), publish);
        assert_eq!(filtered_rx2.try_recv().unwrap(), publish);
    }

    #[tokio::test]
    async fn dropped_receiver_unregisters() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();
        let topic_filter = TopicFilter::from_str("sport/#").unwrap();

        let filtered_rx1 = dispatcher.register_filter(&topic_filter);
        let mut filtered_rx2 = dispatcher.register_filter(&topic_filter);
        let mut unfiltered_rx = dispatcher.register_unfiltered();
        drop(filtered_rx1);

        // Only the live filtered receiver accepts the publish
        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 1);
        assert_eq!(filtered_rx2.try_recv().unwrap(), publish);

        // Dropping the last filtered receiver falls back to unfiltered
        drop(filtered_rx2);
        let publish = create_publish(&topic_name, "payload 2");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 1);
        assert_eq!(unfiltered_rx.try_recv().unwrap(), publish);
    }

    #[tokio::test]
    async fn full_receiver_drops_publish() {
        let mut dispatcher = IncomingPublishDispatcher::new(1);
        let topic_name = TopicName::from_str("sport/tennis/player1").unwrap();
        let topic_filter = TopicFilter::from_str("sport/#").unwrap();
        let mut filtered_rx = dispatcher.register_filter(&topic_filter);

        let publish = create_publish(&topic_name, "payload 1");
        assert_eq!(dispatcher.dispatch_publish(&publish).unwrap(), 1);
        // Channel is now full; the next dispatch has no receiver to accept it
        let publish2 = create_publish(&topic_name, "payload 2");
        assert!(matches!(
            dispatcher.dispatch_publish(&publish2),
            Err(DispatchError::NoReceiver)
        ));
        assert_eq!(filtered_rx.try_recv().unwrap(), publish);
        assert_eq!(filtered_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn prune_on_register() {
        let mut dispatcher = IncomingPublishDispatcher::new(10);
        let topic_filter = TopicFilter::from_str("sport/#").unwrap();

        let filtered_rx1 = dispatcher.register_filter(&topic_filter);
        drop(filtered_rx1);
        assert_eq!(dispatcher.filtered_txs.len(), 1);

        // Registering another filter prunes the closed one
        let other_filter = TopicFilter::from_str("finance/#").unwrap();
        let _filtered_rx2 = dispatcher.register_filter(&other_filter);
        assert_eq!(dispatcher.filtered_txs.len(), 1);
        assert!(dispatcher.filtered_txs.contains_key(&other_filter));
    }
}
