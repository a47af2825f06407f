// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outbound publish completion tracking.
//!
//! The underlying client library does not report which packet id a publish
//! request was assigned. It does, however, emit outgoing events in the order
//! the requests were enqueued, so pending completions are kept in a FIFO and
//! paired with packet ids as the event loop reports them going out on the
//! wire. Broker acknowledgements (PUBACK for Quality of Service 1, PUBCOMP
//! for Quality of Service 2) then resolve the paired completions.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::control_packet::QoS;
use crate::error::{CompletionError, CompletionErrorKind};

/// Awaitable token indicating completion of MQTT message delivery.
pub struct CompletionToken(
    /// The future resolving to the delivery result
    pub Box<dyn Future<Output = Result<(), CompletionError>> + Send + Unpin>,
);

impl Future for CompletionToken {
    type Output = Result<(), CompletionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.get_mut().0).poll(cx)
    }
}

struct PendingCompletion {
    qos: QoS,
    tx: oneshot::Sender<Result<(), CompletionError>>,
}

/// Pairs outbound publishes with their broker acknowledgements.
#[derive(Default)]
pub(crate) struct CompletionTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    /// Completions for publishes handed to the client, in enqueue order,
    /// awaiting packet id assignment by the event loop.
    unassigned: VecDeque<PendingCompletion>,
    /// Completions awaiting broker acknowledgement, keyed by packet id.
    assigned: HashMap<u16, PendingCompletion>,
}

impl CompletionTracker {
    /// Register a new pending publish.
    ///
    /// Must be called in the same order the corresponding requests are
    /// enqueued on the client (callers serialize registration and enqueue).
    pub(crate) fn register(&self, qos: QoS) -> CompletionToken {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .unassigned
            .push_back(PendingCompletion { qos, tx });
        CompletionToken(Box::new(Box::pin(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(CompletionError::new(CompletionErrorKind::SessionClosed)),
            }
        })))
    }

    /// Discard the most recently registered completion.
    ///
    /// Used when handing the request to the client failed after registration.
    pub(crate) fn unregister_last(&self) {
        self.inner.lock().unwrap().unassigned.pop_back();
    }

    /// Record that the event loop sent a publish with the given packet id.
    ///
    /// Quality of Service 0 publishes complete here; higher levels move to
    /// the assigned table to await the broker acknowledgement.
    pub(crate) fn on_publish_sent(&self, pkid: u16) {
        let mut inner = self.inner.lock().unwrap();
        // Retransmissions after a reconnect re-announce an already assigned
        // packet id and must not consume a queued completion.
        if pkid != 0 && inner.assigned.contains_key(&pkid) {
            return;
        }
        let Some(pending) = inner.unassigned.pop_front() else {
            return;
        };
        if pending.qos == QoS::AtMostOnce {
            let _ = pending.tx.send(Ok(()));
        } else {
            inner.assigned.insert(pkid, pending);
        }
    }

    /// Record a broker acknowledgement for the given packet id.
    pub(crate) fn on_ack(&self, pkid: u16) {
        if let Some(pending) = self.inner.lock().unwrap().assigned.remove(&pkid) {
            let _ = pending.tx.send(Ok(()));
        }
    }

    /// Resolve all pending completions with a session-closed error.
    pub(crate) fn fail_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for pending in inner.unassigned.drain(..) {
            let _ = pending
                .tx
                .send(Err(CompletionError::new(CompletionErrorKind::SessionClosed)));
        }
        for (_, pending) in inner.assigned.drain() {
            let _ = pending
                .tx
                .send(Err(CompletionError::new(CompletionErrorKind::SessionClosed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn qos0_completes_on_send() {
        let tracker = CompletionTracker::default();
        let token = tracker.register(QoS::AtMostOnce);
        tracker.on_publish_sent(0);
        assert!(token.await.is_ok());
    }

    #[tokio::test]
    async fn qos1_completes_on_ack() {
        let tracker = CompletionTracker::default();
        let token = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(3);

        // Not complete until the broker acknowledges
        let mut token = token;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut token)
                .await
                .is_err()
        );
        tracker.on_ack(3);
        assert!(token.await.is_ok());
    }

    #[tokio::test]
    async fn completions_pair_in_enqueue_order() {
        let tracker = CompletionTracker::default();
        let token1 = tracker.register(QoS::AtLeastOnce);
        let token2 = tracker.register(QoS::AtLeastOnce);

        // The event loop assigns packet ids in enqueue order
        tracker.on_publish_sent(1);
        tracker.on_publish_sent(2);

        // Acknowledge out of order; each token still resolves
        tracker.on_ack(2);
        assert!(token2.await.is_ok());
        tracker.on_ack(1);
        assert!(token1.await.is_ok());
    }

    #[tokio::test]
    async fn retransmission_does_not_consume_queued_completion() {
        let tracker = CompletionTracker::default();
        let token1 = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(1);

        // A new publish is queued, then pkid 1 is retransmitted after a
        // reconnect before the new publish goes out.
        let token2 = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(1);
        tracker.on_publish_sent(2);

        tracker.on_ack(1);
        assert!(token1.await.is_ok());
        tracker.on_ack(2);
        assert!(token2.await.is_ok());
    }

    #[tokio::test]
    async fn unregister_last_discards_newest() {
        let tracker = CompletionTracker::default();
        let token1 = tracker.register(QoS::AtLeastOnce);
        let token2 = tracker.register(QoS::AtLeastOnce);
        tracker.unregister_last();

        tracker.on_publish_sent(1);
        tracker.on_ack(1);
        assert!(token1.await.is_ok());
        // The discarded completion resolves with a session-closed error
        assert!(token2.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let tracker = CompletionTracker::default();
        let token1 = tracker.register(QoS::AtLeastOnce);
        let token2 = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(1);
        tracker.fail_all();
        assert!(token1.await.is_err());
        assert!(token2.await.is_err());
    }
}
