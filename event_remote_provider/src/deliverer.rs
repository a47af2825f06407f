// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Local delivery worker pool.
//!
//! Remote events accepted by the engine are queued as jobs and delivered to
//! the matching local handlers by a bounded pool of workers. Jobs that
//! originate from a synchronous send carry an acknowledgement request that
//! is published once the last local handler has returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use event_remote_mqtt::control_packet::{PublishProperties, QoS};
use event_remote_mqtt::interface::MqttPubSub;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::provider::EventAdminSink;

/// Error submitting a job to the deliverer
#[derive(Error, Debug)]
pub(crate) enum SubmitError {
    /// The queue stayed at its high-water mark past the bounded wait
    #[error("deliverer queue full")]
    QueueFull,
    /// The deliverer has shut down
    #[error("deliverer has shut down")]
    Closed,
}

/// Acknowledgement to publish once all local handlers have returned.
pub(crate) struct AckRequest {
    /// Response topic named by the sender
    pub response_topic: String,
    /// Prepared publish properties echoing the sender's correlation data
    pub properties: PublishProperties,
}

/// An asynchronous unit of local delivery.
pub(crate) struct DelivererJob {
    /// Topic of the event
    pub topic: String,
    /// Deserialized event properties
    pub properties: BTreeMap<String, String>,
    /// Matching local handler ids, in ascending order
    pub handler_ids: Vec<u64>,
    /// Delivery target
    pub sink: Arc<dyn EventAdminSink>,
    /// Acknowledgement request for sync-origin events
    pub ack: Option<AckRequest>,
}

/// Bounded worker pool delivering events to local handlers.
pub(crate) struct EventDeliverer {
    jobs_tx: mpsc::Sender<DelivererJob>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    submit_timeout: Duration,
}

impl EventDeliverer {
    /// Time an enqueue may block at the high-water mark before the event
    /// is dropped.
    const SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

    pub(crate) fn new<C>(client: C, workers: usize, queue_depth: usize) -> Self
    where
        C: MqttPubSub + Clone + Send + Sync + 'static,
    {
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_depth);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let cancel = CancellationToken::new();
        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    client.clone(),
                    jobs_rx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            jobs_tx,
            cancel,
            workers: Mutex::new(handles),
            submit_timeout: Self::SUBMIT_TIMEOUT,
        }
    }

    /// Queue a job for delivery.
    ///
    /// Blocks up to a bounded time when the queue is at its high-water mark
    /// so that the caller is never blocked indefinitely.
    pub(crate) async fn submit(&self, job: DelivererJob) -> Result<(), SubmitError> {
        match self.jobs_tx.send_timeout(job, self.submit_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Stop the workers. Currently executing jobs are drained; queued jobs
    /// are discarded and their pending acknowledgements are not sent.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Deliverer worker ended abnormally: {e}");
            }
        }
    }
}

async fn run_worker<C>(
    worker_id: usize,
    client: C,
    jobs_rx: Arc<Mutex<mpsc::Receiver<DelivererJob>>>,
    cancel: CancellationToken,
) where
    C: MqttPubSub + Clone + Send + Sync + 'static,
{
    loop {
        // Workers share the queue; only the wait for the next job is
        // serialized, delivery itself runs in parallel.
        let job = {
            let mut jobs_rx = jobs_rx.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                job = jobs_rx.recv() => job,
            }
        };
        let Some(job) = job else {
            log::debug!("Deliverer worker {worker_id} stopping");
            break;
        };

        for handler_id in &job.handler_ids {
            if let Err(e) = job
                .sink
                .deliver(*handler_id, &job.topic, &job.properties)
                .await
            {
                // Delivery continues with the next handler
                log::warn!(
                    "Event handler {handler_id} failed for event on {}: {e}",
                    job.topic
                );
            }
        }

        if let Some(ack) = job.ack {
            match client
                .publish_with_properties(
                    ack.response_topic.clone(),
                    QoS::AtLeastOnce,
                    false,
                    Bytes::new(),
                    ack.properties,
                )
                .await
            {
                Ok(_completion) => {
                    log::debug!("Acknowledged sync event on {} to {}", job.topic, ack.response_topic);
                }
                Err(e) => {
                    log::error!(
                        "Could not acknowledge sync event on {} to {}: {e}",
                        job.topic,
                        ack.response_topic
                    );
                }
            }
        }
    }
}
