// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT client providing a managed connection over a single MQTT session.
//!
//! The [`MqttSession`] outlives individual broker connections: it can be
//! pointed at a broker endpoint with [`MqttSession::connect`], survives
//! transient network drops via its reconnect policy, and carries its
//! subscription table and receivers over to the next connection.

mod completion;
mod dispatcher;
pub mod reconnect_policy;
mod state;
mod subscriptions;

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, Event, EventLoop, Incoming};
use rumqttc::Outgoing;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::connection_settings::ConnectionSettings;
use crate::control_packet::{Publish, PublishProperties, QoS};
use crate::error::{
    ConnectError, ConnectErrorKind, ConnectionError, PublishError, PublishErrorKind,
    SubscribeError, SubscribeErrorKind,
};
use crate::interface::{ManagedClient, MqttConnect, MqttPubSub, PubReceiver};
use crate::session::dispatcher::IncomingPublishDispatcher;
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
use crate::session::state::ConnectionState;
use crate::session::subscriptions::{SubscriptionTable, WireAction};
use crate::topic::{TopicFilter, TopicName, TopicParseError};

pub use crate::session::completion::CompletionToken;
use crate::session::completion::CompletionTracker;

/// Options for configuring a new [`MqttSession`]
#[derive(Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct SessionOptions {
    /// MQTT Connection Settings for configuring the [`MqttSession`]
    pub connection_settings: ConnectionSettings,
    /// Reconnect Policy used while a connection is active
    #[builder(default = "Arc::new(ExponentialBackoffWithJitter::default())")]
    pub reconnect_policy: Arc<dyn ReconnectPolicy>,
    /// Number of attempts an initial connect may take before
    /// [`MqttSession::connect`] reports the broker unreachable
    #[builder(default = "3")]
    pub initial_connect_attempts: u32,
}

impl SessionOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(attempts) = &self.initial_connect_attempts {
            if *attempts == 0 {
                return Err("initial_connect_attempts must be greater than 0".to_string());
            }
        }
        Ok(())
    }
}

/// Client that manages connections over a single MQTT session.
///
/// Cloning is cheap and all clones refer to the same session.
#[derive(Clone)]
pub struct MqttSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    settings: ConnectionSettings,
    reconnect_policy: Arc<dyn ReconnectPolicy>,
    initial_connect_attempts: u32,
    dispatcher: Mutex<IncomingPublishDispatcher>,
    subscriptions: SubscriptionTable,
    completions: CompletionTracker,
    state: Arc<ConnectionState>,
    active: Mutex<Option<ActiveConnection>>,
    /// Serializes completion registration with request enqueue so that
    /// packet id pairing stays in order
    publish_guard: tokio::sync::Mutex<()>,
    /// Generation counter distinguishing successive connections
    generation: Mutex<u64>,
}

struct ActiveConnection {
    client: AsyncClient,
    cancel: CancellationToken,
    generation: u64,
}

impl MqttSession {
    /// Create a new [`MqttSession`] with the provided options structure.
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        let capacity = options.connection_settings.request_channel_capacity;
        Self {
            inner: Arc::new(SessionInner {
                settings: options.connection_settings,
                reconnect_policy: options.reconnect_policy,
                initial_connect_attempts: options.initial_connect_attempts,
                dispatcher: Mutex::new(IncomingPublishDispatcher::new(capacity)),
                subscriptions: SubscriptionTable::default(),
                completions: CompletionTracker::default(),
                state: Arc::new(ConnectionState::default()),
                active: Mutex::new(None),
                publish_guard: tokio::sync::Mutex::new(()),
                generation: Mutex::new(0),
            }),
        }
    }

    /// Return a new instance of [`SessionConnectionMonitor`] that can be used
    /// to observe the connection state
    #[must_use]
    pub fn monitor(&self) -> SessionConnectionMonitor {
        SessionConnectionMonitor {
            state: self.inner.state.clone(),
        }
    }

    /// Publish a message and block until the broker acknowledges it or the
    /// timeout elapses.
    ///
    /// Note that this is broker-level acknowledgement, not application-level.
    ///
    /// # Errors
    /// Returns a [`PublishError`] if the publish cannot be issued, the
    /// session ends, or the acknowledgement does not arrive in time.
    pub async fn publish_sync(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: Option<PublishProperties>,
        timeout: Duration,
    ) -> Result<(), PublishError> {
        let token = self
            .publish_inner(topic.into(), qos, retain, payload.into(), properties)
            .await?;
        match tokio::time::timeout(timeout, token).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PublishError::new(PublishErrorKind::SessionClosed)),
            Err(_) => Err(PublishError::new(PublishErrorKind::Timeout)),
        }
    }

    /// Abruptly terminate the connection without a DISCONNECT packet.
    ///
    /// The broker treats this as an ungraceful client death and publishes
    /// the registered Last Will and Testament.
    pub async fn force_close(&self) {
        let Some(active) = self.inner.active.lock().unwrap().take() else {
            return;
        };
        log::debug!("Force closing session connection");
        self.inner.state.transition_desire_stop();
        active.cancel.cancel();
        self.inner.state.condition_disconnected().await;
        self.inner.completions.fail_all();
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.inner
            .active
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| active.client.clone())
    }

    async fn publish_inner(
        &self,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: Option<PublishProperties>,
    ) -> Result<CompletionToken, PublishError> {
        if !TopicName::is_valid_topic_name(&topic) {
            return Err(PublishError::new(PublishErrorKind::InvalidTopicName));
        }
        let Some(client) = self.current_client() else {
            return Err(PublishError::new(PublishErrorKind::NotConnected));
        };

        // Completion pairing relies on registration order matching enqueue order
        let _guard = self.inner.publish_guard.lock().await;
        let token = self.inner.completions.register(qos);
        let result = match properties {
            Some(properties) => {
                client
                    .publish_with_properties(topic, qos, retain, payload, properties)
                    .await
            }
            None => client.publish(topic, qos, retain, payload).await,
        };
        match result {
            Ok(()) => Ok(token),
            Err(e) => {
                self.inner.completions.unregister_last();
                log::debug!("Publish not accepted by client: {e}");
                Err(PublishError::new(PublishErrorKind::NotConnected))
            }
        }
    }
}

#[async_trait]
impl MqttConnect for MqttSession {
    async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        let (client, event_loop, cancel, generation) = {
            let mut active = self.inner.active.lock().unwrap();
            if active.is_some() {
                return Err(ConnectError::new(ConnectErrorKind::AlreadyConnected));
            }
            let generation = {
                let mut gen_counter = self.inner.generation.lock().unwrap();
                *gen_counter += 1;
                *gen_counter
            };
            let options = self.inner.settings.mqtt_options(host, port);
            let (client, event_loop) =
                AsyncClient::new(options, self.inner.settings.request_channel_capacity);
            let cancel = CancellationToken::new();
            *active = Some(ActiveConnection {
                client: client.clone(),
                cancel: cancel.clone(),
                generation,
            });
            (client, event_loop, cancel, generation)
        };

        self.inner.state.transition_connecting();
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(run_connection(
            self.inner.clone(),
            client,
            event_loop,
            cancel,
            generation,
            result_tx,
        ));

        let result = match result_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(kind)) => Err(ConnectError::new(kind)),
            Err(_) => Err(ConnectError::new(ConnectErrorKind::Unreachable)),
        };
        if result.is_err() {
            // The connection task cleans up after itself, but do not leave a
            // failed connection installed if the caller retries immediately
            let mut active = self.inner.active.lock().unwrap();
            if active
                .as_ref()
                .is_some_and(|active| active.generation == generation)
            {
                *active = None;
            }
        }
        result
    }

    async fn disconnect(&self) {
        let Some(active) = self.inner.active.lock().unwrap().take() else {
            return;
        };
        log::debug!("Disconnecting session gracefully");
        self.inner.state.transition_desire_stop();
        if let Err(e) = active.client.disconnect().await {
            log::debug!("Disconnect request not accepted: {e}");
        }
        // The connection task observes the disconnect and exits; the cancel
        // token is a backstop if the broker never closes the stream
        tokio::select! {
            () = self.inner.state.condition_disconnected() => {}
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                log::debug!("Grace period for graceful disconnect expired; cancelling");
                active.cancel.cancel();
                self.inner.state.condition_disconnected().await;
            }
        }
        self.inner.completions.fail_all();
    }

    fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }
}

#[async_trait]
impl MqttPubSub for MqttSession {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError> {
        self.publish_inner(topic.into(), qos, retain, payload.into(), None)
            .await
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError> {
        self.publish_inner(topic.into(), qos, retain, payload.into(), Some(properties))
            .await
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError> {
        let topic: String = topic.into();
        if !TopicFilter::is_valid_topic_filter(&topic) {
            return Err(SubscribeError::new(SubscribeErrorKind::InvalidTopicFilter));
        }
        if let WireAction::Subscribe(effective_qos) = self.inner.subscriptions.add(&topic, qos) {
            if let Some(client) = self.current_client() {
                if let Err(e) = client.subscribe(topic.clone(), effective_qos).await {
                    // The table replays the subscription on the next connect
                    log::debug!("Subscribe to {topic} not sent: {e}");
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: impl Into<String> + Send) -> Result<(), SubscribeError> {
        let topic: String = topic.into();
        if !TopicFilter::is_valid_topic_filter(&topic) {
            return Err(SubscribeError::new(SubscribeErrorKind::InvalidTopicFilter));
        }
        if let WireAction::Unsubscribe = self.inner.subscriptions.remove(&topic) {
            if let Some(client) = self.current_client() {
                if let Err(e) = client.unsubscribe(topic.clone()).await {
                    log::debug!("Unsubscribe from {topic} not sent: {e}");
                }
            }
        }
        Ok(())
    }
}

impl ManagedClient for MqttSession {
    type PubReceiver = SessionPubReceiver;

    fn client_id(&self) -> &str {
        &self.inner.settings.client_id
    }

    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<SessionPubReceiver, TopicParseError> {
        let topic_filter = TopicFilter::from_str(topic_filter)?;
        let pub_rx = self
            .inner
            .dispatcher
            .lock()
            .unwrap()
            .register_filter(&topic_filter);
        Ok(SessionPubReceiver { pub_rx })
    }

    fn create_unfiltered_pub_receiver(&self) -> SessionPubReceiver {
        let pub_rx = self.inner.dispatcher.lock().unwrap().register_unfiltered();
        SessionPubReceiver { pub_rx }
    }
}

/// Receive incoming MQTT messages dispatched by the session.
pub struct SessionPubReceiver {
    pub_rx: tokio::sync::mpsc::Receiver<Publish>,
}

#[async_trait]
impl PubReceiver for SessionPubReceiver {
    async fn recv(&mut self) -> Option<Publish> {
        self.pub_rx.recv().await
    }

    fn close(&mut self) {
        self.pub_rx.close();
    }
}

/// Monitor for connection changes in the [`MqttSession`].
///
/// This is largely for informational purposes.
#[derive(Clone)]
pub struct SessionConnectionMonitor {
    state: Arc<ConnectionState>,
}

impl SessionConnectionMonitor {
    /// Returns true if the session is currently connected.
    /// Note that this may not be accurate if connection has been recently lost.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Wait until the session is connected.
    /// Returns immediately if already connected.
    pub async fn connected(&self) {
        self.state.condition_connected().await;
    }

    /// Wait until the session is disconnected.
    /// Returns immediately if already disconnected.
    pub async fn disconnected(&self) {
        self.state.condition_disconnected().await;
    }
}

/// Event loop task for one broker connection.
async fn run_connection(
    inner: Arc<SessionInner>,
    client: AsyncClient,
    mut event_loop: EventLoop,
    cancel: CancellationToken,
    generation: u64,
    result_tx: oneshot::Sender<Result<(), ConnectErrorKind>>,
) {
    let mut result_tx = Some(result_tx);
    // Number of previous reconnect attempts
    let mut reconnect_attempts: u32 = 0;

    loop {
        // Poll the next event/error unless the connection is cancelled.
        let next = tokio::select! {
            // Ensure that the cancellation signal is checked first.
            biased;
            () = cancel.cancelled() => break,
            next = event_loop.poll() => next,
        };

        match next {
            Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                inner.state.transition_connected();
                reconnect_attempts = 0;
                log::debug!("Incoming CONNACK: {connack:?}");
                if let Some(tx) = result_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                // Restore subscriptions when the broker holds no session state
                if !connack.session_present {
                    for (topic_filter, qos) in inner.subscriptions.snapshot() {
                        log::debug!("Restoring subscription to {topic_filter}");
                        if let Err(e) = client.subscribe(topic_filter.clone(), qos).await {
                            log::error!("Failed to restore subscription to {topic_filter}: {e}");
                        }
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                log::debug!("Incoming PUB: {publish:?}");
                match inner.dispatcher.lock().unwrap().dispatch_publish(&publish) {
                    Ok(num_dispatches) => {
                        log::debug!("Dispatched PUB to {num_dispatches} receivers");
                    }
                    Err(e) => log::warn!("Could not dispatch PUB: {e:?}"),
                }
            }
            Ok(Event::Incoming(Incoming::PubAck(puback))) => {
                inner.completions.on_ack(puback.pkid);
            }
            Ok(Event::Incoming(Incoming::PubComp(pubcomp))) => {
                inner.completions.on_ack(pubcomp.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                inner.completions.on_publish_sent(pkid);
            }
            Ok(_) => {
                // Remaining event responses require no handling
            }

            // Desired disconnect completion.
            // NOTE: This normally is a ConnectionAborted state error, but the
            // client library sometimes delivers something else in this case,
            // so accept any state error while a stop is desired.
            Err(ConnectionError::MqttState(_)) if inner.state.desire_stop() => break,

            // Connection refused by broker - unrecoverable
            Err(ConnectionError::ConnectionRefused(rc)) => {
                log::error!("Connection Refused: rc: {rc:?}");
                if let Some(tx) = result_tx.take() {
                    let _ = tx.send(Err(ConnectErrorKind::Refused));
                }
                break;
            }

            // Other errors are passed to the reconnect policy
            Err(e) => {
                inner.state.transition_reconnecting();
                log::error!("Error: {e:?}");

                // The initial connect gets a bounded attempt budget
                if result_tx.is_some()
                    && reconnect_attempts + 1 >= inner.initial_connect_attempts
                {
                    if let Some(tx) = result_tx.take() {
                        let _ = tx.send(Err(ConnectErrorKind::Unreachable));
                    }
                    break;
                }

                if let Some(delay) = inner
                    .reconnect_policy
                    .next_reconnect_delay(reconnect_attempts, &e)
                {
                    log::info!("Attempting reconnect in {delay:?}");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => break,
                    }
                } else {
                    log::info!("Reconnect attempts halted by reconnect policy");
                    break;
                }
                reconnect_attempts += 1;
            }
        }
    }

    // Clear the active connection if it is still this one
    {
        let mut active = inner.active.lock().unwrap();
        if active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            *active = None;
        }
    }
    inner.state.transition_disconnected();
    inner.completions.fail_all();
}
