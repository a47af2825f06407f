// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-facing facade of the event admin remote provider.

mod config;
pub(crate) mod engine;
mod handlers;
mod remote;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use event_remote_mqtt::control_packet::{LastWill, LastWillProperties, QoS};
use event_remote_mqtt::interface::{ManagedClient, MqttConnect};
use tokio_util::sync::CancellationToken;

use crate::common::error::{EarpmError, EarpmErrorKind};
use crate::common::user_properties::outbound_user_properties;
use crate::discovery::{BrokerDiscovery, BrokerEndpoint};
use crate::provider::engine::Engine;

pub use crate::provider::config::{
    ProviderOptions, ProviderOptionsBuilder, ProviderOptionsBuilderError,
};

/// Error returned by an [`EventAdminSink`] delivery.
pub type DeliveryError = Box<dyn std::error::Error + Send + Sync>;

/// Local delivery target for remote events.
///
/// The host's event admin implements this to receive events arriving from
/// peer frameworks, one call per matching local handler.
#[async_trait]
pub trait EventAdminSink: Send + Sync {
    /// Deliver an event to the local handler with the given id.
    ///
    /// # Errors
    /// A [`DeliveryError`] is logged; delivery continues with the next
    /// handler.
    async fn deliver(
        &self,
        handler_id: u64,
        topic: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DeliveryError>;
}

/// Per-event options for [`RemoteProvider::post_event_with_options`] and
/// [`RemoteProvider::send_event_with_options`].
#[derive(Clone, Debug, Default)]
pub struct EventOptions {
    /// Quality of Service for the event; the configured default when unset.
    /// Synchronous sends are raised to at-least-once.
    pub qos: Option<QoS>,
    /// Whether the broker retains the event for late subscribers
    pub retain: bool,
    /// Message expiry; for synchronous sends this is also the
    /// acknowledgement deadline
    pub expiry: Option<Duration>,
}

/// The Last Will and Testament a session hosting a [`RemoteProvider`] must
/// register, so peers evict this framework's state if it dies without a
/// clean shutdown.
#[must_use]
pub fn session_last_will(options: &ProviderOptions) -> LastWill {
    let topic = format!("{}session/end", options.control_topic_prefix);
    let properties = LastWillProperties {
        delay_interval: None,
        payload_format_indicator: None,
        message_expiry_interval: None,
        content_type: None,
        response_topic: None,
        correlation_data: None,
        user_properties: outbound_user_properties(
            &options.msg_version,
            &options.fw_uuid.to_string(),
        ),
    };
    LastWill::new(topic, Bytes::new(), QoS::AtLeastOnce, false, Some(properties))
}

/// Event admin remote provider over MQTT.
///
/// Bridges local event-admin events to peer frameworks through an MQTT
/// broker discovered at runtime.
pub struct RemoteProvider<C>
where
    C: ManagedClient + MqttConnect + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    engine: Arc<Engine<C>>,
    discovery: BrokerDiscovery<C>,
    cancel: CancellationToken,
}

impl<C> RemoteProvider<C>
where
    C: ManagedClient + MqttConnect + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    /// Create a new [`RemoteProvider`] on top of a managed MQTT client.
    ///
    /// Registers the control-namespace subscriptions and starts the
    /// background message loops. The provider is idle until a broker
    /// endpoint is supplied via [`RemoteProvider::broker_endpoint_added`].
    ///
    /// # Errors
    /// [`EarpmError`] of kind [`EarpmErrorKind::InvalidConfig`] if the
    /// options are rejected.
    pub async fn new(options: ProviderOptions, client: C) -> Result<Self, EarpmError> {
        let engine = Arc::new(Engine::new(options, client.clone())?);
        engine.subscribe_control_topics().await?;

        let control_receiver = client
            .create_filtered_pub_receiver(&engine.topics.all_filter)
            .map_err(|e| EarpmErrorKind::InvalidConfig(e.to_string()))?;
        let data_receiver = client.create_unfiltered_pub_receiver();

        let cancel = CancellationToken::new();
        tokio::spawn(engine::run_control_loop(
            engine.clone(),
            control_receiver,
            cancel.clone(),
        ));
        tokio::spawn(engine::run_data_loop(
            engine.clone(),
            data_receiver,
            cancel.clone(),
        ));
        tokio::spawn(engine::run_query_loop(engine.clone(), cancel.clone()));

        Ok(Self {
            engine,
            discovery: BrokerDiscovery::new(client),
            cancel,
        })
    }

    /// Publish an event asynchronously.
    ///
    /// Returns as soon as the event is queued; completes successfully
    /// without publishing when no remote handler matches.
    ///
    /// # Errors
    /// [`EarpmError`] of kind [`EarpmErrorKind::InvalidArgument`],
    /// [`EarpmErrorKind::Transport`] or [`EarpmErrorKind::Shutdown`].
    /// Never returns [`EarpmErrorKind::Timeout`].
    pub async fn post_event(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), EarpmError> {
        self.engine
            .post_event(topic, properties, &EventOptions::default())
            .await
    }

    /// [`RemoteProvider::post_event`] with per-event options.
    ///
    /// # Errors
    /// As [`RemoteProvider::post_event`].
    pub async fn post_event_with_options(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
        options: &EventOptions,
    ) -> Result<(), EarpmError> {
        self.engine.post_event(topic, properties, options).await
    }

    /// Publish an event synchronously, blocking until every matching remote
    /// framework has acknowledged delivery, the deadline passes, or all
    /// matching handlers disappear.
    ///
    /// # Errors
    /// [`EarpmError`] of kind [`EarpmErrorKind::Timeout`] if the deadline
    /// elapses with outstanding acknowledgements; kinds
    /// [`EarpmErrorKind::InvalidArgument`], [`EarpmErrorKind::Transport`]
    /// and [`EarpmErrorKind::Shutdown`] as for
    /// [`RemoteProvider::post_event`].
    pub async fn send_event(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), EarpmError> {
        self.engine
            .send_event(topic, properties, &EventOptions::default())
            .await
    }

    /// [`RemoteProvider::send_event`] with per-event options.
    ///
    /// # Errors
    /// As [`RemoteProvider::send_event`].
    pub async fn send_event_with_options(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
        options: &EventOptions,
    ) -> Result<(), EarpmError> {
        self.engine.send_event(topic, properties, options).await
    }

    /// Register a local event handler.
    ///
    /// The handler's interest is subscribed on the broker and announced to
    /// peers. Registering an id again replaces the previous registration.
    ///
    /// # Errors
    /// [`EarpmError`] of kind [`EarpmErrorKind::InvalidArgument`] if the
    /// topic patterns or filter are invalid.
    pub async fn add_event_handler(
        &self,
        handler_id: u64,
        topics: &[String],
        filter: Option<&str>,
        qos: Option<QoS>,
    ) -> Result<(), EarpmError> {
        self.engine
            .add_local_handler(handler_id, topics, filter, qos)
            .await
    }

    /// Remove a local event handler. Removing an unknown id is a benign
    /// no-op.
    ///
    /// # Errors
    /// Currently infallible; the signature reserves the error path.
    pub async fn remove_event_handler(&self, handler_id: u64) -> Result<(), EarpmError> {
        self.engine.remove_local_handler(handler_id).await
    }

    /// Inject the local delivery target. While unset, inbound data events
    /// are dropped with a warning.
    pub fn set_event_admin(&self, sink: Arc<dyn EventAdminSink>) {
        self.engine.set_event_admin(sink);
    }

    /// Detach the local delivery target.
    pub fn clear_event_admin(&self) {
        self.engine.clear_event_admin();
    }

    /// Record a discovered broker endpoint, connecting to it if it becomes
    /// the top-ranked one.
    pub async fn broker_endpoint_added(&self, endpoint: BrokerEndpoint) {
        if self.discovery.endpoint_added(endpoint).await {
            self.engine.announce().await;
        }
    }

    /// Remove a previously discovered broker endpoint, disconnecting and
    /// failing over if it was the active one.
    pub async fn broker_endpoint_removed(&self, endpoint: &BrokerEndpoint) {
        if self.discovery.endpoint_removed(&endpoint.id).await {
            self.engine.announce().await;
        }
    }

    /// Number of remote frameworks currently known.
    pub async fn remote_framework_count(&self) -> usize {
        self.engine.remote_framework_count().await
    }

    /// Shut the provider down: fail pending synchronous sends, stop the
    /// deliverer, tell peers the session ended, and disconnect.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.engine.shutdown().await;
        self.discovery.disconnect_active().await;
    }
}

impl<C> Drop for RemoteProvider<C>
where
    C: ManagedClient + MqttConnect + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
