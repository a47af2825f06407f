// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for defining sets and subsets of MQTT client functionality.

use async_trait::async_trait;
use bytes::Bytes;

use crate::control_packet::{Publish, PublishProperties, QoS};
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::session::CompletionToken;
use crate::topic::TopicParseError;

/// MQTT publish, subscribe and unsubscribe functionality
#[async_trait]
pub trait MqttPubSub {
    /// MQTT Publish
    ///
    /// Enqueues the publish and returns a [`CompletionToken`] that resolves
    /// when the broker acknowledges delivery (Quality of Service 1 or 2), or
    /// when the message has been handed to the network (Quality of Service 0).
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError>;

    /// MQTT Publish with MQTT v5 properties
    ///
    /// Enqueues the publish and returns a [`CompletionToken`] that resolves
    /// when the broker acknowledges delivery (Quality of Service 1 or 2), or
    /// when the message has been handed to the network (Quality of Service 0).
    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError>;

    /// MQTT Subscribe
    ///
    /// Subscriptions are reference counted per topic filter. The wire
    /// SUBSCRIBE is issued at most once per effective change, is deferred
    /// while no connection is available, and is replayed on reconnect.
    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<(), SubscribeError>;

    /// MQTT Unsubscribe
    ///
    /// Decrements the reference count for the topic filter; the wire
    /// UNSUBSCRIBE is issued when the count drops to zero.
    async fn unsubscribe(&self, topic: impl Into<String> + Send) -> Result<(), SubscribeError>;
}

/// Dynamic broker connection management
#[async_trait]
pub trait MqttConnect {
    /// Establish a session to the broker at the given endpoint.
    ///
    /// Blocks until the initial CONNACK, or until the connect attempt budget
    /// is exhausted.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if a connection is already active or the
    /// broker cannot be reached.
    async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError>;

    /// Gracefully disconnect from the broker.
    ///
    /// A graceful disconnect does not trigger the Last Will and Testament.
    async fn disconnect(&self);

    /// Returns true if a broker connection is currently established.
    /// Note that this may not be accurate if connection has been recently lost.
    fn is_connected(&self) -> bool;
}

/// Receiver for incoming MQTT messages.
#[async_trait]
pub trait PubReceiver {
    /// Receives the next incoming publish.
    ///
    /// Returns None if there will be no more incoming publishes.
    async fn recv(&mut self) -> Option<Publish>;

    /// Close the receiver, preventing further incoming publishes.
    fn close(&mut self);
}

/// An MQTT client whose connection state is externally managed.
/// Can be used to send messages and create receivers for incoming messages.
pub trait ManagedClient: MqttPubSub {
    /// The type of receiver used by this client
    type PubReceiver: PubReceiver;

    /// Get the client id for the MQTT connection
    fn client_id(&self) -> &str;

    /// Creates a new [`PubReceiver`] that receives messages matching a
    /// specific topic filter.
    ///
    /// # Errors
    /// Returns a [`TopicParseError`] if the topic filter is invalid.
    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<Self::PubReceiver, TopicParseError>;

    /// Creates a new [`PubReceiver`] that receives all messages not sent to
    /// filtered receivers.
    fn create_unfiltered_pub_receiver(&self) -> Self::PubReceiver;
}
