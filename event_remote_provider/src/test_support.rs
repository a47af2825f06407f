// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock managed client for engine-level tests.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use event_remote_mqtt::control_packet::{Publish, PublishProperties, QoS};
use event_remote_mqtt::error::{
    ConnectError, ConnectErrorKind, PublishError, SubscribeError, SubscribeErrorKind,
};
use event_remote_mqtt::interface::{ManagedClient, MqttConnect, MqttPubSub, PubReceiver};
use event_remote_mqtt::session::CompletionToken;
use event_remote_mqtt::topic::{TopicFilter, TopicName, TopicParseError};
use tokio::sync::mpsc;

/// A message recorded by the mock client.
#[derive(Debug, Clone)]
pub(crate) struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub properties: Option<PublishProperties>,
}

#[derive(Default)]
struct MockInner {
    published: Mutex<Vec<PublishedMessage>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<String>>,
    filtered: Mutex<Vec<(TopicFilter, mpsc::Sender<Publish>)>>,
    unfiltered: Mutex<Vec<mpsc::Sender<Publish>>>,
    connects: Mutex<Vec<(String, u16)>>,
    disconnects: AtomicUsize,
    connected: AtomicBool,
    fail_connect_to: Mutex<HashSet<String>>,
}

/// Records operations and lets tests inject inbound publishes, routing them
/// the way the real session dispatcher would.
#[derive(Clone, Default)]
pub(crate) struct MockClient {
    inner: Arc<MockInner>,
}

impl MockClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().unwrap().clone()
    }

    pub(crate) fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub(crate) fn subscribed(&self) -> Vec<(String, QoS)> {
        self.inner.subscribed.lock().unwrap().clone()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<String> {
        self.inner.unsubscribed.lock().unwrap().clone()
    }

    pub(crate) fn connects(&self) -> Vec<(String, u16)> {
        self.inner.connects.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connect_to(&self, host: &str) {
        self.inner
            .fail_connect_to
            .lock()
            .unwrap()
            .insert(host.to_string());
    }

    /// Inject an inbound publish, dispatching it to the first matching
    /// filtered receiver or, failing that, the unfiltered receivers.
    pub(crate) async fn inject(&self, publish: Publish) {
        let topic = TopicName::from_string(String::from_utf8(publish.topic.to_vec()).unwrap())
            .unwrap();
        let target = {
            let filtered = self.inner.filtered.lock().unwrap();
            filtered
                .iter()
                .find(|(filter, _)| filter.matches_topic_name(&topic))
                .map(|(_, tx)| tx.clone())
        };
        if let Some(tx) = target {
            tx.send(publish).await.unwrap();
            return;
        }
        let unfiltered: Vec<_> = self.inner.unfiltered.lock().unwrap().clone();
        for tx in unfiltered {
            tx.send(publish.clone()).await.unwrap();
        }
    }
}

pub(crate) struct MockPubReceiver {
    rx: mpsc::Receiver<Publish>,
}

#[async_trait]
impl PubReceiver for MockPubReceiver {
    async fn recv(&mut self) -> Option<Publish> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl MqttPubSub for MockClient {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError> {
        self.inner.published.lock().unwrap().push(PublishedMessage {
            topic: topic.into(),
            qos,
            retain,
            payload: payload.into().to_vec(),
            properties: None,
        });
        Ok(CompletionToken(Box::new(std::future::ready(Ok(())))))
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError> {
        self.inner.published.lock().unwrap().push(PublishedMessage {
            topic: topic.into(),
            qos,
            retain,
            payload: payload.into().to_vec(),
            properties: Some(properties),
        });
        Ok(CompletionToken(Box::new(std::future::ready(Ok(())))))
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
        self.inner.subscribed.lock().unwrap().push((topic, qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: impl Into<String> + Send) -> Result<(), SubscribeError> {
        self.inner.unsubscribed.lock().unwrap().push(topic.into());
        Ok(())
    }
}

impl ManagedClient for MockClient {
    type PubReceiver = MockPubReceiver;

    fn client_id(&self) -> &str {
        "mock_client"
    }

    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<MockPubReceiver, TopicParseError> {
        let topic_filter = TopicFilter::from_str(topic_filter)?;
        let (tx, rx) = mpsc::channel(64);
        self.inner.filtered.lock().unwrap().push((topic_filter, tx));
        Ok(MockPubReceiver { rx })
    }

    fn create_unfiltered_pub_receiver(&self) -> MockPubReceiver {
        let (tx, rx) = mpsc::channel(64);
        self.inner.unfiltered.lock().unwrap().push(tx);
        MockPubReceiver { rx }
    }
}

#[async_trait]
impl MqttConnect for MockClient {
    async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.inner
            .connects
            .lock()
            .unwrap()
            .push((host.to_string(), port));
        if self.inner.fail_connect_to.lock().unwrap().contains(host) {
            return Err(ConnectError::new(ConnectErrorKind::Unreachable));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
