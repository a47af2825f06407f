// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The protocol core of the remote provider.
//!
//! Owns the local-handler, subscription, remote-framework and pending-sync
//! maps, encodes and decodes control messages, and performs synchronous and
//! asynchronous dispatch.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use event_remote_mqtt::control_packet::{Publish, PublishProperties, QoS};
use event_remote_mqtt::interface::{ManagedClient, MqttPubSub, PubReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{self, HandlerAdd, HandlerRemove, HandlerUpdate};
use crate::common::error::{EarpmError, EarpmErrorKind};
use crate::common::user_properties::{
    outbound_publish_properties, user_property, UserProperty,
};
use crate::common::version::ProtocolVersion;
use crate::deliverer::{AckRequest, DelivererJob, EventDeliverer};
use crate::event::EventPattern;
use crate::filter::Filter;
use crate::provider::config::ProviderOptions;
use crate::provider::handlers::{max_qos, LocalHandlerEntry, SubscriptionAggregate};
use crate::provider::remote::{
    PendingSyncEvent, RemoteFramework, RemoteHandler, SyncSignal,
};
use crate::provider::{EventAdminSink, EventOptions};

/// Topics of the reserved control namespace.
pub(crate) struct ControlTopics {
    pub prefix: String,
    pub handler_add: String,
    pub handler_remove: String,
    pub handler_update: String,
    pub handler_query: String,
    pub session_end: String,
    pub own_ack: String,
    /// Suffix of the acknowledgement topic addressed to this framework
    own_ack_suffix: String,
    /// Topic filter covering the entire control namespace
    pub all_filter: String,
    /// Topic filter covering the handler-info topics
    pub handler_filter: String,
}

impl ControlTopics {
    pub(crate) fn new(prefix: &str, fw_uuid: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            handler_add: format!("{prefix}handler/add"),
            handler_remove: format!("{prefix}handler/remove"),
            handler_update: format!("{prefix}handler/update"),
            handler_query: format!("{prefix}handler/query"),
            session_end: format!("{prefix}session/end"),
            own_ack: format!("{prefix}ack/{fw_uuid}"),
            own_ack_suffix: format!("ack/{fw_uuid}"),
            all_filter: format!("{prefix}#"),
            handler_filter: format!("{prefix}handler/+"),
        }
    }
}

/// Maps owned exclusively by the engine, guarded by one coarse lock.
#[derive(Default)]
pub(crate) struct EngineState {
    pub local_handlers: std::collections::HashMap<u64, LocalHandlerEntry>,
    pub subscriptions: SubscriptionAggregate,
    pub remote_frameworks: std::collections::HashMap<Uuid, RemoteFramework>,
    pub pending_syncs: std::collections::HashMap<u64, PendingSyncEvent>,
}

/// How a synchronous send interacts with its matched peer set.
enum SyncDispatch {
    /// No remote handler matches; the send completes locally
    NoRemoteHandlers,
    /// All matching peers are demoted; publish without waiting
    FireAndForget,
    /// Await acknowledgements for the allocated correlation id
    Await(u64, oneshot::Receiver<SyncSignal>),
}

pub(crate) struct Engine<C>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    client: C,
    options: ProviderOptions,
    version: ProtocolVersion,
    uuid_str: String,
    pub(crate) topics: ControlTopics,
    state: Mutex<EngineState>,
    deliverer: EventDeliverer,
    event_admin: RwLock<Option<Arc<dyn EventAdminSink>>>,
    shutting_down: AtomicBool,
}

impl<C> Engine<C>
where
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(options: ProviderOptions, client: C) -> Result<Self, EarpmError> {
        let version = options
            .msg_version
            .parse::<ProtocolVersion>()
            .map_err(|e| EarpmErrorKind::InvalidConfig(e.to_string()))?;
        let uuid_str = options.fw_uuid.to_string();
        let topics = ControlTopics::new(&options.control_topic_prefix, &uuid_str);
        let deliverer = EventDeliverer::new(
            client.clone(),
            options.deliverer_workers,
            options.deliverer_queue_depth,
        );
        Ok(Self {
            client,
            version,
            uuid_str,
            topics,
            state: Mutex::new(EngineState::default()),
            deliverer,
            event_admin: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            options,
        })
    }

    /// Subscribe to the control namespace topics this framework consumes.
    pub(crate) async fn subscribe_control_topics(&self) -> Result<(), EarpmError> {
        for topic_filter in [
            &self.topics.handler_filter,
            &self.topics.session_end,
            &self.topics.own_ack,
        ] {
            self.client
                .subscribe(topic_filter.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|e| EarpmErrorKind::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }

    pub(crate) fn set_event_admin(&self, sink: Arc<dyn EventAdminSink>) {
        *self.event_admin.write().unwrap() = Some(sink);
    }

    pub(crate) fn clear_event_admin(&self) {
        *self.event_admin.write().unwrap() = None;
    }

    pub(crate) async fn remote_framework_count(&self) -> usize {
        self.state.lock().await.remote_frameworks.len()
    }

    fn check_running(&self) -> Result<(), EarpmError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EarpmErrorKind::Shutdown.into());
        }
        Ok(())
    }

    fn validate_event_topic(&self, topic: &str) -> Result<(), EarpmError> {
        if !event_remote_mqtt::topic::TopicName::is_valid_topic_name(topic) {
            return Err(EarpmError::invalid_argument(format!(
                "'{topic}' is not a valid event topic"
            )));
        }
        if topic.starts_with(&self.topics.prefix) {
            return Err(EarpmError::invalid_argument(format!(
                "'{topic}' is inside the reserved control namespace"
            )));
        }
        Ok(())
    }

    // ---------- Local handler registration ----------

    pub(crate) async fn add_local_handler(
        &self,
        handler_id: u64,
        topics: &[String],
        filter: Option<&str>,
        qos: Option<QoS>,
    ) -> Result<(), EarpmError> {
        self.check_running()?;
        if topics.is_empty() {
            return Err(EarpmError::invalid_argument(
                "handler must subscribe to at least one topic",
            ));
        }
        let patterns = topics
            .iter()
            .map(|topic| EventPattern::from_str(topic))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EarpmError::invalid_argument(e.to_string()))?;
        let filter = filter
            .map(Filter::from_str)
            .transpose()
            .map_err(|e| EarpmError::invalid_argument(e.to_string()))?;
        let qos = qos.unwrap_or(self.options.default_qos);

        // Re-registration of an id replaces the previous entry
        self.remove_local_handler(handler_id).await?;

        let entry = LocalHandlerEntry {
            id: handler_id,
            patterns,
            filter,
            qos,
        };
        let description = entry.description();
        let patterns = entry.patterns.clone();
        {
            let mut state = self.state.lock().await;
            for pattern in &entry.patterns {
                state.subscriptions.add_contributor(pattern, handler_id, qos);
            }
            state.local_handlers.insert(handler_id, entry);
        }
        // The session reference counts wire subscriptions per filter and
        // defers them while disconnected
        for pattern in &patterns {
            let topic_filter = pattern.as_mqtt_filter();
            if let Err(e) = self.client.subscribe(topic_filter.clone(), qos).await {
                log::error!("Could not subscribe to {topic_filter}: {e}");
            }
        }
        match codec::encode_handler_add(&HandlerAdd {
            handler: description,
        }) {
            Ok(payload) => {
                self.publish_control(&self.topics.handler_add, QoS::AtMostOnce, payload)
                    .await;
            }
            Err(e) => log::error!("Could not encode handler announcement: {e}"),
        }
        log::debug!("Added local event handler {handler_id}");
        Ok(())
    }

    pub(crate) async fn remove_local_handler(&self, handler_id: u64) -> Result<(), EarpmError> {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.local_handlers.remove(&handler_id) else {
                // Removing a non-existent id is a benign no-op
                return Ok(());
            };
            for pattern in &entry.patterns {
                state
                    .subscriptions
                    .remove_contributor(pattern.as_str(), handler_id);
            }
            entry
        };
        for pattern in &entry.patterns {
            let topic_filter = pattern.as_mqtt_filter();
            if let Err(e) = self.client.unsubscribe(topic_filter.clone()).await {
                log::error!("Could not unsubscribe from {topic_filter}: {e}");
            }
        }
        match codec::encode_handler_remove(&HandlerRemove { handler_id }) {
            Ok(payload) => {
                self.publish_control(&self.topics.handler_remove, QoS::AtLeastOnce, payload)
                    .await;
            }
            Err(e) => log::error!("Could not encode handler withdrawal: {e}"),
        }
        log::debug!("Removed local event handler {handler_id}");
        Ok(())
    }

    // ---------- Outbound dispatch ----------

    pub(crate) async fn post_event(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
        options: &EventOptions,
    ) -> Result<(), EarpmError> {
        self.check_running()?;
        self.validate_event_topic(topic)?;
        let mut qos = options.qos.unwrap_or(self.options.default_qos);

        let matched = {
            let state = self.state.lock().await;
            let mut matched = false;
            for framework in state.remote_frameworks.values() {
                if let Some(required_qos) = framework.match_required_qos(topic, properties) {
                    matched = true;
                    // Honour the receiving handlers' receipt preference
                    qos = max_qos(qos, required_qos);
                }
            }
            matched
        };
        if !matched {
            log::debug!("No remote event handler subscribes to {topic}");
            return Ok(());
        }

        let payload = codec::encode_event_properties(properties)
            .map_err(|e| EarpmError::invalid_argument(e.to_string()))?;
        let mut publish_properties =
            outbound_publish_properties(&self.options.msg_version, &self.uuid_str);
        if let Some(expiry) = options.expiry {
            publish_properties.message_expiry_interval = Some(expiry_seconds(expiry));
        }
        self.client
            .publish_with_properties(topic, qos, options.retain, payload, publish_properties)
            .await
            .map_err(EarpmError::transport)?;
        Ok(())
    }

    pub(crate) async fn send_event(
        &self,
        topic: &str,
        properties: &BTreeMap<String, String>,
        options: &EventOptions,
    ) -> Result<(), EarpmError> {
        self.check_running()?;
        self.validate_event_topic(topic)?;
        // Synchronous events need the broker to acknowledge receipt
        let mut qos = max_qos(
            options.qos.unwrap_or(self.options.default_qos),
            QoS::AtLeastOnce,
        );
        let expiry = options.expiry.unwrap_or(self.options.sync_event_expiry_default);

        let dispatch = {
            let mut state = self.state.lock().await;
            let mut awaited = HashSet::new();
            let mut matched_any = false;
            for (uuid, framework) in &state.remote_frameworks {
                if let Some(required_qos) = framework.match_required_qos(topic, properties) {
                    matched_any = true;
                    qos = max_qos(qos, required_qos);
                    if !framework.demoted {
                        awaited.insert(*uuid);
                    }
                }
            }
            if !matched_any {
                SyncDispatch::NoRemoteHandlers
            } else if awaited.is_empty() {
                SyncDispatch::FireAndForget
            } else {
                let mut correlation_id: u64 = rand::random();
                while correlation_id == 0 || state.pending_syncs.contains_key(&correlation_id) {
                    correlation_id = rand::random();
                }
                for uuid in &awaited {
                    if let Some(framework) = state.remote_frameworks.get_mut(uuid) {
                        framework.pending_acks.insert(correlation_id);
                    }
                }
                let (tx, rx) = oneshot::channel();
                state.pending_syncs.insert(
                    correlation_id,
                    PendingSyncEvent {
                        topic: topic.to_string(),
                        properties: properties.clone(),
                        remaining: awaited,
                        tx: Some(tx),
                    },
                );
                SyncDispatch::Await(correlation_id, rx)
            }
        };

        if matches!(dispatch, SyncDispatch::NoRemoteHandlers) {
            log::debug!("No remote event handler subscribes to {topic}; sync event completes locally");
            return Ok(());
        }

        let payload = codec::encode_event_properties(properties)
            .map_err(|e| EarpmError::invalid_argument(e.to_string()))?;
        let mut publish_properties =
            outbound_publish_properties(&self.options.msg_version, &self.uuid_str);
        publish_properties.message_expiry_interval = Some(expiry_seconds(expiry));
        if let SyncDispatch::Await(correlation_id, _) = &dispatch {
            publish_properties.response_topic = Some(self.topics.own_ack.clone());
            publish_properties.correlation_data =
                Some(Bytes::copy_from_slice(&correlation_id.to_be_bytes()));
        }

        let publish_result = self
            .client
            .publish_with_properties(topic, qos, options.retain, payload, publish_properties)
            .await;

        match dispatch {
            SyncDispatch::NoRemoteHandlers => unreachable!("handled above"),
            SyncDispatch::FireAndForget => {
                publish_result.map_err(EarpmError::transport)?;
                Ok(())
            }
            SyncDispatch::Await(correlation_id, rx) => {
                if let Err(e) = publish_result {
                    self.clear_pending_sync(correlation_id).await;
                    return Err(EarpmError::transport(e));
                }
                match tokio::time::timeout(expiry, rx).await {
                    Ok(Ok(SyncSignal::Done)) => Ok(()),
                    Ok(Ok(SyncSignal::Shutdown)) | Ok(Err(_)) => {
                        Err(EarpmErrorKind::Shutdown.into())
                    }
                    Err(_) => self.on_sync_timeout(correlation_id, topic).await,
                }
            }
        }
    }

    async fn clear_pending_sync(&self, correlation_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending_syncs.remove(&correlation_id) {
            for uuid in &pending.remaining {
                if let Some(framework) = state.remote_frameworks.get_mut(uuid) {
                    framework.pending_acks.remove(&correlation_id);
                }
            }
        }
    }

    async fn on_sync_timeout(&self, correlation_id: u64, topic: &str) -> Result<(), EarpmError> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending_syncs.remove(&correlation_id) else {
            // The last acknowledgement raced the deadline
            return Ok(());
        };
        for uuid in &pending.remaining {
            if let Some(framework) = state.remote_frameworks.get_mut(uuid) {
                framework.pending_acks.remove(&correlation_id);
                framework.continuous_no_ack += 1;
                if !framework.demoted
                    && framework.continuous_no_ack >= self.options.no_ack_threshold
                {
                    framework.demoted = true;
                    log::warn!(
                        "Remote framework {uuid} missed {} consecutive sync events; demoting to fire-and-forget",
                        framework.continuous_no_ack
                    );
                }
            }
        }
        log::warn!(
            "Sync event on {topic} timed out awaiting {} acknowledgement(s)",
            pending.remaining.len()
        );
        Err(EarpmErrorKind::Timeout.into())
    }

    // ---------- Control message handling ----------

    pub(crate) async fn handle_control_publish(&self, publish: Publish) {
        let Ok(topic) = String::from_utf8(publish.topic.to_vec()) else {
            log::warn!("Dropping control message with non-UTF-8 topic");
            return;
        };
        let properties = publish.properties.as_ref();

        // The version gates everything else; an incompatible or absent
        // version means the rest of the message cannot be trusted
        let version_str = user_property(properties, UserProperty::MsgVersion);
        let compatible = version_str
            .and_then(|v| v.parse::<ProtocolVersion>().ok())
            .is_some_and(|v| self.version.is_compatible_with(&v));
        if !compatible {
            log::warn!(
                "{topic} message version({}) is incompatible.",
                version_str.unwrap_or("null")
            );
            return;
        }
        let Some(sender) = user_property(properties, UserProperty::SenderUuid) else {
            log::warn!("{topic} message has no sender UUID; dropping");
            return;
        };
        let Ok(sender) = Uuid::parse_str(sender) else {
            log::warn!("{topic} message has a malformed sender UUID; dropping");
            return;
        };
        if sender == self.options.fw_uuid {
            // Own broadcast echoed back by the broker
            return;
        }

        let Some(suffix) = topic.strip_prefix(&self.topics.prefix) else {
            log::debug!("Ignoring message outside the control namespace: {topic}");
            return;
        };
        match suffix {
            "handler/add" => self.on_handler_add(sender, &publish.payload).await,
            "handler/remove" => self.on_handler_remove(sender, &publish.payload).await,
            "handler/update" => self.on_handler_update(sender, &publish.payload).await,
            "handler/query" => {
                log::debug!("Remote framework {sender} queried handler information");
                self.publish_handler_update().await;
            }
            "session/end" => self.on_session_end(sender).await,
            _ if *suffix == self.topics.own_ack_suffix => {
                self.on_ack(sender, properties).await;
            }
            _ => log::debug!("Ignoring message on unknown control topic {topic}"),
        }
    }

    async fn on_handler_add(&self, sender: Uuid, payload: &[u8]) {
        let message = match codec::decode_handler_add(payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed handler/add message from {sender}: {e}");
                return;
            }
        };
        let handler = match RemoteHandler::from_description(&message.handler) {
            Ok(handler) => handler,
            Err(e) => {
                log::warn!("Invalid handler description from {sender}: {e}");
                return;
            }
        };
        let first_sight = {
            let mut state = self.state.lock().await;
            let first_sight = !state.remote_frameworks.contains_key(&sender);
            let framework = state
                .remote_frameworks
                .entry(sender)
                .or_insert_with(RemoteFramework::new);
            framework.note_handler_info();
            log::debug!("Remote framework {sender} announced handler {}", handler.id);
            framework.handlers.insert(handler.id, handler);
            first_sight
        };
        if first_sight {
            log::info!("Discovered remote framework {sender}");
            // Publish our own state so the new peer reconciles immediately
            self.publish_handler_update().await;
        }
    }

    async fn on_handler_remove(&self, sender: Uuid, payload: &[u8]) {
        let message = match codec::decode_handler_remove(payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed handler/remove message from {sender}: {e}");
                return;
            }
        };
        let mut state = self.state.lock().await;
        let Some(framework) = state.remote_frameworks.get_mut(&sender) else {
            return;
        };
        framework.note_handler_info();
        if framework.handlers.remove(&message.handler_id).is_none() {
            return;
        }
        log::debug!(
            "Remote framework {sender} withdrew handler {}",
            message.handler_id
        );
        if framework.handlers.is_empty() {
            state.remote_frameworks.remove(&sender);
        }
        reevaluate_pending_for(&mut state, sender);
    }

    async fn on_handler_update(&self, sender: Uuid, payload: &[u8]) {
        let message = match codec::decode_handler_update(payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed handler/update message from {sender}: {e}");
                return;
            }
        };
        let mut handlers = std::collections::HashMap::new();
        for description in &message.handlers {
            match RemoteHandler::from_description(description) {
                Ok(handler) => {
                    handlers.insert(handler.id, handler);
                }
                Err(e) => {
                    log::warn!("Invalid handler description from {sender}: {e}");
                    return;
                }
            }
        }
        let first_sight = {
            let mut state = self.state.lock().await;
            let first_sight = !state.remote_frameworks.contains_key(&sender);
            if handlers.is_empty() {
                state.remote_frameworks.remove(&sender);
            } else {
                let framework = state
                    .remote_frameworks
                    .entry(sender)
                    .or_insert_with(RemoteFramework::new);
                framework.note_handler_info();
                framework.handlers = handlers;
            }
            reevaluate_pending_for(&mut state, sender);
            first_sight && !message.handlers.is_empty()
        };
        if first_sight {
            log::info!("Discovered remote framework {sender}");
            self.publish_handler_update().await;
        }
    }

    async fn on_session_end(&self, sender: Uuid) {
        let mut state = self.state.lock().await;
        if state.remote_frameworks.remove(&sender).is_some() {
            log::info!("Remote framework {sender} session ended; purging its handlers");
            reevaluate_pending_for(&mut state, sender);
        }
    }

    async fn on_ack(&self, sender: Uuid, properties: Option<&PublishProperties>) {
        let Some(correlation_id) = properties
            .and_then(|p| p.correlation_data.as_ref())
            .and_then(|data| decode_correlation_id(data))
        else {
            log::debug!("Acknowledgement without correlation data; dropping");
            return;
        };
        let mut state = self.state.lock().await;
        let done = {
            let Some(pending) = state.pending_syncs.get_mut(&correlation_id) else {
                log::debug!("Acknowledgement for unknown sync event {correlation_id}; dropping");
                return;
            };
            if !pending.remaining.remove(&sender) {
                log::debug!(
                    "Acknowledgement from framework {sender} not awaited for sync event {correlation_id}; dropping"
                );
                return;
            }
            pending.remaining.is_empty()
        };
        if let Some(framework) = state.remote_frameworks.get_mut(&sender) {
            framework.pending_acks.remove(&correlation_id);
            framework.continuous_no_ack = 0;
        }
        if done {
            if let Some(mut pending) = state.pending_syncs.remove(&correlation_id) {
                if let Some(tx) = pending.tx.take() {
                    let _ = tx.send(SyncSignal::Done);
                }
            }
        }
    }

    // ---------- Inbound data events ----------

    pub(crate) async fn handle_data_publish(&self, publish: Publish) {
        let Ok(topic) = String::from_utf8(publish.topic.to_vec()) else {
            log::warn!("Dropping event with non-UTF-8 topic");
            return;
        };
        let sink = self.event_admin.read().unwrap().clone();
        let Some(sink) = sink else {
            log::warn!("Discarding remote event on {topic}: no event admin attached");
            return;
        };
        let properties = match codec::decode_event_properties(&publish.payload) {
            Ok(properties) => properties,
            Err(e) => {
                log::warn!("Malformed event payload on {topic}: {e}");
                return;
            }
        };
        let handler_ids = {
            let state = self.state.lock().await;
            let mut ids: Vec<u64> = state
                .local_handlers
                .values()
                .filter(|handler| handler.matches(&topic, &properties))
                .map(|handler| handler.id)
                .collect();
            // Handlers are invoked in ascending id order
            ids.sort_unstable();
            ids
        };
        let ack = self.ack_request_for(&publish);
        if handler_ids.is_empty() && ack.is_none() {
            log::debug!("No local event handler matches {topic}");
            return;
        }
        let job = DelivererJob {
            topic,
            properties,
            handler_ids,
            sink,
            ack,
        };
        if let Err(e) = self.deliverer.submit(job).await {
            log::error!("Dropping remote event: {e}");
        }
    }

    /// Build the acknowledgement request for a sync-origin event, if the
    /// sender asked for one.
    fn ack_request_for(&self, publish: &Publish) -> Option<AckRequest> {
        let properties = publish.properties.as_ref()?;
        let response_topic = properties.response_topic.clone()?;
        let mut ack_properties =
            outbound_publish_properties(&self.options.msg_version, &self.uuid_str);
        ack_properties.correlation_data = properties.correlation_data.clone();
        Some(AckRequest {
            response_topic,
            properties: ack_properties,
        })
    }

    // ---------- Control publications ----------

    /// Publish the complete local handler set for peer reconciliation.
    pub(crate) async fn publish_handler_update(&self) {
        let update = {
            let state = self.state.lock().await;
            let mut handlers: Vec<_> = state
                .local_handlers
                .values()
                .map(LocalHandlerEntry::description)
                .collect();
            handlers.sort_by_key(|handler| handler.handler_id);
            HandlerUpdate { handlers }
        };
        match codec::encode_handler_update(&update) {
            Ok(payload) => {
                self.publish_control(&self.topics.handler_update, QoS::AtMostOnce, payload)
                    .await;
            }
            Err(e) => log::error!("Could not encode handler update: {e}"),
        }
    }

    /// Ask all peers to publish their handler sets.
    pub(crate) async fn publish_handler_query(&self) {
        self.publish_control(&self.topics.handler_query, QoS::AtLeastOnce, Vec::new())
            .await;
    }

    /// Announce this framework to peers: publish our handler set and ask
    /// for theirs. Used after a broker connection is established.
    pub(crate) async fn announce(&self) {
        self.publish_handler_update().await;
        self.publish_handler_query().await;
    }

    async fn publish_control(&self, topic: &str, qos: QoS, payload: Vec<u8>) {
        let properties = outbound_publish_properties(&self.options.msg_version, &self.uuid_str);
        match self
            .client
            .publish_with_properties(topic, qos, false, payload, properties)
            .await
        {
            Ok(_completion) => log::debug!("Published control message on {topic}"),
            Err(e) => log::debug!("Control message on {topic} not published: {e}"),
        }
    }

    // ---------- Shutdown ----------

    pub(crate) async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Remote provider shutting down");
        {
            let mut state = self.state.lock().await;
            for (_, mut pending) in state.pending_syncs.drain() {
                if let Some(tx) = pending.tx.take() {
                    let _ = tx.send(SyncSignal::Shutdown);
                }
            }
        }
        self.deliverer.shutdown().await;
        // Tell peers this session ended cleanly so they purge our state
        let properties = outbound_publish_properties(&self.options.msg_version, &self.uuid_str);
        match self
            .client
            .publish_with_properties(
                self.topics.session_end.clone(),
                QoS::AtLeastOnce,
                false,
                Bytes::new(),
                properties,
            )
            .await
        {
            Ok(completion) => {
                // Best effort; do not hold up shutdown for the broker
                let _ = tokio::time::timeout(Duration::from_secs(1), completion).await;
            }
            Err(e) => log::debug!("Session end message not published: {e}"),
        }
    }
}

/// Drop acknowledgement obligations of `peer` from pending sync events that
/// it no longer matches, completing any event whose peer set empties.
fn reevaluate_pending_for(state: &mut EngineState, peer: Uuid) {
    let mut completed = Vec::new();
    for (correlation_id, pending) in &mut state.pending_syncs {
        if !pending.remaining.contains(&peer) {
            continue;
        }
        let still_matches = state
            .remote_frameworks
            .get(&peer)
            .is_some_and(|framework| framework.matches(&pending.topic, &pending.properties));
        if !still_matches {
            pending.remaining.remove(&peer);
            if pending.remaining.is_empty() {
                completed.push(*correlation_id);
            }
        }
    }
    for correlation_id in completed {
        if let Some(mut pending) = state.pending_syncs.remove(&correlation_id) {
            log::debug!(
                "Sync event on {} cleared; all matching handlers disappeared or acknowledged",
                pending.topic
            );
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(SyncSignal::Done);
            }
        }
    }
}

fn decode_correlation_id(data: &Bytes) -> Option<u64> {
    let bytes: [u8; 8] = data.as_ref().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn expiry_seconds(expiry: Duration) -> u32 {
    u32::try_from(expiry.as_secs().max(1)).unwrap_or(u32::MAX)
}

// ---------- Background loops ----------

/// Consume control-namespace messages in arrival order.
pub(crate) async fn run_control_loop<C>(
    engine: Arc<Engine<C>>,
    mut receiver: C::PubReceiver,
    cancel: CancellationToken,
) where
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send,
{
    loop {
        let publish = tokio::select! {
            () = cancel.cancelled() => {
                receiver.close();
                break;
            }
            publish = receiver.recv() => publish,
        };
        let Some(publish) = publish else { break };
        engine.handle_control_publish(publish).await;
    }
    log::debug!("Control message loop stopped");
}

/// Consume data events in arrival order and feed the deliverer.
pub(crate) async fn run_data_loop<C>(
    engine: Arc<Engine<C>>,
    mut receiver: C::PubReceiver,
    cancel: CancellationToken,
) where
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send,
{
    loop {
        let publish = tokio::select! {
            () = cancel.cancelled() => {
                receiver.close();
                break;
            }
            publish = receiver.recv() => publish,
        };
        let Some(publish) = publish else { break };
        engine.handle_data_publish(publish).await;
    }
    log::debug!("Data event loop stopped");
}

/// Periodically query peers for their handler sets to heal split state.
pub(crate) async fn run_query_loop<C>(engine: Arc<Engine<C>>, cancel: CancellationToken)
where
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(engine.options.handler_query_interval);
    // The first tick fires immediately; the announce on connect covers it
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                engine.publish_handler_query().await;
            }
        }
    }
    log::debug!("Handler query loop stopped");
}

// Engine-level behavior is exercised through the provider facade tests in
// `crate::provider`.
