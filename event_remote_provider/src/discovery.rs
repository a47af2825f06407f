// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Broker discovery.
//!
//! Consumes broker endpoint descriptions from the host's discovery facility
//! and drives the session connection. Endpoints are ranked lexicographically
//! by endpoint id; only the top-ranked endpoint is used, with failover to
//! the next-ranked endpoint on connect failure.

use event_remote_mqtt::interface::MqttConnect;

/// A discovered MQTT broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Discovery id of the endpoint; ranks endpoints lexicographically
    pub id: String,
    /// Broker address
    pub address: String,
    /// Broker port
    pub port: u16,
}

impl BrokerEndpoint {
    /// Create a new [`BrokerEndpoint`]
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }
}

struct DiscoveryState {
    /// Known endpoints, sorted by id
    endpoints: Vec<BrokerEndpoint>,
    /// Id of the endpoint currently connected to, if any
    active: Option<String>,
}

/// Tracks discovered endpoints and keeps the session pointed at the
/// top-ranked one.
pub(crate) struct BrokerDiscovery<C>
where
    C: MqttConnect + Send + Sync,
{
    client: C,
    state: tokio::sync::Mutex<DiscoveryState>,
}

impl<C> BrokerDiscovery<C>
where
    C: MqttConnect + Send + Sync,
{
    pub(crate) fn new(client: C) -> Self {
        Self {
            client,
            state: tokio::sync::Mutex::new(DiscoveryState {
                endpoints: Vec::new(),
                active: None,
            }),
        }
    }

    /// Record a discovered endpoint. Returns true if a new connection was
    /// established as a result.
    pub(crate) async fn endpoint_added(&self, endpoint: BrokerEndpoint) -> bool {
        let mut state = self.state.lock().await;
        state.endpoints.retain(|e| e.id != endpoint.id);
        state.endpoints.push(endpoint);
        state.endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        self.reconcile(&mut state).await
    }

    /// Remove a previously discovered endpoint. If it was the active one,
    /// the session disconnects gracefully and the next-ranked endpoint (if
    /// any) is connected. Returns true if a new connection was established.
    pub(crate) async fn endpoint_removed(&self, endpoint_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.endpoints.retain(|e| e.id != endpoint_id);
        if state.active.as_deref() == Some(endpoint_id) {
            state.active = None;
            self.client.disconnect().await;
        }
        self.reconcile(&mut state).await
    }

    /// Disconnect from the active endpoint without forgetting it.
    pub(crate) async fn disconnect_active(&self) {
        let mut state = self.state.lock().await;
        if state.active.take().is_some() {
            self.client.disconnect().await;
        }
    }

    async fn reconcile(&self, state: &mut DiscoveryState) -> bool {
        let Some(top) = state.endpoints.first() else {
            return false;
        };
        if state.active.as_deref() == Some(top.id.as_str()) {
            return false;
        }
        if state.active.is_some() {
            // A higher-ranked endpoint displaced the active one
            state.active = None;
            self.client.disconnect().await;
        }
        let candidates = state.endpoints.clone();
        for endpoint in candidates {
            match self.client.connect(&endpoint.address, endpoint.port).await {
                Ok(()) => {
                    log::info!(
                        "Connected to broker {} at {}:{}",
                        endpoint.id,
                        endpoint.address,
                        endpoint.port
                    );
                    state.active = Some(endpoint.id);
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "Could not connect to broker {} at {}:{}: {e}",
                        endpoint.id,
                        endpoint.address,
                        endpoint.port
                    );
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockClient;

    #[tokio::test]
    async fn connects_to_first_endpoint() {
        let client = MockClient::new();
        let discovery = BrokerDiscovery::new(client.clone());

        assert!(
            discovery
                .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
                .await
        );
        assert_eq!(client.connects(), vec![("broker-a".to_string(), 1883)]);
    }

    #[tokio::test]
    async fn lower_ranked_endpoint_does_not_displace_active() {
        let client = MockClient::new();
        let discovery = BrokerDiscovery::new(client.clone());

        assert!(
            discovery
                .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
                .await
        );
        assert!(
            !discovery
                .endpoint_added(BrokerEndpoint::new("b", "broker-b", 1883))
                .await
        );
        assert_eq!(client.connects(), vec![("broker-a".to_string(), 1883)]);
    }

    #[tokio::test]
    async fn higher_ranked_endpoint_displaces_active() {
        let client = MockClient::new();
        let discovery = BrokerDiscovery::new(client.clone());

        assert!(
            discovery
                .endpoint_added(BrokerEndpoint::new("b", "broker-b", 1883))
                .await
        );
        assert!(
            discovery
                .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
                .await
        );
        assert_eq!(
            client.connects(),
            vec![
                ("broker-b".to_string(), 1883),
                ("broker-a".to_string(), 1883)
            ]
        );
        assert_eq!(client.disconnects(), 1);
    }

    #[tokio::test]
    async fn failover_to_next_ranked_endpoint() {
        let client = MockClient::new();
        client.fail_connect_to("broker-a");
        let discovery = BrokerDiscovery::new(client.clone());

        discovery
            .endpoint_added(BrokerEndpoint::new("b", "broker-b", 1883))
            .await;
        // Adding the top-ranked endpoint fails over back to the working one
        assert!(
            discovery
                .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
                .await
        );
        assert_eq!(
            client.connects(),
            vec![
                ("broker-b".to_string(), 1883),
                ("broker-a".to_string(), 1883),
                ("broker-b".to_string(), 1883),
            ]
        );
    }

    #[tokio::test]
    async fn removal_of_active_endpoint_disconnects_and_fails_over() {
        let client = MockClient::new();
        let discovery = BrokerDiscovery::new(client.clone());

        discovery
            .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
            .await;
        discovery
            .endpoint_added(BrokerEndpoint::new("b", "broker-b", 1883))
            .await;
        assert!(discovery.endpoint_removed("a").await);
        assert_eq!(client.disconnects(), 1);
        assert_eq!(
            client.connects(),
            vec![
                ("broker-a".to_string(), 1883),
                ("broker-b".to_string(), 1883)
            ]
        );
    }

    #[tokio::test]
    async fn removal_of_last_endpoint_only_disconnects() {
        let client = MockClient::new();
        let discovery = BrokerDiscovery::new(client.clone());

        discovery
            .endpoint_added(BrokerEndpoint::new("a", "broker-a", 1883))
            .await;
        assert!(!discovery.endpoint_removed("a").await);
        assert_eq!(client.disconnects(), 1);
    }
}
