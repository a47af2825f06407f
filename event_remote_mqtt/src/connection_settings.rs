// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic MQTT connection settings implementations

use std::time::Duration;

use crate::control_packet::LastWill;

/// All the settings required to establish an MQTT session, other than the
/// broker endpoint itself (which is supplied on connect).
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ConnectionSettings {
    /// Client identifier
    pub(crate) client_id: String,
    /// Max time between communications
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Clean start
    #[builder(default = "false")]
    pub(crate) clean_start: bool,
    /// Username for MQTT
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for MQTT
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// Capacity of the bounded outbound request queue
    #[builder(default = "100")]
    pub(crate) request_channel_capacity: usize,
    /// Last Will and Testament registered with the broker on connect
    #[builder(default = "None")]
    pub(crate) last_will: Option<LastWill>,
}

impl ConnectionSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                return Err("client_id must not be empty".to_string());
            }
        }
        if let Some(keep_alive) = &self.keep_alive {
            // The underlying client rejects keep alive intervals below 5 seconds
            if *keep_alive < Duration::from_secs(5) {
                return Err("keep_alive must be at least 5 seconds".to_string());
            }
        }
        if let Some(capacity) = &self.request_channel_capacity {
            if *capacity == 0 {
                return Err("request_channel_capacity must be greater than 0".to_string());
            }
        }
        Ok(())
    }
}

impl ConnectionSettings {
    /// Convert the settings into [`rumqttc::v5::MqttOptions`] for the given endpoint.
    pub(crate) fn mqtt_options(&self, host: &str, port: u16) -> rumqttc::v5::MqttOptions {
        let mut mqtt_options = rumqttc::v5::MqttOptions::new(self.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_start(self.clean_start);
        if let Some(username) = &self.username {
            mqtt_options
                .set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        if let Some(last_will) = &self.last_will {
            mqtt_options.set_last_will(last_will.clone());
        }
        mqtt_options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_defaults() {
        let settings = ConnectionSettingsBuilder::default()
            .client_id("test_client")
            .build()
            .unwrap();
        assert_eq!(settings.client_id, "test_client");
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert!(!settings.clean_start);
        assert!(settings.username.is_none());
        assert!(settings.last_will.is_none());
        assert_eq!(settings.request_channel_capacity, 100);
    }

    #[test]
    fn missing_client_id() {
        assert!(ConnectionSettingsBuilder::default().build().is_err());
    }

    #[test]
    fn empty_client_id() {
        assert!(ConnectionSettingsBuilder::default()
            .client_id("")
            .build()
            .is_err());
    }

    #[test]
    fn keep_alive_too_short() {
        assert!(ConnectionSettingsBuilder::default()
            .client_id("test_client")
            .keep_alive(Duration::from_secs(2))
            .build()
            .is_err());
    }

    #[test]
    fn zero_capacity() {
        assert!(ConnectionSettingsBuilder::default()
            .client_id("test_client")
            .request_channel_capacity(0usize)
            .build()
            .is_err());
    }
}
