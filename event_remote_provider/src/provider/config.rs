// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction-time configuration of the remote provider.

use std::time::Duration;

use event_remote_mqtt::control_packet::QoS;
use uuid::Uuid;

use crate::common::version::ProtocolVersion;

/// Options for configuring a new
/// [`RemoteProvider`](crate::provider::RemoteProvider).
///
/// Any option out of domain fails construction.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ProviderOptions {
    /// UUID identifying this framework to its peers
    #[builder(default = "Uuid::new_v4()")]
    pub(crate) fw_uuid: Uuid,
    /// Quality of Service used when an event does not request one
    #[builder(default = "QoS::AtLeastOnce")]
    pub(crate) default_qos: QoS,
    /// Consecutive-no-acknowledgement count before a peer is demoted to
    /// fire-and-forget delivery
    #[builder(default = "10")]
    pub(crate) no_ack_threshold: u32,
    /// Default deadline for synchronous sends without an explicit expiry
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) sync_event_expiry_default: Duration,
    /// Size of the local delivery worker pool
    #[builder(default = "4")]
    pub(crate) deliverer_workers: usize,
    /// High-water mark of the delivery queue
    #[builder(default = "64")]
    pub(crate) deliverer_queue_depth: usize,
    /// Period of the reconciliation handler query
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) handler_query_interval: Duration,
    /// Semantic version advertised in outbound user properties
    #[builder(default = "String::from(\"1.0.0\")")]
    pub(crate) msg_version: String,
    /// Reserved control topic namespace; must end with `/`
    #[builder(default = "String::from(\"earpm/\")")]
    pub(crate) control_topic_prefix: String,
}

impl ProviderOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(threshold) = &self.no_ack_threshold {
            if *threshold == 0 {
                return Err("no_ack_threshold must be greater than 0".to_string());
            }
        }
        if let Some(expiry) = &self.sync_event_expiry_default {
            if expiry.is_zero() || expiry.as_secs() > u64::from(u32::MAX) {
                return Err("sync_event_expiry_default out of range".to_string());
            }
        }
        if let Some(workers) = &self.deliverer_workers {
            if *workers == 0 {
                return Err("deliverer_workers must be greater than 0".to_string());
            }
        }
        if let Some(depth) = &self.deliverer_queue_depth {
            if *depth == 0 {
                return Err("deliverer_queue_depth must be greater than 0".to_string());
            }
        }
        if let Some(interval) = &self.handler_query_interval {
            if interval.is_zero() {
                return Err("handler_query_interval must be greater than 0".to_string());
            }
        }
        if let Some(msg_version) = &self.msg_version {
            if msg_version.parse::<ProtocolVersion>().is_err() {
                return Err(format!("msg_version '{msg_version}' is not a semantic version"));
            }
        }
        if let Some(prefix) = &self.control_topic_prefix {
            if prefix.is_empty()
                || !prefix.ends_with('/')
                || prefix.contains('#')
                || prefix.contains('+')
            {
                return Err(format!("control_topic_prefix '{prefix}' is invalid"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_defaults() {
        let options = ProviderOptionsBuilder::default().build().unwrap();
        assert_eq!(options.default_qos, QoS::AtLeastOnce);
        assert_eq!(options.no_ack_threshold, 10);
        assert_eq!(options.sync_event_expiry_default, Duration::from_secs(30));
        assert_eq!(options.deliverer_workers, 4);
        assert_eq!(options.deliverer_queue_depth, 64);
        assert_eq!(options.handler_query_interval, Duration::from_secs(30));
        assert_eq!(options.msg_version, "1.0.0");
        assert_eq!(options.control_topic_prefix, "earpm/");
    }

    #[test]
    fn zero_no_ack_threshold_fails() {
        assert!(ProviderOptionsBuilder::default()
            .no_ack_threshold(0u32)
            .build()
            .is_err());
    }

    #[test]
    fn zero_workers_fails() {
        assert!(ProviderOptionsBuilder::default()
            .deliverer_workers(0usize)
            .build()
            .is_err());
    }

    #[test]
    fn zero_queue_depth_fails() {
        assert!(ProviderOptionsBuilder::default()
            .deliverer_queue_depth(0usize)
            .build()
            .is_err());
    }

    #[test]
    fn zero_expiry_fails() {
        assert!(ProviderOptionsBuilder::default()
            .sync_event_expiry_default(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn malformed_msg_version_fails() {
        assert!(ProviderOptionsBuilder::default()
            .msg_version("not-a-version")
            .build()
            .is_err());
    }

    #[test]
    fn invalid_control_prefix_fails() {
        assert!(ProviderOptionsBuilder::default()
            .control_topic_prefix("earpm")
            .build()
            .is_err());
        assert!(ProviderOptionsBuilder::default()
            .control_topic_prefix("earpm/#/")
            .build()
            .is_err());
    }
}
