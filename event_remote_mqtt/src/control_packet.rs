// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Re-exported MQTT v5 packet types from the underlying client library.

/// Quality of Service
pub type QoS = rumqttc::v5::mqttbytes::QoS;

/// PUBLISH packet
pub type Publish = rumqttc::v5::mqttbytes::v5::Publish;
/// Properties for a PUBLISH packet
pub type PublishProperties = rumqttc::v5::mqttbytes::v5::PublishProperties;
/// Last Will and Testament registered on connect
pub type LastWill = rumqttc::v5::mqttbytes::v5::LastWill;
/// Properties for a Last Will and Testament
pub type LastWillProperties = rumqttc::v5::mqttbytes::v5::LastWillProperties;
