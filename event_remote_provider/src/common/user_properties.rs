// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT user properties carried on every message originated by the provider.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use event_remote_mqtt::control_packet::PublishProperties;

/// Enum representing the required system user properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UserProperty {
    /// Semantic version of the wire protocol spoken by the sender.
    /// Receivers reject messages whose major version differs from their own.
    MsgVersion,
    /// Framework UUID of the sending process, lowercase hyphenated.
    SenderUuid,
}

impl Display for UserProperty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UserProperty::MsgVersion => write!(f, "MSG_VERSION"),
            UserProperty::SenderUuid => write!(f, "SENDER_UUID"),
        }
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MSG_VERSION" => Ok(UserProperty::MsgVersion),
            "SENDER_UUID" => Ok(UserProperty::SenderUuid),
            _ => Err(()),
        }
    }
}

/// Build the user property list for an outbound message.
#[must_use]
pub fn outbound_user_properties(msg_version: &str, sender_uuid: &str) -> Vec<(String, String)> {
    vec![
        (
            UserProperty::MsgVersion.to_string(),
            msg_version.to_string(),
        ),
        (
            UserProperty::SenderUuid.to_string(),
            sender_uuid.to_string(),
        ),
    ]
}

/// Build publish properties carrying the required user properties and
/// nothing else.
#[must_use]
pub fn outbound_publish_properties(msg_version: &str, sender_uuid: &str) -> PublishProperties {
    PublishProperties {
        payload_format_indicator: None,
        message_expiry_interval: None,
        topic_alias: None,
        response_topic: None,
        correlation_data: None,
        user_properties: outbound_user_properties(msg_version, sender_uuid),
        subscription_identifiers: Vec::new(),
        content_type: None,
    }
}

/// Extract the value of a user property from publish properties, if present.
#[must_use]
pub fn user_property<'a>(
    properties: Option<&'a PublishProperties>,
    property: UserProperty,
) -> Option<&'a str> {
    let key = property.to_string();
    properties?
        .user_properties
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
}
