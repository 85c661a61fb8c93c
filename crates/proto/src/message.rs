use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, ProtoError};

/// Placeholder logged instead of a base64 image preview.
const PREVIEW_PLACEHOLDER: &str = "<base64 preview omitted>";

/// Stable identifier of a remote gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(pub String);

impl GatewayId {
    /// Returns the raw gateway identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the broker queue carrying frames from the gateway to the server.
    pub fn inbound_queue(&self) -> String {
        format!("{}.in", self.0)
    }

    /// Name of the broker queue carrying frames from the server to the gateway.
    pub fn outbound_queue(&self) -> String {
        format!("{}.out", self.0)
    }
}

impl std::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GatewayId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GatewayId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connectivity status persisted for gateways and devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayStatus {
    #[serde(rename = "on")]
    Online,
    #[serde(rename = "off")]
    Offline,
}

impl GatewayStatus {
    /// Wire/database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayStatus::Online => "on",
            GatewayStatus::Offline => "off",
        }
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GatewayStatus {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" | "online" => Ok(GatewayStatus::Online),
            "off" | "offline" => Ok(GatewayStatus::Offline),
            other => Err(ProtoError::InvalidStatus(other.to_string())),
        }
    }
}

/// Message exchanged with a gateway, encoded as a JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IotMessage {
    /// Gateway that produced (or is addressed by) this message.
    pub gateway_id: GatewayId,
    /// Device behind the gateway, when the message concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Message kind, e.g. `"status"` or `"command"`.
    #[serde(default)]
    pub message_type: String,
    /// Name of the property/command carried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Arbitrary payload value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Base64 encoded camera preview.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Time the message was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IotMessage {
    /// Creates a message of the given type for a gateway.
    pub fn new(gateway_id: GatewayId, message_type: impl Into<String>) -> Self {
        Self {
            gateway_id,
            device_id: None,
            message_type: message_type.into(),
            name: None,
            label: None,
            value: None,
            preview: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Creates a gateway status message (`messageType = "status"`).
    pub fn status(gateway_id: GatewayId, status: GatewayStatus) -> Self {
        let mut msg = Self::new(gateway_id, "status");
        msg.name = Some("gateway".to_string());
        msg.value = Some(serde_json::Value::String(status.as_str().to_string()));
        msg
    }

    /// Returns the status carried by a `status` message, if any.
    pub fn status_value(&self) -> Option<GatewayStatus> {
        if self.message_type != "status" {
            return None;
        }
        self.value.as_ref()?.as_str()?.parse().ok()
    }

    /// Decodes a message from a raw JSON frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the message as a JSON frame payload.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }

    /// Copy suitable for logging, with any image preview replaced.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.preview.as_deref().is_some_and(|p| !p.is_empty()) {
            copy.preview = Some(PREVIEW_PLACEHOLDER.to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn gateway_id_builds_queue_names() {
        let id = GatewayId::from("gw42");
        assert_eq!(id.inbound_queue(), "gw42.in");
        assert_eq!(id.outbound_queue(), "gw42.out");
    }

    #[test]
    fn decodes_minimal_camel_case_frame() {
        let msg = IotMessage::from_slice(br#"{"gatewayId":"gw42","deviceId":"cam-1"}"#)
            .expect("frame should decode");
        assert_eq!(msg.gateway_id, GatewayId::from("gw42"));
        assert_eq!(msg.device_id.as_deref(), Some("cam-1"));
        assert_eq!(msg.message_type, "");
        assert_eq!(msg.timestamp, None);
    }

    #[test]
    fn rejects_frame_without_gateway_id() {
        let err = IotMessage::from_slice(br#"{"messageType":"status"}"#)
            .expect_err("gatewayId is required");
        assert!(err.to_string().contains("gatewayId"));
    }

    #[test]
    fn rejects_non_json_frame() {
        assert!(IotMessage::from_slice(b"\xff\xfe not json").is_err());
    }

    #[test]
    fn status_message_carries_status_value() {
        let msg = IotMessage::status(GatewayId::from("gw1"), GatewayStatus::Offline);
        assert_eq!(msg.message_type, "status");
        assert_eq!(msg.status_value(), Some(GatewayStatus::Offline));

        let encoded = String::from_utf8(msg.to_vec().expect("encode")).expect("utf8");
        assert!(encoded.contains(r#""messageType":"status""#));
        assert!(encoded.contains(r#""value":"off""#));
    }

    #[test]
    fn status_value_ignores_other_message_types() {
        let mut msg = IotMessage::new(GatewayId::from("gw1"), "event");
        msg.value = Some(serde_json::json!("on"));
        assert_eq!(msg.status_value(), None);
    }

    #[test]
    fn redacted_replaces_preview_only() {
        let mut msg = IotMessage::new(GatewayId::from("gw1"), "snapshot");
        msg.preview = Some("iVBORw0KGgoAAAANSUhEUgAA".to_string());
        msg.label = Some("front door".to_string());

        let redacted = msg.redacted();
        assert_eq!(redacted.preview.as_deref(), Some(PREVIEW_PLACEHOLDER));
        assert_eq!(redacted.label, msg.label);
        assert_eq!(msg.preview.as_deref(), Some("iVBORw0KGgoAAAANSUhEUgAA"));
    }

    #[test]
    fn gateway_status_parse_and_display() {
        assert_eq!(GatewayStatus::from_str("on").unwrap(), GatewayStatus::Online);
        assert_eq!(GatewayStatus::from_str("offline").unwrap(), GatewayStatus::Offline);
        assert_eq!(GatewayStatus::Online.to_string(), "on");

        let err = GatewayStatus::from_str("maybe").expect_err("invalid status");
        match err {
            ProtoError::InvalidStatus(value) => assert_eq!(value, "maybe"),
            other => panic!("unexpected error variant: {other}"),
        }
    }
}
