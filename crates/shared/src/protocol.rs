use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::SystemStatus;

pub const JSONRPC_VERSION: &str = "2.0";
pub const SUBSCRIBE_METHOD: &str = "subscribe";

/// Outbound control frame sent over the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: SubscribeParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub channel: String,
}

impl ChannelRequest {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: SUBSCRIBE_METHOD.to_string(),
            params: SubscribeParams {
                channel: channel.into(),
            },
        }
    }
}

/// Inbound frame published on a channel. Every field is optional so that a
/// malformed publication still reaches the handler registered for it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelFrame {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "prevStatus")]
    pub prev_status: Option<Value>,
}

impl ChannelFrame {
    /// Channel the frame was published on: `method` for JSON-RPC notifications,
    /// `channel` for plain message-bus frames.
    pub fn channel_name(&self) -> Option<&str> {
        self.method
            .as_deref()
            .filter(|m| *m != SUBSCRIBE_METHOD)
            .or(self.channel.as_deref())
    }

    pub fn into_status_message(self) -> StatusMessage {
        StatusMessage::from_parts(self.params, self.prev_status)
    }
}

/// Status change event received over the channel. Consumed once by the
/// subscriber it was routed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: String,
    #[serde(
        default,
        rename = "prevStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_status: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl StatusMessage {
    pub fn new(status: impl Into<String>) -> Self {
        let status = status.into();
        Self {
            params: serde_json::json!({ "status": status }),
            status,
            previous_status: None,
        }
    }

    /// Builds a message from the raw `params` payload and an optional
    /// top-level `prevStatus`. Never fails: a missing or non-string status
    /// becomes an empty string.
    pub fn from_parts(params: Value, top_level_prev: Option<Value>) -> Self {
        let status = params
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let previous_status = params
            .get("prevStatus")
            .cloned()
            .or(top_level_prev)
            .and_then(|v| v.as_str().map(str::to_string));
        Self {
            status,
            previous_status,
            params,
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus::from(self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_matches_wire_shape() {
        let value = serde_json::to_value(ChannelRequest::subscribe("system-state")).expect("json");
        assert_eq!(
            value,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "subscribe",
                "params": { "channel": "system-state" }
            })
        );
    }

    #[test]
    fn frame_routes_by_method_or_channel() {
        let rpc: ChannelFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"system-state","params":{"status":"STOPPING"}}"#,
        )
        .expect("frame");
        assert_eq!(rpc.channel_name(), Some("system-state"));

        let bus: ChannelFrame =
            serde_json::from_str(r#"{"channel":"system-state","params":{"status":"STOPPING"}}"#)
                .expect("frame");
        assert_eq!(bus.channel_name(), Some("system-state"));
    }

    #[test]
    fn status_message_reads_previous_status_from_either_location() {
        let nested: ChannelFrame = serde_json::from_str(
            r#"{"method":"c","params":{"status":"STOPPING","prevStatus":"RUNNING"}}"#,
        )
        .expect("frame");
        let message = nested.into_status_message();
        assert_eq!(message.system_status(), SystemStatus::Stopping);
        assert_eq!(message.previous_status.as_deref(), Some("RUNNING"));

        let top: ChannelFrame = serde_json::from_str(
            r#"{"method":"c","params":{"status":"READY_TO_SHUTDOWN"},"prevStatus":"STOPPING"}"#,
        )
        .expect("frame");
        assert_eq!(
            top.into_status_message().previous_status.as_deref(),
            Some("STOPPING")
        );
    }

    #[test]
    fn malformed_params_produce_empty_status() {
        let message = StatusMessage::from_parts(serde_json::json!([1, 2, 3]), None);
        assert!(message.status.is_empty());
        assert_eq!(message.system_status(), SystemStatus::Other(String::new()));
    }
}
