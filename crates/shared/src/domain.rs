use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Link relation that points at the event channel publishing system status changes.
pub const SYSTEM_STATE_CHANNEL_REL: &str = "system.state.channel";

/// Name of the link parameter carrying the channel to subscribe to.
pub const CHANNEL_PARAMETER_NAME: &str = "channel";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SystemStatus {
    Running,
    Stopping,
    ReadyToShutdown,
    Error,
    Other(String),
}

impl SystemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::ReadyToShutdown => "READY_TO_SHUTDOWN",
            Self::Error => "ERROR",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for SystemStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            "READY_TO_SHUTDOWN" => Self::ReadyToShutdown,
            "ERROR" => Self::Error,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for SystemStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<SystemStatus> for String {
    fn from(value: SystemStatus) -> Self {
        match value {
            SystemStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParameter {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "defaultValue")]
    pub default_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "rel")]
    pub relation: String,
    pub href: String,
    #[serde(default)]
    pub parameters: Vec<LinkParameter>,
}

impl Link {
    pub fn parameter(&self, name: &str) -> Option<&LinkParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Channel name carried by this link: the `channel` parameter when present,
    /// otherwise the first parameter with a non-empty default value.
    pub fn channel_name(&self) -> Option<&str> {
        self.parameter(CHANNEL_PARAMETER_NAME)
            .or_else(|| self.parameters.iter().find(|p| !p.default_value.is_empty()))
            .map(|p| p.default_value.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// Snapshot returned by one status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub status: SystemStatus,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl SystemState {
    pub fn new(status: impl Into<SystemStatus>) -> Self {
        Self {
            status: status.into(),
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Links keyed by relation. The first link wins when a relation repeats.
    pub fn links_by_relation(&self) -> HashMap<&str, &Link> {
        let mut table = HashMap::with_capacity(self.links.len());
        for link in &self.links {
            table.entry(link.relation.as_str()).or_insert(link);
        }
        table
    }

    pub fn link(&self, relation: &str) -> Option<&Link> {
        self.links_by_relation().get(relation).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_link(parameters: Vec<LinkParameter>) -> Link {
        Link {
            relation: SYSTEM_STATE_CHANNEL_REL.to_string(),
            href: "ws://localhost/api/websocket".to_string(),
            parameters,
        }
    }

    #[test]
    fn deserializes_wire_state_with_links() {
        let raw = serde_json::json!({
            "status": "RUNNING",
            "links": [{
                "rel": "system.state.channel",
                "href": "wss://x/events",
                "method": "GET",
                "parameters": [{ "name": "channel", "defaultValue": "system-state", "required": true }]
            }]
        });
        let state: SystemState = serde_json::from_value(raw).expect("state");
        assert_eq!(state.status, SystemStatus::Running);
        let link = state.link(SYSTEM_STATE_CHANNEL_REL).expect("link");
        assert_eq!(link.href, "wss://x/events");
        assert_eq!(link.channel_name(), Some("system-state"));
    }

    #[test]
    fn missing_links_default_to_empty() {
        let state: SystemState =
            serde_json::from_str(r#"{"status":"READY_TO_SHUTDOWN"}"#).expect("state");
        assert_eq!(state.status, SystemStatus::ReadyToShutdown);
        assert!(state.links.is_empty());
        assert!(state.link(SYSTEM_STATE_CHANNEL_REL).is_none());
    }

    #[test]
    fn unknown_status_is_kept_verbatim() {
        let state: SystemState =
            serde_json::from_str(r#"{"status":"MAINTENANCE"}"#).expect("state");
        assert_eq!(state.status, SystemStatus::Other("MAINTENANCE".to_string()));
        assert_eq!(
            serde_json::to_value(&state).expect("json")["status"],
            "MAINTENANCE"
        );
    }

    #[test]
    fn channel_name_falls_back_to_first_default_value() {
        let link = channel_link(vec![LinkParameter {
            name: String::new(),
            default_value: "system-state".to_string(),
        }]);
        assert_eq!(link.channel_name(), Some("system-state"));

        let empty = channel_link(Vec::new());
        assert_eq!(empty.channel_name(), None);
    }

    #[test]
    fn first_link_wins_for_repeated_relation() {
        let mut second = channel_link(Vec::new());
        second.href = "ws://other".to_string();
        let state = SystemState::new("RUNNING")
            .with_link(channel_link(Vec::new()))
            .with_link(second);
        assert_eq!(
            state.link(SYSTEM_STATE_CHANNEL_REL).map(|l| l.href.as_str()),
            Some("ws://localhost/api/websocket")
        );
    }
}
