use std::fmt;

use serde::{Deserialize, Serialize};

/// Named server→client notification channels.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HubChannel {
    InvoiceChanged,
    UserChanged,
    DashboardChanged,
}

impl HubChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceChanged => "InvoiceChanged",
            Self::UserChanged => "UserChanged",
            Self::DashboardChanged => "DashboardChanged",
        }
    }
}

impl fmt::Display for HubChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvoiceChangeType {
    Created,
    Updated,
    Deleted,
    StatusChanged,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserChangeType {
    Created,
    Updated,
    Deleted,
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DashboardScope {
    Invoices,
    Users,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceChangedPayload {
    pub invoice_id: u64,
    pub change_type: InvoiceChangeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<u64>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// ISO 8601 timestamp set by the backend.
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserChangedPayload {
    pub user_id: u64,
    pub change_type: UserChangeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardChangedPayload {
    pub scope: DashboardScope,
    pub change_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<u64>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Ping { client_time_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    HelloOk {
        connection_id: String,
        server_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pong { server_time_ms: u64 },
    InvoiceChanged(InvoiceChangedPayload),
    UserChanged(UserChangedPayload),
    DashboardChanged(DashboardChangedPayload),
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Maps a notification message to its dispatchable event; control
    /// messages map to `None`.
    pub fn into_event(self) -> Option<HubEvent> {
        match self {
            Self::InvoiceChanged(payload) => Some(HubEvent::InvoiceChanged(payload)),
            Self::UserChanged(payload) => Some(HubEvent::UserChanged(payload)),
            Self::DashboardChanged(payload) => Some(HubEvent::DashboardChanged(payload)),
            Self::HelloOk { .. } | Self::Pong { .. } => None,
        }
    }
}

/// A notification delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    InvoiceChanged(InvoiceChangedPayload),
    UserChanged(UserChangedPayload),
    DashboardChanged(DashboardChangedPayload),
}

impl HubEvent {
    pub fn channel(&self) -> HubChannel {
        match self {
            Self::InvoiceChanged(_) => HubChannel::InvoiceChanged,
            Self::UserChanged(_) => HubChannel::UserChanged,
            Self::DashboardChanged(_) => HubChannel::DashboardChanged,
        }
    }
}
