//! Core types shared by the stream, coordinator and cache modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a stream connection (or of an aggregate of them).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Connecting or waiting out a backoff delay.
    pub fn is_reconnecting(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Kind of row change carried by a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A normalized change notification from a feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Logical source the change came from. Filled in with the connection id
    /// when the transport leaves it empty.
    #[serde(default)]
    pub source_id: String,
    pub operation: ChangeOperation,
    /// New row value (absent for deletes).
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Key of the row before the change, if the feed reports it.
    #[serde(default)]
    pub previous_key: Option<String>,
}

impl ChangeEvent {
    pub fn insert(source_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source_id: source_id.into(),
            operation: ChangeOperation::Insert,
            payload: Some(payload),
            previous_key: None,
        }
    }

    pub fn update(
        source_id: impl Into<String>,
        payload: serde_json::Value,
        previous_key: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            operation: ChangeOperation::Update,
            payload: Some(payload),
            previous_key,
        }
    }

    pub fn delete(source_id: impl Into<String>, previous_key: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            operation: ChangeOperation::Delete,
            payload: None,
            previous_key: Some(previous_key.into()),
        }
    }
}

/// A change event tagged with the coordinator member that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberEvent {
    pub member: String,
    pub event: ChangeEvent,
}
