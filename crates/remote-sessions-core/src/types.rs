//! Session data model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RemoteInfo;

/// Zone/host-scoped resource identifier a session belongs to.
pub type ResourceId = String;

/// The two concurrently-possible session types of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Interactive console session.
    Console,
    /// Live log-follow session backed by a push connection.
    Stream,
}

impl SessionKind {
    /// Both kinds, in slot order.
    pub const ALL: [Self; 2] = [Self::Console, Self::Stream];

    /// Path segment used by the remote session endpoint.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Stream => "stream",
        }
    }

    /// The sibling kind sharing the same resource record.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Console => Self::Stream,
            Self::Stream => Self::Console,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-observed lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session exists.
    #[default]
    Absent,
    /// Start issued, readiness not yet confirmed.
    Starting,
    /// Session confirmed ready.
    Active,
    /// Stop issued, teardown not yet confirmed.
    Stopping,
    /// Start or connection failed.
    Error,
}

impl SessionStatus {
    /// Whether a lifecycle operation is in flight.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

/// Options forwarded verbatim in the start request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartOptions(pub Map<String, Value>);

impl StartOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style option setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

/// Identifies one remote session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub resource_id: ResourceId,
    pub session_kind: SessionKind,
    pub status: SessionStatus,
    /// Remote session identifier, used to address the stop call.
    pub session_id: Option<String>,
    /// Connection metadata needed to render or connect to the session.
    pub remote_info: Option<RemoteInfo>,
}

impl SessionDescriptor {
    /// Whether this descriptor is the active session of its `(resource, kind)` pair.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
