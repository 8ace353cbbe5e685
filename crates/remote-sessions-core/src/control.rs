//! Control-channel contract against the remote session endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RemoteInfo, SessionKind, StartOptions};

/// Response of a start call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartResult {
    /// Remote session identifier.
    pub session_id: String,
    /// Connection metadata, possibly incomplete until the session is active.
    #[serde(default)]
    pub remote_info: RemoteInfo,
}

/// Response of a stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResult {
    pub success: bool,
}

/// Response of an info call for an existing session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub active: bool,
    /// Remote status string, if the host reports one.
    #[serde(default)]
    pub status: Option<String>,
    /// Identifier of the running session, when the host reports one.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub remote_info: RemoteInfo,
}

impl SessionInfo {
    /// Whether the remote host reports the session as running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            || self
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("active") || s.eq_ignore_ascii_case("running"))
    }

    /// Session identifier from the top-level field or, failing that, a
    /// `sessionId` key inside the remote info.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or_else(|| self.remote_info.get("sessionId").and_then(serde_json::Value::as_str))
            .filter(|id| !id.is_empty())
    }

    /// Active and carrying the fields needed to connect.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_active() && self.remote_info.has_connection_fields()
    }
}

/// Control-channel error.
///
/// `NotFound` is an expected outcome (the session is simply gone), kept
/// distinct so callers can treat it as state rather than failure.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unexpected status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("Session not found")]
    NotFound,
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ControlError {
    /// Whether this is the expected "session absent" outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Request/response calls against the remote session endpoint.
///
/// Implementations perform exactly one request per call; retries belong to
/// the poller and verifier.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Start a session of `kind` for `resource_id`.
    async fn start(
        &self,
        resource_id: &str,
        kind: SessionKind,
        options: &StartOptions,
    ) -> Result<SessionStartResult, ControlError>;

    /// Stop the session identified by `session_id`.
    async fn stop(
        &self,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<StopResult, ControlError>;

    /// Query current session info, bypassing any response cache.
    ///
    /// Returns `ControlError::NotFound` when the session does not exist.
    async fn info(&self, resource_id: &str, kind: SessionKind) -> Result<SessionInfo, ControlError>;
}
