//! Scripted control channel for tests.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use remote_sessions_core::{
    ControlChannel, ControlError, RemoteInfo, SessionInfo, SessionKind, SessionStartResult,
    StartOptions, StopResult,
};
use serde_json::json;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start { resource_id: String, kind: SessionKind },
    Stop { resource_id: String, kind: SessionKind, session_id: String },
    Info { resource_id: String, kind: SessionKind },
}

#[derive(Default)]
struct Script {
    starts: VecDeque<Result<SessionStartResult, ControlError>>,
    stops: VecDeque<Result<StopResult, ControlError>>,
    infos: VecDeque<Result<SessionInfo, ControlError>>,
    calls: Vec<Call>,
}

/// Control channel answering from queued responses.
///
/// Exhausted queues fall back to: start succeeds with session `s-1`, stop
/// succeeds, info reports `NotFound`.
#[derive(Default)]
pub struct ScriptedControl {
    script: Mutex<Script>,
}

impl ScriptedControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn push_start(&self, result: Result<SessionStartResult, ControlError>) -> &Self {
        self.with(|s| s.starts.push_back(result));
        self
    }

    pub fn push_stop(&self, result: Result<StopResult, ControlError>) -> &Self {
        self.with(|s| s.stops.push_back(result));
        self
    }

    pub fn push_info(&self, result: Result<SessionInfo, ControlError>) -> &Self {
        self.with(|s| s.infos.push_back(result));
        self
    }

    /// All calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    /// Number of `info` calls made so far.
    #[must_use]
    pub fn info_calls(&self) -> usize {
        self.with(|s| s.calls.iter().filter(|c| matches!(c, Call::Info { .. })).count())
    }
}

/// Remote info with the connection fields present.
#[must_use]
pub fn connectable_info(endpoint: &str, port: u16) -> RemoteInfo {
    serde_json::from_value(json!({ "endpoint": endpoint, "port": port, "protocol": "ws" }))
        .unwrap_or_default()
}

/// Info response for a running session.
#[must_use]
pub fn active_info(remote_info: RemoteInfo) -> SessionInfo {
    SessionInfo {
        active: true,
        status: Some("active".to_string()),
        session_id: None,
        remote_info,
    }
}

/// Info response for a session that exists but is not running.
#[must_use]
pub fn inactive_info() -> SessionInfo {
    SessionInfo {
        active: false,
        status: Some("starting".to_string()),
        session_id: None,
        remote_info: RemoteInfo::default(),
    }
}

#[async_trait]
impl ControlChannel for ScriptedControl {
    async fn start(
        &self,
        resource_id: &str,
        kind: SessionKind,
        _options: &StartOptions,
    ) -> Result<SessionStartResult, ControlError> {
        self.with(|s| {
            s.calls.push(Call::Start {
                resource_id: resource_id.to_string(),
                kind,
            });
            s.starts.pop_front().unwrap_or_else(|| {
                Ok(SessionStartResult {
                    session_id: "s-1".to_string(),
                    remote_info: RemoteInfo::default(),
                })
            })
        })
    }

    async fn stop(
        &self,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<StopResult, ControlError> {
        self.with(|s| {
            s.calls.push(Call::Stop {
                resource_id: resource_id.to_string(),
                kind,
                session_id: session_id.to_string(),
            });
            s.stops.pop_front().unwrap_or(Ok(StopResult { success: true }))
        })
    }

    async fn info(&self, resource_id: &str, kind: SessionKind) -> Result<SessionInfo, ControlError> {
        self.with(|s| {
            s.calls.push(Call::Info {
                resource_id: resource_id.to_string(),
                kind,
            });
            s.infos.pop_front().unwrap_or(Err(ControlError::NotFound))
        })
    }
}
