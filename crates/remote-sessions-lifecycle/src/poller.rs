//! Readiness polling after a start request.

use std::time::Duration;

use remote_sessions_core::{ControlChannel, ControlError, SessionConfig, SessionInfo, SessionKind};

use crate::SessionScope;

/// Outcome of a readiness poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Session active with connection fields.
    Ready { info: SessionInfo, attempts: u32 },
    /// Attempt bound exhausted.
    NotReady { attempts: u32, reason: String },
    /// The owning scope was cancelled; nothing should be written.
    Cancelled { attempts: u32 },
}

impl Readiness {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Ready { attempts, .. }
            | Self::NotReady { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Polls `info` until the session is usable or `max_attempts` is reached.
///
/// Worst-case duration is bounded by `max_attempts × interval` plus the
/// latency of the calls themselves.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    interval: Duration,
    max_attempts: u32,
}

impl ReadinessPoller {
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.poll_interval(), config.poll_max_attempts)
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Poll until ready. The first `info` call is issued immediately.
    pub async fn poll<C>(
        &self,
        client: &C,
        resource_id: &str,
        kind: SessionKind,
        scope: &SessionScope,
    ) -> Readiness
    where
        C: ControlChannel + ?Sized,
    {
        let mut last_reason = String::from("no response");

        for attempt in 1..=self.max_attempts {
            if scope.is_cancelled() {
                return Readiness::Cancelled { attempts: attempt - 1 };
            }

            match client.info(resource_id, kind).await {
                Ok(info) if info.is_ready() => {
                    tracing::info!(resource_id, %kind, attempt, "session ready");
                    return Readiness::Ready { info, attempts: attempt };
                }
                Ok(info) if info.is_active() => {
                    last_reason = "session active but missing connection endpoint or port".into();
                }
                Ok(_) => last_reason = "session not active yet".into(),
                Err(ControlError::NotFound) => last_reason = "session not registered yet".into(),
                Err(e) => {
                    tracing::warn!(resource_id, %kind, attempt, "readiness check failed: {e}");
                    last_reason = e.to_string();
                }
            }
            tracing::debug!(resource_id, %kind, attempt, reason = %last_reason, "session not ready");

            if attempt < self.max_attempts && !scope.sleep(self.interval).await {
                return Readiness::Cancelled { attempts: attempt };
            }
        }

        Readiness::NotReady {
            attempts: self.max_attempts,
            reason: format!(
                "{kind} session not ready after {} attempts: {last_reason}",
                self.max_attempts
            ),
        }
    }
}
