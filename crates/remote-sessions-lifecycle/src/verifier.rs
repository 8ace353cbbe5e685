//! Post-stop verification.

use std::time::Duration;

use remote_sessions_core::{ControlChannel, ControlError, SessionConfig, SessionKind};

use crate::SessionScope;

/// Outcome of a kill verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillVerdict {
    /// The remote host no longer reports the session.
    Confirmed { attempts: u32 },
    /// Attempt bound exhausted with the session still present.
    Unconfirmed { attempts: u32, reason: String },
    /// The owning scope was cancelled; nothing should be written.
    Cancelled { attempts: u32 },
}

/// Confirms a stop took effect, since remote teardown is asynchronous
/// relative to the stop response.
#[derive(Debug, Clone, Copy)]
pub struct KillVerifier {
    settle_delay: Duration,
    retry_interval: Duration,
    max_attempts: u32,
}

impl KillVerifier {
    #[must_use]
    pub fn new(settle_delay: Duration, retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            settle_delay,
            retry_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.kill_settle_delay(),
            config.kill_retry_interval(),
            config.kill_max_attempts,
        )
    }

    /// Wait `settle_delay`, then check until the session is gone.
    ///
    /// Returns as soon as a check reports the session absent or inactive.
    pub async fn verify<C>(
        &self,
        client: &C,
        resource_id: &str,
        kind: SessionKind,
        scope: &SessionScope,
    ) -> KillVerdict
    where
        C: ControlChannel + ?Sized,
    {
        let mut reason = String::new();

        for attempt in 1..=self.max_attempts {
            let wait = if attempt == 1 {
                self.settle_delay
            } else {
                self.retry_interval
            };
            if !scope.sleep(wait).await {
                return KillVerdict::Cancelled { attempts: attempt - 1 };
            }

            match client.info(resource_id, kind).await {
                Err(ControlError::NotFound) => {
                    tracing::info!(resource_id, %kind, attempt, "session teardown confirmed");
                    return KillVerdict::Confirmed { attempts: attempt };
                }
                Ok(info) if !info.is_active() => {
                    tracing::info!(resource_id, %kind, attempt, "session reported inactive");
                    return KillVerdict::Confirmed { attempts: attempt };
                }
                Ok(_) => reason = "session still reports active".into(),
                Err(e) => reason = e.to_string(),
            }
            tracing::debug!(resource_id, %kind, attempt, %reason, "session still present");
        }

        tracing::warn!(
            resource_id,
            %kind,
            attempts = self.max_attempts,
            "could not confirm session teardown: {reason}"
        );
        KillVerdict::Unconfirmed {
            attempts: self.max_attempts,
            reason,
        }
    }
}
