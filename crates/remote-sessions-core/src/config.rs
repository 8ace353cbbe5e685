//! Tunables for polling, verification, buffering and the control endpoint.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// Environment variable prefix read by [`SessionConfig::from_env`].
pub const ENV_PREFIX: &str = "REMOTE_SESSIONS_";

/// Session lifecycle configuration.
///
/// Durations are stored in milliseconds so the struct stays trivially
/// (de)serializable from JSON/TOML settings files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the remote session control endpoint.
    pub base_url: String,
    /// Delay between readiness polls.
    pub poll_interval_ms: u64,
    /// Maximum number of readiness `info` calls.
    pub poll_max_attempts: u32,
    /// Delay between a successful stop and the first verification call.
    pub kill_settle_delay_ms: u64,
    /// Delay between verification retries.
    pub kill_retry_interval_ms: u64,
    /// Maximum number of verification `info` calls.
    pub kill_max_attempts: u32,
    /// Maximum retained log lines per stream session.
    pub stream_buffer_capacity: usize,
    /// Per-request timeout for control-channel calls.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            poll_interval_ms: 500,
            poll_max_attempts: 10,
            kill_settle_delay_ms: 1500,
            kill_retry_interval_ms: 1500,
            kill_max_attempts: 3,
            stream_buffer_capacity: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `REMOTE_SESSIONS_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(url) = var("BASE_URL").filter(|s| !s.trim().is_empty()) {
            cfg.base_url = url.trim().trim_end_matches('/').to_string();
        }
        overlay(&var, "POLL_INTERVAL_MS", &mut cfg.poll_interval_ms);
        overlay(&var, "POLL_MAX_ATTEMPTS", &mut cfg.poll_max_attempts);
        overlay(&var, "KILL_SETTLE_DELAY_MS", &mut cfg.kill_settle_delay_ms);
        overlay(&var, "KILL_RETRY_INTERVAL_MS", &mut cfg.kill_retry_interval_ms);
        overlay(&var, "KILL_MAX_ATTEMPTS", &mut cfg.kill_max_attempts);
        overlay(&var, "STREAM_BUFFER_CAPACITY", &mut cfg.stream_buffer_capacity);
        overlay(&var, "REQUEST_TIMEOUT_MS", &mut cfg.request_timeout_ms);
        cfg
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn kill_settle_delay(&self) -> Duration {
        Duration::from_millis(self.kill_settle_delay_ms)
    }

    #[must_use]
    pub const fn kill_retry_interval(&self) -> Duration {
        Duration::from_millis(self.kill_retry_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn overlay<T>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(var = %format!("{ENV_PREFIX}{name}"), %raw, "ignoring invalid value: {e}"),
    }
}
