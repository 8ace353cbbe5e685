//! Cancellation scope of the view that owns a lifecycle.

use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

/// Cancellation handle tied to the consumer of a session (a UI surface).
///
/// Once cancelled, in-flight lifecycles finish their current network call
/// but discard the result instead of writing state, and poll loops stop.
#[derive(Debug, Clone, Default)]
pub struct SessionScope {
    token: CancellationToken,
}

impl SessionScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope cancelled together with `self`, but cancellable on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Cancel the scope, e.g. when the owning view unmounts.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration`; returns `false` if the scope was cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.token.cancelled() => false,
        }
    }

    /// Guard that cancels the scope when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Underlying token, for `select!` in connection loops.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
