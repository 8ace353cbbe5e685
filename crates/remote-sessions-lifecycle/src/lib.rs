//! Session orchestration for remote console and log sessions.
//!
//! Provides:
//! - `ReadinessPoller` - bounded `info` polling after a start
//! - `KillVerifier` - bounded `info` polling after a stop
//! - `SessionManager` - start/stop orchestration writing through the `Reconciler`
//! - `SessionScope` - cancellation owned by the consuming view

pub mod manager;
pub mod poller;
pub mod scope;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use manager::{SessionManager, StartOutcome, StopOutcome};
pub use poller::{Readiness, ReadinessPoller};
pub use scope::SessionScope;
pub use verifier::{KillVerdict, KillVerifier};
