//! Core abstractions for remote session lifecycle management.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionKind` / `SessionStatus` / `SessionDescriptor` - the session data model
//! - `RemoteInfo` - opaque connection metadata returned by the remote host
//! - `ControlChannel` - request/response contract against the session endpoint
//! - `StreamBuffer` - bounded ring of log lines with live subscribers
//! - `Reconciler` - per-resource state, mutated only by keyed slot merges
//! - `SessionConfig` - polling bounds, buffer capacity, endpoint

pub mod config;
pub mod control;
pub mod remote_info;
pub mod state;
pub mod stream_buffer;
pub mod types;

pub use config::SessionConfig;
pub use control::{ControlChannel, ControlError, SessionInfo, SessionStartResult, StopResult};
pub use remote_info::RemoteInfo;
pub use state::{Reconciler, ResourceState, SlotState, SlotUpdate, StateChange};
pub use stream_buffer::{BufferEvent, StreamBuffer, StreamEntry};
pub use types::{ResourceId, SessionDescriptor, SessionKind, SessionStatus, StartOptions};
