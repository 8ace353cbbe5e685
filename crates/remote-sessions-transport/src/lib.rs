//! Transport layer for remote session control and log streaming.
//!
//! Provides:
//! - HTTP control channel (start / stop / info)
//! - Push-stream frame protocol (JSON, tagged by `type`)
//! - Stream connection manager (feature: websocket)

pub mod http;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod stream;

pub use http::HttpControlChannel;
pub use protocol::{ProtocolError, StreamFrame};

#[cfg(feature = "websocket")]
pub use stream::{StreamError, StreamEvent, StreamHandle, StreamManager, StreamState};
