//! Wire formats for the control endpoint and the push stream.

use remote_sessions_core::{RemoteInfo, StartOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /sessions/{kind}/start`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest<'a> {
    pub resource_id: &'a str,
    pub options: &'a StartOptions,
}

/// Inbound push-stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Informational; logged, not rendered.
    Status {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// One log line.
    LogLine {
        #[serde(alias = "data", alias = "text")]
        line: String,
        /// Remote sequence number, when the host provides one.
        #[serde(default)]
        seq: Option<u64>,
    },
    /// Remote-side error; surfaced, does not end the stream.
    Error {
        #[serde(alias = "error")]
        message: String,
    },
}

/// Malformed push-stream frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

impl StreamFrame {
    /// Parse one text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known tagged JSON object.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse one binary frame carrying UTF-8 JSON.
    ///
    /// # Errors
    /// Returns error on invalid UTF-8 or malformed JSON.
    pub fn parse_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::parse(text)
    }

    /// A `status` frame announcing that the remote follower failed.
    #[must_use]
    pub fn is_fatal_status(&self) -> bool {
        matches!(
            self,
            Self::Status { status: Some(s), .. }
                if s.eq_ignore_ascii_case("error") || s.eq_ignore_ascii_case("failed")
        )
    }
}

/// Push-connection URL addressed by the stream session's remote info.
///
/// An explicit `url` field wins; otherwise the URL is assembled from
/// `protocol`, `endpoint`/`host`, `port` and an optional `path`.
#[must_use]
pub fn push_url(info: &RemoteInfo) -> Option<String> {
    if let Some(url) = info.get("url").and_then(Value::as_str) {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Some(url.to_string());
        }
    }

    let endpoint = info.endpoint()?;
    let port = info.port()?;
    let scheme = match info.protocol() {
        Some(p) if p.eq_ignore_ascii_case("wss") || p.eq_ignore_ascii_case("https") => "wss",
        _ => "ws",
    };
    let path = info.get("path").and_then(Value::as_str).unwrap_or("");
    let sep = if path.is_empty() || path.starts_with('/') { "" } else { "/" };

    Some(format!("{scheme}://{endpoint}:{port}{sep}{path}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn info(value: Value) -> RemoteInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn classifies_three_frame_kinds() {
        let status = StreamFrame::parse(r#"{"type":"status","message":"following"}"#).unwrap();
        assert!(matches!(status, StreamFrame::Status { .. }));
        assert!(!status.is_fatal_status());

        let line = StreamFrame::parse(r#"{"type":"log_line","data":"boot ok","seq":4}"#).unwrap();
        assert_eq!(
            line,
            StreamFrame::LogLine {
                line: "boot ok".into(),
                seq: Some(4)
            }
        );

        let err = StreamFrame::parse(r#"{"type":"error","message":"rotate failed"}"#).unwrap();
        assert!(matches!(err, StreamFrame::Error { ref message } if message == "rotate failed"));
    }

    #[test]
    fn error_status_is_fatal() {
        let frame = StreamFrame::parse(r#"{"type":"status","status":"error"}"#).unwrap();
        assert!(frame.is_fatal_status());
    }

    #[test]
    fn rejects_unknown_and_malformed_frames() {
        assert!(StreamFrame::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(StreamFrame::parse("not json").is_err());
        assert!(matches!(
            StreamFrame::parse_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn start_request_uses_camel_case() {
        let opts = StartOptions::new().with("lines", 100);
        let body = serde_json::to_value(StartRequest {
            resource_id: "z1",
            options: &opts,
        })
        .unwrap();
        assert_eq!(body, json!({"resourceId": "z1", "options": {"lines": 100}}));
    }

    #[test]
    fn push_url_from_fields_or_explicit_url() {
        assert_eq!(
            push_url(&info(json!({"endpoint": "10.0.0.2", "port": 7000, "path": "logs/z1"}))),
            Some("ws://10.0.0.2:7000/logs/z1".into())
        );
        assert_eq!(
            push_url(&info(json!({"host": "h", "port": "443", "protocol": "https"}))),
            Some("wss://h:443".into())
        );
        assert_eq!(
            push_url(&info(json!({"url": "wss://proxy/logs?id=1"}))),
            Some("wss://proxy/logs?id=1".into())
        );
        assert_eq!(push_url(&info(json!({"endpoint": "h"}))), None);
    }
}
