//! Push-stream (log-follow) connection manager.
//!
//! One push connection per stream session. The connection is opened after the
//! backing session is started through the control channel, fills a bounded
//! [`StreamBuffer`], and is closed before the backing session is stopped.
//! Unexpected disconnects are reported to views as a reconnect prompt; the
//! protocol has no resumption token, so nothing reconnects on its own.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use remote_sessions_core::{
    ControlChannel, ControlError, RemoteInfo, ResourceId, SessionKind, SessionStatus,
    SlotUpdate, StartOptions, StreamBuffer,
};
use remote_sessions_lifecycle::{SessionManager, SessionScope, StartOutcome, StopOutcome};
use tokio::{
    net::TcpStream,
    sync::{RwLock, broadcast, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{StreamFrame, push_url};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the remote close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-connection state machine: `idle -> starting -> streaming -> {stopped | errored}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    /// User stop; buffer cleared. Terminal.
    Stopped,
    /// Abnormal close or fatal status frame. Terminal for this instance.
    Errored,
}

impl StreamState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

/// Notification for views of a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Informational status frame.
    Status(String),
    /// Error frame or malformed frame; the connection stays open.
    Error(String),
    /// The connection ended without a user stop; offer a reconnect.
    Disconnected { reason: String },
}

/// Stream connection manager error.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("Stream session not ready: {0}")]
    NotReady(String),
    #[error("Stream session has no push endpoint")]
    MissingEndpoint,
    #[error("Failed to open push connection: {0}")]
    Connect(String),
    #[error("Stream cancelled")]
    Cancelled,
}

/// How a connection loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionEnd {
    /// Closed on user stop.
    Closed,
    /// Owning scope cancelled (view unmounted).
    Unmounted,
    /// Remote close, socket error, or fatal status frame.
    Failed(String),
}

struct Shared {
    id: Uuid,
    resource_id: ResourceId,
    session_id: Option<String>,
    buffer: Arc<StreamBuffer>,
    state: watch::Sender<StreamState>,
    events: broadcast::Sender<StreamEvent>,
    close: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// User stop or shutdown; an instance that already ended keeps its state.
    fn finish(&self) {
        self.buffer.clear();
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = StreamState::Stopped;
            true
        });
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event); // no views is fine
    }

    /// Classify one inbound text frame; returns the end reason for fatal frames.
    fn handle_text(&self, text: &str) -> Option<String> {
        match StreamFrame::parse(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                tracing::warn!(resource_id = %self.resource_id, "bad stream frame: {e}");
                self.emit(StreamEvent::Error(e.to_string()));
                None
            }
        }
    }

    fn handle_frame(&self, frame: StreamFrame) -> Option<String> {
        let fatal = frame.is_fatal_status();
        match frame {
            StreamFrame::LogLine { line, seq: Some(seq) } => {
                self.buffer.push_sequenced(seq, line);
            }
            StreamFrame::LogLine { line, seq: None } => {
                self.buffer.push_line(line);
            }
            StreamFrame::Status { status, message } => {
                let text = message.or(status).unwrap_or_default();
                tracing::info!(resource_id = %self.resource_id, connection = %self.id, "stream status: {text}");
                if fatal {
                    return Some(format!("remote follower failed: {text}"));
                }
                self.emit(StreamEvent::Status(text));
            }
            StreamFrame::Error { message } => {
                tracing::warn!(resource_id = %self.resource_id, "stream error frame: {message}");
                self.emit(StreamEvent::Error(message));
            }
        }
        None
    }
}

/// Handle to one stream connection instance, shared by all its views.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    /// Connection instance id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.shared.resource_id
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.shared.session_id.as_deref()
    }

    /// Retained log lines.
    #[must_use]
    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.shared.buffer
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    /// Receiver following state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// Receiver for status, error and disconnect notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }
}

struct Connection {
    handle: StreamHandle,
    task: JoinHandle<()>,
}

/// Owns the push connections of all stream sessions.
pub struct StreamManager<C>
where
    C: ControlChannel + 'static,
{
    sessions: SessionManager<C>,
    buffer_capacity: usize,
    connections: RwLock<HashMap<ResourceId, Connection>>,
}

impl<C> StreamManager<C>
where
    C: ControlChannel + 'static,
{
    /// Create a manager sharing the session manager's client and reconciler.
    #[must_use]
    pub fn new(sessions: SessionManager<C>, buffer_capacity: usize) -> Self {
        Self {
            sessions,
            buffer_capacity,
            connections: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionManager<C> {
        &self.sessions
    }

    /// Current connection for `resource_id`, if any.
    pub async fn handle(&self, resource_id: &str) -> Option<StreamHandle> {
        self.connections
            .read()
            .await
            .get(resource_id)
            .map(|c| c.handle.clone())
    }

    /// Lifecycle state of the stream session of `resource_id`.
    ///
    /// `Starting` while the backing session is being negotiated, `Idle` when
    /// nothing was ever followed.
    pub async fn state(&self, resource_id: &str) -> StreamState {
        if let Some(handle) = self.handle(resource_id).await {
            return handle.state();
        }
        match self.sessions.reconciler().slot(resource_id, SessionKind::Stream).status {
            SessionStatus::Starting | SessionStatus::Active => StreamState::Starting,
            _ => StreamState::Idle,
        }
    }

    /// Start following the logs of `resource_id`.
    ///
    /// While a connection is streaming the existing handle is returned. A
    /// connection that already ended is replaced by a fresh instance.
    ///
    /// # Errors
    /// Returns error if the session cannot be started or the push connection
    /// cannot be opened; the stream slot is marked `error`.
    pub async fn follow(
        &self,
        resource_id: &str,
        options: &StartOptions,
        scope: &SessionScope,
    ) -> Result<StreamHandle, StreamError> {
        if let Some(handle) = self.handle(resource_id).await {
            if !handle.state().is_terminal() {
                return Ok(handle);
            }
            // Previous instance ended; tear its backing session down first.
            self.stop(resource_id, scope).await?;
        }

        let descriptor = match self
            .sessions
            .start_session(resource_id, SessionKind::Stream, options, scope)
            .await?
        {
            StartOutcome::Ready { descriptor, .. } | StartOutcome::AlreadyActive(descriptor) => descriptor,
            StartOutcome::NotReady { reason, .. } => return Err(StreamError::NotReady(reason)),
            // Whatever the start left behind is torn down by the session manager.
            StartOutcome::Cancelled => return Err(StreamError::Cancelled),
        };

        let remote_info = descriptor.remote_info.unwrap_or_default();
        let ws = match self.connect(resource_id, &remote_info).await {
            Ok(ws) => ws,
            Err(e) => {
                self.abandon_session(resource_id, scope, &e).await;
                return Err(e);
            }
        };
        if scope.is_cancelled() {
            drop(ws);
            self.discard_session(resource_id, descriptor.session_id.as_deref());
            return Err(StreamError::Cancelled);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(StreamState::Streaming);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            session_id: descriptor.session_id,
            buffer: Arc::new(StreamBuffer::new(self.buffer_capacity)),
            state,
            events,
            close: CancellationToken::new(),
        });
        tracing::info!(resource_id, connection = %shared.id, "log stream connected");

        let handle = StreamHandle {
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(run_connection(
            ws,
            shared,
            scope.clone(),
            self.sessions.clone(),
        ));
        self.connections.write().await.insert(
            resource_id.to_string(),
            Connection {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    async fn connect(&self, resource_id: &str, info: &RemoteInfo) -> Result<WsStream, StreamError> {
        let url = push_url(info).ok_or(StreamError::MissingEndpoint)?;
        tracing::debug!(resource_id, %url, "opening push connection");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(ws)
    }

    /// Connection failed after the backing session started: do not leave it running.
    ///
    /// The stop runs even when the owner is gone; only the error notice is
    /// skipped then.
    async fn abandon_session(&self, resource_id: &str, scope: &SessionScope, err: &StreamError) {
        tracing::error!(resource_id, "log stream failed to connect: {err}");
        let teardown = SessionScope::new();
        if let Err(e) = self.sessions.stop_session(resource_id, SessionKind::Stream, &teardown).await {
            tracing::warn!(resource_id, "failed to stop orphaned stream session: {e}");
        }
        if !scope.is_cancelled() {
            self.sessions.reconciler().merge_slot(
                resource_id,
                SessionKind::Stream,
                SlotUpdate::failed(err.to_string()),
            );
        }
    }

    /// Detached stop of a session whose consumer went away.
    fn discard_session(&self, resource_id: &str, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            self.sessions
                .spawn_teardown(resource_id, SessionKind::Stream, session_id);
        }
    }

    /// User stop: close the push connection, then stop the backing session.
    ///
    /// # Errors
    /// Returns the control error of the stop call; the stream slot then stays
    /// `stopping` with a warning.
    pub async fn stop(
        &self,
        resource_id: &str,
        scope: &SessionScope,
    ) -> Result<StopOutcome, StreamError> {
        let connection = self.connections.write().await.remove(resource_id);
        if let Some(Connection { handle, task }) = connection {
            handle.shared.close.cancel();
            if let Err(e) = task.await {
                tracing::warn!(resource_id, "stream connection task failed: {e}");
            }
            handle.shared.finish();
            tracing::info!(resource_id, connection = %handle.id(), "log stream closed");
        }

        Ok(self
            .sessions
            .stop_session(resource_id, SessionKind::Stream, scope)
            .await?)
    }

    /// Close every connection without touching state, e.g. on shutdown.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.write().await.drain().collect();
        for (resource_id, Connection { handle, task }) in connections {
            handle.shared.close.cancel();
            if let Err(e) = task.await {
                tracing::warn!(%resource_id, "stream connection task failed: {e}");
            }
            handle.shared.finish();
        }
    }
}

async fn run_connection<C>(
    ws: WsStream,
    shared: Arc<Shared>,
    scope: SessionScope,
    sessions: SessionManager<C>,
) where
    C: ControlChannel + 'static,
{
    let end = read_frames(ws, &shared, &scope).await;
    let resource_id = shared.resource_id.as_str();

    match end {
        ConnectionEnd::Closed => {}
        ConnectionEnd::Unmounted => {
            tracing::debug!(resource_id, "stream owner gone, closing connection");
            shared.finish();
            // The shared slot must not keep advertising a stream nobody reads.
            if let Some(session_id) = shared.session_id.as_deref() {
                sessions.spawn_teardown(resource_id, SessionKind::Stream, session_id);
            }
        }
        ConnectionEnd::Failed(reason) => {
            tracing::warn!(resource_id, connection = %shared.id, "log stream disconnected: {reason}");
            shared.set_state(StreamState::Errored);
            shared.emit(StreamEvent::Disconnected {
                reason: reason.clone(),
            });
            if !scope.is_cancelled() {
                // Keep the session id so a later stop can still tear it down.
                sessions.reconciler().merge_slot(
                    resource_id,
                    SessionKind::Stream,
                    SlotUpdate {
                        status: Some(SessionStatus::Error),
                        notice: Some(Some(format!("Log stream disconnected: {reason}"))),
                        ..SlotUpdate::default()
                    },
                );
            }
        }
    }
}

async fn read_frames(mut ws: WsStream, shared: &Shared, scope: &SessionScope) -> ConnectionEnd {
    loop {
        tokio::select! {
            biased;
            () = shared.close.cancelled() => {
                close_quietly(&mut ws).await;
                return ConnectionEnd::Closed;
            }
            () = scope.cancelled() => {
                close_quietly(&mut ws).await;
                return ConnectionEnd::Unmounted;
            }
            msg = ws.next() => {
                let fatal = match msg {
                    Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => shared.handle_text(text),
                        Err(_) => {
                            shared.emit(StreamEvent::Error(
                                crate::ProtocolError::InvalidUtf8.to_string(),
                            ));
                            None
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by remote host ({}): {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by remote host".to_string());
                        return ConnectionEnd::Failed(reason);
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => return ConnectionEnd::Failed(e.to_string()),
                    None => return ConnectionEnd::Failed("connection closed".to_string()),
                };
                if let Some(reason) = fatal {
                    close_quietly(&mut ws).await;
                    return ConnectionEnd::Failed(reason);
                }
            }
        }
    }
}

async fn close_quietly(ws: &mut WsStream) {
    if let Err(e) = ws.close(None).await {
        tracing::trace!("close frame not sent: {e}");
        return;
    }
    // Drain until the peer acknowledges or the grace period runs out.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
