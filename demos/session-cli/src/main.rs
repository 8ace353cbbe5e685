//! Command-line driver for console and stream sessions.
//!
//! Run with: cargo run -p session-cli -- <command> <resource> [args]
//!
//! ```text
//! session-cli start  <resource> [console|stream]
//! session-cli stop   <resource> <console|stream> <session-id>
//! session-cli info   <resource> [console|stream]
//! session-cli follow <resource>
//! ```
//!
//! The control endpoint and timing bounds come from `REMOTE_SESSIONS_*`
//! environment variables.

use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use remote_sessions_core::{
    ControlChannel, Reconciler, RemoteInfo, SessionConfig, SessionKind, SlotUpdate, StartOptions,
};
use remote_sessions_lifecycle::{SessionManager, SessionScope, StartOutcome, StopOutcome};
use remote_sessions_transport::{HttpControlChannel, StreamEvent, StreamManager};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: session-cli <start|stop|info|follow> <resource> [console|stream] [session-id]";

fn parse_kind(arg: Option<&str>) -> anyhow::Result<SessionKind> {
    match arg {
        None | Some("console") => Ok(SessionKind::Console),
        Some("stream") => Ok(SessionKind::Stream),
        Some(other) => bail!("unknown session kind {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(command), Some(resource)) = (args.first(), args.get(1)) else {
        bail!(USAGE);
    };

    let config = SessionConfig::from_env();
    let client = HttpControlChannel::from_config(&config)
        .with_context(|| format!("control endpoint {}", config.base_url))?;
    let sessions = SessionManager::new(Arc::new(client), Reconciler::new(), &config);
    let scope = SessionScope::new();

    match command.as_str() {
        "start" => {
            let kind = parse_kind(args.get(2).map(String::as_str))?;
            match sessions
                .start_session(resource, kind, &StartOptions::new(), &scope)
                .await?
            {
                StartOutcome::Ready { descriptor, attempts } => {
                    tracing::info!(attempts, "session ready");
                    println!("{}", serde_json::to_string_pretty(&descriptor)?);
                }
                StartOutcome::AlreadyActive(descriptor) => {
                    println!("{}", serde_json::to_string_pretty(&descriptor)?);
                }
                StartOutcome::NotReady { reason, .. } => bail!(reason),
                StartOutcome::Cancelled => bail!("cancelled"),
            }
        }
        "stop" => {
            let kind = parse_kind(args.get(2).map(String::as_str))?;
            let session_id = args.get(3).context(USAGE)?;
            // A fresh process knows nothing; seed the slot with the id to stop.
            sessions.reconciler().merge_slot(
                resource,
                kind,
                SlotUpdate::active(Some(session_id.clone()), RemoteInfo::default()),
            );
            match sessions.stop_session(resource, kind, &scope).await? {
                StopOutcome::Confirmed { attempts } => println!("stopped ({attempts} checks)"),
                StopOutcome::AlreadyAbsent => println!("no session"),
                StopOutcome::Unconfirmed { reason, .. } => {
                    println!("warning: session may still be running: {reason}");
                }
                StopOutcome::Cancelled => bail!("cancelled"),
            }
        }
        "info" => {
            let kind = parse_kind(args.get(2).map(String::as_str))?;
            let info = sessions.client().info(resource, kind).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        "follow" => {
            let streams = StreamManager::new(sessions, config.stream_buffer_capacity);
            follow(&streams, resource, &scope).await?;
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
    Ok(())
}

/// Print log lines until ctrl-c or a disconnect, then stop the stream.
async fn follow<C>(
    streams: &StreamManager<C>,
    resource: &str,
    scope: &SessionScope,
) -> anyhow::Result<()>
where
    C: ControlChannel + 'static,
{
    let handle = streams.follow(resource, &StartOptions::new(), scope).await?;
    let mut lines = handle.buffer().lines_stream();
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            event = events.recv() => {
                if !keep_following(event) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let outcome = streams.stop(resource, scope).await?;
    tracing::info!(?outcome, "stream stopped");
    Ok(())
}

/// Report one stream notification; `false` once the follow loop should end.
fn keep_following(event: Result<StreamEvent, RecvError>) -> bool {
    match event {
        Ok(StreamEvent::Status(status)) => eprintln!("[status] {status}"),
        Ok(StreamEvent::Error(message)) => eprintln!("[error] {message}"),
        Ok(StreamEvent::Disconnected { reason }) => {
            eprintln!("[disconnected] {reason}; run follow again to reconnect");
            return false;
        }
        Err(RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "missed stream notifications");
        }
        Err(RecvError::Closed) => return false,
    }
    true
}
