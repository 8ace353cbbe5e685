//! Bounded ring of log lines with live subscribers.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Live channel depth. Lagging views resync from `snapshot`.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// One retained log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub text: String,
    /// Unix epoch milliseconds.
    pub received_at: i64,
    /// Monotonic per connection instance.
    pub sequence_id: u64,
}

/// Change notification delivered to live views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    Line(StreamEntry),
    Cleared,
}

struct Inner {
    entries: VecDeque<StreamEntry>,
    last_sequence: Option<u64>,
}

/// Ordered, bounded buffer of the most recent lines of one stream session.
///
/// Oldest entries are evicted first once `capacity` is reached. Several views
/// (inline preview, full-screen) can subscribe to the same buffer.
pub struct StreamBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    sender: broadcast::Sender<BufferEvent>,
}

impl StreamBuffer {
    /// Create a buffer retaining at most `capacity` lines (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(256)),
                last_sequence: None,
            }),
            capacity,
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line numbered after the last accepted one.
    ///
    /// Returns the assigned sequence id.
    pub fn push_line(&self, text: impl Into<String>) -> u64 {
        let mut inner = self.lock();
        let seq = inner.last_sequence.map_or(0, |s| s + 1);
        self.insert(&mut inner, seq, text.into());
        seq
    }

    /// Append a line carrying a remote sequence id.
    ///
    /// Lines whose id is not greater than the last accepted one are dropped
    /// and `None` is returned.
    pub fn push_sequenced(&self, sequence_id: u64, text: impl Into<String>) -> Option<u64> {
        let mut inner = self.lock();
        if inner.last_sequence.is_some_and(|last| sequence_id <= last) {
            tracing::trace!(sequence_id, "dropping duplicate stream line");
            return None;
        }
        self.insert(&mut inner, sequence_id, text.into());
        Some(sequence_id)
    }

    fn insert(&self, inner: &mut Inner, sequence_id: u64, text: String) {
        while inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        let entry = StreamEntry {
            text,
            received_at: now_millis(),
            sequence_id,
        };
        inner.entries.push_back(entry.clone());
        inner.last_sequence = Some(sequence_id);
        let _ = self.sender.send(BufferEvent::Line(entry)); // live views
    }

    /// Drop all retained lines and reset sequencing.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.last_sequence = None;
        let _ = self.sender.send(BufferEvent::Cleared);
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Highest accepted sequence id.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.lock().last_sequence
    }

    /// Retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.sender.subscribe()
    }

    /// Stream that yields retained lines first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, BufferEvent> {
        // Subscribe before snapshotting so no line falls between the two.
        let rx = self.subscribe();
        let history = self.snapshot();
        let floor = history.last().map(|e| e.sequence_id);

        let hist = futures::stream::iter(history.into_iter().map(BufferEvent::Line));
        let live = BroadcastStream::new(rx)
            .scan(floor, |floor, res| {
                let item = match res {
                    Ok(BufferEvent::Line(e)) if floor.is_some_and(|f| e.sequence_id <= f) => None,
                    Ok(BufferEvent::Cleared) => {
                        *floor = None;
                        Some(BufferEvent::Cleared)
                    }
                    Ok(event) => Some(event),
                    Err(_) => None,
                };
                future::ready(Some(item))
            })
            .filter_map(future::ready);

        Box::pin(hist.chain(live))
    }

    /// Stream of line texts until the buffer is cleared.
    #[must_use]
    pub fn lines_stream(&self) -> futures::stream::BoxStream<'static, String> {
        self.history_plus_stream()
            .take_while(|event| future::ready(!matches!(event, BufferEvent::Cleared)))
            .filter_map(|event| async move {
                match event {
                    BufferEvent::Line(entry) => Some(entry.text),
                    BufferEvent::Cleared => None,
                }
            })
            .boxed()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn sixty_lines_into_fifty_keeps_the_newest() {
        let buf = StreamBuffer::new(50);
        for i in 0..60 {
            buf.push_line(format!("line {i}"));
        }

        let entries = buf.snapshot();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries.first().unwrap().sequence_id, 10);
        assert_eq!(entries.last().unwrap().sequence_id, 59);
        assert_eq!(entries.first().unwrap().text, "line 10");
        assert!(entries.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
    }

    #[test]
    fn never_exceeds_capacity() {
        let buf = StreamBuffer::new(3);
        for i in 0..10 {
            buf.push_line(i.to_string());
            assert!(buf.len() <= 3);
        }
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    fn sequenced_lines_deduplicate() {
        let buf = StreamBuffer::new(10);
        assert_eq!(buf.push_sequenced(5, "a"), Some(5));
        assert_eq!(buf.push_sequenced(5, "a again"), None);
        assert_eq!(buf.push_sequenced(3, "late"), None);
        assert_eq!(buf.push_sequenced(6, "b"), Some(6));
        assert_eq!(buf.push_line("local"), 7);
        let texts: Vec<_> = buf.snapshot().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, ["a", "b", "local"]);
    }

    #[test]
    fn clear_resets_sequencing() {
        let buf = StreamBuffer::new(4);
        buf.push_line("x");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.last_sequence(), None);
        assert_eq!(buf.push_line("y"), 0);
    }

    #[tokio::test]
    async fn late_view_gets_history_then_live_lines() {
        let buf = StreamBuffer::new(8);
        buf.push_line("one");
        buf.push_line("two");

        let mut lines = buf.lines_stream();
        buf.push_line("three");
        buf.clear();

        let mut got = Vec::new();
        while let Some(line) = lines.next().await {
            got.push(line);
        }
        assert_eq!(got, ["one", "two", "three"]);
    }
}
