//! Resumable model-response streams, keyed by chat.
//!
//! Each record buffers the serialized chunks it has emitted (capped at
//! [`MAX_BUFFER_BYTES`], oldest dropped first) and fans them out live. A
//! client that reconnects attaches by chat id and gets the buffer followed
//! by whatever arrives next, with no gap or duplicate between the two.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use toolrelay_protocol::StreamChunk;

pub const MAX_BUFFER_BYTES: usize = 2 * 1024 * 1024;
/// Completed records stay attachable this long.
pub const COMPLETED_TTL: Duration = Duration::from_secs(60);
/// Incomplete records with no new chunk for this long are abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(120);

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum LiveEvent {
    Chunk { seq: u64, data: Arc<str> },
    End,
}

struct Buffer {
    /// `(seq, data)` in push order; seqs are contiguous.
    chunks: VecDeque<(u64, Arc<str>)>,
    next_seq: u64,
    bytes: usize,
    completed_at: Option<Instant>,
    last_activity: Instant,
}

type SharedBuffer = Arc<Mutex<Buffer>>;

fn lock_buffer(buffer: &Mutex<Buffer>) -> MutexGuard<'_, Buffer> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct StreamRecord {
    stream_id: String,
    buffer: SharedBuffer,
    live: broadcast::Sender<LiveEvent>,
}

impl StreamRecord {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            stream_id: toolrelay_protocol::new_id(),
            buffer: Arc::new(Mutex::new(Buffer {
                chunks: VecDeque::new(),
                next_seq: 0,
                bytes: 0,
                completed_at: None,
                last_activity: Instant::now(),
            })),
            live,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        lock_buffer(&self.buffer)
    }

    /// Buffer and broadcast one chunk. Ignored once the record is complete.
    pub fn push(&self, chunk: &StreamChunk) {
        let data: Arc<str> = chunk.to_json().into();
        let mut buffer = self.lock();
        if buffer.completed_at.is_some() {
            return;
        }

        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.bytes += data.len();
        buffer.chunks.push_back((seq, data.clone()));
        while buffer.bytes > MAX_BUFFER_BYTES {
            let Some((_, dropped)) = buffer.chunks.pop_front() else {
                break;
            };
            buffer.bytes -= dropped.len();
        }
        buffer.last_activity = Instant::now();

        // Sent under the lock so attach() sees each chunk exactly once.
        let _ = self.live.send(LiveEvent::Chunk { seq, data });
    }

    /// Mark the stream finished and end every live subscriber.
    pub fn complete(&self) {
        let mut buffer = self.lock();
        if buffer.completed_at.is_some() {
            return;
        }
        buffer.completed_at = Some(Instant::now());
        let _ = self.live.send(LiveEvent::End);
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed_at.is_some()
    }

    /// Buffered chunks followed by live ones until the stream completes.
    /// A subscriber that falls behind the live channel is refilled from the
    /// buffer, so it still sees every chunk in order.
    pub fn attach(&self) -> BoxStream<'static, Arc<str>> {
        let buffer = self.lock();
        let backlog: Vec<Arc<str>> = buffer.chunks.iter().map(|(_, d)| d.clone()).collect();
        if buffer.completed_at.is_some() {
            return stream::iter(backlog).boxed();
        }

        let follower = LiveFollower {
            stream_id: self.stream_id.clone(),
            buffer: self.buffer.clone(),
            receiver: BroadcastStream::new(self.live.subscribe()),
            next_seq: buffer.next_seq,
            refill: VecDeque::new(),
            ended: false,
        };
        drop(buffer);

        let live = stream::unfold(follower, |mut follower| async move {
            let data = follower.next_chunk().await?;
            Some((data, follower))
        });
        stream::iter(backlog).chain(live).boxed()
    }

    fn is_expired(&self, now: Instant) -> bool {
        let buffer = self.lock();
        match buffer.completed_at {
            Some(at) => now.duration_since(at) >= COMPLETED_TTL,
            None => now.duration_since(buffer.last_activity) >= STALE_AFTER,
        }
    }
}

/// Live half of an attached stream.
struct LiveFollower {
    stream_id: String,
    buffer: SharedBuffer,
    receiver: BroadcastStream<LiveEvent>,
    /// Seq of the next chunk this subscriber has not yet yielded.
    next_seq: u64,
    refill: VecDeque<Arc<str>>,
    ended: bool,
}

impl LiveFollower {
    async fn next_chunk(&mut self) -> Option<Arc<str>> {
        loop {
            if let Some(data) = self.refill.pop_front() {
                return Some(data);
            }
            if self.ended {
                return None;
            }
            match self.receiver.next().await? {
                Ok(LiveEvent::Chunk { seq, data }) => {
                    if seq < self.next_seq {
                        continue;
                    }
                    self.next_seq = seq + 1;
                    return Some(data);
                }
                Ok(LiveEvent::End) => return None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => self.catch_up(missed),
            }
        }
    }

    fn catch_up(&mut self, missed: u64) {
        let buffer = lock_buffer(&self.buffer);
        let oldest = buffer.chunks.front().map_or(buffer.next_seq, |(seq, _)| *seq);
        debug!(
            component = "stream_store",
            event = "stream.subscriber_lagged",
            stream_id = %self.stream_id,
            missed,
            from_seq = self.next_seq,
        );

        if oldest > self.next_seq {
            // The missed chunks were already evicted from the buffer.
            warn!(
                component = "stream_store",
                event = "stream.subscriber_gap",
                stream_id = %self.stream_id,
                lost = oldest - self.next_seq,
                "Subscriber fell behind the buffer; ending its stream"
            );
            self.refill.push_back(
                StreamChunk::Error {
                    code: "stream_lagged".to_string(),
                    message: "Stream fell behind; reattach to resume".to_string(),
                }
                .to_json()
                .into(),
            );
            self.ended = true;
            return;
        }

        self.refill.extend(
            buffer
                .chunks
                .iter()
                .filter(|(seq, _)| *seq >= self.next_seq)
                .map(|(_, data)| data.clone()),
        );
        self.next_seq = buffer.next_seq;
        if buffer.completed_at.is_some() {
            self.ended = true;
        }
    }
}

#[derive(Default)]
pub struct StreamStore {
    by_chat: DashMap<String, Arc<StreamRecord>>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new stream for `chat_id`, ending any earlier one.
    pub fn begin(&self, chat_id: &str) -> Arc<StreamRecord> {
        let record = Arc::new(StreamRecord::new());
        if let Some(previous) = self.by_chat.insert(chat_id.to_string(), record.clone()) {
            debug!(
                component = "stream_store",
                event = "stream.replaced",
                chat_id = %chat_id,
                previous_stream_id = %previous.stream_id,
            );
            previous.complete();
        }
        record
    }

    pub fn get(&self, chat_id: &str) -> Option<Arc<StreamRecord>> {
        self.by_chat.get(chat_id).map(|r| r.clone())
    }

    /// Drop expired records. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.by_chat.len();
        self.by_chat.retain(|_, record| {
            let expired = record.is_expired(now);
            if expired {
                // Stale records still have subscribers waiting for an end.
                record.complete();
            }
            !expired
        });
        before.saturating_sub(self.by_chat.len())
    }

    pub fn len(&self) -> usize {
        self.by_chat.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> StreamChunk {
        StreamChunk::Text {
            text: s.to_string(),
        }
    }

    fn as_text(data: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        value["text"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn attach_replays_buffer_then_follows_live() {
        let store = StreamStore::new();
        let record = store.begin("chat-1");
        record.push(&text("a"));
        record.push(&text("b"));

        let mut attached = store.get("chat-1").unwrap().attach();
        record.push(&text("c"));
        record.complete();

        let mut seen = Vec::new();
        while let Some(data) = attached.next().await {
            seen.push(as_text(&data));
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn completed_stream_replays_and_ends() {
        let store = StreamStore::new();
        let record = store.begin("chat-1");
        record.push(&text("only"));
        record.complete();
        record.push(&text("ignored"));

        let seen: Vec<String> = record.attach().map(|d| as_text(&d)).collect().await;
        assert_eq!(seen, vec!["only"]);
    }

    #[tokio::test]
    async fn buffer_drops_oldest_past_cap() {
        let record = StreamRecord::new();
        let big = "x".repeat(MAX_BUFFER_BYTES / 2);
        record.push(&text(&big));
        record.push(&text(&big));
        record.push(&text("tail"));
        record.complete();

        let seen: Vec<String> = record.attach().map(|d| as_text(&d)).collect().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.last().map(String::as_str), Some("tail"));
        assert!(record.lock().bytes <= MAX_BUFFER_BYTES);
    }

    #[tokio::test]
    async fn begin_replaces_and_ends_previous_stream() {
        let store = StreamStore::new();
        let first = store.begin("chat-1");
        let mut attached = first.attach();
        let second = store.begin("chat-1");

        assert!(first.is_completed());
        assert!(attached.next().await.is_none());
        assert_eq!(store.get("chat-1").unwrap().stream_id(), second.stream_id());
    }

    #[tokio::test]
    async fn slow_subscriber_is_refilled_from_buffer() {
        let record = StreamRecord::new();
        record.push(&text("early"));
        let attached = record.attach();

        for i in 0..300 {
            record.push(&text(&i.to_string()));
        }
        record.complete();

        let seen: Vec<String> = attached.map(|d| as_text(&d)).collect().await;
        let mut expected = vec!["early".to_string()];
        expected.extend((0..300).map(|i| i.to_string()));
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn subscriber_behind_evicted_chunks_ends_with_error() {
        let record = StreamRecord::new();
        let attached = record.attach();

        let big = "x".repeat(MAX_BUFFER_BYTES / 200);
        for _ in 0..LIVE_CHANNEL_CAPACITY + 400 {
            record.push(&text(&big));
        }
        record.complete();

        let seen: Vec<serde_json::Value> = attached
            .map(|d| serde_json::from_str(&d).unwrap())
            .collect()
            .await;
        let last = seen.last().expect("error chunk");
        assert_eq!(last["type"], "error");
        assert_eq!(last["code"], "stream_lagged");
        assert!(seen[..seen.len() - 1].iter().all(|v| v["type"] == "text"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_completed_and_stale_records() {
        let store = StreamStore::new();
        store.begin("done").complete();
        store.begin("stale").push(&text("hello"));

        tokio::time::advance(COMPLETED_TTL).await;
        assert_eq!(store.sweep(), 1);
        assert!(store.get("done").is_none());
        assert!(store.get("stale").is_some());

        tokio::time::advance(STALE_AFTER - COMPLETED_TTL).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 0);
    }
}
