//! Outbound queue and the WebSocket writer task
//!
//! Capture produces one chunk per frame on its own thread; the writer task is
//! the single place where those chunks are serialized and written to the
//! socket. The queue between them is bounded so a slow connection cannot grow
//! memory without limit.

use crate::codec::EncodedChunk;
use crate::gemini::{ClientMessage, MediaChunk, RealtimeInput};
use futures_util::{Sink, SinkExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Frames held before the overflow policy applies, about 8 s of audio.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// What to do with a new chunk when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued chunk so the newest audio gets through
    #[default]
    DropOldest,
    /// Discard the incoming chunk
    DropNewest,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<EncodedChunk>,
    closed: bool,
}

/// Bounded multi-producer queue with an explicit overflow policy.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a chunk without blocking. Returns false if it was not queued.
    pub fn push(&self, chunk: EncodedChunk) -> bool {
        let queued = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.closed {
                return false;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(chunk);
                true
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(chunk);
                        self.record_drop();
                        true
                    }
                    OverflowPolicy::DropNewest => {
                        self.record_drop();
                        false
                    }
                }
            }
        };

        if queued {
            self.notify.notify_one();
        }
        queued
    }

    /// Wait for the next chunk. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<EncodedChunk> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = match self.state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(chunk) = state.items.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting chunks. Already queued chunks can still be popped.
    pub fn close(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.closed,
            Err(poisoned) => poisoned.into_inner().closed,
        }
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.items.len(),
            Err(poisoned) => poisoned.into_inner().items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks discarded because of overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 50 == 0 {
            warn!("Outbound queue full, {} audio chunks dropped so far", total);
        }
    }
}

/// Serialize one audio chunk as a `realtimeInput` message.
pub fn realtime_audio_message(chunk: EncodedChunk) -> crate::gemini::Result<String> {
    let msg = ClientMessage::RealtimeInput {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                data: chunk.data,
                mime_type: chunk.mime_type,
            }],
        },
    };
    msg.to_json()
}

/// Drain the queue into the socket until it is closed, then send a Close frame.
pub async fn run_writer<S>(queue: std::sync::Arc<OutboundQueue>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    info!("WebSocket writer task started");
    let mut sent: u64 = 0;

    while let Some(chunk) = queue.pop().await {
        let json = match realtime_audio_message(chunk) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audio chunk: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            error!("❌ Failed to send audio chunk: {}", e);
            queue.close();
            break;
        }
        sent += 1;
        if sent % 100 == 0 {
            debug!("🎤 {} audio chunks sent ({} dropped)", sent, queue.dropped());
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Close frame not sent: {}", e);
    }
    let _ = sink.close().await;
    info!("WebSocket writer task shutting down ({} chunks sent)", sent);
}
