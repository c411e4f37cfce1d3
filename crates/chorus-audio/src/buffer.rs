//! Bounded chunk queue and buffer pool for the pipeline hot path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// ChunkQueue
// ---------------------------------------------------------------------------

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO between a pipeline stage and its consumer.
///
/// Overflow drops the oldest entry so a stalled consumer sees the freshest
/// audio instead of an ever-growing backlog.
pub struct ChunkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    cap: usize,
}

impl<T> ChunkQueue<T> {
    /// Create a queue bounded at `cap` entries (minimum 1).
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            cap: cap.max(1),
        })
    }

    /// Push an item, dropping the oldest when full. Returns the dropped
    /// item, if any. Pushes to a closed queue are discarded.
    pub fn push(&self, item: T) -> Option<T> {
        let mut dropped = None;
        {
            let Ok(mut state) = self.state.lock() else {
                return None;
            };
            if state.closed {
                return Some(item);
            }
            if state.items.len() == self.cap {
                dropped = state.items.pop_front();
                state.dropped += 1;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        dropped
    }

    /// Pop the next item, waiting until one is available. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let Ok(mut state) = self.state.lock() else {
                    return None;
                };
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().ok()?.items.pop_front()
    }

    /// Close the queue; waiting consumers drain remaining items then get
    /// `None`.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// ChunkPool
// ---------------------------------------------------------------------------

/// Freelist of reusable byte buffers for per-chunk allocations.
///
/// Buffers are handed out cleared with their capacity intact; returning a
/// buffer past the pool cap just drops it.
pub struct ChunkPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
    pool_cap: usize,
}

impl ChunkPool {
    /// Pool of up to `pool_cap` buffers of `buf_capacity` bytes each.
    pub fn new(buf_capacity: usize, pool_cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_capacity,
            pool_cap,
        }
    }

    /// Take a cleared buffer from the pool, or allocate one.
    pub fn take(&self) -> Vec<u8> {
        if let Ok(mut free) = self.free.lock() {
            if let Some(mut buf) = free.pop() {
                buf.clear();
                return buf;
            }
        }
        Vec::with_capacity(self.buf_capacity)
    }

    /// Return a buffer for reuse.
    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.pool_cap {
                free.push(buf);
            }
        }
    }

    /// Buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}
