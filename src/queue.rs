// Inbound byte queue shared between transport producers and the stream
// consumer.
//
// Transport adapters push received bytes through a `ByteSink`, a cloneable
// push-only handle; the owning `DeviceStream` is the single logical
// consumer. The queue is unbounded (a push never blocks and never fails
// while the queue is open), order-preserving across producers in
// push-call order, and terminally closeable during teardown.

use crate::error::{StreamError, StreamResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Unbounded, order-preserving FIFO of bytes.
pub struct ByteQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    buf: VecDeque<u8>,
    closed: bool,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Derive the push-only capability handle given to transport adapters.
    pub fn sink(self: &Arc<Self>) -> ByteSink {
        ByteSink {
            queue: Arc::clone(self),
        }
    }

    /// Enqueue one byte. Never blocks; silent no-op after `close`.
    pub fn push(&self, byte: u8) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.buf.push_back(byte);
        }
        self.notify.notify_one();
    }

    /// Enqueue a slice of bytes in order under one lock acquisition.
    pub fn extend(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.buf.extend(bytes.iter().copied());
        }
        self.notify.notify_one();
    }

    /// Dequeue the next byte, waiting until one is available.
    ///
    /// Returns `Err(StreamError::Closed)` once the queue has been closed.
    /// Deadlines are enforced by the caller (`tokio::time::timeout_at`
    /// around this future), not here.
    pub async fn pop(&self) -> StreamResult<u8> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(byte) = inner.buf.pop_front() {
                    return Ok(byte);
                }
                if inner.closed {
                    return Err(StreamError::Closed);
                }
            }
            // Single consumer: a push racing past the check above leaves a
            // stored permit, so this cannot miss a wakeup.
            self.notify.notified().await;
        }
    }

    /// Report the next queued byte without consuming it, if any.
    pub fn try_peek(&self) -> Option<u8> {
        self.inner.lock().buf.front().copied()
    }

    /// Number of currently queued bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    /// Discard all currently queued bytes. Bytes pushed after the flush
    /// takes the lock are unaffected.
    pub fn flush(&self) {
        self.inner.lock().buf.clear();
    }

    /// Terminally close the queue: subsequent pops fail immediately and
    /// subsequent pushes are no-ops. Wakes a blocked consumer.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.buf.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Push-only capability over a [`ByteQueue`].
///
/// Handed to transport adapters at construction; adapters push each
/// received byte in arrival order and can never read, peek, or flush.
#[derive(Clone)]
pub struct ByteSink {
    queue: Arc<ByteQueue>,
}

impl ByteSink {
    pub fn push(&self, byte: u8) {
        self.queue.push(byte);
    }

    pub fn extend(&self, bytes: &[u8]) {
        self.queue.extend(bytes);
    }
}
