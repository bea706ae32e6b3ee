//! Bounded one-producer/one-consumer byte-chunk channel.
//!
//! The backup and restore pipelines rendezvous on exactly one of these: the
//! producer (walker or subprocess reader) `put`s framed chunks, the consumer
//! drains them through compression/encryption into segments. A second, small
//! instance captures archiver stderr during tar-mode restore.
//!
//! # Semantics
//! - Strict FIFO; capacity is counted in chunks, not bytes.
//! - `put` blocks while the backlog is full and fails with [`QueueError::Closed`]
//!   after `finish`, or [`QueueError::Cancelled`] after `force_stop`.
//! - `get` never blocks indefinitely: it returns [`Chunk::Wait`] when nothing
//!   is available yet and the producer is still live, so the consumer can
//!   poll-retry and stay responsive to cancellation.
//! - `force_stop` is the single cancellation primitive: the producer's next
//!   `put` errors and `get` reports EOF immediately, even with chunks queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

/// Default backlog of the main data pipeline, in chunks.
pub const DEFAULT_CAPACITY: usize = 10;

/// Backlog of the stderr capture channel used during tar-mode restore.
/// Bounded so a chatty archiver cannot grow memory without limit; any bytes
/// at all on this channel mean the restore has failed.
pub const ERROR_CAPACITY: usize = 2000;

/// Poll granularity for blocked `put` and empty `get`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// `put` after the producer declared EOF with `finish`.
    #[error("queue is closed for writing")]
    Closed,
    /// `put` after the consumer aborted with `force_stop`.
    #[error("queue was force-stopped by the consumer")]
    Cancelled,
}

/// Result of a single [`RichQueue::get`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    /// The next chunk, in FIFO order.
    Data(Vec<u8>),
    /// Nothing buffered yet but the producer is still live; retry.
    Wait,
    /// Producer finished and the backlog is drained, or the queue was
    /// force-stopped.
    Eof,
}

pub struct RichQueue {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    aborted: AtomicBool,
    eof_seen: AtomicBool,
}

impl RichQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            aborted: AtomicBool::new(false),
            eof_seen: AtomicBool::new(false),
        }
    }

    /// Enqueue one chunk, blocking while the backlog is at capacity.
    ///
    /// Cancellation is observed at [`POLL_INTERVAL`] granularity while
    /// blocked, so a `force_stop` never leaves the producer wedged on a
    /// full queue.
    pub fn put(&self, chunk: Vec<u8>) -> Result<(), QueueError> {
        let mut chunk = chunk;
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(QueueError::Cancelled);
            }
            let guard = self.tx.lock().expect("queue sender lock poisoned");
            let tx = guard.as_ref().ok_or(QueueError::Closed)?;
            match tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    chunk = back;
                    drop(guard);
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Dequeue the next chunk, or report `Wait`/`Eof`.
    pub fn get(&self) -> Chunk {
        if self.aborted.load(Ordering::SeqCst) {
            self.eof_seen.store(true, Ordering::SeqCst);
            return Chunk::Eof;
        }
        let rx = self.rx.lock().expect("queue receiver lock poisoned");
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(data) => Chunk::Data(data),
            Err(RecvTimeoutError::Timeout) => Chunk::Wait,
            Err(RecvTimeoutError::Disconnected) => {
                self.eof_seen.store(true, Ordering::SeqCst);
                Chunk::Eof
            }
        }
    }

    /// True until this side has observed EOF via [`get`](Self::get).
    pub fn has_more(&self) -> bool {
        !self.eof_seen.load(Ordering::SeqCst)
    }

    /// True iff the backlog is empty right now.
    pub fn empty(&self) -> bool {
        self.rx.lock().expect("queue receiver lock poisoned").is_empty()
    }

    /// Producer declares EOF. Queued chunks remain deliverable; once drained,
    /// `get` reports [`Chunk::Eof`].
    pub fn finish(&self) {
        self.tx.lock().expect("queue sender lock poisoned").take();
    }

    /// Consumer-initiated abort. Subsequent `put` fails with `Cancelled`;
    /// `get` reports EOF immediately, discarding any backlog.
    pub fn force_stop(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.tx.lock().expect("queue sender lock poisoned").take();
    }

    /// Drain whatever is buffered without waiting. Used to collect the
    /// stderr excerpt after a failed archiver run.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let rx = self.rx.lock().expect("queue receiver lock poisoned");
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }
}

impl Default for RichQueue {
    fn default() -> Self {
        Self::new()
    }
}
