//! Hand-off between the frame loop and the payload sender.
//!
//! The frame loop only ever pushes; it never waits on the sender. When the
//! sender falls behind, the oldest queued payload is dropped and counted as
//! lost.

use crate::circular_queue::CircularQueue;
use crate::error::Error;
use crate::session::SessionPayload;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Destination for finished payloads. Delivery and retries are its own concern.
pub trait PayloadSink: Send {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PayloadSink for JsonLinesSink<W> {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, payload)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects payloads in memory; handy for embedding and tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    payloads: Arc<Mutex<Vec<SessionPayload>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<SessionPayload> {
        self.payloads.lock().clone()
    }
}

impl PayloadSink for MemorySink {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), Error> {
        self.payloads.lock().push(payload.clone());
        Ok(())
    }
}

struct Shared {
    queue: Mutex<CircularQueue<SessionPayload>>,
    ready: Condvar,
    closed: AtomicBool,
    lost: AtomicU64,
}

/// Bounded, drop-oldest queue of payloads awaiting delivery.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(CircularQueue::with_capacity(capacity)),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
                lost: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues without blocking. Returns `false` when an older payload had to
    /// be dropped to make room.
    pub fn push(&self, payload: SessionPayload) -> bool {
        let evicted = self.shared.queue.lock().push(payload);
        self.shared.ready.notify_one();

        match evicted {
            Some(lost) => {
                let total = self.shared.lost.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "outbox full, dropped payload started at {} ({} lost so far)",
                    lost.start_time, total
                );
                false
            }
            None => true,
        }
    }

    pub fn try_pop(&self) -> Option<SessionPayload> {
        self.shared.queue.lock().pop()
    }

    /// Waits for the next payload; `None` once closed and drained.
    pub fn pop_blocking(&self) -> Option<SessionPayload> {
        let mut queue = self.shared.queue.lock();

        loop {
            if let Some(payload) = queue.pop() {
                return Some(payload);
            }

            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            self.shared.ready.wait(&mut queue);
        }
    }

    /// No more payloads will be pushed; waiting consumers drain and stop.
    pub fn close(&self) {
        let _guard = self.shared.queue.lock();
        self.shared.closed.store(true, Ordering::Release);
        self.shared.ready.notify_all();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Payloads dropped on overflow.
    #[inline]
    pub fn lost(&self) -> u64 {
        self.shared.lost.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub failed: u64,
}

/// Runs `sink` on its own thread until the outbox is closed and drained.
pub fn spawn_dispatcher<S>(outbox: Outbox, mut sink: S) -> Result<JoinHandle<DispatchStats>, Error>
where
    S: PayloadSink + 'static,
{
    let handle = thread::Builder::new()
        .name("outbox".into())
        .spawn(move || {
            let mut stats = DispatchStats::default();

            while let Some(payload) = outbox.pop_blocking() {
                match sink.send(&payload) {
                    Ok(()) => stats.sent += 1,
                    Err(err) => {
                        stats.failed += 1;
                        warn!("payload delivery failed: {}", err);
                    }
                }
            }

            if let Err(err) = sink.flush() {
                warn!("sink flush failed: {}", err);
            }

            debug!("dispatcher done: {} sent, {} failed", stats.sent, stats.failed);
            stats
        })?;

    Ok(handle)
}
