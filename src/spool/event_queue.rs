//! Event Queue
//!
//! Single worker thread per region that applies spool events strictly in
//! submission order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::element::CacheKey;
use crate::error::{Result, TierError};

/// Work item for the region worker
#[derive(Debug)]
pub enum SpoolEvent {
    /// Write the element staged under `seq`
    Put { key: CacheKey, seq: u64 },

    /// Delete `key` from disk
    Remove { key: CacheKey, seq: u64 },

    /// Delete everything from disk
    RemoveAll { seq: u64 },

    /// Acknowledge once every earlier event has been applied
    Barrier(Sender<()>),
}

/// Receives events on the worker thread
pub trait SpoolListener: Send + Sync + 'static {
    fn handle(&self, event: SpoolEvent);
}

/// Whether an event was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Accepted,
    /// The queue was shut down; the event was dropped
    Destroyed,
}

/// FIFO queue drained by one dedicated thread
pub struct EventQueue {
    region: String,
    sender: Mutex<Option<Sender<SpoolEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Signalled when the worker exits
    done: Receiver<()>,
    pending: Arc<AtomicUsize>,
}

impl EventQueue {
    /// Start the worker for `region`
    pub fn start(region: &str, listener: Arc<dyn SpoolListener>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<SpoolEvent>();
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker_region = region.to_string();
        let worker = thread::Builder::new()
            .name(format!("spool-{}", region))
            .spawn(move || {
                for event in receiver.iter() {
                    match event {
                        SpoolEvent::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                        event => listener.handle(event),
                    }
                    worker_pending.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!("Spool worker for {} drained and stopped", worker_region);
                let _ = done_tx.send(());
            })
            .map_err(|e| TierError::Storage(format!("Cannot start spool worker: {}", e)))?;

        Ok(Self {
            region: region.to_string(),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            done: done_rx,
            pending,
        })
    }

    /// Append an event; never blocks
    pub fn enqueue(&self, event: SpoolEvent) -> QueueStatus {
        let sender = self.sender.lock();
        let sender = match sender.as_ref() {
            Some(sender) => sender,
            None => return QueueStatus::Destroyed,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return QueueStatus::Destroyed;
        }
        QueueStatus::Accepted
    }

    /// Events accepted but not yet applied
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Wait until every event enqueued before this call has been applied
    ///
    /// Returns false on timeout or when the queue is destroyed.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.enqueue(SpoolEvent::Barrier(ack_tx)) == QueueStatus::Destroyed {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Reject further events and let the worker drain what is queued
    ///
    /// Waits up to `wait` for the drain; returns whether it completed.
    /// In-flight work is never interrupted.
    pub fn destroy(&self, wait: Duration) -> bool {
        if self.sender.lock().take().is_none() {
            return true;
        }

        match self.done.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.lock().take() {
                    if worker.join().is_err() {
                        tracing::error!("Spool worker for {} panicked", self.region);
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Spool worker for {} still has {} events after {:?}; continuing shutdown",
                    self.region,
                    self.pending(),
                    wait
                );
                false
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        // Dropping the sender lets the worker finish on its own
        self.sender.lock().take();
    }
}
