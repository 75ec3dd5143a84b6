//! Outbound queues for a connection
//!
//! Commands reach the device through two stages. The deep buffered queue
//! ([`OutboundQueue`]) holds paced commands for the buffered writer, which
//! asks the flow controller for permission before forwarding each one. The
//! unbuffered stage is a capacity-1 tokio channel of [`DirectWrite`] items
//! drained by the raw writer: a send completes only once the raw writer has
//! room, so it acts as the rendezvous hand-off to the OS handle.

use parking_lot::Mutex;
use serialhub_core::SerialError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::command_queue::QueuedCommand;

/// Capacity of the unbuffered hand-off channel
pub const DIRECT_CHANNEL_CAPACITY: usize = 1;

/// Bytes headed for the raw writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectWrite {
    pub data: Vec<u8>,
    /// When set, the raw writer broadcasts `Complete` for this command
    /// once it has been written.
    pub completion: Option<QueuedCommand>,
}

impl DirectWrite {
    pub fn untracked(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            completion: None,
        }
    }
}

/// Buffered queue of paced commands with a single consumer
///
/// Also owns the connection's pending counter: items accepted by the
/// connection (buffered or direct) that have been neither written nor
/// discarded.
#[derive(Debug)]
pub struct OutboundQueue {
    port: String,
    capacity: usize,
    items: Mutex<VecDeque<QueuedCommand>>,
    closed: AtomicBool,
    notify: Notify,
    pending: AtomicUsize,
}

impl OutboundQueue {
    pub fn new(port: impl Into<String>, capacity: usize) -> Self {
        Self {
            port: port.into(),
            capacity,
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue a paced command
    pub fn push(&self, cmd: QueuedCommand) -> Result<(), SerialError> {
        if self.is_closed() {
            return Err(SerialError::ConnectionClosing {
                port: self.port.clone(),
            });
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(SerialError::QueueFull {
                    port: self.port.clone(),
                    capacity: self.capacity,
                });
            }
            items.push_back(cmd);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next command. Returns `None` once the queue is closed;
    /// items still queued at that point are dropped by [`close`](Self::close).
    pub async fn pop(&self) -> Option<QueuedCommand> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(cmd) = self.items.lock().pop_front() {
                return Some(cmd);
            }
            self.notify.notified().await;
        }
    }

    /// Discard every queued command, returning how many were dropped
    pub fn drain(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        self.release_pending(dropped);
        dropped
    }

    /// Stop accepting commands and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = self.drain();
        if dropped > 0 {
            tracing::debug!("Dropped {} queued commands for {} on close", dropped, self.port);
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Commands waiting in the buffered queue
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Items accepted but not yet written or discarded
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Count a direct write that bypasses the buffered queue
    pub fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturating decrement of the pending counter
    pub fn release_pending(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_sub(n))
            });
    }
}
