//! In-flight command tracking
//!
//! FIFO of commands that have been written to a device but not yet
//! acknowledged, with a running total of their byte lengths. The total is
//! what the GRBL strategy compares against the device's receive buffer.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A command and the client id it was submitted with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub data: String,
    pub id: String,
}

impl QueuedCommand {
    pub fn new(data: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueuedCommand>,
    total_len: usize,
}

/// Thread-safe FIFO with byte-length accounting.
///
/// `len_bytes()` always equals the sum of `data.len()` over the queued items.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<Inner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command at the tail
    pub fn push(&self, data: impl Into<String>, id: impl Into<String>) {
        let cmd = QueuedCommand::new(data, id);
        let mut inner = self.inner.lock();
        inner.total_len += cmd.data.len();
        inner.items.push_back(cmd);
    }

    /// Remove and return the oldest command
    pub fn poll(&self) -> Option<QueuedCommand> {
        let mut inner = self.inner.lock();
        let cmd = inner.items.pop_front()?;
        inner.total_len -= cmd.data.len();
        Some(cmd)
    }

    /// Look at the oldest command without removing it
    pub fn peek(&self) -> Option<QueuedCommand> {
        self.inner.lock().items.front().cloned()
    }

    /// Empty the queue unconditionally
    pub fn delete(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.total_len = 0;
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Summed byte length of queued commands
    pub fn len_bytes(&self) -> usize {
        self.inner.lock().total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_poll_accounting() {
        let q = CommandQueue::new();
        q.push("G0 X1\n", "1");
        q.push("G0 Y2\n", "2");
        assert_eq!(q.len(), 2);
        assert_eq!(q.len_bytes(), 12);

        let first = q.poll().unwrap();
        assert_eq!(first, QueuedCommand::new("G0 X1\n", "1"));
        assert_eq!(q.len_bytes(), 6);
        assert_eq!(q.peek().unwrap().id, "2");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_poll_empty() {
        let q = CommandQueue::new();
        assert!(q.poll().is_none());
        assert!(q.peek().is_none());
        assert_eq!(q.len_bytes(), 0);
    }

    #[test]
    fn test_delete() {
        let q = CommandQueue::new();
        q.push("abc", "");
        q.push("de", "");
        q.delete();
        assert!(q.is_empty());
        assert_eq!(q.len_bytes(), 0);
    }
}
