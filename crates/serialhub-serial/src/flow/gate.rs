//! Single-slot pause rendezvous
//!
//! The buffered writer parks on a [`PauseGate`] while a flow controller is
//! paused. The slot holds at most one [`PauseSignal`]; releasing fills it and
//! wakes the parked writer, which takes the signal and resets the slot to
//! `Block`. A `ResumeAndDiscard` already in the slot is never downgraded to
//! `ResumeNormal`, so a wipe cannot be lost to a racing acknowledgement.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Release code delivered to a parked writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseSignal {
    /// Nothing delivered yet; keep waiting
    Block,
    /// Send the pending command
    ResumeNormal,
    /// Drop the pending command without sending it
    ResumeAndDiscard,
}

#[derive(Debug)]
pub struct PauseGate {
    slot: Mutex<PauseSignal>,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(PauseSignal::Block),
            notify: Notify::new(),
        }
    }

    /// Forget any stale release so the next [`wait`](Self::wait) truly blocks
    pub fn clear(&self) {
        *self.slot.lock() = PauseSignal::Block;
    }

    /// Deliver a release code to the parked writer, or to the next one to park
    pub fn release(&self, signal: PauseSignal) {
        if signal == PauseSignal::Block {
            return;
        }
        {
            let mut slot = self.slot.lock();
            if *slot != PauseSignal::ResumeAndDiscard {
                *slot = signal;
            }
        }
        self.notify.notify_one();
    }

    /// Park until a release code is delivered, then consume it
    pub async fn wait(&self) -> PauseSignal {
        loop {
            {
                let mut slot = self.slot.lock();
                let signal = *slot;
                if signal != PauseSignal::Block {
                    *slot = PauseSignal::Block;
                    return signal;
                }
            }
            // notify_one stores a permit when nobody is parked yet, so a
            // release between the check above and this await is not missed.
            self.notify.notified().await;
        }
    }

    /// Current slot contents
    pub fn peek(&self) -> PauseSignal {
        *self.slot.lock()
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let gate = Arc::new(PauseGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        gate.release(PauseSignal::ResumeNormal);
        assert_eq!(waiter.await.unwrap(), PauseSignal::ResumeNormal);
        assert_eq!(gate.peek(), PauseSignal::Block);
    }

    #[tokio::test]
    async fn test_release_before_wait_is_kept() {
        let gate = PauseGate::new();
        gate.release(PauseSignal::ResumeNormal);
        assert_eq!(gate.wait().await, PauseSignal::ResumeNormal);
    }

    #[test]
    fn test_discard_takes_precedence() {
        let gate = PauseGate::new();
        gate.release(PauseSignal::ResumeAndDiscard);
        gate.release(PauseSignal::ResumeNormal);
        assert_eq!(gate.peek(), PauseSignal::ResumeAndDiscard);
    }

    #[tokio::test]
    async fn test_clear_drops_stale_release() {
        let gate = Arc::new(PauseGate::new());
        gate.release(PauseSignal::ResumeNormal);
        gate.clear();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        gate.release(PauseSignal::ResumeAndDiscard);
        assert_eq!(waiter.await.unwrap(), PauseSignal::ResumeAndDiscard);
    }
}
