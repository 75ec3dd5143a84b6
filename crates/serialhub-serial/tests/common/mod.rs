//! Shared fixtures for the serial integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use serialhub_core::{Broadcaster, OutboundMessage};
use serialhub_serial::PortIo;
use serialhub_settings::AgentConfig;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted result for [`MockPort::read`]
#[derive(Debug)]
pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

/// In-memory port: scripted reads, recorded writes
#[derive(Default)]
pub struct MockPort {
    reads: Mutex<VecDeque<ReadStep>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl MockPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        self.reads.lock().push_back(ReadStep::Data(data.into()));
    }

    pub fn push_step(&self, step: ReadStep) {
        self.reads.lock().push_back(step);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Every write decoded as text, in order
    pub fn written_text(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn write_count(&self, data: &[u8]) -> usize {
        self.writes.lock().iter().filter(|w| w.as_slice() == data).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PortIo for MockPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let step = self.reads.lock().pop_front();
        match step {
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads
                        .lock()
                        .push_front(ReadStep::Data(data[n..].to_vec()));
                }
                Ok(n)
            }
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Broadcaster that keeps every message
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Device output broadcast for `port`, concatenated
    pub fn data(&self, port: &str) -> String {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Data(d) if d.port == port => Some(d.data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&OutboundMessage) -> bool) -> usize {
        self.messages.lock().iter().filter(|m| pred(m)).count()
    }

    pub fn has_text(&self, text: &str) -> bool {
        self.texts().iter().any(|t| t.contains(text))
    }
}

impl Broadcaster for Recorder {
    fn broadcast(&self, msg: OutboundMessage) {
        self.messages.lock().push(msg);
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Defaults with the GRBL status poller slowed down so it stays out of the way
pub fn test_config() -> Arc<AgentConfig> {
    let mut config = AgentConfig::default();
    config.grbl.status_poll_interval_ms = 60_000;
    Arc::new(config)
}
