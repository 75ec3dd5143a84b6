//! Timed batching strategy
//!
//! Device output is accumulated and flushed to clients as one message per
//! tick, so byte-at-a-time streams do not become one message per byte.
//! Outgoing commands are never delayed.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serialhub_core::{Broadcaster, OutboundMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{BufferAlgorithm, FlowContext, FlowController, InputEncoding, Readiness};

/// How a flushed batch is rendered in the `Data` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedEncoding {
    /// Lossy UTF-8 text
    Text,
    /// Standard base64 of the raw bytes
    Base64,
}

struct Accumulator {
    port: String,
    broadcaster: Arc<dyn Broadcaster>,
    encoding: TimedEncoding,
    buffer: Mutex<Vec<u8>>,
}

impl Accumulator {
    fn flush(&self) {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return;
        }
        let data = match self.encoding {
            TimedEncoding::Text => String::from_utf8_lossy(&batch).into_owned(),
            TimedEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(&batch),
        };
        tracing::trace!("Flushing {} bytes from {}", batch.len(), self.port);
        self.broadcaster
            .broadcast(OutboundMessage::data(&self.port, data));
    }
}

pub struct TimedFlow {
    acc: Arc<Accumulator>,
    interval: Duration,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TimedFlow {
    pub fn new(ctx: FlowContext, encoding: TimedEncoding) -> Self {
        Self {
            interval: ctx.config.timed.flush_interval(),
            acc: Arc::new(Accumulator {
                port: ctx.port,
                broadcaster: ctx.broadcaster,
                encoding,
                buffer: Mutex::new(Vec::new()),
            }),
            stop_tx: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Broadcast whatever has accumulated and empty the buffer
    pub fn flush(&self) {
        self.acc.flush();
    }

    /// Bytes waiting for the next tick
    pub fn buffered_len(&self) -> usize {
        self.acc.buffer.lock().len()
    }
}

#[async_trait]
impl FlowController for TimedFlow {
    fn algorithm(&self) -> BufferAlgorithm {
        match self.acc.encoding {
            TimedEncoding::Text => BufferAlgorithm::Timed,
            TimedEncoding::Base64 => BufferAlgorithm::TimedRaw,
        }
    }

    fn init(&self) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let acc = self.acc.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => acc.flush(),
                    _ = stop_rx.recv() => break,
                }
            }
            tracing::debug!("Flush ticker for {} stopped", acc.port);
        });
        *self.stop_tx.lock() = Some(stop_tx);
        *self.ticker.lock() = Some(handle);
    }

    fn input_encoding(&self) -> InputEncoding {
        InputEncoding::Raw
    }

    fn on_incoming_data(&self, data: &str) {
        self.on_incoming_bytes(data.as_bytes());
    }

    fn on_incoming_bytes(&self, data: &[u8]) {
        self.acc.buffer.lock().extend_from_slice(data);
    }

    async fn block_until_ready(&self, _cmd: &str, _id: &str) -> Readiness {
        Readiness::Proceed {
            handled_elsewhere: false,
        }
    }

    fn close(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.try_send(());
        }
        self.ticker.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundQueue;
    use crate::port::PortIo;
    use serialhub_settings::AgentConfig;
    use std::io;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<OutboundMessage>>);

    impl Broadcaster for Recorder {
        fn broadcast(&self, msg: OutboundMessage) {
            self.0.lock().push(msg);
        }
    }

    struct NullIo;

    impl PortIo for NullIo {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::TimedOut.into())
        }
        fn write(&self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn flow(encoding: TimedEncoding) -> (TimedFlow, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let ctx = FlowContext {
            port: "COM5".to_string(),
            broadcaster: rec.clone(),
            io: Arc::new(NullIo),
            outbound: Arc::new(OutboundQueue::new("COM5", 16)),
            config: Arc::new(AgentConfig::default()),
        };
        (TimedFlow::new(ctx, encoding), rec)
    }

    #[test]
    fn test_manual_flush_concatenates() {
        let (flow, rec) = flow(TimedEncoding::Text);
        flow.on_incoming_bytes(b"he");
        flow.on_incoming_bytes(b"ll");
        flow.on_incoming_bytes(b"o");
        flow.flush();
        assert_eq!(flow.buffered_len(), 0);
        assert_eq!(*rec.0.lock(), vec![OutboundMessage::data("COM5", "hello")]);

        flow.flush();
        assert_eq!(rec.0.lock().len(), 1);
    }

    #[test]
    fn test_base64_flush() {
        let (flow, rec) = flow(TimedEncoding::Base64);
        assert_eq!(flow.algorithm(), BufferAlgorithm::TimedRaw);
        flow.on_incoming_bytes(&[0x00, 0xff, 0x10]);
        flow.flush();
        assert_eq!(*rec.0.lock(), vec![OutboundMessage::data("COM5", "AP8Q")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_coalesces_one_tick() {
        let (flow, rec) = flow(TimedEncoding::Text);
        flow.init();
        flow.on_incoming_bytes(b"<Idle");
        flow.on_incoming_bytes(b"|MPos:0,0,0");
        flow.on_incoming_bytes(b">\r\n");
        tokio::time::sleep(Duration::from_millis(17)).await;
        assert_eq!(
            *rec.0.lock(),
            vec![OutboundMessage::data("COM5", "<Idle|MPos:0,0,0>\r\n")]
        );
        assert_eq!(flow.buffered_len(), 0);

        flow.close();
        flow.on_incoming_bytes(b"late");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.0.lock().len(), 1);
    }
}
