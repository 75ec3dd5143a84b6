//! Serial connection lifecycle
//!
//! One [`SerialConnection`] per open port. It owns the OS handle and runs
//! three tasks:
//!
//! - **reader** (blocking thread): reads device output, reassembles UTF-8
//!   when the controller wants text, and feeds the flow controller. Any read
//!   failure tears the connection down.
//! - **buffered writer** (async task): pops paced commands, waits in
//!   [`FlowController::block_until_ready`], then forwards or discards them.
//! - **raw writer** (blocking thread): the only code that writes queued
//!   bytes to the OS handle.
//!
//! Shutdown is explicit. [`close`](SerialConnection::close), or any read or
//! write failure, tears the connection down: the flow controller is stopped,
//! both queues are closed in producer order and the OS handle is released,
//! which ends the reader. The registry then joins the writers with
//! [`shutdown_writers`](SerialConnection::shutdown_writers).

use base64::Engine;
use parking_lot::Mutex;
use serialhub_core::{Broadcaster, CommandError, CompletionKind, OutboundMessage, SerialError};
use serialhub_settings::AgentConfig;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::command_queue::QueuedCommand;
use crate::flow::{self, BufferAlgorithm, CommandClass, FlowContext, FlowController, InputEncoding, Readiness};
use crate::outbound::{DirectWrite, OutboundQueue, DIRECT_CHANNEL_CAPACITY};
use crate::port::{is_transient, PortIo};
use crate::utf8::Utf8Reassembler;

/// Two empty reads closer together than this mean the device is gone
pub const ZERO_READ_THRESHOLD: Duration = Duration::from_millis(1);

const EOF_DESCRIPTION: &str = "Got EOF (End of File) on port which usually means another app other than SerialHub is locking your port.";

/// How a client payload is routed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// `send`: split and paced by the flow controller
    Buffered,
    /// `sendnobuf`: written as-is, no pacing
    NoBuffer,
    /// `sendraw`: base64-decoded, then written as-is
    Raw,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffered => "send",
            Self::NoBuffer => "sendnobuf",
            Self::Raw => "sendraw",
        }
    }
}

impl fmt::Display for SendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(Self::Buffered),
            "sendnobuf" => Ok(Self::NoBuffer),
            "sendraw" => Ok(Self::Raw),
            _ => Err(CommandError::UnsupportedSendMode(s.to_string())),
        }
    }
}

pub struct SerialConnection {
    name: String,
    baud: u32,
    algorithm: BufferAlgorithm,
    io: Arc<dyn PortIo>,
    flow: Arc<dyn FlowController>,
    outbound: Arc<OutboundQueue>,
    broadcaster: Arc<dyn Broadcaster>,
    read_buffer_size: usize,
    direct_tx: Mutex<Option<mpsc::Sender<DirectWrite>>>,
    buffered_writer: Mutex<Option<JoinHandle<()>>>,
    raw_writer: Mutex<Option<JoinHandle<()>>>,
    is_closing: AtomicBool,
    closing_due_to_error: AtomicBool,
    torn_down: AtomicBool,
    finished: watch::Sender<bool>,
}

impl fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnection")
            .field("name", &self.name)
            .field("baud", &self.baud)
            .field("algorithm", &self.algorithm)
            .field("is_closing", &self.is_closing())
            .finish()
    }
}

impl SerialConnection {
    /// Wire up a freshly opened port and start both writer tasks.
    ///
    /// The reader is started separately with [`spawn_reader`](Self::spawn_reader)
    /// once the connection is registered. Must be called inside a tokio runtime.
    pub fn start(
        name: &str,
        baud: u32,
        algorithm: BufferAlgorithm,
        io: Arc<dyn PortIo>,
        broadcaster: Arc<dyn Broadcaster>,
        config: Arc<AgentConfig>,
    ) -> Arc<Self> {
        let outbound = Arc::new(OutboundQueue::new(
            name,
            config.serial.buffered_queue_capacity,
        ));
        let flow = flow::create(
            algorithm,
            FlowContext {
                port: name.to_string(),
                broadcaster: broadcaster.clone(),
                io: io.clone(),
                outbound: outbound.clone(),
                config: config.clone(),
            },
        );
        flow.init();

        let (direct_tx, direct_rx) = mpsc::channel(DIRECT_CHANNEL_CAPACITY);
        let (finished, _) = watch::channel(false);

        let conn = Arc::new(Self {
            name: name.to_string(),
            baud,
            algorithm,
            io,
            flow,
            outbound,
            broadcaster,
            read_buffer_size: config.serial.read_buffer_size,
            direct_tx: Mutex::new(Some(direct_tx.clone())),
            buffered_writer: Mutex::new(None),
            raw_writer: Mutex::new(None),
            is_closing: AtomicBool::new(false),
            closing_due_to_error: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            finished,
        });

        let span = tracing::info_span!("serial", port = %conn.name);

        let buffered = {
            let conn = conn.clone();
            tokio::spawn(conn.run_buffered_writer(direct_tx).instrument(span.clone()))
        };
        let raw = {
            let conn = conn.clone();
            tokio::task::spawn_blocking(move || {
                let _guard = span.enter();
                conn.run_raw_writer(direct_rx)
            })
        };
        *conn.buffered_writer.lock() = Some(buffered);
        *conn.raw_writer.lock() = Some(raw);

        tracing::info!(
            "Started {} connection on {} at {} baud",
            algorithm,
            conn.name,
            baud
        );
        conn
    }

    /// Start the reader. The handle resolves once reading has stopped for
    /// good, either through [`close`](Self::close) or a read failure.
    pub fn spawn_reader(self: &Arc<Self>) -> JoinHandle<()> {
        let conn = self.clone();
        let span = tracing::info_span!("serial", port = %self.name);
        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            conn.run_reader()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn algorithm(&self) -> BufferAlgorithm {
        self.algorithm
    }

    pub fn flow(&self) -> &Arc<dyn FlowController> {
        &self.flow
    }

    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// Items accepted by this connection but not yet written or discarded
    pub fn pending(&self) -> usize {
        self.outbound.pending()
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::SeqCst)
    }

    pub fn is_closing_due_to_error(&self) -> bool {
        self.closing_due_to_error.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.is_closing() || self.is_closing_due_to_error()
    }

    fn closing_error(&self) -> SerialError {
        SerialError::ConnectionClosing {
            port: self.name.clone(),
        }
    }

    /// Route a client payload to the device
    pub async fn write(&self, data: &str, mode: SendMode) -> Result<(), SerialError> {
        if self.is_shutting_down() {
            return Err(self.closing_error());
        }
        match mode {
            SendMode::Buffered => self.send_paced(data, "").await,
            SendMode::NoBuffer => self.send_direct(DirectWrite::untracked(data)).await,
            SendMode::Raw => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| SerialError::InvalidPayload {
                        port: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                self.send_direct(DirectWrite::untracked(bytes)).await
            }
        }
    }

    /// Send a payload through the flow controller.
    ///
    /// The payload is split by the controller. Control commands bypass the
    /// buffered queue after applying their pause/resume/wipe effect. `id`
    /// is attached to the last paced command of the payload, or to the last
    /// control command when nothing is paced. A payload the controller
    /// consumes entirely (`*init*`, `%`) completes right away.
    pub async fn send_paced(&self, data: &str, id: &str) -> Result<(), SerialError> {
        if self.is_shutting_down() {
            return Err(self.closing_error());
        }
        let commands: Vec<(String, CommandClass)> = self
            .flow
            .break_apart_commands(data)
            .into_iter()
            .map(|cmd| {
                let class = self.flow.classify(&cmd);
                (cmd, class)
            })
            .collect();
        if commands.is_empty() {
            if !id.is_empty() {
                self.broadcaster.broadcast(OutboundMessage::completion(
                    CompletionKind::Complete,
                    &self.name,
                    id,
                    0,
                    data,
                ));
            }
            return Ok(());
        }
        let id_index = commands
            .iter()
            .rposition(|(_, class)| *class == CommandClass::Paced)
            .unwrap_or(commands.len() - 1);

        for (index, (cmd, class)) in commands.into_iter().enumerate() {
            let cmd_id = if index == id_index { id } else { "" };
            match class {
                CommandClass::Paced => {
                    self.outbound.push(QueuedCommand::new(cmd, cmd_id))?;
                }
                control => {
                    match control {
                        CommandClass::Pause => self.flow.pause(),
                        CommandClass::Resume => self.flow.unpause(),
                        CommandClass::Wipe => self.flow.wipe(),
                        _ => {}
                    }
                    tracing::debug!("{:?} skips the buffer on {} ({:?})", cmd, self.name, control);
                    let item = DirectWrite {
                        data: cmd.clone().into_bytes(),
                        completion: (!cmd_id.is_empty()).then(|| QueuedCommand::new(cmd, cmd_id)),
                    };
                    self.send_direct(item).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_direct(&self, item: DirectWrite) -> Result<(), SerialError> {
        let tx = self
            .direct_tx
            .lock()
            .clone()
            .ok_or_else(|| self.closing_error())?;
        self.outbound.add_pending();
        if tx.send(item).await.is_err() {
            self.outbound.release_pending(1);
            return Err(self.closing_error());
        }
        Ok(())
    }

    /// Explicit close requested by a client
    pub fn close(&self) {
        if self.is_closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = format!("Closing serial port {}", self.name);
        tracing::info!("{}", msg);
        self.broadcaster.broadcast(OutboundMessage::text(msg));
        self.teardown();
    }

    /// Mark the connection failed and release everything it holds
    fn fail(&self) {
        self.closing_due_to_error.store(true, Ordering::SeqCst);
        self.teardown();
    }

    /// Release the OS handle and stop accepting work.
    ///
    /// The flow controller is closed first so a parked writer is released
    /// with a discard, then the buffered queue is closed and the connection's
    /// own unbuffered sender dropped. The buffered writer holds the last
    /// sender, so the raw writer drains and stops once it has exited.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flow.close();
        self.outbound.close();
        self.direct_tx.lock().take();
        if let Err(e) = self.io.close() {
            tracing::warn!("Failed to close {}: {}", self.name, e);
        }
    }

    /// Stop and join both writer tasks
    pub async fn shutdown_writers(&self) {
        if !self.is_shutting_down() {
            self.is_closing.store(true, Ordering::SeqCst);
        }
        self.teardown();

        let buffered = self.buffered_writer.lock().take();
        if let Some(handle) = buffered {
            if let Err(e) = handle.await {
                tracing::error!("Buffered writer for {} failed: {}", self.name, e);
            }
        }
        let raw = self.raw_writer.lock().take();
        if let Some(handle) = raw {
            if let Err(e) = handle.await {
                tracing::error!("Raw writer for {} failed: {}", self.name, e);
            }
        }

        self.finished.send_replace(true);
        tracing::debug!("Writers for {} shut down", self.name);
    }

    /// Resolves once [`shutdown_writers`](Self::shutdown_writers) has finished
    pub async fn wait_closed(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn run_buffered_writer(self: Arc<Self>, direct_tx: mpsc::Sender<DirectWrite>) {
        while let Some(cmd) = self.outbound.pop().await {
            match self.flow.block_until_ready(&cmd.data, &cmd.id).await {
                Readiness::Discard => {
                    tracing::debug!("Discarded {:?} on {}", cmd.data, self.name);
                    self.outbound.release_pending(1);
                }
                Readiness::Proceed { handled_elsewhere } => {
                    let completion = (!handled_elsewhere && !cmd.id.is_empty()).then(|| cmd.clone());
                    let item = DirectWrite {
                        data: cmd.data.into_bytes(),
                        completion,
                    };
                    if direct_tx.send(item).await.is_err() {
                        self.outbound.release_pending(1);
                        break;
                    }
                }
            }
        }
        tracing::debug!("Buffered writer for {} stopped", self.name);
    }

    fn run_raw_writer(&self, mut rx: mpsc::Receiver<DirectWrite>) {
        while let Some(item) = rx.blocking_recv() {
            if self.is_shutting_down() {
                self.outbound.release_pending(1);
                continue;
            }

            let result = self.io.write(&item.data);
            self.outbound.release_pending(1);

            match result {
                Ok(()) => {
                    tracing::debug!(
                        "Wrote {} bytes to {}: {:?}",
                        item.data.len(),
                        self.name,
                        String::from_utf8_lossy(&item.data)
                    );
                    if let Some(done) = item.completion {
                        self.broadcaster.broadcast(OutboundMessage::completion(
                            CompletionKind::Complete,
                            &self.name,
                            done.id,
                            0,
                            done.data,
                        ));
                    }
                }
                Err(e) => {
                    let msg = format!("Error writing to {} {} Closing port.", self.name, e);
                    tracing::error!("{}", msg);
                    self.broadcaster.broadcast(OutboundMessage::text(msg));
                    self.fail();
                    break;
                }
            }
        }
        // Anything still in flight when the channel closes was never written
        rx.close();
        while rx.try_recv().is_ok() {
            self.outbound.release_pending(1);
        }
        let msg = format!("Shutting down writer on {}", self.name);
        tracing::debug!("{}", msg);
        self.broadcaster.broadcast(OutboundMessage::text(msg));
    }

    fn run_reader(&self) {
        let mut buf = vec![0u8; self.read_buffer_size.max(1)];
        let mut utf8 = Utf8Reassembler::new();
        let encoding = self.flow.input_encoding();
        let mut last_empty_read: Option<Instant> = None;

        loop {
            let result = self.io.read(&mut buf);

            if self.is_closing() {
                let msg = format!("Shutting down reader on {}", self.name);
                tracing::info!("{}", msg);
                self.broadcaster.broadcast(OutboundMessage::text(msg));
                break;
            }
            if self.is_closing_due_to_error() {
                break;
            }

            match result {
                Ok(0) => {
                    if last_empty_read.is_some_and(|t| t.elapsed() < ZERO_READ_THRESHOLD) {
                        tracing::warn!("Repeated empty reads on {}, treating as disconnect", self.name);
                        self.broadcaster.broadcast(OutboundMessage::open_fail(
                            &self.name,
                            self.baud,
                            EOF_DESCRIPTION,
                        ));
                        self.closing_due_to_error.store(true, Ordering::SeqCst);
                        break;
                    }
                    last_empty_read = Some(Instant::now());
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    tracing::debug!("Read {} bytes from {}", n, self.name);
                    match encoding {
                        InputEncoding::Utf8 => {
                            let text = utf8.decode(chunk);
                            if !text.is_empty() {
                                self.flow.on_incoming_data(&text);
                            }
                        }
                        InputEncoding::Raw => self.flow.on_incoming_bytes(chunk),
                    }
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    tracing::error!("Error reading on {}: {}", self.name, e);
                    self.broadcaster.broadcast(OutboundMessage::text(format!(
                        "Error reading on {} {} Closing port.",
                        self.name, e
                    )));
                    self.broadcaster.broadcast(OutboundMessage::open_fail(
                        &self.name,
                        self.baud,
                        format!("Got error reading on port. {}", e),
                    ));
                    self.closing_due_to_error.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        if self.is_closing_due_to_error() {
            self.teardown();
        }
        tracing::debug!("Reader for {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_mode_parse() {
        assert_eq!("send".parse::<SendMode>().unwrap(), SendMode::Buffered);
        assert_eq!("SendNoBuf".parse::<SendMode>().unwrap(), SendMode::NoBuffer);
        assert_eq!("sendraw".parse::<SendMode>().unwrap(), SendMode::Raw);
        assert_eq!(
            "sendjson".parse::<SendMode>(),
            Err(CommandError::UnsupportedSendMode("sendjson".to_string()))
        );
    }
}
