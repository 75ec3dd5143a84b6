//! GRBL character-counting flow control
//!
//! GRBL acknowledges every line with `ok` or `error` and has a 127 byte
//! receive buffer. Each command handed to the device is tracked in a
//! [`CommandQueue`]; once the tracked bytes reach the buffer size, sending
//! pauses until acknowledgements free enough room.
//!
//! States:
//! - Ready: commands pass straight through
//! - Paused: the buffered writer is parked on the [`PauseGate`]
//! - PausedForWipe: a wipe released the gate with `ResumeAndDiscard`; the
//!   parked command is dropped and the writer returns to Ready
//!
//! A background task polls status with a bare `?` on a fixed interval. `?` is
//! a realtime command and does not occupy the receive buffer.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serialhub_core::{Broadcaster, CompletionKind, OutboundMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::gate::{PauseGate, PauseSignal};
use super::{BufferAlgorithm, CommandClass, FlowContext, FlowController, Readiness};
use crate::command_queue::CommandQueue;
use crate::outbound::OutboundQueue;
use crate::port::PortIo;

/// Realtime characters that are written immediately and never get `ok`
const REALTIME: [&str; 4] = ["!", "~", "?", "\u{18}"];

static NEWLINE_REGEX: OnceLock<Regex> = OnceLock::new();
static PAREN_COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
static SEMICOLON_COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();

fn newline_regex() -> &'static Regex {
    NEWLINE_REGEX.get_or_init(|| Regex::new(r"\r?\n{1,2}").expect("invalid regex pattern"))
}

fn paren_comment_regex() -> &'static Regex {
    PAREN_COMMENT_REGEX.get_or_init(|| Regex::new(r"\(.*?\)").expect("invalid regex pattern"))
}

fn semicolon_comment_regex() -> &'static Regex {
    SEMICOLON_COMMENT_REGEX.get_or_init(|| Regex::new(r";.*").expect("invalid regex pattern"))
}

/// Strip `( )` and `;` comments and every whitespace character
pub(crate) fn clean_gcode(line: &str) -> String {
    let line = paren_comment_regex().replace_all(line, "");
    let line = semicolon_comment_regex().replace_all(&line, "");
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

#[derive(Debug, Default)]
struct LineState {
    /// Partial line carried between reads
    latest_data: String,
    last_status: String,
    /// Startup banner, e.g. `Grbl 1.1h ['$' for help]`
    version: String,
}

pub struct GrblFlow {
    port: String,
    broadcaster: Arc<dyn Broadcaster>,
    io: Arc<dyn PortIo>,
    outbound: Arc<OutboundQueue>,
    buffer_max: usize,
    poll_interval: Duration,
    paused: Mutex<bool>,
    queue: CommandQueue,
    gate: PauseGate,
    lines: Mutex<LineState>,
    closed: AtomicBool,
    poller_stop: Mutex<Option<mpsc::Sender<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl GrblFlow {
    pub fn new(ctx: FlowContext) -> Self {
        Self {
            buffer_max: ctx.config.grbl.buffer_max,
            poll_interval: ctx.config.grbl.status_poll_interval(),
            port: ctx.port,
            broadcaster: ctx.broadcaster,
            io: ctx.io,
            outbound: ctx.outbound,
            paused: Mutex::new(false),
            queue: CommandQueue::new(),
            gate: PauseGate::new(),
            lines: Mutex::new(LineState::default()),
            closed: AtomicBool::new(false),
            poller_stop: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Commands sent to the device and not yet acknowledged
    pub fn in_flight(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn version(&self) -> String {
        self.lines.lock().version.clone()
    }

    pub fn last_status(&self) -> String {
        self.lines.lock().last_status.clone()
    }

    /// Resume a paused writer with `signal`; no-op when not paused
    fn resume(&self, signal: PauseSignal) {
        let mut paused = self.paused.lock();
        if *paused {
            *paused = false;
            self.gate.release(signal);
        }
    }

    /// Forget every in-flight command and cancel a parked send
    pub fn release_lock(&self) {
        tracing::debug!("Releasing GRBL lock on {}", self.port);
        let mut paused = self.paused.lock();
        self.queue.delete();
        *paused = false;
        self.gate.release(PauseSignal::ResumeAndDiscard);
    }

    /// Drop buffered-but-unsent commands without sending anything to GRBL
    pub fn local_buffer_wipe(&self) {
        let dropped = self.outbound.drain();
        self.release_lock();
        let remaining = self.outbound.pending();
        tracing::info!(
            "Wiped {} queued commands on {}, {} still pending",
            dropped,
            self.port,
            remaining
        );
        self.broadcaster
            .broadcast(OutboundMessage::wiped(&self.port, remaining));
    }

    fn send_line(&self, data: String) {
        self.broadcaster
            .broadcast(OutboundMessage::data(&self.port, data));
    }

    fn handle_line(&self, line: &str) {
        let is_ok = line.starts_with("ok");
        if is_ok || line.starts_with("error") {
            match self.queue.poll() {
                Some(done) => {
                    let kind = if is_ok {
                        CompletionKind::Complete
                    } else {
                        tracing::warn!("GRBL rejected {:?} on {}: {}", done.data, self.port, line);
                        CompletionKind::Error
                    };
                    self.broadcaster.broadcast(OutboundMessage::completion(
                        kind,
                        &self.port,
                        done.id,
                        self.queue.len_bytes(),
                        done.data,
                    ));
                }
                None => {
                    tracing::error!(
                        "Received {:?} on {} with no command in flight; GRBL and the tracking queue are out of sync",
                        line,
                        self.port
                    );
                }
            }
            if self.queue.len_bytes() < self.buffer_max {
                self.resume(PauseSignal::ResumeNormal);
            }
        } else if line.starts_with("Grbl") {
            tracing::info!("GRBL reset on {}: {}", self.port, line);
            self.local_buffer_wipe();
            self.lines.lock().version = line.to_string();
        } else if line.starts_with('<') {
            let mut state = self.lines.lock();
            if state.last_status == line {
                tracing::trace!("GRBL status unchanged on {}", self.port);
                return;
            }
            state.last_status = line.to_string();
        }

        self.send_line(format!("{}\n", line));
    }

    fn split_complete_lines(&self, data: &str) -> Vec<String> {
        let mut state = self.lines.lock();
        state.latest_data.push_str(data);
        let mut parts: Vec<String> = newline_regex()
            .split(&state.latest_data)
            .map(str::to_string)
            .collect();
        // The last element is an unterminated line (possibly empty)
        let rest = parts.pop().unwrap_or_default();
        state.latest_data = rest;
        parts
    }
}

#[async_trait]
impl FlowController for GrblFlow {
    fn algorithm(&self) -> BufferAlgorithm {
        BufferAlgorithm::Grbl
    }

    fn init(&self) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let io = self.io.clone();
        let broadcaster = self.broadcaster.clone();
        let port = self.port.clone();
        let period = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let io = io.clone();
                        match tokio::task::spawn_blocking(move || io.write(b"?")).await {
                            Ok(Ok(())) => tracing::trace!("Polled GRBL status on {}", port),
                            Ok(Err(e)) => {
                                let msg = format!("Error writing to {} {} Closing port.", port, e);
                                tracing::error!("{}", msg);
                                broadcaster.broadcast(OutboundMessage::text(msg));
                                break;
                            }
                            Err(e) => {
                                tracing::error!("Status poll task failed on {}: {}", port, e);
                                break;
                            }
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            tracing::debug!("Stopped GRBL status poller on {}", port);
        });
        *self.poller_stop.lock() = Some(stop_tx);
        *self.poller.lock() = Some(handle);
    }

    fn on_incoming_data(&self, data: &str) {
        for line in self.split_complete_lines(data) {
            if !line.is_empty() {
                self.handle_line(&line);
            }
        }
    }

    async fn block_until_ready(&self, cmd: &str, id: &str) -> Readiness {
        if self.closed.load(Ordering::SeqCst) {
            return Readiness::Discard;
        }

        let must_wait = {
            let mut paused = self.paused.lock();
            self.queue.push(cmd, id);
            tracing::debug!(
                "Queued {} bytes on {}, {} in flight",
                cmd.len(),
                self.port,
                self.queue.len_bytes()
            );
            if self.queue.len_bytes() >= self.buffer_max {
                tracing::debug!("GRBL buffer full on {}, pausing", self.port);
                *paused = true;
            }
            if *paused {
                self.gate.clear();
            }
            *paused
        };

        if must_wait {
            let signal = self.gate.wait().await;
            tracing::debug!("Released on {} with {:?}", self.port, signal);
            if signal == PauseSignal::ResumeAndDiscard || self.closed.load(Ordering::SeqCst) {
                return Readiness::Discard;
            }
        }

        Readiness::Proceed {
            handled_elsewhere: true,
        }
    }

    fn break_apart_commands(&self, cmd: &str) -> Vec<String> {
        let mut commands = Vec::new();
        for raw in cmd.split('\n') {
            let item = clean_gcode(raw);
            match item.as_str() {
                "" => {}
                "*init*" => {
                    let version = self.version();
                    self.send_line(format!("{}\n", version));
                }
                "*status*" => {
                    let status = self.last_status();
                    self.send_line(format!("{}\n", status));
                }
                "%" => self.local_buffer_wipe(),
                rt if REALTIME.contains(&rt) => commands.push(item),
                _ => commands.push(format!("{}\n", item)),
            }
        }
        tracing::debug!("Split {:?} into {:?}", cmd, commands);
        commands
    }

    fn classify(&self, cmd: &str) -> CommandClass {
        if cmd.contains('\u{18}') {
            CommandClass::Wipe
        } else if cmd.contains('!') {
            CommandClass::Pause
        } else if cmd.contains('~') {
            CommandClass::Resume
        } else if cmd.contains('?') {
            CommandClass::Direct
        } else {
            CommandClass::Paced
        }
    }

    fn pause(&self) {
        *self.paused.lock() = true;
        tracing::debug!("Paused GRBL buffer on {}", self.port);
    }

    fn unpause(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.gate.release(PauseSignal::ResumeNormal);
        tracing::debug!("Unpaused GRBL buffer on {}", self.port);
    }

    fn wipe(&self) {
        self.local_buffer_wipe();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = self.poller_stop.lock().take() {
            let _ = stop_tx.try_send(());
        }
        self.poller.lock().take();
        let mut paused = self.paused.lock();
        *paused = false;
        self.gate.release(PauseSignal::ResumeAndDiscard);
    }
}
