//! TinyG queue-report flow control
//!
//! TinyG reports its free planner slots as `"qr":N`. Sending pauses when the
//! report falls to `stop_sending` and resumes once it climbs back to
//! `start_sending`; reports in between leave the state alone. Only complete
//! lines are scanned, so a report split across reads is seen once, whole.
//! Every command is additionally spaced by a fixed pacing delay.
//!
//! A wipe bumps a generation counter. A writer that was waiting when the
//! generation changed drops its command instead of sending it.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serialhub_core::{Broadcaster, OutboundMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

use super::grbl::clean_gcode;
use super::{BufferAlgorithm, CommandClass, FlowContext, FlowController, Readiness};
use crate::outbound::OutboundQueue;

static QR_REGEX: OnceLock<Regex> = OnceLock::new();

fn qr_regex() -> &'static Regex {
    QR_REGEX.get_or_init(|| Regex::new(r#""?qr"?:(\d+)"#).expect("invalid regex pattern"))
}

/// Last queue report in `chunk`, if any
pub fn parse_queue_report(chunk: &str) -> Option<u32> {
    qr_regex()
        .captures_iter(chunk)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .last()
}

/// Commands TinyG executes immediately, outside its planner queue
const SINGLE_CHAR: [char; 3] = ['!', '~', '%'];

/// Move a finished line into `commands` with exactly one trailing newline
fn finish(line: &mut String, commands: &mut Vec<String>) {
    let trimmed = line.trim_end_matches('\r');
    if !trimmed.trim().is_empty() {
        commands.push(format!("{}\n", trimmed));
    }
    line.clear();
}

pub struct TinygFlow {
    port: String,
    broadcaster: Arc<dyn Broadcaster>,
    outbound: Arc<OutboundQueue>,
    stop_sending: u32,
    start_sending: u32,
    pacing_delay: Duration,
    paused: watch::Sender<bool>,
    /// Partial line carried between reads
    latest_data: Mutex<String>,
    wipe_generation: AtomicU64,
    closed: AtomicBool,
}

impl TinygFlow {
    pub fn new(ctx: FlowContext) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            stop_sending: ctx.config.tinyg.stop_sending,
            start_sending: ctx.config.tinyg.start_sending,
            pacing_delay: ctx.config.tinyg.pacing_delay(),
            port: ctx.port,
            broadcaster: ctx.broadcaster,
            outbound: ctx.outbound,
            paused,
            latest_data: Mutex::new(String::new()),
            wipe_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn set_paused(&self, value: bool) {
        let changed = self.paused.send_if_modified(|p| {
            if *p == value {
                false
            } else {
                *p = value;
                true
            }
        });
        if changed {
            tracing::debug!(
                "TinyG {} on {}",
                if value { "paused" } else { "resumed" },
                self.port
            );
        }
    }

    /// Apply one queue report to the hysteresis window
    pub fn apply_queue_report(&self, qr: u32) {
        if qr <= self.stop_sending {
            self.set_paused(true);
        } else if qr >= self.start_sending {
            self.set_paused(false);
        }
    }

    /// Append `data` to the carried text and return the last queue report
    /// found in the lines it completes
    fn complete_lines_report(&self, data: &str) -> Option<u32> {
        let mut latest = self.latest_data.lock();
        latest.push_str(data);
        let end = latest.rfind('\n')?;
        let report = parse_queue_report(&latest[..end]);
        latest.drain(..=end);
        report
    }
}

#[async_trait]
impl FlowController for TinygFlow {
    fn algorithm(&self) -> BufferAlgorithm {
        BufferAlgorithm::Tinyg
    }

    fn on_incoming_data(&self, data: &str) {
        if let Some(qr) = self.complete_lines_report(data) {
            tracing::trace!("TinyG qr:{} on {}", qr, self.port);
            self.apply_queue_report(qr);
        }
        if !data.is_empty() {
            self.broadcaster
                .broadcast(OutboundMessage::data(&self.port, data));
        }
    }

    async fn block_until_ready(&self, cmd: &str, _id: &str) -> Readiness {
        let generation = self.wipe_generation.load(Ordering::SeqCst);
        let mut rx = self.paused.subscribe();
        if rx.wait_for(|paused| !*paused).await.is_err() {
            return Readiness::Discard;
        }
        drop(rx);
        tokio::time::sleep(self.pacing_delay).await;
        if self.closed.load(Ordering::SeqCst) {
            return Readiness::Discard;
        }
        if self.wipe_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Dropping {:?} on {}, wiped while waiting", cmd, self.port);
            return Readiness::Discard;
        }
        Readiness::Proceed {
            handled_elsewhere: false,
        }
    }

    fn break_apart_commands(&self, cmd: &str) -> Vec<String> {
        let mut commands = Vec::new();
        let mut line = String::new();
        for c in cmd.chars() {
            if c == '\n' {
                finish(&mut line, &mut commands);
            } else if SINGLE_CHAR.contains(&c) {
                finish(&mut line, &mut commands);
                commands.push(c.to_string());
            } else {
                line.push(c);
            }
        }
        finish(&mut line, &mut commands);
        commands
    }

    fn classify(&self, cmd: &str) -> CommandClass {
        let cmd = clean_gcode(cmd);
        if cmd.contains('!') {
            CommandClass::Pause
        } else if cmd.contains('~') {
            CommandClass::Resume
        } else if cmd.contains('%') {
            CommandClass::Wipe
        } else {
            CommandClass::Paced
        }
    }

    fn pause(&self) {
        self.set_paused(true);
    }

    fn unpause(&self) {
        self.set_paused(false);
    }

    fn wipe(&self) {
        let dropped = self.outbound.drain();
        self.wipe_generation.fetch_add(1, Ordering::SeqCst);
        self.set_paused(false);
        tracing::info!("Wiped {} queued commands on {}", dropped, self.port);
        self.broadcaster
            .broadcast(OutboundMessage::wiped(&self.port, self.outbound.pending()));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_paused(false);
    }
}
