//! Flow control strategies
//!
//! A [`FlowController`] sits between a connection's buffered queue and the
//! device. The buffered writer calls [`FlowController::block_until_ready`]
//! before forwarding each command, and the reader feeds every chunk of device
//! output to [`FlowController::on_incoming_data`]. Each strategy decides from
//! that output when the device can accept more.
//!
//! Strategies are selected once, at open time, by [`create`].

pub mod gate;
pub mod grbl;
pub mod noop;
pub mod timed;
pub mod tinyg;

use async_trait::async_trait;
use serialhub_core::{Broadcaster, CommandError};
use serialhub_settings::AgentConfig;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::outbound::OutboundQueue;
use crate::port::PortIo;

pub use gate::{PauseGate, PauseSignal};
pub use grbl::GrblFlow;
pub use noop::NoOpFlow;
pub use timed::{TimedEncoding, TimedFlow};
pub use tinyg::TinygFlow;

/// Flow-control algorithm names accepted by `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAlgorithm {
    /// No pacing
    Default,
    /// Incoming bytes coalesced on a fixed tick
    Timed,
    /// As `Timed`, with base64 output
    TimedRaw,
    Grbl,
    Tinyg,
}

impl BufferAlgorithm {
    pub const ALL: [BufferAlgorithm; 5] = [
        Self::Default,
        Self::Timed,
        Self::TimedRaw,
        Self::Grbl,
        Self::Tinyg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Timed => "timed",
            Self::TimedRaw => "timedraw",
            Self::Grbl => "grbl",
            Self::Tinyg => "tinyg",
        }
    }
}

impl fmt::Display for BufferAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BufferAlgorithm {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| CommandError::UnknownBufferAlgorithm(s.to_string()))
    }
}

/// How the reader hands device output to a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEncoding {
    /// Decoded text, code points reassembled across reads
    Utf8,
    /// Bytes exactly as read
    Raw,
}

/// Outcome of [`FlowController::block_until_ready`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Forward the command. When `handled_elsewhere` is false the controller
    /// will not acknowledge it, so the raw writer reports completion itself.
    Proceed { handled_elsewhere: bool },
    /// A wipe cancelled the command; drop it without writing
    Discard,
}

/// What a command does when it is submitted with `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Goes through the buffered queue
    Paced,
    /// Bypasses the buffered queue
    Direct,
    /// Bypasses the buffered queue and pauses pacing
    Pause,
    /// Bypasses the buffered queue and resumes pacing
    Resume,
    /// Bypasses the buffered queue and wipes everything still queued
    Wipe,
}

impl CommandClass {
    pub fn skips_buffer(&self) -> bool {
        !matches!(self, Self::Paced)
    }
}

/// Everything a controller may need from its connection
#[derive(Clone)]
pub struct FlowContext {
    pub port: String,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub io: Arc<dyn PortIo>,
    pub outbound: Arc<OutboundQueue>,
    pub config: Arc<AgentConfig>,
}

/// Pacing strategy attached to one connection
#[async_trait]
pub trait FlowController: Send + Sync {
    fn algorithm(&self) -> BufferAlgorithm;

    /// Start background tasks. Must be called inside a tokio runtime.
    fn init(&self) {}

    fn input_encoding(&self) -> InputEncoding {
        InputEncoding::Utf8
    }

    /// Handle decoded device output
    fn on_incoming_data(&self, data: &str);

    /// Handle raw device output; used when `input_encoding` is `Raw`
    fn on_incoming_bytes(&self, data: &[u8]) {
        self.on_incoming_data(&String::from_utf8_lossy(data));
    }

    /// Wait until `cmd` may be written. This is the only suspension point on
    /// the send path.
    async fn block_until_ready(&self, cmd: &str, id: &str) -> Readiness;

    /// Split a client payload into the commands that are actually sent
    fn break_apart_commands(&self, cmd: &str) -> Vec<String> {
        if cmd.is_empty() {
            Vec::new()
        } else {
            vec![cmd.to_string()]
        }
    }

    fn classify(&self, _cmd: &str) -> CommandClass {
        CommandClass::Paced
    }

    fn pause(&self) {}

    fn unpause(&self) {}

    /// Drop everything still queued and release a parked writer
    fn wipe(&self) {}

    /// Stop background tasks and release any parked writer for good
    fn close(&self);
}

/// Build the controller for `algorithm`
pub fn create(algorithm: BufferAlgorithm, ctx: FlowContext) -> Arc<dyn FlowController> {
    tracing::debug!("Creating {} flow controller for {}", algorithm, ctx.port);
    match algorithm {
        BufferAlgorithm::Default => Arc::new(NoOpFlow::new(ctx)),
        BufferAlgorithm::Timed => Arc::new(TimedFlow::new(ctx, TimedEncoding::Text)),
        BufferAlgorithm::TimedRaw => Arc::new(TimedFlow::new(ctx, TimedEncoding::Base64)),
        BufferAlgorithm::Grbl => Arc::new(GrblFlow::new(ctx)),
        BufferAlgorithm::Tinyg => Arc::new(TinygFlow::new(ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("grbl".parse::<BufferAlgorithm>().unwrap(), BufferAlgorithm::Grbl);
        assert_eq!("TimedRaw".parse::<BufferAlgorithm>().unwrap(), BufferAlgorithm::TimedRaw);
        assert_eq!(" tinyg ".parse::<BufferAlgorithm>().unwrap(), BufferAlgorithm::Tinyg);
        assert_eq!(
            "xonxoff".parse::<BufferAlgorithm>(),
            Err(CommandError::UnknownBufferAlgorithm("xonxoff".to_string()))
        );
    }

    #[test]
    fn test_names_match_settings() {
        let names: Vec<&str> = BufferAlgorithm::ALL.iter().map(|a| a.as_str()).collect();
        assert_eq!(names, serialhub_settings::BUFFER_ALGORITHM_NAMES);
    }
}
