//! # SerialHub Serial
//!
//! Serial connections and everything that paces them:
//!
//! - [`SerialConnection`]: reader, buffered writer and raw writer tasks per port
//! - [`flow`]: pacing strategies (none, timed batching, GRBL, TinyG)
//! - [`ConnectionRegistry`]: the set of open connections
//! - [`PortCatalog`] and [`discovery`]: the inventory of attached ports

pub mod catalog;
pub mod command_queue;
pub mod connection;
pub mod discovery;
pub mod flow;
pub mod outbound;
pub mod port;
pub mod registry;
pub mod utf8;

pub use catalog::PortCatalog;
pub use command_queue::{CommandQueue, QueuedCommand};
pub use connection::{SendMode, SerialConnection, ZERO_READ_THRESHOLD};
pub use discovery::{
    DiscoveredPort, DiscoveryEvent, DiscoveryEventKind, DiscoveryProcess, DiscoverySource,
};
pub use flow::{
    BufferAlgorithm, CommandClass, FlowContext, FlowController, InputEncoding, Readiness,
};
pub use outbound::{DirectWrite, OutboundQueue};
pub use port::{PortIo, PortOpener, RealSerialPort, SerialPortOpener};
pub use registry::ConnectionRegistry;
pub use utf8::Utf8Reassembler;
