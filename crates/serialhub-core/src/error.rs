//! Error handling for SerialHub
//!
//! Errors are grouped by the layer that raises them:
//! - Serial errors (port lifecycle and write path)
//! - Command errors (parsing client text commands)
//! - Discovery errors (the external port discovery process)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Serial connection error type
///
/// Raised by the connection lifecycle and the write path. Transport failures
/// tear down only the affected connection.
#[derive(Error, Debug)]
pub enum SerialError {
    /// No open connection matches the requested name
    #[error("We could not find the serial port {port} that you were trying to use.")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// The port is already open through this agent
    #[error("Port already open: {port}")]
    PortAlreadyOpen {
        /// The name of the port that is already open.
        port: String,
    },

    /// The OS refused to open the port
    #[error("Error opening port. {reason}")]
    OpenFailed {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// The buffered outbound queue cannot accept more commands
    #[error("Outbound queue for {port} is full ({capacity} commands)")]
    QueueFull {
        /// The port whose queue is full.
        port: String,
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The connection is shutting down and no longer accepts writes
    #[error("Port {port} is closing")]
    ConnectionClosing {
        /// The port being closed.
        port: String,
    },

    /// A raw payload could not be decoded
    #[error("Invalid payload for {port}: {reason}")]
    InvalidPayload {
        /// The target port.
        port: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// Standard I/O error from the port handle
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client command error type
///
/// Represents malformed or unsupported text commands received from clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Nothing but whitespace was received
    #[error("Empty command")]
    Empty,

    /// The verb is not one the agent understands
    #[error("Could not understand command.")]
    Unknown,

    /// A required argument was not supplied
    #[error("{0}")]
    MissingArgument(&'static str),

    /// The baud rate is not a positive integer
    #[error("Problem converting baud rate {0}")]
    InvalidBaud(String),

    /// The send verb is not one of the supported modes
    #[error("Unsupported send command:{0}. Please specify a valid one")]
    UnsupportedSendMode(String),

    /// The requested flow-control algorithm does not exist
    #[error("Unknown buffer algorithm: {0}")]
    UnknownBufferAlgorithm(String),

    /// A `sendjson` payload could not be decoded
    #[error("Problem decoding json. {0}")]
    InvalidJson(String),
}

/// Discovery error type
///
/// Represents failures talking to the external port discovery process.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The discovery binary could not be started
    #[error("Failed to start discovery {program}: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The process violated the discovery protocol
    #[error("Discovery protocol error: {0}")]
    Protocol(String),

    /// A discovery message was not valid JSON
    #[error("Discovery JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the process pipes
    #[error("Discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for SerialHub
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Serial error
    #[error(transparent)]
    Serial(#[from] SerialError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Discovery error
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a serial error
    pub fn is_serial_error(&self) -> bool {
        matches!(self, Error::Serial(_))
    }

    /// Check if this is a command error
    pub fn is_command_error(&self) -> bool {
        matches!(self, Error::Command(_))
    }

    /// Check if the error names a port that is not open
    pub fn is_port_not_found(&self) -> bool {
        matches!(self, Error::Serial(SerialError::PortNotFound { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
