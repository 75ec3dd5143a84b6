//! # SerialHub
//!
//! A local agent bridging a browser IDE to microcontroller boards attached
//! by serial port. It:
//! - opens and multiplexes concurrent serial connections
//! - paces outgoing command streams per device protocol (none, timed, GRBL, TinyG)
//! - relays device output to subscribed clients with acknowledgment tracking
//! - keeps an inventory of attached ports from an external discovery process
//!
//! ## Architecture
//!
//! 1. **serialhub-core** - errors, outbound messages, broadcaster
//! 2. **serialhub-settings** - configuration and persistence
//! 3. **serialhub-serial** - connections, flow control, registry, catalog, discovery
//! 4. **serialhub** - process root, command dispatcher and binary

pub mod commands;
pub mod hub;

pub use commands::{HubCommand, JsonCommand, SendJsonRequest};
pub use hub::SerialHub;

pub use serialhub_core::{
    BroadcastHub, Broadcaster, CommandError, DiscoveryError, Error, OutboundMessage, Result,
    SerialError,
};
pub use serialhub_serial::{BufferAlgorithm, PortOpener, SendMode, SerialConnection};
pub use serialhub_settings::{AgentConfig, LoggingSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Version reported by the `version` command
pub fn version_string() -> String {
    format!("{} (built {})", VERSION, BUILD_DATE)
}

/// Initialize logging
///
/// Logs go to stderr, since stdout carries broadcasts. `RUST_LOG` takes
/// precedence over the configured filter.
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&settings.filter))?;

    if settings.json {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
            .pretty();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}
