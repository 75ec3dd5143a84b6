//! SerialHub Settings Crate
//!
//! Agent configuration and its persistence.

pub mod config;
pub mod error;

pub use config::{
    AgentConfig, DiscoverySettings, GrblSettings, HubSettings, LoggingSettings, SerialSettings,
    TimedSettings, TinygSettings, BUFFER_ALGORITHM_NAMES,
};
pub use error::{SettingsError, SettingsResult};
