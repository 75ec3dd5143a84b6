//! # SerialHub Core
//!
//! Shared building blocks for the SerialHub agent:
//! the error taxonomy, the outbound JSON message shapes pushed to
//! subscribed clients, and the broadcaster that fans them out.

pub mod broadcast;
pub mod error;
pub mod message;

pub use broadcast::{BroadcastHub, Broadcaster, SubscriptionId};
pub use error::{CommandError, DiscoveryError, Error, Result, SerialError};
pub use message::{
    CommandCompletion, CompletionKind, LifecycleNotice, OpenFailure, OutboundMessage, PortData,
    PortList, PortListEntry, WipedQueue,
};
