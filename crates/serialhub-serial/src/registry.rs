//! Registry of open connections
//!
//! Port names are matched case-insensitively, and at most one connection per
//! name is registered at a time.

use parking_lot::Mutex;
use serialhub_core::{Broadcaster, OutboundMessage, SerialError};
use std::sync::Arc;

use crate::connection::SerialConnection;

pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<SerialConnection>>>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ConnectionRegistry {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            broadcaster,
        }
    }

    /// Add a connection and announce it
    pub fn register(&self, conn: Arc<SerialConnection>) -> Result<(), SerialError> {
        {
            let mut connections = self.connections.lock();
            if connections
                .iter()
                .any(|c| c.name().eq_ignore_ascii_case(conn.name()))
            {
                return Err(SerialError::PortAlreadyOpen {
                    port: conn.name().to_string(),
                });
            }
            connections.push(conn.clone());
        }
        tracing::info!("Registered {} ({})", conn.name(), conn.algorithm());
        self.broadcaster.broadcast(OutboundMessage::opened(
            conn.name(),
            conn.baud(),
            conn.algorithm().as_str(),
        ));
        Ok(())
    }

    /// Remove a connection, announce the close and stop its writers.
    ///
    /// Returns false when `conn` was not registered, in which case nothing is
    /// broadcast.
    pub async fn unregister(&self, conn: &Arc<SerialConnection>) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            let before = connections.len();
            connections.retain(|c| !Arc::ptr_eq(c, conn));
            connections.len() != before
        };
        if !removed {
            return false;
        }
        tracing::info!("Unregistered {}", conn.name());
        self.broadcaster
            .broadcast(OutboundMessage::closed(conn.name(), conn.baud()));
        conn.shutdown_writers().await;
        true
    }

    pub fn find(&self, name: &str) -> Option<Arc<SerialConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.connections
            .lock()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<SerialConnection>> {
        self.connections.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
