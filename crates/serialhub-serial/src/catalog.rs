//! Inventory of attached ports
//!
//! Built by diffing discovery events: a repeat add updates the entry in place,
//! a remove deletes it. Open/closed state is set by the connection lifecycle
//! and kept apart from the discovered entries, so a port that is re-added
//! after a reset (or discovered after it was opened) is still shown open.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use serialhub_core::{Broadcaster, OutboundMessage, PortList, PortListEntry};
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::{DiscoveredPort, DiscoveryEvent, DiscoveryEventKind, DiscoverySource};
use crate::flow::BufferAlgorithm;

const SERIAL_PROTOCOL: &str = "serial";
const NULL_ID: &str = "0x0000";

#[derive(Debug, Clone, Copy)]
struct OpenState {
    baud: u32,
    algorithm: BufferAlgorithm,
}

impl OpenState {
    fn apply_to(&self, entry: &mut PortListEntry) {
        entry.is_open = true;
        entry.baud = self.baud;
        entry.buffer_algorithm = self.algorithm.as_str().to_string();
    }
}

pub struct PortCatalog {
    ports: Mutex<Vec<PortListEntry>>,
    /// Open connections keyed by lowercased port name
    open: Mutex<HashMap<String, OpenState>>,
    exclude: Option<Regex>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PortCatalog {
    pub fn new(exclude: Option<Regex>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            ports: Mutex::new(Vec::new()),
            open: Mutex::new(HashMap::new()),
            exclude,
            broadcaster,
        }
    }

    /// Whether a discovered port belongs in the inventory
    pub fn accepts(&self, port: &DiscoveredPort) -> bool {
        if !port.protocol.is_empty() && port.protocol != SERIAL_PROTOCOL {
            return false;
        }
        let vid = match port.vid() {
            Some(vid) if !vid.is_empty() && !vid.eq_ignore_ascii_case(NULL_ID) => vid,
            _ => return false,
        };
        if port.pid().is_some_and(|pid| pid.eq_ignore_ascii_case(NULL_ID)) {
            return false;
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&port.address) {
                tracing::debug!("Excluding {} ({})", port.address, vid);
                return false;
            }
        }
        true
    }

    /// Apply one discovery event
    pub fn apply(&self, event: &DiscoveryEvent) {
        match event.kind {
            DiscoveryEventKind::Add => self.add(&event.port),
            DiscoveryEventKind::Remove => self.remove(&event.port.address),
        }
    }

    pub fn add(&self, port: &DiscoveredPort) {
        if !self.accepts(port) {
            return;
        }
        let serial_number = port.serial_number().unwrap_or_default().to_string();
        let vendor_id = port.vid().unwrap_or_default().to_string();
        let product_id = port.pid().unwrap_or_default().to_string();

        let mut ports = self.ports.lock();
        match ports.iter_mut().find(|p| p.name == port.address) {
            Some(existing) => {
                existing.serial_number = serial_number;
                existing.vendor_id = vendor_id;
                existing.product_id = product_id;
            }
            None => {
                tracing::info!("Port {} attached", port.address);
                let mut entry = PortListEntry {
                    name: port.address.clone(),
                    serial_number,
                    vendor_id,
                    product_id,
                    is_open: false,
                    baud: 0,
                    buffer_algorithm: String::new(),
                };
                if let Some(state) = self.open.lock().get(&port.address.to_lowercase()) {
                    state.apply_to(&mut entry);
                }
                ports.push(entry);
            }
        }
    }

    pub fn remove(&self, address: &str) {
        let mut ports = self.ports.lock();
        let before = ports.len();
        ports.retain(|p| p.name != address);
        if ports.len() != before {
            tracing::info!("Port {} detached", address);
        }
    }

    /// Forget every discovered port. Open state survives.
    pub fn reset(&self) {
        self.ports.lock().clear();
    }

    pub fn mark_open(&self, name: &str, baud: u32, algorithm: BufferAlgorithm) {
        let state = OpenState { baud, algorithm };
        self.open.lock().insert(name.to_lowercase(), state);
        if let Some(entry) = self
            .ports
            .lock()
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            state.apply_to(entry);
        }
    }

    pub fn mark_closed(&self, name: &str) {
        self.open.lock().remove(&name.to_lowercase());
        if let Some(entry) = self
            .ports
            .lock()
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            entry.is_open = false;
            entry.baud = 0;
            entry.buffer_algorithm.clear();
        }
    }

    pub fn get(&self, name: &str) -> Option<PortListEntry> {
        self.ports
            .lock()
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn snapshot(&self) -> PortList {
        PortList {
            ports: self.ports.lock().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }

    /// The inventory as the pretty-printed `{"Ports": [...]}` document
    pub fn list_json(&self) -> String {
        OutboundMessage::Ports(self.snapshot()).to_wire()
    }

    pub fn broadcast_list(&self) {
        self.broadcaster
            .broadcast(OutboundMessage::Ports(self.snapshot()));
    }

    /// Consume discovery streams until the restart budget is spent.
    ///
    /// Whenever a stream ends the inventory is emptied, since nothing is
    /// watching the ports any more.
    pub async fn run(&self, source: &dyn DiscoverySource, max_restarts: u32, backoff: Duration) {
        let mut restarts = 0;
        loop {
            match source.start().await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        self.apply(&event);
                    }
                    tracing::warn!("Discovery stream ended");
                }
                Err(e) => tracing::error!("Discovery failed: {}", e),
            }
            self.reset();

            if restarts >= max_restarts {
                tracing::error!("Giving up on port discovery after {} restarts", restarts);
                return;
            }
            restarts += 1;
            tracing::info!(
                "Restarting discovery in {:?} ({}/{})",
                backoff,
                restarts,
                max_restarts
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Silent;

    impl Broadcaster for Silent {
        fn broadcast(&self, _msg: OutboundMessage) {}
    }

    fn port(address: &str, vid: &str, pid: &str) -> DiscoveredPort {
        DiscoveredPort {
            address: address.to_string(),
            protocol: "serial".to_string(),
            properties: HashMap::from([
                ("vid".to_string(), vid.to_string()),
                ("pid".to_string(), pid.to_string()),
            ]),
        }
    }

    #[test]
    fn test_filters() {
        let catalog = PortCatalog::new(
            Some(Regex::new("^/dev/ttyS").unwrap()),
            Arc::new(Silent),
        );
        assert!(catalog.accepts(&port("/dev/ttyACM0", "0x2341", "0x0043")));
        assert!(!catalog.accepts(&port("/dev/ttyACM0", "0x0000", "0x0043")));
        assert!(!catalog.accepts(&port("/dev/ttyACM0", "0x2341", "0x0000")));
        assert!(!catalog.accepts(&port("/dev/ttyS0", "0x2341", "0x0043")));

        let mut no_vid = port("COM1", "", "");
        no_vid.properties.clear();
        assert!(!catalog.accepts(&no_vid));

        let mut network = port("192.168.1.5", "0x2341", "0x0043");
        network.protocol = "network".to_string();
        assert!(!catalog.accepts(&network));
    }

    #[test]
    fn test_open_state() {
        let catalog = PortCatalog::new(None, Arc::new(Silent));
        catalog.add(&port("COM3", "0x2341", "0x0043"));
        catalog.mark_open("com3", 115200, BufferAlgorithm::Grbl);
        let entry = catalog.get("COM3").unwrap();
        assert!(entry.is_open);
        assert_eq!(entry.baud, 115200);
        assert_eq!(entry.buffer_algorithm, "grbl");

        catalog.mark_closed("COM3");
        let entry = catalog.get("COM3").unwrap();
        assert!(!entry.is_open);
        assert_eq!(entry.baud, 0);
    }

    #[test]
    fn test_open_state_survives_reset() {
        let catalog = PortCatalog::new(None, Arc::new(Silent));
        catalog.add(&port("COM3", "0x2341", "0x0043"));
        catalog.mark_open("COM3", 115200, BufferAlgorithm::Tinyg);
        catalog.reset();
        assert!(catalog.is_empty());

        catalog.add(&port("COM3", "0x2341", "0x0043"));
        let entry = catalog.get("COM3").unwrap();
        assert!(entry.is_open);
        assert_eq!(entry.baud, 115200);
        assert_eq!(entry.buffer_algorithm, "tinyg");

        // opened before discovery saw it
        catalog.mark_open("COM4", 9600, BufferAlgorithm::Default);
        catalog.add(&port("COM4", "0x1a86", "0x7523"));
        assert!(catalog.get("COM4").unwrap().is_open);

        catalog.mark_closed("COM3");
        catalog.reset();
        catalog.add(&port("COM3", "0x2341", "0x0043"));
        assert!(!catalog.get("COM3").unwrap().is_open);
    }
}
