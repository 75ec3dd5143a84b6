mod common;

use async_trait::async_trait;
use common::Recorder;
use parking_lot::Mutex;
use serialhub_core::{DiscoveryError, OutboundMessage};
use serialhub_serial::{DiscoveredPort, DiscoveryEvent, DiscoverySource, PortCatalog};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn port(address: &str, vid: &str, pid: &str, serial: &str) -> DiscoveredPort {
    DiscoveredPort {
        address: address.to_string(),
        protocol: "serial".to_string(),
        properties: HashMap::from([
            ("vid".to_string(), vid.to_string()),
            ("pid".to_string(), pid.to_string()),
            ("serialNumber".to_string(), serial.to_string()),
        ]),
    }
}

fn names(catalog: &PortCatalog) -> Vec<String> {
    catalog.snapshot().ports.into_iter().map(|p| p.name).collect()
}

#[test]
fn add_add_remove_leaves_second_port() {
    let catalog = PortCatalog::new(None, Recorder::new());
    catalog.apply(&DiscoveryEvent::add(port("/dev/ttyACM0", "0x2341", "0x0043", "A1")));
    catalog.apply(&DiscoveryEvent::add(port("/dev/ttyUSB0", "0x1a86", "0x7523", "")));
    catalog.apply(&DiscoveryEvent::remove(port("/dev/ttyACM0", "", "", "")));
    assert_eq!(names(&catalog), vec!["/dev/ttyUSB0"]);
}

#[test]
fn repeated_add_updates_in_place() {
    let catalog = PortCatalog::new(None, Recorder::new());
    catalog.add(&port("COM3", "0x2341", "0x0043", "old"));
    catalog.mark_open("COM3", 250000, serialhub_serial::BufferAlgorithm::Grbl);
    catalog.add(&port("COM3", "0x2341", "0x0043", "new"));

    let list = catalog.snapshot();
    assert_eq!(list.ports.len(), 1);
    let entry = &list.ports[0];
    assert_eq!(entry.serial_number, "new");
    assert!(entry.is_open, "open state survives a metadata refresh");
    assert_eq!(entry.baud, 250000);
}

#[test]
fn list_json_is_pretty_printed() {
    let recorder = Recorder::new();
    let catalog = PortCatalog::new(None, recorder.clone());
    catalog.add(&port("COM7", "0x0403", "0x6001", "FT1"));

    let json = catalog.list_json();
    assert!(json.contains("\n  \"Ports\""));
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["Ports"][0]["Name"], "COM7");
    assert_eq!(value["Ports"][0]["VendorID"], "0x0403");
    assert_eq!(value["Ports"][0]["IsOpen"], false);

    catalog.broadcast_list();
    assert_eq!(recorder.count(|m| matches!(m, OutboundMessage::Ports(_))), 1);
}

/// Emits the same events on every start, then ends the stream
struct Scripted {
    events: Vec<DiscoveryEvent>,
    starts: AtomicU32,
    seen: Mutex<Vec<usize>>,
    catalog: Mutex<Option<Arc<PortCatalog>>>,
}

#[async_trait]
impl DiscoverySource for Scripted {
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        // record what the catalog looked like when the previous stream ended
        if let Some(catalog) = self.catalog.lock().as_ref() {
            self.seen.lock().push(catalog.len());
        }
        if self.starts.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(DiscoveryError::Protocol("transient".to_string()));
        }
        let (tx, rx) = mpsc::channel(8);
        for event in &self.events {
            tx.send(event.clone()).await.unwrap();
        }
        Ok(rx)
    }
}

#[tokio::test]
async fn run_restarts_then_gives_up() {
    let catalog = Arc::new(PortCatalog::new(None, Recorder::new()));
    let source = Scripted {
        events: vec![DiscoveryEvent::add(port("COM1", "0x2341", "0x0043", ""))],
        starts: AtomicU32::new(0),
        seen: Mutex::new(Vec::new()),
        catalog: Mutex::new(Some(catalog.clone())),
    };

    catalog.run(&source, 2, Duration::from_millis(5)).await;

    assert_eq!(source.starts.load(Ordering::SeqCst), 3);
    assert_eq!(*source.seen.lock(), vec![0, 0, 0]);
    assert!(catalog.is_empty());
}
