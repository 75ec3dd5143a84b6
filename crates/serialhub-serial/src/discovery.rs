//! Client for an external port discovery process
//!
//! The discovery binary speaks the pluggable-discovery protocol on its
//! stdio: after `HELLO 1 "<client>"` and `START_SYNC` it emits one JSON
//! message per port event. [`DiscoveryProcess`] runs it and turns that
//! output into a channel of [`DiscoveryEvent`]s which ends when the process
//! exits.

use async_trait::async_trait;
use serde::Deserialize;
use serialhub_core::DiscoveryError;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const CLIENT_NAME: &str = "serialhub";

/// A port as reported by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscoveredPort {
    pub address: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DiscoveredPort {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn vid(&self) -> Option<&str> {
        self.property("vid")
    }

    pub fn pid(&self) -> Option<&str> {
        self.property("pid")
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.property("serialNumber")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub port: DiscoveredPort,
}

impl DiscoveryEvent {
    pub fn add(port: DiscoveredPort) -> Self {
        Self {
            kind: DiscoveryEventKind::Add,
            port,
        }
    }

    pub fn remove(port: DiscoveredPort) -> Self {
        Self {
            kind: DiscoveryEventKind::Remove,
            port,
        }
    }
}

/// Source of port add/remove events.
///
/// Each call to `start` begins a new stream; the receiver yields `None` when
/// that stream has ended for good.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryMessage {
    event_type: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    port: Option<DiscoveredPort>,
}

/// Map one protocol message to an event, if it carries one
fn interpret(msg: DiscoveryMessage) -> Result<Option<DiscoveryEvent>, DiscoveryError> {
    if msg.error {
        return Err(DiscoveryError::Protocol(format!(
            "{}: {}",
            msg.event_type,
            msg.message.unwrap_or_default()
        )));
    }
    let event = match (msg.event_type.as_str(), msg.port) {
        ("add", Some(port)) => Some(DiscoveryEvent::add(port)),
        ("remove", Some(port)) => Some(DiscoveryEvent::remove(port)),
        (kind, _) => {
            tracing::debug!(
                "Discovery {} {}",
                kind,
                msg.message.as_deref().unwrap_or("")
            );
            None
        }
    };
    Ok(event)
}

/// Incremental parser for the discovery process output.
///
/// Messages are JSON values that may span several lines, so bytes are
/// accumulated until a complete value is available.
#[derive(Debug, Default)]
pub struct MessageParser {
    buffer: Vec<u8>,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed output and collect every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut stream =
            serde_json::Deserializer::from_slice(&self.buffer).into_iter::<DiscoveryMessage>();
        let mut consumed = 0;
        let mut failure = None;
        loop {
            match stream.next() {
                Some(Ok(msg)) => {
                    consumed = stream.byte_offset();
                    match interpret(msg) {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    failure = Some(e.into());
                    break;
                }
                None => {
                    consumed = self.buffer.len();
                    break;
                }
            }
        }
        self.buffer.drain(..consumed);
        match failure {
            Some(e) => {
                self.buffer.clear();
                Err(e)
            }
            None => Ok(events),
        }
    }
}

/// Runs the external discovery binary
#[derive(Debug, Clone)]
pub struct DiscoveryProcess {
    program: String,
    args: Vec<String>,
}

impl DiscoveryProcess {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl DiscoverySource for DiscoveryProcess {
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DiscoveryError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DiscoveryError::Protocol("stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DiscoveryError::Protocol("stdout not captured".to_string()))?;

        stdin
            .write_all(format!("HELLO 1 \"{}\"\n", CLIENT_NAME).as_bytes())
            .await?;
        stdin.write_all(b"START_SYNC\n").await?;
        stdin.flush().await?;
        tracing::info!("Started discovery {}", self.program);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let program = self.program.clone();
        tokio::spawn(async move {
            // stdin stays open for the lifetime of the process
            let _stdin = stdin;
            let mut parser = MessageParser::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("Error reading from discovery {}: {}", program, e);
                        break;
                    }
                };
                match parser.feed(&buf[..n]) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Discarding discovery output: {}", e),
                }
            }
            match child.wait().await {
                Ok(status) => tracing::warn!("Discovery {} exited with {}", program, status),
                Err(e) => tracing::warn!("Discovery {} did not exit cleanly: {}", program, e),
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: &str = r#"{
  "eventType": "add",
  "port": {
    "address": "/dev/ttyACM0",
    "label": "/dev/ttyACM0",
    "protocol": "serial",
    "protocolLabel": "Serial Port (USB)",
    "properties": { "pid": "0x0043", "serialNumber": "8573", "vid": "0x2341" }
  }
}
"#;

    #[test]
    fn test_parses_multiline_message() {
        let mut parser = MessageParser::new();
        let events = parser
            .feed(br#"{"eventType":"hello","message":"OK","protocolVersion":1}"#)
            .unwrap();
        assert!(events.is_empty());

        let (head, tail) = ADD.split_at(40);
        assert!(parser.feed(head.as_bytes()).unwrap().is_empty());
        let events = parser.feed(tail.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DiscoveryEventKind::Add);
        assert_eq!(events[0].port.address, "/dev/ttyACM0");
        assert_eq!(events[0].port.vid(), Some("0x2341"));
        assert_eq!(events[0].port.serial_number(), Some("8573"));
    }

    #[test]
    fn test_remove_and_error() {
        let mut parser = MessageParser::new();
        let events = parser
            .feed(br#"{"eventType":"remove","port":{"address":"COM3","protocol":"serial"}}"#)
            .unwrap();
        assert_eq!(events, vec![DiscoveryEvent::remove(DiscoveredPort {
            address: "COM3".to_string(),
            protocol: "serial".to_string(),
            properties: HashMap::new(),
        })]);

        let err = parser
            .feed(br#"{"eventType":"start_sync","error":true,"message":"busy"}"#)
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Protocol(ref m) if m.contains("busy")));
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut parser = MessageParser::new();
        assert!(parser.feed(b"not json\n").is_err());
        let events = parser
            .feed(br#"{"eventType":"remove","port":{"address":"COM4"}}"#)
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
