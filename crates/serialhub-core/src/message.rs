//! Outbound messages pushed to subscribed clients.
//!
//! Every message is rendered to a single wire string by [`OutboundMessage::to_wire`].
//! Structured messages are JSON objects with the PascalCase field names that
//! browser clients already understand; plain text notices are sent verbatim.

use serde::{Deserialize, Serialize};

/// Whether a tracked command completed or was rejected by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionKind {
    /// Device acknowledged with `ok`, or the command was written untracked.
    Complete,
    /// Device answered with `error`.
    Error,
}

/// Acknowledgement for a command carrying a client id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandCompletion {
    pub cmd: CompletionKind,
    pub id: String,
    pub port: String,
    pub buffer_bytes_remaining: usize,
    pub original_command: String,
}

/// A chunk or line of device output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortData {
    pub port: String,
    pub data: String,
}

/// Acknowledgement that the buffered queue was wiped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipedQueue {
    #[serde(rename = "Cmd")]
    pub cmd: String,
    #[serde(rename = "QCnt")]
    pub queue_count: usize,
    #[serde(rename = "Port")]
    pub port: String,
}

/// A port could not be opened or failed while reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpenFailure {
    pub cmd: String,
    pub desc: String,
    pub port: String,
    pub baud: u32,
}

/// Register/unregister notice for a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleNotice {
    pub cmd: String,
    pub desc: String,
    pub port: String,
    pub baud: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_type: Option<String>,
}

/// One row of the port inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortListEntry {
    pub name: String,
    pub serial_number: String,
    #[serde(rename = "VendorID")]
    pub vendor_id: String,
    #[serde(rename = "ProductID")]
    pub product_id: String,
    pub is_open: bool,
    pub baud: u32,
    pub buffer_algorithm: String,
}

/// The full port inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortList {
    pub ports: Vec<PortListEntry>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "Error")]
    error: &'a str,
}

#[derive(Serialize)]
struct VersionBody<'a> {
    #[serde(rename = "Version")]
    version: &'a str,
}

/// Anything the agent pushes to its subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Completion(CommandCompletion),
    Data(PortData),
    Wiped(WipedQueue),
    OpenFail(OpenFailure),
    Lifecycle(LifecycleNotice),
    Ports(PortList),
    /// `{"Error": "..."}`
    Error(String),
    /// `{"Version": "..."}`
    Version(String),
    /// Free-form notice sent without JSON framing
    Text(String),
}

impl OutboundMessage {
    pub fn data(port: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Data(PortData {
            port: port.into(),
            data: data.into(),
        })
    }

    pub fn completion(
        kind: CompletionKind,
        port: impl Into<String>,
        id: impl Into<String>,
        buffer_bytes_remaining: usize,
        original_command: impl Into<String>,
    ) -> Self {
        Self::Completion(CommandCompletion {
            cmd: kind,
            id: id.into(),
            port: port.into(),
            buffer_bytes_remaining,
            original_command: original_command.into(),
        })
    }

    pub fn wiped(port: impl Into<String>, queue_count: usize) -> Self {
        Self::Wiped(WipedQueue {
            cmd: "WipedQueue".to_string(),
            queue_count,
            port: port.into(),
        })
    }

    pub fn open_fail(port: impl Into<String>, baud: u32, desc: impl Into<String>) -> Self {
        Self::OpenFail(OpenFailure {
            cmd: "OpenFail".to_string(),
            desc: desc.into(),
            port: port.into(),
            baud,
        })
    }

    pub fn opened(port: impl Into<String>, baud: u32, buffer_type: impl Into<String>) -> Self {
        Self::Lifecycle(LifecycleNotice {
            cmd: "Open".to_string(),
            desc: "Got register/open on port.".to_string(),
            port: port.into(),
            baud,
            buffer_type: Some(buffer_type.into()),
        })
    }

    pub fn closed(port: impl Into<String>, baud: u32) -> Self {
        Self::Lifecycle(LifecycleNotice {
            cmd: "Close".to_string(),
            desc: "Got unregister/close on port.".to_string(),
            port: port.into(),
            baud,
            buffer_type: None,
        })
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn text(msg: impl Into<String>) -> Self {
        Self::Text(msg.into())
    }

    /// Render the message as it is sent to clients.
    ///
    /// The port list is pretty-printed; every other JSON message is compact.
    pub fn to_wire(&self) -> String {
        let rendered = match self {
            Self::Completion(c) => serde_json::to_string(c),
            Self::Data(d) => serde_json::to_string(d),
            Self::Wiped(w) => serde_json::to_string(w),
            Self::OpenFail(o) => serde_json::to_string(o),
            Self::Lifecycle(l) => serde_json::to_string(l),
            Self::Ports(p) => serde_json::to_string_pretty(p),
            Self::Error(e) => serde_json::to_string(&ErrorBody { error: e }),
            Self::Version(v) => serde_json::to_string(&VersionBody { version: v }),
            Self::Text(t) => return t.clone(),
        };
        match rendered {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to serialize outbound message: {}", e);
                String::new()
            }
        }
    }
}

impl std::fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}
