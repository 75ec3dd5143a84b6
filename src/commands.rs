//! Text commands received from clients
//!
//! One command per line, verb first, verbs case-insensitive:
//!
//! ```text
//! list
//! version
//! open <port> <baud> [default|timed|timedraw|grbl|tinyg]
//! close <port>
//! send|sendnobuf|sendraw <port> <data>
//! sendjson {"P": "<port>", "Data": [{"D": "<cmd>", "Id": "<id>"}]}
//! ```

use serde::{Deserialize, Serialize};
use serialhub_core::CommandError;
use serialhub_serial::{BufferAlgorithm, SendMode};
use std::str::FromStr;

/// One command of a `sendjson` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonCommand {
    #[serde(rename = "D")]
    pub data: String,
    #[serde(rename = "Id", default)]
    pub id: String,
}

/// Payload of `sendjson`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJsonRequest {
    #[serde(rename = "P")]
    pub port: String,
    #[serde(rename = "Data", default)]
    pub data: Vec<JsonCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    List,
    Version,
    Open {
        port: String,
        baud: u32,
        /// `None` selects the configured default
        algorithm: Option<BufferAlgorithm>,
    },
    Close {
        port: String,
    },
    Send {
        mode: SendMode,
        port: String,
        /// Everything after the port name, verbatim
        data: String,
    },
    SendJson(SendJsonRequest),
}

impl FromStr for HubCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        let verb = trimmed
            .split_whitespace()
            .next()
            .ok_or(CommandError::Empty)?
            .to_ascii_lowercase();

        match verb.as_str() {
            "list" => Ok(Self::List),
            "version" => Ok(Self::Version),
            "open" => parse_open(trimmed),
            "close" => {
                let port = trimmed
                    .split_whitespace()
                    .nth(1)
                    .ok_or(CommandError::MissingArgument("You did not specify a port to close"))?;
                Ok(Self::Close {
                    port: port.to_string(),
                })
            }
            "sendjson" => {
                let body = trimmed[verb.len()..].trim();
                let request: SendJsonRequest = serde_json::from_str(body)
                    .map_err(|e| CommandError::InvalidJson(e.to_string()))?;
                Ok(Self::SendJson(request))
            }
            v if v.starts_with("send") => parse_send(line),
            _ => Err(CommandError::Unknown),
        }
    }
}

fn parse_open(line: &str) -> Result<HubCommand, CommandError> {
    let args: Vec<&str> = line.split_whitespace().collect();
    if args.len() < 3 {
        return Err(CommandError::MissingArgument(
            "You did not specify a port and baud rate in your open cmd",
        ));
    }
    let baud = args[2]
        .parse::<u32>()
        .ok()
        .filter(|b| *b > 0)
        .ok_or_else(|| CommandError::InvalidBaud(args[2].to_string()))?;
    let algorithm = args.get(3).map(|a| a.parse()).transpose()?;
    Ok(HubCommand::Open {
        port: args[1].to_string(),
        baud,
        algorithm,
    })
}

/// `data` keeps its spacing and line endings; only the line's leading
/// whitespace is dropped.
fn parse_send(line: &str) -> Result<HubCommand, CommandError> {
    let mut parts = line.trim_start().splitn(3, ' ');
    let mode: SendMode = parts.next().unwrap_or_default().parse()?;
    let port = parts
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or(CommandError::MissingArgument("Could not parse send command"))?;
    let data = parts
        .next()
        .ok_or(CommandError::MissingArgument("Could not parse send command"))?;
    Ok(HubCommand::Send {
        mode,
        port: port.to_string(),
        data: data.to_string(),
    })
}
