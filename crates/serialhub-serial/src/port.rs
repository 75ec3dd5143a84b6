//! Raw serial port access
//!
//! [`PortIo`] is the narrow byte interface a connection needs from the OS
//! handle. [`RealSerialPort`] implements it over the `serialport` crate with
//! independent reader and writer handles, so a blocked read never delays a
//! write. [`PortOpener`] lets the hub open ports without knowing whether they
//! are real hardware.

use parking_lot::Mutex;
use serialhub_core::SerialError;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Low-level port interface
///
/// Methods take `&self` so one handle can be shared by the reader task, the
/// writer task and a flow controller's background poller.
pub trait PortIo: Send + Sync {
    /// Read available bytes. A read timeout is reported as
    /// `io::ErrorKind::TimedOut` and is not a failure.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Release the OS handle; later reads and writes fail with `NotConnected`
    fn close(&self) -> io::Result<()>;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port is closed")
}

/// Real serial port implementation using serialport crate
pub struct RealSerialPort {
    name: String,
    reader: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
}

impl RealSerialPort {
    /// Open a serial port at the given baud rate
    pub fn open(name: &str, baud: u32, read_timeout: Duration) -> Result<Self, SerialError> {
        let port = serialport::new(name, baud)
            .timeout(read_timeout)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", name, e);
                SerialError::OpenFailed {
                    port: name.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let writer = port.try_clone().map_err(|e| SerialError::OpenFailed {
            port: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            reader: Mutex::new(Some(port)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PortIo for RealSerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.lock().as_mut() {
            Some(port) => port.read(buf),
            None => Err(not_connected()),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        match self.writer.lock().as_mut() {
            Some(port) => {
                port.write_all(data)?;
                port.flush()
            }
            None => Err(not_connected()),
        }
    }

    fn close(&self) -> io::Result<()> {
        // Writer first: the reader lock may be held for up to one read timeout.
        self.writer.lock().take();
        self.reader.lock().take();
        tracing::debug!("Closed OS handle for {}", self.name);
        Ok(())
    }
}

/// Opens ports by name
pub trait PortOpener: Send + Sync {
    fn open(&self, name: &str, baud: u32) -> Result<Arc<dyn PortIo>, SerialError>;
}

/// Opens real hardware through the `serialport` crate
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    read_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, name: &str, baud: u32) -> Result<Arc<dyn PortIo>, SerialError> {
        let port = RealSerialPort::open(name, baud, self.read_timeout)?;
        tracing::info!("Opened {} at {} baud", name, baud);
        Ok(Arc::new(port))
    }
}

/// Whether a read error only means "no data yet"
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let opener = SerialPortOpener::default();
        let err = opener
            .open("/dev/serialhub-does-not-exist", 115200)
            .err()
            .unwrap();
        match err {
            SerialError::OpenFailed { port, .. } => {
                assert_eq!(port, "/dev/serialhub-does-not-exist")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
