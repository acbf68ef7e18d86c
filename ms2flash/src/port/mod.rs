//! Serial link to the SLCAN adapter.
//!
//! [`SlcanAdapter`](crate::adapter::SlcanAdapter) only needs a byte stream
//! plus a handful of line controls, so that is all [`Port`] asks for. The
//! native implementation sits behind the `native` feature; tests use an
//! in-memory port with scripted replies.
//!
//! ```rust,no_run
//! use ms2flash::port::Port;
//!
//! fn poke<P: Port>(port: &mut P) -> ms2flash::Result<()> {
//!     port.set_control_lines(true, true)?;
//!     port.write_line(b"V\r")
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate of the serial link to the adapter.
pub const DEFAULT_BAUD: u32 = 230_400;

/// Read timeout of the adapter's reader thread.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Where and how fast to open the adapter. The link is always 8N1 without
/// flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// How long a read waits before reporting a timeout.
    pub read_timeout: Duration,
}

impl SerialConfig {
    /// Settings for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte link to an SLCAN adapter.
///
/// Reads must give up after a short timeout with
/// [`std::io::ErrorKind::TimedOut`] (or `Ok(0)`) so the reader thread can
/// notice a shutdown request.
pub trait Port: Read + Write + Send {
    /// Port name/path, for messages.
    fn name(&self) -> &str;

    /// Drive DTR and RTS. Most adapters only talk once both are raised.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()>;

    /// Drop whatever the adapter sent before we started listening.
    fn discard_input(&mut self) -> Result<()>;

    /// Second handle to the same device for the reader thread.
    fn try_clone(&self) -> Result<Self>
    where
        Self: Sized;

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write one complete adapter line and flush it.
    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.write_all(line)?;
        self.flush()?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, list_ports};


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_defaults_to_reader_timeout() {
        let config = SerialConfig::new("/dev/ttyACM0", DEFAULT_BAUD);
        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 230_400);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn test_mock_port_replies_follow_writes() {
        let mut port = mock::MockPort::new();
        port.respond_to(b"S5\r", b"\r");
        port.write_line(b"O\r").unwrap();
        assert!(port.read(&mut [0u8; 4]).is_err());
        port.write_line(b"S5\r").unwrap();

        let mut buf = [0u8; 4];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\r");
        assert_eq!(port.output(), b"O\rS5\r");
    }

    #[test]
    fn test_mock_port_discards_pending_input() {
        let mut port = mock::MockPort::new();
        port.push_input(b"\x07\x07T00");
        port.discard_input().unwrap();
        assert!(port.read(&mut [0u8; 4]).is_err());
    }
}
