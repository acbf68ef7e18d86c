//! [`Port`] backed by the `serialport` crate.

use std::io::{self, Read, Write};

use log::{debug, trace};
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use super::{Port, PortInfo, SerialConfig};
use crate::error::Result;

/// Serial port of an SLCAN adapter on the host.
///
/// The handle is dropped on [`Port::close`]; I/O after that fails with
/// [`io::ErrorKind::NotConnected`].
pub struct NativePort {
    link: Option<Box<dyn SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let link = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.read_timeout)
            .open()?;
        Ok(Self {
            link: Some(link),
            name: config.port_name.clone(),
        })
    }

    fn link(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.link
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "adapter port closed"))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        trace!("{}: DTR={dtr} RTS={rts}", self.name);
        let link = self.link()?;
        link.write_data_terminal_ready(dtr)?;
        link.write_request_to_send(rts)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.link()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "adapter port closed"))?;
        Ok(Self {
            link: Some(link.try_clone()?),
            name: self.name.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.link = None;
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.link()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.link()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.link()?.flush()
    }
}

/// Serial ports present on the host, with USB details where known.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(port_info).collect())
}

fn port_info(port: serialport::SerialPortInfo) -> PortInfo {
    let mut info = PortInfo {
        name: port.port_name,
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial_number: None,
    };
    if let SerialPortType::UsbPort(usb) = port.port_type {
        info.vid = Some(usb.vid);
        info.pid = Some(usb.pid);
        info.manufacturer = usb.manufacturer;
        info.product = usb.product;
        info.serial_number = usb.serial_number;
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_details_are_kept() {
        let info = port_info(serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x16D0,
                pid: 0x117E,
                serial_number: Some("A1".to_string()),
                manufacturer: Some("Protofusion Labs".to_string()),
                product: Some("CANable".to_string()),
            }),
        });
        assert_eq!(info.vid, Some(0x16D0));
        assert_eq!(info.pid, Some(0x117E));
        assert_eq!(info.product.as_deref(), Some("CANable"));
    }

    #[test]
    fn test_non_usb_port_has_no_ids() {
        let info = port_info(serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        });
        assert_eq!(info.name, "/dev/ttyS0");
        assert_eq!(info.vid, None);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/ms2flash-does-not-exist", 230_400);
        assert!(NativePort::open(&config).is_err());
    }
}
