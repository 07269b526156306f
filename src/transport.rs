//! Byte-oriented request/response links to the instrument.
//!
//! The acquisition engine only sees the [`Transport`] trait. Every call on it
//! may block; `read_until` in particular has no deadline and will wait for the
//! terminator for as long as the link stays up.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};

use crate::errors::{DriverError, Result};

/// Default serial baud rate for CIMOS boards
pub const BAUD_RATE: u32 = 115200;

/// Per-call timeout of the underlying port. `read_until` retries through it.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Link state as reported to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connected,
    ConnectionFailed,
    Disconnected,
}

/// A port the operator can pick from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub port_name: String,
    pub kind: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Blocking request/response channel to one instrument.
pub trait Transport: Send {
    /// Initiate the connection.
    fn open(&mut self) -> Result<()>;

    /// Close the connection. Safe to call when already closed.
    fn close(&mut self);

    /// Write all of `bytes` and flush.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block until `terminator` arrives; the returned frame includes it.
    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>>;

    /// Number of bytes waiting in the receive buffer.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Discard whatever the device has sent but nobody has read yet.
    fn interrupt(&mut self) -> Result<()>;

    fn status(&self) -> ConnectionStatus;

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        (**self).read_until(terminator)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn interrupt(&mut self) -> Result<()> {
        (**self).interrupt()
    }

    fn status(&self) -> ConnectionStatus {
        (**self).status()
    }
}

/// Settings used when opening a serial link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// [`Transport`] over a local serial port (USB CDC or UART).
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    status: ConnectionStatus,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            status: ConnectionStatus::NotConnected,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(DriverError::NotConnected)
    }

    fn lost(&mut self, err: impl Into<DriverError>) -> DriverError {
        let err = err.into();
        warn!(
            "serial link lost: port={}, error={}",
            self.settings.port, err
        );
        self.status = ConnectionStatus::Disconnected;
        self.port = None;
        err
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        match serialport::new(&self.settings.port, self.settings.baud_rate)
            .timeout(self.settings.read_timeout)
            .open()
        {
            Ok(port) => {
                info!(
                    "serial port opened: port={}, baud={}",
                    self.settings.port, self.settings.baud_rate
                );
                self.port = Some(port);
                self.status = ConnectionStatus::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "serial port open failed: port={}, error={}",
                    self.settings.port, e
                );
                self.status = ConnectionStatus::ConnectionFailed;
                Err(DriverError::Connect(format!("{}: {e}", self.settings.port)))
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial port closed: port={}", self.settings.port);
            self.status = ConnectionStatus::Disconnected;
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        let res = port.write_all(bytes).and_then(|_| port.flush());
        res.map_err(|e| self.lost(e))
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(64);
        loop {
            let mut byte = [0u8; 1];
            let res = self.port()?.read(&mut byte);
            match res {
                Ok(1) => {
                    frame.push(byte[0]);
                    if byte[0] == terminator {
                        return Ok(frame);
                    }
                }
                Ok(_) => {}
                // The port timeout only bounds a single read call
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.lost(e)),
            }
        }
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let res = self.port()?.bytes_to_read();
        res.map(|n| n as usize).map_err(|e| self.lost(e))
    }

    fn interrupt(&mut self) -> Result<()> {
        let res = self.port()?.clear(serialport::ClearBuffer::Input);
        res.map_err(|e| self.lost(e))
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// List serial ports the operator can choose from.
pub fn list_available_devices() -> Result<Vec<DeviceDescriptor>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => DeviceDescriptor {
                port_name: p.port_name,
                kind: format!("usb {:04x}:{:04x}", usb.vid, usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            SerialPortType::BluetoothPort => descriptor(p.port_name, "bluetooth"),
            SerialPortType::PciPort => descriptor(p.port_name, "pci"),
            SerialPortType::Unknown => descriptor(p.port_name, "unknown"),
        })
        .collect())
}

fn descriptor(port_name: String, kind: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        port_name,
        kind: kind.to_string(),
        manufacturer: None,
        product: None,
        serial_number: None,
    }
}
