use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::transport::{self, DeviceDescriptor};

/// Link types a front end may offer. Only serial is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Serial,
}

impl InterfaceKind {
    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::Serial => "Serial",
        }
    }
}

/// A named instrument the operator can select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    name: String,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DriverError::Connect("device name must not be empty".into()));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Flat list of devices and interfaces a front end offers for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    devices: Vec<DeviceProfile>,
    interfaces: Vec<InterfaceKind>,
}

impl Registry {
    pub fn new(devices: Vec<DeviceProfile>, interfaces: Vec<InterfaceKind>) -> Self {
        Self {
            devices,
            interfaces,
        }
    }

    /// `count` devices named `device0`, `device1`, ... on the serial interface.
    pub fn numbered(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| DeviceProfile {
                name: format!("device{i}"),
            })
            .collect();
        Self::new(devices, vec![InterfaceKind::Serial])
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(DeviceProfile::name).collect()
    }

    pub fn interface_names(&self) -> Vec<&'static str> {
        self.interfaces.iter().map(|i| i.name()).collect()
    }

    pub fn device(&self, name: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Ports reachable through `interface`.
    pub fn connection_init(&self, interface: InterfaceKind) -> Result<Vec<DeviceDescriptor>> {
        match interface {
            InterfaceKind::Serial => transport::list_available_devices(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::numbered(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_lists_three_serial_devices() {
        let registry = Registry::default();
        assert_eq!(registry.device_names(), vec!["device0", "device1", "device2"]);
        assert_eq!(registry.interface_names(), vec!["Serial"]);
        assert!(registry.device("device1").is_some());
        assert!(registry.device("device9").is_none());
    }

    #[test]
    fn empty_device_name_is_rejected() {
        assert!(DeviceProfile::new("  ").is_err());
        assert_eq!(DeviceProfile::new("cimos-a").unwrap().name(), "cimos-a");
    }
}
