//! Runtime settings and per-device persistence of last-used parameters.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::params::ParameterSet;

/// Maps a sweep address to its x-axis label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    pub offset: f64,
    pub step: f64,
}

impl Default for SweepAxis {
    fn default() -> Self {
        Self {
            offset: 0.0,
            step: 1.0,
        }
    }
}

impl SweepAxis {
    pub fn label(&self, address: usize) -> f64 {
        self.offset + self.step * address as f64
    }
}

/// Settings of an [`crate::Engine`] that are not part of a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used in CSV file names and as the config store key.
    pub device_name: String,
    /// Where CSV files go. No CSV output when unset.
    pub output_dir: Option<PathBuf>,
    /// Upper bound on the wait for a read reply. Unbounded when unset.
    pub ready_timeout: Option<Duration>,
    pub sweep_axis: SweepAxis,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_name: "device0".to_string(),
            output_dir: None,
            ready_timeout: None,
            sweep_axis: SweepAxis::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }
}

/// Directory of `<device>.json` files holding each device's last-used parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, device: &str) -> PathBuf {
        self.dir.join(format!("{device}.json"))
    }

    /// Last-used parameters of `device`, if any were saved.
    pub fn load(&self, device: &str) -> Result<Option<ParameterSet>> {
        let path = self.path_for(device);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no saved parameters: device={}", device);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let params = serde_json::from_str(&text)?;
        debug!("loaded parameters: device={}, path={}", device, path.display());
        Ok(Some(params))
    }

    pub fn save(&self, device: &str, params: &ParameterSet) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(device);
        fs::write(&path, serde_json::to_string_pretty(params)?)?;
        info!("saved parameters: device={}, path={}", device, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ChannelSelection, Mode};
    use crate::DriverError;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.load("device0").unwrap().is_none());
    }

    #[test]
    fn saved_parameters_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested"));
        let params = ParameterSet {
            channel: ChannelSelection::Both,
            mode: Mode::FixedReference,
            reference_value: Some(17),
            repeat_interval: Duration::from_millis(250),
            stop_time: Some(Duration::from_secs(3)),
            ..ParameterSet::default()
        };
        store.save("device1", &params).unwrap();
        assert!(store.path_for("device1").exists());
        assert_eq!(store.load("device1").unwrap(), Some(params));
        assert!(store.load("device2").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        fs::write(store.path_for("device0"), "{ not json").unwrap();
        assert!(matches!(store.load("device0"), Err(DriverError::Config(_))));
    }

    #[test]
    fn sweep_axis_labels() {
        let axis = SweepAxis {
            offset: 100.0,
            step: 2.5,
        };
        assert_eq!(axis.label(0), 100.0);
        assert_eq!(axis.label(16), 140.0);
        assert_eq!(SweepAxis::default().label(15), 15.0);
    }
}
