use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport not connected")]
    NotConnected,
    #[error("malformed response frame {frame:?}: {reason}")]
    Decode { frame: String, reason: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("calibration failed: {0}")]
    Calibration(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl DriverError {
    pub(crate) fn decode(frame: &[u8], reason: impl Into<String>) -> Self {
        DriverError::Decode {
            frame: String::from_utf8_lossy(frame).into_owned(),
            reason: reason.into(),
        }
    }
}

/// A single rejected field of a measurement parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}

pub type Result<T> = std::result::Result<T, DriverError>;
