//! CIMOS capacitance-sensing instrument driver and acquisition engine.
//!
//! The board is driven over a serial link with short ASCII commands
//! terminated by `#`. An [`Engine`] runs one measurement at a time on its own
//! thread: it configures the board, optionally calibrates against the
//! internal capacitor, then sweeps (or reads a fixed reference address) once
//! per repeat, appending every completed repeat to a shared [`OutputModel`]
//! and a [`RepeatSink`] such as [`CsvSink`].
//!
//! # Quick start
//!
//! ```no_run
//! use cimos_rs::{Engine, EngineConfig, ParameterSet, SerialSettings, SerialTransport, Transport};
//!
//! let mut transport = SerialTransport::new(SerialSettings::new("/dev/ttyUSB0"));
//! transport.open()?;
//!
//! let engine = Engine::new(EngineConfig::new("device0"));
//! let handle = engine
//!     .start(ParameterSet::default(), Box::new(transport))
//!     .map_err(|rejected| rejected.to_string())?;
//! let report = handle.wait();
//! println!("{:?}", report.outcome);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Cancellation
//!
//! [`RunHandle::halt`] may be called from any thread, any number of times.
//! The run stops at the next device reply or sleep slice and only whole
//! repeats are kept.

mod cimos;
mod config;
mod engine;
mod errors;
mod export;
pub mod logging;
pub mod mock;
mod output;
mod params;
mod protocol;
mod registry;
mod transport;

#[cfg(feature = "python")]
mod python;

pub use cimos::{Cimos, REPLY_DRAIN_TIMEOUT};
pub use config::{ConfigStore, EngineConfig, SweepAxis};
pub use engine::{
    Calibration, Engine, HaltSignal, Rejected, RunHandle, RunOutcome, RunReport, RunState,
    Termination, CALIBRATION_SAMPLE_COUNT,
};
pub use errors::*;
pub use export::{CsvSink, NullSink, RepeatSink};
pub use output::{OutputModel, OutputReader, RepeatResult};
pub use params::{
    ChannelSelection, Mode, ParameterForm, ParameterSet, PlotDimensionality, MAX_REPEATS,
    MAX_SAMPLE_COUNT,
};
pub use protocol::{
    decode_mean, decode_samples, encode_address, mean, ChannelTag, Command, Resolution,
    ADDRESS_COUNT, MAX_ADDRESS, TERMINATOR,
};
pub use registry::{DeviceProfile, InterfaceKind, Registry};
pub use transport::{
    list_available_devices, ConnectionStatus, DeviceDescriptor, SerialSettings, SerialTransport,
    Transport, BAUD_RATE, DEFAULT_READ_TIMEOUT,
};
