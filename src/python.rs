use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::{
    list_available_devices, ChannelTag, Engine, EngineConfig, OutputReader, ParameterForm,
    RunHandle, RunOutcome, RunState, SerialSettings, SerialTransport, Transport,
};

fn io_err(e: impl ToString) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyIOError, _>(e.to_string())
}

fn value_err(e: impl ToString) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string())
}

fn state_name(state: RunState) -> String {
    match state {
        RunState::Idle => "idle".into(),
        RunState::Configuring => "configuring".into(),
        RunState::Calibrating => "calibrating".into(),
        RunState::Running { repeat, of } => format!("running {repeat}/{of}"),
        RunState::Halting => "halting".into(),
        RunState::Finalizing => "finalizing".into(),
        RunState::Finished(t) => format!("finished ({t:?})").to_lowercase(),
    }
}

fn channel_tag(name: &str) -> PyResult<ChannelTag> {
    match name {
        "left" => Ok(ChannelTag::Left),
        "right" => Ok(ChannelTag::Right),
        "internal" => Ok(ChannelTag::InternalCap),
        other => Err(value_err(format!("unknown channel {other:?}"))),
    }
}

/// CIMOS acquisition engine bound to one serial port.
///
/// Example:
///     >>> engine = Engine("device0", output_dir="runs")
///     >>> engine.connect("/dev/ttyUSB0")
///     >>> engine.start(channel="both", mode="sweep", repeats="3")
///     >>> engine.wait()
///     'completed'
///     >>> engine.poll("left")
#[pyclass(name = "Engine", unsendable)]
struct PyEngine {
    engine: Engine,
    transport: Option<Box<dyn Transport>>,
    run: Option<RunHandle>,
    reader: OutputReader,
}

#[pymethods]
impl PyEngine {
    #[new]
    #[pyo3(signature = (device_name="device0", output_dir=None))]
    fn new(device_name: &str, output_dir: Option<String>) -> Self {
        let mut config = EngineConfig::new(device_name);
        config.output_dir = output_dir.map(Into::into);
        let engine = Engine::new(config);
        let reader = engine.output().reader();
        PyEngine {
            engine,
            transport: None,
            run: None,
            reader,
        }
    }

    /// Open the serial port the board is attached to.
    fn connect(&mut self, port: &str) -> PyResult<()> {
        let mut transport = SerialTransport::new(SerialSettings::new(port));
        transport.open().map_err(io_err)?;
        self.transport = Some(Box::new(transport));
        Ok(())
    }

    /// Start a run. Every argument is text, as typed into a form.
    ///
    /// Raises:
    ///     ValueError: If a parameter is invalid or a run is in progress.
    #[pyo3(signature = (channel="left", mode="sweep", reference_value="", resolution="000",
                        sample_count="10", repeats="1", repeat_interval="", stop_time=""))]
    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        channel: &str,
        mode: &str,
        reference_value: &str,
        resolution: &str,
        sample_count: &str,
        repeats: &str,
        repeat_interval: &str,
        stop_time: &str,
    ) -> PyResult<()> {
        self.reclaim();
        let transport = self.transport.take().ok_or_else(|| io_err("not connected"))?;
        let form = ParameterForm {
            channel: channel.into(),
            mode: mode.into(),
            reference_value: reference_value.into(),
            resolution: resolution.into(),
            sample_count: sample_count.into(),
            repeats: repeats.into(),
            repeat_interval: repeat_interval.into(),
            stop_time: stop_time.into(),
            plot: "2d".into(),
        };
        match self.engine.start_form(&form, transport) {
            Ok(handle) => {
                self.run = Some(handle);
                Ok(())
            }
            Err(rejected) => {
                let msg = rejected.to_string();
                self.transport = Some(rejected.transport);
                Err(value_err(msg))
            }
        }
    }

    /// Request cancellation of the current run. Safe to call repeatedly.
    fn halt(&self) {
        if let Some(run) = &self.run {
            run.halt();
        }
    }

    #[getter]
    fn state(&self) -> String {
        state_name(self.engine.state())
    }

    #[getter]
    fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Block until the current run ends and return its outcome.
    ///
    /// Raises:
    ///     IOError: If the run failed.
    fn wait(&mut self) -> PyResult<String> {
        let Some(run) = self.run.take() else {
            return Ok(state_name(self.engine.state()));
        };
        let report = run.wait();
        self.transport = Some(report.transport);
        match report.outcome {
            RunOutcome::Completed => Ok("completed".into()),
            RunOutcome::Cancelled => Ok("cancelled".into()),
            RunOutcome::Failed(e) => Err(io_err(e)),
        }
    }

    /// Results appended on `channel` since the previous poll.
    fn poll(&mut self, channel: &str) -> PyResult<Vec<Vec<i64>>> {
        let tag = channel_tag(channel)?;
        Ok(self
            .reader
            .poll(tag)
            .iter()
            .map(|r| r.values().to_vec())
            .collect())
    }

    /// Reference-pulse crossings appended since the previous poll.
    fn poll_crossings(&mut self) -> Vec<Option<usize>> {
        self.reader.poll_crossings()
    }

    /// Summary of the output model as a dictionary.
    fn summary<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let output = self.engine.output();
        let dict = PyDict::new(py);
        for tag in output.tags() {
            dict.set_item(tag.name(), output.len(tag))?;
        }
        Ok(dict)
    }

    /// Clear accumulated results. Ignored while a run is active.
    fn reset(&mut self) {
        self.engine.reset();
    }

    /// Serial ports available on this machine.
    #[staticmethod]
    fn list_devices() -> PyResult<Vec<String>> {
        list_available_devices()
            .map(|devices| devices.into_iter().map(|d| d.port_name).collect())
            .map_err(io_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "Engine(device={:?}, state={})",
            self.engine.config().device_name,
            state_name(self.engine.state())
        )
    }
}

impl PyEngine {
    /// Take the transport back from a run that already ended.
    fn reclaim(&mut self) {
        if self.run.as_ref().is_some_and(RunHandle::is_finished) {
            if let Some(run) = self.run.take() {
                self.transport = Some(run.wait().transport);
            }
        }
    }
}

/// The Python module definition
#[pymodule]
fn cimos_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::init_logging();
    m.add_class::<PyEngine>()?;
    m.add("DEFAULT_SAMPLE_COUNT", 10u16)?;
    m.add("RESOLUTIONS", vec!["000", "001", "011", "111"])?;
    Ok(())
}
