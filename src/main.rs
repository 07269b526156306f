use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::LevelFilter;

use cimos_rs::logging::init_logging_with;
use cimos_rs::mock::SimulatedCimos;
use cimos_rs::{
    list_available_devices, ChannelTag, ConfigStore, DeviceProfile, Engine, EngineConfig,
    ParameterForm, RunOutcome, RunState, SerialSettings, SerialTransport, Transport, BAUD_RATE,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "cimos-acquire", about = "Run a CIMOS measurement and write CSV")]
struct Args {
    /// List available serial ports and exit
    #[arg(long)]
    list: bool,
    /// Serial port the board is attached to (e.g., /dev/ttyUSB0)
    #[arg(long)]
    port: Option<String>,
    #[arg(long, default_value_t = BAUD_RATE)]
    baud: u32,
    /// Name used in CSV file names and for saved parameters
    #[arg(long, default_value = "device0")]
    device_name: String,
    /// Measure against the built-in simulator instead of a serial port
    #[arg(long)]
    simulate: bool,
    /// left, right, internal or both
    #[arg(long)]
    channel: Option<String>,
    /// sweep or fixed
    #[arg(long)]
    mode: Option<String>,
    /// Address read in fixed mode (0-127)
    #[arg(long)]
    reference: Option<String>,
    /// 000, 001, 011 or 111
    #[arg(long)]
    resolution: Option<String>,
    #[arg(long)]
    samples: Option<String>,
    #[arg(long)]
    repeats: Option<String>,
    /// Seconds between repeat starts
    #[arg(long)]
    interval: Option<String>,
    /// Seconds; overrides --repeats when an interval is set
    #[arg(long)]
    stop_time: Option<String>,
    /// Directory for CSV output; no CSV when omitted
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Directory holding last-used parameters per device
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Give up on a read reply after this many milliseconds
    #[arg(long)]
    ready_timeout_ms: Option<u64>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(args.verbose.then_some(LevelFilter::Debug));

    if args.list {
        let devices = list_available_devices()?;
        if devices.is_empty() {
            println!("No serial ports found.");
        }
        for d in devices {
            println!(
                "{:<20} {:<8} {}",
                d.port_name,
                d.kind,
                d.product.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let profile = DeviceProfile::new(args.device_name.as_str())?;
    let mut config = EngineConfig::new(profile.name());
    config.output_dir = args.output_dir.clone();
    config.ready_timeout = args.ready_timeout_ms.map(Duration::from_millis);

    let mut engine = Engine::new(config);
    if let Some(dir) = &args.config_dir {
        engine = engine.with_store(ConfigStore::new(dir));
    }

    let defaults = engine.defaults().context("loading saved parameters")?;
    let form = apply_overrides(ParameterForm::from(&defaults), &args);

    let transport: Box<dyn Transport> = if args.simulate {
        let samples = form.sample_count.trim().parse().unwrap_or(defaults.sample_count);
        println!("--- Simulated CIMOS ({} samples per read) ---", samples);
        Box::new(SimulatedCimos::linear(usize::from(samples)))
    } else {
        let port = args
            .port
            .clone()
            .ok_or_else(|| anyhow!("--port is required unless --simulate or --list is given"))?;
        let mut settings = SerialSettings::new(port);
        settings.baud_rate = args.baud;
        let mut serial = SerialTransport::new(settings);
        serial.open()?;
        println!("Connected to {}", serial.settings().port);
        Box::new(serial)
    };

    let handle = engine
        .start_form(&form, transport)
        .map_err(|rejected| anyhow!("{rejected}"))?;

    let mut reader = engine.output().reader();
    let mut last_state = RunState::Idle;
    loop {
        let state = handle.state();
        if state != last_state {
            println!("[{:?}]", state);
            last_state = state;
        }
        print_new_results(&mut reader);
        if handle.is_finished() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let mut report = handle.wait();
    print_new_results(&mut reader);
    report.transport.close();

    if let Some(c) = &report.calibration {
        println!(
            "Calibration: slope={:.4} intercept={:.4} reference_pulse={:.2}",
            c.slope, c.intercept, c.reference_pulse
        );
    }
    match report.outcome {
        RunOutcome::Completed => {
            println!("Done. {} repeat(s) completed.", report.repeats_completed);
            Ok(())
        }
        RunOutcome::Cancelled => {
            println!("Halted after {} repeat(s).", report.repeats_completed);
            Ok(())
        }
        RunOutcome::Failed(e) => Err(anyhow!(e).context(format!(
            "run failed after {} repeat(s)",
            report.repeats_completed
        ))),
    }
}

fn apply_overrides(mut form: ParameterForm, args: &Args) -> ParameterForm {
    let fields = [
        (&mut form.channel, &args.channel),
        (&mut form.mode, &args.mode),
        (&mut form.reference_value, &args.reference),
        (&mut form.resolution, &args.resolution),
        (&mut form.sample_count, &args.samples),
        (&mut form.repeats, &args.repeats),
        (&mut form.repeat_interval, &args.interval),
        (&mut form.stop_time, &args.stop_time),
    ];
    for (field, value) in fields {
        if let Some(v) = value {
            field.clone_from(v);
        }
    }
    form
}

fn print_new_results(reader: &mut cimos_rs::OutputReader) {
    for tag in [ChannelTag::Left, ChannelTag::Right, ChannelTag::InternalCap] {
        for result in reader.poll(tag) {
            let values = result.values();
            let min = values.iter().min().copied().unwrap_or_default();
            let max = values.iter().max().copied().unwrap_or_default();
            println!(
                "  {:<8} points={:<3} min={:<8} max={:<8}",
                tag.name(),
                values.len(),
                min,
                max
            );
        }
    }
    for crossing in reader.poll_crossings() {
        match crossing {
            Some(index) => println!("  crossing at index {index}"),
            None => println!("  no crossing"),
        }
    }
}
