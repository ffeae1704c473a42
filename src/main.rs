use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use paralyzer::channel::{Channel, Connector, SerialConnector};
use paralyzer::logging::{init_file_logging, init_logging};
use paralyzer::mock::MockSessionProvider;
use paralyzer::{
    ChipTilter, Orchestrator, PairId, RigConfig, TelemetryField, TilterEvent, WriteMode,
};

#[derive(Parser, Debug)]
#[command(name = "paralyzer", about = "Drive the ParaLyzer rig: switchboard, tilter and lock-in")]
struct Args {
    /// Rig config (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Write the log to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and their descriptions
    Ports,
    /// Print the switchboard commands for a set of electrode pairs
    Encode {
        /// Pair and residence time, e.g. 3:500000 or res:1000
        #[arg(long = "pair", value_parser = parse_pair, required = true)]
        pairs: Vec<(PairId, u32)>,
        #[arg(long)]
        debug: bool,
    },
    /// Configure the tilter and watch its telemetry
    Tilter {
        /// Setup value, e.g. posAngle=65 or posPause=1:30
        #[arg(long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,
        /// Write every frame several times
        #[arg(long)]
        force: bool,
        /// Write the reset stream before applying values
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        start: bool,
        /// Seconds to print telemetry for
        #[arg(long, default_value_t = 10)]
        watch: u64,
    },
    /// Run a measurement for a fixed time
    Run {
        #[arg(long = "pair", value_parser = parse_pair, required = true)]
        pairs: Vec<(PairId, u32)>,
        /// Seconds to record
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// Use a simulated lock-in session
        #[arg(long)]
        simulate_lockin: bool,
    },
}

fn parse_pair(s: &str) -> std::result::Result<(PairId, u32), String> {
    let (id, micros) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ID:MICROS, got '{s}'"))?;
    let id = id.parse::<PairId>().map_err(|e| e.to_string())?;
    let micros = micros
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("'{micros}' is not a residence time in microseconds"))?;
    Ok((id, micros))
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RigConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RigConfig::default(),
    };
    let level = args.log_level.as_deref().or(config.log_level.as_deref());
    match &args.log_file {
        Some(path) => init_file_logging(path, level)
            .with_context(|| format!("creating log file {}", path.display()))?,
        None => init_logging(level),
    }

    match args.command {
        Command::Ports => list_ports(),
        Command::Encode { pairs, debug } => encode(&config, &pairs, debug),
        Command::Tilter {
            values,
            force,
            reset,
            start,
            watch,
        } => tilter(&config, &values, force, reset, start, watch),
        Command::Run {
            pairs,
            duration,
            simulate_lockin,
        } => measure(&config, &pairs, duration, simulate_lockin),
    }
}

fn list_ports() -> Result<()> {
    let ports = SerialConnector.enumerate()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn encode(config: &RigConfig, pairs: &[(PairId, u32)], debug: bool) -> Result<()> {
    let tables = config.tables.load().context("loading lookup tables")?;
    let pairs: Vec<_> = pairs
        .iter()
        .map(|&(id, interval_us)| paralyzer::ElectrodePair { id, interval_us })
        .collect();
    for command in tables.build_commands(&pairs, debug)? {
        println!("{command}");
    }
    Ok(())
}

fn tilter(
    config: &RigConfig,
    values: &[(String, String)],
    force: bool,
    reset: bool,
    start: bool,
    watch: u64,
) -> Result<()> {
    let channel = Channel::new(
        "tilter",
        config.tilter.descriptor.clone(),
        config.tilter.serial.clone(),
        Arc::new(SerialConnector),
    )
    .with_lock_timeout(config.lock_timeout());
    let mut tilter = ChipTilter::new(Arc::new(channel), config.tilter.settings.clone());
    let port = tilter.detect().context("detecting tilter")?;
    println!("Tilter on {port}");

    let mode = if force { WriteMode::Force } else { WriteMode::Normal };
    if reset {
        tilter.reset_setup(mode)?;
    }
    for (name, value) in values {
        tilter
            .set_value(name, value)
            .with_context(|| format!("setting {name}"))?;
    }
    if !values.is_empty() {
        tilter.write_setup(mode)?;
        tilter.setup_mut().clear_stream();
    }

    for event in TilterEvent::ALL {
        tilter.set_event(
            event,
            Arc::new(move || println!("-> {event}")),
            1,
            Duration::ZERO,
        );
    }
    tilter.start_reader()?;
    if start {
        tilter.start_tilter()?;
    }

    let until = Instant::now() + Duration::from_secs(watch);
    while Instant::now() < until && tilter.is_connected() {
        thread::sleep(Duration::from_millis(config.tilter.settings.poll_interval_ms.max(100)));
        let sample = tilter.telemetry();
        let line: Vec<String> = sample
            .iter()
            .filter_map(|(field, value)| value.map(|v| format!("{}{v}", field.key())))
            .collect();
        if !line.is_empty() {
            println!("{}", line.join(";"));
        }
    }

    if start {
        tilter.stop_tilter()?;
    }
    tilter.stop_reader();
    let state = tilter.state();
    println!(
        "cycles: {}, time left: {:?}",
        state.cycle_count,
        tilter.parameter(TelemetryField::TimeLeft)
    );
    Ok(())
}

fn measure(config: &RigConfig, pairs: &[(PairId, u32)], duration: u64, simulate: bool) -> Result<()> {
    if !simulate {
        bail!("no lock-in transport is available here, pass --simulate-lockin");
    }
    let ids: Vec<&str> = config.lockin.device_ids.iter().map(String::as_str).collect();
    let provider = MockSessionProvider::new(&ids).with_generator(4, 10);

    let mut rig = Orchestrator::from_config(config, Arc::new(SerialConnector), Box::new(provider))?;
    for (device, result) in rig.detect_all() {
        match result {
            Ok(place) => println!("{device}: {place}"),
            Err(e) => println!("{device}: {e}"),
        }
    }

    for &(id, interval_us) in pairs {
        rig.define_pair(id, interval_us);
    }
    let flags = config.measurement;
    rig.setup_switching(&flags.selection)?;
    rig.start(&flags)?;
    println!("Recording for {duration} s ({})", rig.state());

    thread::sleep(Duration::from_secs(duration));

    let stopped = rig.stop(&flags);
    let lockin = rig.lockin().lock();
    println!(
        "{} Files in {}",
        lockin.status(),
        lockin.stream_folder().display()
    );
    let flags = lockin.record_flags();
    if flags.dataloss || flags.invalid_timestamp {
        println!("warning: {flags:?}");
    }
    drop(lockin);
    stopped?;
    Ok(())
}
