//! igus dryve Drive Probe
//!
//! Connects straight to the controller (no worker queue), decodes the
//! statusword bit by bit and prints the live position, velocity, mode,
//! homing and digital-input state.

use anyhow::Result;
use clap::Parser;
use crossterm::{
    execute,
    style::{Print, Stylize},
};
use igus_lift_control::{
    Connector, Drive, LiftConfig, SimOptions, SimulatedDrive, StatusWord, ThreadSleeper,
};
use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// igus dryve Drive Probe
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Controller port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Probe the built-in simulated controller
    #[arg(long)]
    simulate: bool,

    /// Run the enable sequence before probing
    #[arg(long)]
    init: bool,

    /// Number of samples to take
    #[arg(short, long, default_value = "1")]
    samples: u32,

    /// Delay between samples in milliseconds
    #[arg(long, default_value = "500")]
    interval_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

const BITS: [(StatusWord, &str); 13] = [
    (StatusWord::READY_TO_SWITCH_ON, "ready to switch on"),
    (StatusWord::SWITCHED_ON, "switched on"),
    (StatusWord::OPERATION_ENABLED, "operation enabled"),
    (StatusWord::FAULT, "fault"),
    (StatusWord::VOLTAGE_ENABLED, "voltage enabled"),
    (StatusWord::QUICK_STOP, "quick stop"),
    (StatusWord::SWITCH_ON_DISABLED, "switch on disabled"),
    (StatusWord::WARNING, "warning"),
    (StatusWord::REMOTE, "remote"),
    (StatusWord::TARGET_REACHED, "target reached"),
    (StatusWord::INTERNAL_LIMIT_ACTIVE, "internal limit active"),
    (StatusWord::OPERATION_MODE_SPECIFIC, "operation mode specific"),
    (StatusWord::HOMING_ERROR, "homing error"),
];

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let mut config = match &args.config {
        Some(path) => LiftConfig::load(path)?,
        None => LiftConfig::default(),
    };
    if let Some(host) = &args.host {
        config.drive.host = host.clone();
    }
    if let Some(port) = args.port {
        config.drive.port = port;
    }
    config.validate()?;

    let connector: Box<dyn Connector> = if args.simulate {
        Box::new(SimulatedDrive::new(SimOptions::default()))
    } else {
        Box::new(config.connector())
    };

    print_header(&connector.describe())?;

    let transport = connector.connect()?;
    let mut drive = Drive::new(
        transport,
        Arc::new(ThreadSleeper),
        config.drive_timing(),
        config.homing,
    );
    execute!(stdout(), Print("✅ ".green()), Print("Connected\n"))?;

    if args.init {
        drive.initialize()?;
        execute!(stdout(), Print("✅ ".green()), Print("Operation enabled\n"))?;
    }

    for sample in 1..=args.samples.max(1) {
        if args.samples > 1 {
            execute!(
                stdout(),
                Print(format!("\n--- Sample {}/{} ---\n", sample, args.samples).cyan())
            )?;
        }
        probe(&mut drive)?;
        if sample < args.samples {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }

    drive.close();
    execute!(stdout(), Print("=".repeat(50)), Print("\n"))?;
    Ok(())
}

fn print_header(target: &str) -> Result<()> {
    execute!(
        stdout(),
        Print("\n"),
        Print("=".repeat(50).cyan()),
        Print("\n"),
        Print("🔎 igus dryve drive probe\n".blue().bold()),
        Print(format!("Controller: {}\n", target)),
        Print("=".repeat(50)),
        Print("\n")
    )?;
    Ok(())
}

fn probe(drive: &mut Drive) -> Result<()> {
    let raw = drive.read_statusword()?;
    let sw = StatusWord::from_bits_retain(raw);

    execute!(
        stdout(),
        Print(format!("Statusword 0x{:04X} -> ", raw)),
        Print(sw.state().name().bold()),
        Print("\n")
    )?;
    for (bit, name) in BITS {
        let mark = if sw.contains(bit) {
            "●".green()
        } else {
            "○".dark_grey()
        };
        execute!(
            stdout(),
            Print("  "),
            Print(mark),
            Print(format!(" 0x{:04X} {}\n", bit.bits(), name))
        )?;
    }

    let position = drive.read_position()?;
    let velocity = drive.read_velocity()?;
    let mode = drive.read_mode_display()?;
    let homed = drive.is_homed()?;
    let inputs = drive.read_digital_inputs()?;

    let mode_name = match mode {
        1 => "profile position",
        6 => "homing",
        _ => "other",
    };
    execute!(
        stdout(),
        Print(format!("Position       {}\n", position)),
        Print(format!("Velocity       {}\n", velocity)),
        Print(format!("Mode           {} ({})\n", mode, mode_name)),
        Print("Homed          "),
        Print(if homed { "yes".green() } else { "no".yellow() }),
        Print("\n"),
        Print(format!("Digital inputs 0x{:08X}\n", inputs))
    )?;
    Ok(())
}
