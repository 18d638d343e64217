//! igus Lift Console
//!
//! Interactive terminal control of the lift: homing, fault reset, blocking
//! and background moves, live status.

use anyhow::Result;
use clap::Parser;
use crossterm::{
    execute,
    style::{Print, Stylize},
};
use igus_lift_control::{
    LiftConfig, LiftMotor, MotorState, SimOptions, SimulatedDrive, ThreadSleeper,
};
use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// igus Lift Console
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

    /// Run against the built-in simulated controller
    #[arg(long)]
    simulate: bool,

    /// Seconds to wait for the first connection
    #[arg(long, default_value = "15")]
    connect_timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing(&args);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = load_config(&args)?;
    let motor = if args.simulate {
        LiftMotor::start(
            Arc::new(SimulatedDrive::new(SimOptions::default())),
            Arc::new(ThreadSleeper),
            &config,
        )?
    } else {
        LiftMotor::connect(&config)?
    };

    print_header(&config, args.simulate)?;

    if motor.wait_connected(Duration::from_secs(args.connect_timeout)) {
        execute!(stdout(), Print("✅ ".green()), Print("Drive connected and enabled\n"))?;
    } else {
        execute!(
            stdout(),
            Print("⚠️  ".yellow()),
            Print("Drive not connected yet, commands will queue until it answers\n")
        )?;
    }
    print_status(&motor.get_status())?;

    run_interactive_mode(&motor, &running, &config)?;

    motor.shutdown();
    execute!(stdout(), Print("🛑 ".yellow()), Print("Lift released\n"))?;
    Ok(())
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(args: &Args) -> Result<LiftConfig> {
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
    Ok(config)
}

fn print_header(config: &LiftConfig, simulate: bool) -> Result<()> {
    let target = if simulate {
        "simulated controller".to_string()
    } else {
        format!("{}:{}", config.drive.host, config.drive.port)
    };
    execute!(
        stdout(),
        Print("\n"),
        Print("=".repeat(50).cyan()),
        Print("\n"),
        Print("🏗️  igus dryve lift console\n".blue().bold()),
        Print(format!("Controller: {}\n", target)),
        Print("Commands:\n"),
        Print("  h             -> home (skipped when already homed)\n"),
        Print("  r             -> fault reset and re-enable\n"),
        Print("  [position]    -> move and wait (e.g. 30000)\n"),
        Print("  bg [position] -> move in background\n"),
        Print("  vel [value]   -> set profile velocity\n"),
        Print("  acc [value]   -> set profile acceleration\n"),
        Print("  s             -> refresh and show status\n"),
        Print("  q             -> quit\n"),
        Print("=".repeat(50)),
        Print("\n")
    )?;
    Ok(())
}

fn print_status(state: &MotorState) -> Result<()> {
    let connected = if state.connected {
        "connected".green()
    } else {
        "disconnected".red()
    };
    let homed = if state.homed {
        "homed".green()
    } else {
        "not homed".yellow()
    };
    execute!(
        stdout(),
        Print("   "),
        Print(connected),
        Print(" | "),
        Print(homed),
        Print(format!(
            " | position {} | velocity {} | statusword 0x{:04X}{}\n",
            state.position,
            state.velocity,
            state.statusword,
            if state.active { " | active" } else { "" }
        ))
    )?;
    if let Some(error) = &state.last_error {
        execute!(stdout(), Print(format!("   last error: {}\n", error).red()))?;
    }
    Ok(())
}

fn report(outcome: igus_lift_control::Result<Option<bool>>, what: &str) -> Result<()> {
    match outcome {
        Ok(Some(_)) => execute!(stdout(), Print("   -> ✅ ".green()), Print(format!("{} done\n", what)))?,
        Ok(None) => execute!(stdout(), Print(format!("   -> {} queued\n", what)))?,
        Err(e) => execute!(stdout(), Print(format!("   -> ❌ {} failed: {}\n", what, e).red()))?,
    }
    Ok(())
}

fn run_interactive_mode(
    motor: &LiftMotor,
    running: &Arc<AtomicBool>,
    config: &LiftConfig,
) -> Result<()> {
    let mut velocity = config.motion.velocity;
    let mut acceleration = config.motion.acceleration;

    while running.load(Ordering::SeqCst) {
        execute!(stdout(), Print("lift> "))?;
        stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        let input = input.trim().to_lowercase();
        if input == "q" {
            break;
        } else if input == "h" {
            report(motor.home(true), "Homing")?;
        } else if input == "r" {
            report(motor.fault_reset(true), "Fault reset")?;
        } else if input == "s" {
            if let Err(e) = motor.refresh(true) {
                execute!(stdout(), Print(format!("   refresh failed: {}\n", e).red()))?;
            }
            print_status(&motor.get_status())?;
        } else if let Some(rest) = input.strip_prefix("vel") {
            match rest.trim().parse::<i32>() {
                Ok(v) if v > 0 => {
                    velocity = v;
                    execute!(stdout(), Print(format!("   -> profile velocity {}\n", v)))?;
                }
                _ => execute!(stdout(), Print("   velocity must be a positive integer\n".red()))?,
            }
        } else if let Some(rest) = input.strip_prefix("acc") {
            match rest.trim().parse::<i32>() {
                Ok(a) if a > 0 => {
                    acceleration = a;
                    execute!(stdout(), Print(format!("   -> profile acceleration {}\n", a)))?;
                }
                _ => execute!(stdout(), Print("   acceleration must be a positive integer\n".red()))?,
            }
        } else if let Some(rest) = input.strip_prefix("bg") {
            match rest.trim().parse::<i32>() {
                Ok(target) => report(
                    motor.move_to_position(target, velocity, acceleration, false),
                    "Move",
                )?,
                Err(_) => execute!(stdout(), Print("   usage: bg [position]\n".red()))?,
            }
        } else if let Ok(target) = input.parse::<i32>() {
            execute!(stdout(), Print(format!("   -> moving to {}\n", target)))?;
            report(
                motor.move_to_position(target, velocity, acceleration, true),
                "Move",
            )?;
            print_status(&motor.get_status())?;
        } else if !input.is_empty() {
            execute!(stdout(), Print("Unknown command\n".red()))?;
        }
    }

    Ok(())
}
