//! igus Lift Sequence Runner
//!
//! Scripted lift runs: homing, single moves, multi-position cycles. Blocking
//! motor calls run on the blocking pool while a monitor task samples the
//! cached status.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    cursor::MoveToColumn,
    execute,
    style::{Print, Stylize},
    terminal::{Clear, ClearType},
};
use igus_lift_control::{
    LiftConfig, LiftMotor, SimOptions, SimulatedDrive, ThreadSleeper,
};
use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// igus Lift Sequence Runner
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

    /// Status monitor period in milliseconds (0 disables it)
    #[arg(long, default_value = "500")]
    monitor_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Home the axis
    Home,
    /// Single move (homes first when needed)
    Move {
        /// Target position
        #[arg(allow_negative_numbers = true)]
        target: i32,
        /// Profile velocity (default from config)
        #[arg(long)]
        velocity: Option<i32>,
        /// Profile acceleration (default from config)
        #[arg(long)]
        acceleration: Option<i32>,
    },
    /// Visit a list of positions, optionally repeated
    Cycle {
        /// Comma-separated positions
        #[arg(long, default_value = "0,30000,60000,30000,0")]
        positions: String,
        /// Number of passes over the list
        #[arg(long, default_value = "1")]
        repeat: u32,
        /// Dwell time at each position in seconds
        #[arg(long, default_value = "1.0")]
        dwell: f64,
    },
    /// Fault reset and re-enable
    Reset,
    /// Read live status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing(&args);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = load_config(&args)?;
    let motor = Arc::new(if args.simulate {
        LiftMotor::start(
            Arc::new(SimulatedDrive::new(SimOptions::default())),
            Arc::new(ThreadSleeper),
            &config,
        )?
    } else {
        LiftMotor::connect(&config)?
    });

    let timeout = Duration::from_secs(args.connect_timeout);
    let connected = {
        let motor = motor.clone();
        tokio::task::spawn_blocking(move || motor.wait_connected(timeout)).await?
    };
    if !connected {
        motor.shutdown();
        bail!("drive did not connect within {:?}", timeout);
    }

    let monitor = (args.monitor_ms > 0 && !matches!(args.mode, Mode::Status { .. }))
        .then(|| tokio::spawn(monitor_status(motor.clone(), Duration::from_millis(args.monitor_ms))));

    let outcome = run_mode(&args.mode, &motor, &config, &running).await;

    if let Some(handle) = monitor {
        handle.abort();
        execute!(stdout(), Print("\n"))?;
    }

    let shutdown = motor.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;
    outcome
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

async fn run_mode(
    mode: &Mode,
    motor: &Arc<LiftMotor>,
    config: &LiftConfig,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    match mode {
        Mode::Home => home(motor).await,
        Mode::Move {
            target,
            velocity,
            acceleration,
        } => {
            if !motor.is_homed() {
                home(motor).await?;
            }
            move_to(
                motor,
                *target,
                velocity.unwrap_or(config.motion.velocity),
                acceleration.unwrap_or(config.motion.acceleration),
            )
            .await
        }
        Mode::Cycle {
            positions,
            repeat,
            dwell,
        } => {
            let positions = parse_position_list(positions)?;
            run_cycle(motor, config, running, &positions, *repeat, *dwell).await
        }
        Mode::Reset => {
            let motor = motor.clone();
            tokio::task::spawn_blocking(move || motor.fault_reset(true)).await??;
            info!("Fault reset complete");
            Ok(())
        }
        Mode::Status { json } => {
            let probe = motor.clone();
            tokio::task::spawn_blocking(move || probe.refresh(true)).await??;
            let state = motor.get_status();
            if *json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{:#?}", state);
            }
            Ok(())
        }
    }
}

async fn home(motor: &Arc<LiftMotor>) -> Result<()> {
    let started = Instant::now();
    let m = motor.clone();
    tokio::task::spawn_blocking(move || m.home(true)).await??;
    info!("Homing finished in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

async fn move_to(motor: &Arc<LiftMotor>, target: i32, velocity: i32, acceleration: i32) -> Result<()> {
    let started = Instant::now();
    let m = motor.clone();
    tokio::task::spawn_blocking(move || m.move_to_position(target, velocity, acceleration, true))
        .await??;
    info!(
        "Move to {} finished in {:.1}s at position {}",
        target,
        started.elapsed().as_secs_f64(),
        motor.get_status().position
    );
    Ok(())
}

async fn run_cycle(
    motor: &Arc<LiftMotor>,
    config: &LiftConfig,
    running: &Arc<AtomicBool>,
    positions: &[i32],
    repeat: u32,
    dwell: f64,
) -> Result<()> {
    execute!(
        stdout(),
        Print("\n"),
        Print("=".repeat(50)),
        Print("\n"),
        Print("🔁 Position cycle\n".blue()),
        Print(format!("Positions: {:?} x{}\n", positions, repeat)),
        Print(format!("Dwell: {}s\n", dwell)),
        Print("=".repeat(50)),
        Print("\n")
    )?;

    if !motor.is_homed() {
        home(motor).await?;
    }

    let dwell = Duration::from_secs_f64(dwell.max(0.0));
    for pass in 1..=repeat {
        for (step, &target) in positions.iter().enumerate() {
            if !running.load(Ordering::SeqCst) {
                info!("Interrupted, stopping cycle");
                return Ok(());
            }
            info!(
                "Pass {}/{} step {}/{}: {}",
                pass,
                repeat,
                step + 1,
                positions.len(),
                target
            );
            move_to(
                motor,
                target,
                config.motion.velocity,
                config.motion.acceleration,
            )
            .await?;
            tokio::time::sleep(dwell).await;
        }
    }
    Ok(())
}

async fn monitor_status(motor: Arc<LiftMotor>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let state = motor.get_status();
        let flag = if state.active {
            "moving".yellow()
        } else {
            "idle".green()
        };
        let _ = execute!(
            stdout(),
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(flag),
            Print(format!(
                " position {} | statusword 0x{:04X}",
                state.position, state.statusword
            ))
        );
        let _ = stdout().flush();
    }
}

fn parse_position_list(s: &str) -> Result<Vec<i32>> {
    s.split(',')
        .map(|s| s.trim().parse::<i32>().map_err(Into::into))
        .collect()
}
