//! `scanrig` command line.
//!
//! - `simulate`: run a whole scan against the simulated controller and mock
//!   cameras, print the session as JSON
//! - `status`: print controller state and position
//! - `home`: run the homing cycle
//! - `move`: move to (or by) a position
//!
//! `status`, `home` and `move` talk to a real controller and need the `serial`
//! feature.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scanrig::config::{RigConfig, DEFAULT_CONFIG_PATH};
use scanrig::hardware::mock::{MockCameras, MockLighting};
use scanrig::hardware::sim::{SimConfig, SimulatedController};
use scanrig::motion::MotionController;
use scanrig::protocol::ProtocolEngine;
use scanrig::scan::{CylindricalPattern, FocusDirective, ScanOrchestrator};
use scanrig::Position4D;

#[derive(Parser, Debug)]
#[command(name = "scanrig")]
#[command(about = "Control core for a 4-axis 3D scanning rig")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a cylindrical scan against the simulator
    Simulate {
        /// Camera distance from the turntable axis
        #[arg(long, default_value = "150")]
        radius: f64,

        /// Lowest ring height
        #[arg(long, default_value = "20")]
        bottom: f64,

        /// Highest ring height
        #[arg(long, default_value = "180")]
        top: f64,

        /// Number of rings
        #[arg(long, default_value = "3")]
        rings: usize,

        /// Turntable stops per ring
        #[arg(long, default_value = "8")]
        rotations: usize,

        /// Aim every point at this height on the turntable axis
        #[arg(long)]
        focus_height: Option<f64>,

        /// Comma-separated focus stack for every point
        #[arg(long, value_delimiter = ',')]
        stack: Vec<f64>,

        /// Number of simulated cameras
        #[arg(long, default_value = "3")]
        cameras: usize,

        /// Write the session JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print controller state and position
    Status,

    /// Home all axes
    Home,

    /// Move all axes to a position
    Move {
        #[arg(short, allow_negative_numbers = true)]
        x: f64,
        #[arg(short, allow_negative_numbers = true)]
        y: f64,
        #[arg(short, allow_negative_numbers = true)]
        z: f64,
        #[arg(short, allow_negative_numbers = true)]
        c: f64,

        /// Feedrate (defaults to motion.default_feedrate)
        #[arg(short, long)]
        feedrate: Option<f64>,

        /// Treat the position as a delta from the current one
        #[arg(long)]
        relative: bool,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RigConfig::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    init_tracing(
        &config.application.log_level,
        args.json_logs || config.application.log_json,
    );
    info!(config = %args.config.display(), "scanrig starting");

    match args.command {
        Command::Simulate {
            radius,
            bottom,
            top,
            rings,
            rotations,
            focus_height,
            stack,
            cameras,
            output,
        } => {
            let mut pattern = CylindricalPattern::with_rings(radius, bottom, top, rings, rotations);
            if let Some(height) = focus_height {
                pattern = pattern.aimed_at(height);
            }
            if !stack.is_empty() {
                pattern = pattern.with_focus(FocusDirective::Stack(stack));
            }
            simulate(&config, &pattern, cameras, output).await
        }
        Command::Status => {
            let motion = controller(&config)?;
            let engine = motion.engine();
            engine.connect().await.context("connecting to controller")?;
            let seq = engine.snapshot().seq;
            let snapshot = engine
                .wait_for_state(|s| s.seq > seq, Duration::from_secs(2))
                .await
                .context("waiting for a status report")?;
            println!("state:    {}", snapshot.state);
            println!("position: {}", motion.get_position());
            if let Some(code) = snapshot.alarm_code {
                println!("alarm:    {}", code);
            }
            Ok(())
        }
        Command::Home => {
            let motion = controller(&config)?;
            motion.home_all().await.context("homing")?;
            println!("homed at {}", motion.get_position());
            Ok(())
        }
        Command::Move {
            x,
            y,
            z,
            c,
            feedrate,
            relative,
        } => {
            let motion = controller(&config)?;
            let position = Position4D::new(x, y, z, c);
            let feedrate = feedrate.unwrap_or(config.motion.default_feedrate);
            let moved = if relative {
                motion.move_relative(position, feedrate).await
            } else {
                motion.move_absolute(position, feedrate).await
            };
            moved.context("moving")?;
            println!("at {}", motion.get_position());
            Ok(())
        }
    }
}

async fn simulate(
    config: &RigConfig,
    pattern: &CylindricalPattern,
    cameras: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let sim = SimulatedController::new(SimConfig::default());
    let engine = Arc::new(ProtocolEngine::new(
        Arc::new(sim.clone()),
        config.protocol.clone(),
    ));
    let motion = Arc::new(MotionController::from_config(engine, config));
    let orchestrator = ScanOrchestrator::from_config(
        motion,
        Arc::new(MockCameras::numbered(cameras)),
        Arc::new(MockLighting::new()),
        config,
    );

    let session = orchestrator.run(pattern).await.context("running scan")?;
    info!(
        status = ?session.status,
        captures = session.capture_count(),
        commands = sim.received_lines().len(),
        "simulation finished"
    );

    let json = session.to_json().context("serializing session")?;
    match output {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

#[cfg(feature = "serial")]
fn controller(config: &RigConfig) -> Result<MotionController> {
    use scanrig::hardware::serial::SerialPortTransport;

    let transport = SerialPortTransport::from_config(&config.serial);
    let engine = Arc::new(ProtocolEngine::new(
        Arc::new(transport),
        config.protocol.clone(),
    ));
    Ok(MotionController::from_config(engine, config))
}

#[cfg(not(feature = "serial"))]
fn controller(_config: &RigConfig) -> Result<MotionController> {
    Err(scanrig::RigError::FeatureNotEnabled("serial".to_string()).into())
}
