//! `relume` – command line entry point for both tiers.
//!
//! ```text
//! relume controller            # listen for the host, run the 10 ms loop
//! relume host                  # connect to the controller, run the 100 ms loop
//! relume sim --seconds 20      # both tiers in one process on simulated hardware
//! relume preprocess in.ppm out.pgm --stages debug/
//! relume init-config
//! ```
//!
//! Configuration comes from `~/.relume/config.toml` (or `--config`), with
//! `RELUME_*` environment overrides.  Ctrl-C sets a shared shutdown flag that
//! both loops check every tick; they stop their motors before returning.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use relume_hal::camera::{Camera, CameraSettings};
use relume_hal::capture::CaptureSupervisor;
use relume_hal::pnm;
use relume_hal::replay::DirectoryCamera;
use relume_hal::sim::{SimCamera, SimDriveBase, SimTarget, SimWorld};
use relume_link::Link;
use relume_perception::Preprocessor;
use relume_runtime::{ControllerLoop, FrameSlot, HostLoop};
use relume_types::{ControllerReport, HostMessage, RelumeError};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Relume(#[from] RelumeError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "relume", version, about = "Two-tier robot control stack")]
struct Cli {
    /// Config file to use instead of ~/.relume/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the perception and planning tier.
    Host {
        /// Controller address, overrides `link.addr`.
        #[arg(long)]
        addr: Option<String>,
        /// Replay .ppm frames from this directory.
        #[arg(long)]
        frames: Option<PathBuf>,
    },
    /// Run the motor control tier.
    Controller {
        /// Address to listen on, overrides `link.addr`.
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run both tiers against simulated hardware.
    Sim {
        /// Stop after this many seconds.
        #[arg(long, default_value_t = 20.0)]
        seconds: f64,
    },
    /// Run the preprocessing pipeline on one image file.
    Preprocess {
        input: PathBuf,
        output: PathBuf,
        /// Also write every intermediate stage into this directory.
        #[arg(long)]
        stages: Option<PathBuf>,
    },
    /// Write a default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = relume_runtime::init_tracing(service_name(&cli.command));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn service_name(command: &Commands) -> &'static str {
    match command {
        Commands::Host { .. } => "relume-host",
        Commands::Controller { .. } => "relume-controller",
        Commands::Sim { .. } => "relume-sim",
        Commands::Preprocess { .. } | Commands::InitConfig { .. } => "relume-cli",
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let load = || config::load(cli.config.as_deref());
    match cli.command {
        Commands::InitConfig { force } => init_config(cli.config.as_deref(), force),
        Commands::Preprocess { input, output, stages } => preprocess(&load()?, &input, &output, stages.as_deref()),
        Commands::Host { addr, frames } => {
            let cfg = load()?;
            print_banner("host");
            run_host(&cfg, addr, frames, install_ctrlc()).await
        }
        Commands::Controller { addr } => {
            let cfg = load()?;
            print_banner("controller");
            run_controller(&cfg, addr, install_ctrlc()).await
        }
        Commands::Sim { seconds } => {
            let cfg = load()?;
            print_banner("simulation");
            run_sim(&cfg, Duration::from_secs_f64(seconds.max(0.0)), install_ctrlc()).await
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tiers
// ─────────────────────────────────────────────────────────────────────────────

async fn run_controller(cfg: &Config, addr: Option<String>, shutdown: Arc<AtomicBool>) -> Result<(), CliError> {
    let addr = addr.unwrap_or_else(|| cfg.link.addr.clone());
    warn!("no motor driver bindings available; driving the simulated base");
    let world = SimWorld::new(cfg.controller.kinematics);
    let mut controller = ControllerLoop::new(cfg.controller.clone(), SimDriveBase::new(world).build())?;

    println!("  Waiting for the host on {} …", addr.bold());
    let stream = tokio::select! {
        stream = relume_link::listen(addr.as_str()) => stream?,
        () = wait_for_shutdown(&shutdown) => {
            info!("shutdown requested before the host connected");
            return Ok(());
        }
    };
    let (mut tx, mut rx) = Link::spawn::<_, ControllerReport, HostMessage>(stream);
    controller.run(&mut tx, &mut rx, shutdown).await?;
    Ok(())
}

async fn run_host(
    cfg: &Config,
    addr: Option<String>,
    frames_dir: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), CliError> {
    let addr = addr.unwrap_or_else(|| cfg.link.addr.clone());
    let camera: Box<dyn Camera> = match frames_dir.or_else(|| cfg.replay_dir.clone()) {
        Some(dir) => {
            info!(dir = %dir.display(), "replaying recorded frames");
            Box::new(DirectoryCamera::new("replay", dir))
        }
        None => {
            warn!("no camera bindings available; using the simulated camera");
            Box::new(SimCamera::new("front"))
        }
    };

    let mut host = HostLoop::new(cfg.host.clone())?;
    let frames = FrameSlot::new();
    let supervisor = CaptureSupervisor::start(camera, cfg.camera.clone(), frames.callback())?;

    println!("  Connecting to the controller at {} …", addr.bold());
    let result = async {
        let stream = tokio::select! {
            stream = relume_link::connect(addr.as_str()) => stream?,
            () = wait_for_shutdown(&shutdown) => {
                info!("shutdown requested before the controller answered");
                return Ok(());
            }
        };
        let (mut tx, mut rx) = Link::spawn::<_, HostMessage, ControllerReport>(stream);
        host.run(&frames, &mut tx, &mut rx, shutdown).await
    }
    .await;

    let captured = supervisor.stats().frames();
    supervisor.stop();
    info!(frames = captured, "capture stopped");
    Ok(result?)
}

async fn run_sim(cfg: &Config, duration: Duration, shutdown: Arc<AtomicBool>) -> Result<(), CliError> {
    let world = SimWorld::new(cfg.controller.kinematics);
    let target = SimTarget {
        x_m: cfg.sim.target_x_m,
        y_m: cfg.sim.target_y_m,
        diameter_m: cfg.sim.target_diameter_m,
    };
    let mut controller = ControllerLoop::new(cfg.controller.clone(), SimDriveBase::new(world.clone()).build())?;
    let mut host = HostLoop::new(cfg.host.clone())?;

    let camera = SimCamera::new("sim_front").observing(world.clone(), target, cfg.host.detection.horizontal_fov_deg);
    let settings = CameraSettings {
        width: cfg.sim.width,
        height: cfg.sim.height,
        warmup_ms: 0,
        ..cfg.camera.clone()
    };
    let frames = FrameSlot::new();
    let supervisor = CaptureSupervisor::start(Box::new(camera), settings, frames.callback())?;

    let (host_io, controller_io) = tokio::io::duplex(64 * 1024);
    let (mut host_tx, mut host_rx) = Link::spawn::<_, HostMessage, ControllerReport>(host_io);
    let (mut ctrl_tx, mut ctrl_rx) = Link::spawn::<_, ControllerReport, HostMessage>(controller_io);

    let timer = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            shutdown.store(true, Ordering::SeqCst);
        })
    };

    info!(?target, seconds = duration.as_secs_f64(), "simulation started");
    let (host_result, controller_result) = tokio::join!(
        host.run(&frames, &mut host_tx, &mut host_rx, shutdown.clone()),
        controller.run(&mut ctrl_tx, &mut ctrl_rx, shutdown.clone()),
    );
    timer.abort();
    supervisor.stop();
    host_result?;
    controller_result?;

    let pose = world.pose();
    let distance = (target.x_m - pose.x_m).hypot(target.y_m - pose.y_m);
    println!();
    println!(
        "  Final pose  x={:.2} m  y={:.2} m  heading={:.1}°",
        pose.x_m,
        pose.y_m,
        pose.heading_rad.to_degrees()
    );
    let summary = format!("  Distance to target {distance:.2} m (standoff {:.2} m)", cfg.host.standoff_m);
    if distance <= cfg.host.standoff_m + cfg.host.follower.goal_tolerance_m * 2.0 {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.yellow());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Offline tools
// ─────────────────────────────────────────────────────────────────────────────

fn preprocess(cfg: &Config, input: &Path, output: &Path, stages_dir: Option<&Path>) -> Result<(), CliError> {
    let frame = pnm::read_frame(input)?;
    let stages = Preprocessor::new(cfg.host.preprocess.clone()).run_with_stages(&frame)?;
    pnm::write_pgm(output, stages.output.width(), stages.output.height(), stages.output.pixels())?;
    println!("  {} {}", "✓".green().bold(), output.display());

    if let Some(dir) = stages_dir {
        std::fs::create_dir_all(dir).map_err(|source| CliError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        pnm::write_ppm(&dir.join("1_denoised.ppm"), &stages.denoised)?;
        for (name, image) in stages.named_gray_stages() {
            pnm::write_pgm(&dir.join(format!("{name}.pgm")), image.width(), image.height(), image.pixels())?;
        }
        println!("  {} stages written to {}", "✓".green().bold(), dir.display());
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> Result<(), CliError> {
    let path = path.map_or_else(config::config_path, Path::to_path_buf);
    config::init(&Config::default(), &path, force)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Resolves once `shutdown` is set.
async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}

fn install_ctrlc() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping motors and shutting down …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }
    shutdown
}

fn print_banner(mode: &str) {
    println!();
    println!("{}", r#"   ________  ____  ______ ___  ___"#.bold().cyan());
    println!("{}", r#"  / ___/ _ \/ / / / / __ `__ \/ _ \"#.bold().cyan());
    println!("{}", r#" / /  /  __/ / /_/ / / / / / /  __/"#.bold().cyan());
    println!("{}", r#"/_/   \___/_/\__,_/_/ /_/ /_/\___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}  {}",
        "Relume".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        mode.cyan()
    );
    println!();
}
