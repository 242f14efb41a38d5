//! # Robot-dog control server entry point
//!
//! Starts the server on simulated hardware with defaults overridable from the
//! command line, then waits for Ctrl-C (or `--duration` seconds).
//!
//! Logging goes through `env_logger`; set `RUST_LOG=debug` to see telemetry
//! traffic and per-order executor decisions.

use std::{
    net::IpAddr,
    path::PathBuf,
    process::ExitCode,
    sync::atomic::Ordering,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use log::{error, info, warn};

use dog_server::{
    Hardware, Server, ServerConfig,
    config::{DEFAULT_CONTROL_PORT, DEFAULT_VIDEO_PORT, OveruseLimits},
};

const WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "dog_server")]
#[command(about = "Quadruped robot control and video server", long_about = None)]
struct Args {
    /// Address to bind both listeners on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    #[arg(long, default_value_t = DEFAULT_VIDEO_PORT)]
    video_port: u16,

    /// Calibration points file
    #[arg(long, default_value = "point.txt")]
    calibration: PathBuf,

    /// Abort a running gait cycle as soon as a different order arrives
    #[arg(long)]
    preempt: bool,

    /// Grace window (ms) in which a stop lets the last motion finish one more cycle; 0 disables
    #[arg(long, default_value_t = 350)]
    move_hold_ms: u64,

    /// Seconds of inactivity after which write ownership lapses
    #[arg(long, default_value_t = 8)]
    owner_timeout: u64,

    /// Force a rest after 180 s of continuous activity
    #[arg(long)]
    overuse_guard: bool,

    #[arg(long)]
    no_battery: bool,

    #[arg(long)]
    no_health: bool,

    /// Log a health summary every 15 s
    #[arg(long)]
    health_log: bool,

    /// Pin the motion executor to this core
    #[arg(long)]
    pin_core: Option<usize>,

    /// Run for this many seconds, then shut down (0 = until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    duration: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_host: self.host,
            control_port: self.control_port,
            video_port: self.video_port,
            ownership_timeout: Duration::from_secs(self.owner_timeout),
            calibration_path: self.calibration,
            ..ServerConfig::default()
        };
        config.motion.preempt_on_new_command = self.preempt;
        config.motion.move_hold_grace = Duration::from_millis(self.move_hold_ms);
        config.motion.pin_core = self.pin_core;
        if self.overuse_guard {
            config.motion.overuse = Some(OveruseLimits::default());
        }
        config.battery.enabled = !self.no_battery;
        config.health.enabled = !self.no_health;
        config.health.log_summary = self.health_log;
        config
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let config = args.into_config();

    info!("=== DOG SERVER START ===");
    let hardware = Hardware::simulated(&config.video);
    let server = match Server::start(config, hardware) {
        Ok(server) => server,
        Err(e) => {
            error!("[Main] startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let running = server.running_flag();
    let on_signal = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("[Main] Ctrl-C received");
        on_signal.store(false, Ordering::Release);
    }) {
        warn!("[Main] Ctrl-C handler not installed: {e}");
    }

    let started = Instant::now();
    while running.load(Ordering::Acquire) {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            info!("[Main] run duration reached");
            break;
        }
        thread::sleep(WAIT_SLICE);
    }

    server.shutdown();
    info!("=== DOG SERVER FINISHED ===");
    ExitCode::SUCCESS
}
