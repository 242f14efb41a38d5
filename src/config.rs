//! Server configuration.
//!
//! Defaults mirror the behaviour of the robot as shipped; the binary overrides a
//! subset of fields from the command line.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_CONTROL_PORT: u16 = 5001;
pub const DEFAULT_VIDEO_PORT: u16 = 8001;
pub const CONTROL_BACKLOG: i32 = 8;
pub const VIDEO_BACKLOG: i32 = 1;

pub const DEFAULT_SPEED: u32 = 8;
pub const DEFAULT_HEIGHT: f64 = 99.0;
pub const INTERPOLATION_STEPS: u32 = 50;

pub const LOW_BATTERY_THRESHOLD_V: f64 = 6.1;

/// Top-level configuration handed to [`crate::server::Server::start`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: IpAddr,
    pub control_port: u16,
    pub video_port: u16,
    pub control_backlog: i32,
    pub video_backlog: i32,
    /// Upper bound on a single accept poll.
    pub accept_timeout: Duration,
    /// Read timeout on control connections.
    pub read_timeout: Duration,
    pub ownership_timeout: Duration,
    pub calibration_path: PathBuf,
    /// Beep and flash once the listeners are up.
    pub ready_signal: bool,
    pub motion: MotionConfig,
    pub battery: BatteryConfig,
    pub health: HealthConfig,
    pub video: VideoConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            video_port: DEFAULT_VIDEO_PORT,
            control_backlog: CONTROL_BACKLOG,
            video_backlog: VIDEO_BACKLOG,
            accept_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            ownership_timeout: Duration::from_secs(8),
            calibration_path: PathBuf::from("point.txt"),
            ready_signal: true,
            motion: MotionConfig::default(),
            battery: BatteryConfig::default(),
            health: HealthConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub default_speed: u32,
    pub default_height: f64,
    /// Interpolation steps used by stop, relax and wake transitions.
    pub interpolation_steps: u32,
    /// Pause after each pose application. Zero disables pacing.
    pub step_interval: Duration,
    /// How long the executor waits for a new order before re-checking state.
    pub idle_poll: Duration,
    /// Abort a running primitive as soon as a different order is posted.
    pub preempt_on_new_command: bool,
    /// A stop received this soon after the last motion order lets one more
    /// gait cycle run first. Zero disables the hold.
    pub move_hold_grace: Duration,
    /// Capacity of the order channel between handlers and the executor.
    pub mailbox_capacity: usize,
    pub balance: BalanceConfig,
    /// `None` disables overuse protection.
    pub overuse: Option<OveruseLimits>,
    /// Run the executor thread at maximum OS priority.
    pub realtime_priority: bool,
    pub pin_core: Option<usize>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_speed: DEFAULT_SPEED,
            default_height: DEFAULT_HEIGHT,
            interpolation_steps: INTERPOLATION_STEPS,
            step_interval: Duration::from_millis(10),
            idle_poll: Duration::from_millis(20),
            preempt_on_new_command: false,
            move_hold_grace: Duration::from_millis(350),
            mailbox_capacity: 64,
            balance: BalanceConfig::default(),
            overuse: None,
            realtime_priority: true,
            pin_core: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: f64,
    pub output_limit: f64,
    /// Samples averaged into the IMU zero offset.
    pub zero_samples: u32,
    /// Pause after levelling, before the IMU is zeroed.
    pub settle_before_zero: Duration,
    /// Pause after zeroing, before the loop starts correcting.
    pub settle_after_zero: Duration,
    pub tick: Duration,
    /// Hard cap on a single balance session.
    pub max_duration: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.0,
            kd: 0.0025,
            integral_limit: 10.0,
            output_limit: 45.0,
            zero_samples: 100,
            settle_before_zero: Duration::from_secs(2),
            settle_after_zero: Duration::from_secs(1),
            tick: Duration::from_millis(10),
            max_duration: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OveruseLimits {
    pub active_limit: Duration,
    pub rest: Duration,
}

impl Default for OveruseLimits {
    fn default() -> Self {
        Self {
            active_limit: Duration::from_secs(180),
            rest: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatteryConfig {
    pub enabled: bool,
    pub threshold_v: f64,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub warning_interval: Duration,
    /// Delay between the forced relax and the forced PWM cut.
    pub stop_pwm_delay: Duration,
    /// Minimum spacing of the "ignoring command" log during lockout.
    pub lockout_log_interval: Duration,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_v: LOW_BATTERY_THRESHOLD_V,
            debounce: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
            warning_interval: Duration::from_secs(5),
            stop_pwm_delay: Duration::from_secs(3),
            lockout_log_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub reopen_backoff: Duration,
    pub log_summary: bool,
    pub summary_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            reopen_backoff: Duration::from_secs(2),
            log_summary: false,
            summary_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl VideoConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 300,
            fps: 15,
            jpeg_quality: 80,
        }
    }
}
