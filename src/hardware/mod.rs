//! Hardware seam.
//!
//! The server never talks to a bus directly. Every device it needs is reached
//! through one of the traits below, and a [`Hardware`] bundle carries the
//! concrete implementations into the threads that use them. All traits take
//! `&self` so a single device can be shared behind an `Arc` between the motion
//! executor and the telemetry handlers; implementations serialise access
//! internally.

pub mod sim;

use std::{sync::Arc, time::Duration};

use crate::error::{ActuatorError, CameraError, SensorError};

/// Servo channel driving the camera head.
pub const HEAD_CHANNEL: u8 = 15;

/// 16-channel PWM servo driver.
pub trait ServoDriver: Send + Sync {
    /// Commands `channel` to `degrees` (0..=180). Implementations apply their
    /// own mechanical limits on top.
    fn set_servo_angle(&self, channel: u8, degrees: f64) -> Result<(), ActuatorError>;

    /// Turns all PWM outputs off. Servos go limp until the next angle write.
    fn stop_all_pwm(&self) -> Result<(), ActuatorError>;
}

pub trait RangeSensor: Send + Sync {
    fn read_distance_cm(&self) -> Result<f64, SensorError>;
}

pub trait PowerSensor: Send + Sync {
    /// Battery pack voltage in volts.
    fn read_voltage(&self) -> Result<f64, SensorError>;
}

/// Body attitude in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

pub trait AttitudeSensor: Send + Sync {
    fn read_attitude(&self) -> Result<Attitude, SensorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeepPattern {
    On,
    Off,
    /// `count` tones of `on`, separated by `off`.
    Pulses { count: u32, on: Duration, off: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightPattern {
    /// Parameters of a `CMD_LED` line, passed through untouched.
    Color(Vec<String>),
    /// Parameters of a `CMD_LED_MOD` line.
    Mode(Vec<String>),
    /// Flash every LED `count` times in `rgb`.
    Flash { rgb: [u8; 3], count: u32, on: Duration },
}

/// LED strip plus buzzer.
pub trait Indicator: Send + Sync {
    fn beep(&self, pattern: &BeepPattern) -> Result<(), ActuatorError>;
    fn light(&self, pattern: &LightPattern) -> Result<(), ActuatorError>;
}

pub trait Camera: Send + Sync {
    fn start(&self) -> Result<(), CameraError>;

    /// Blocks until the next frame is available and returns it JPEG-encoded.
    fn capture_jpeg(&self) -> Result<Vec<u8>, CameraError>;

    fn stop(&self);
}

/// Every device the server uses, shareable across threads.
#[derive(Clone)]
pub struct Hardware {
    pub servos: Arc<dyn ServoDriver>,
    pub range: Arc<dyn RangeSensor>,
    pub power: Arc<dyn PowerSensor>,
    pub imu: Arc<dyn AttitudeSensor>,
    pub indicator: Arc<dyn Indicator>,
    pub camera: Arc<dyn Camera>,
}

impl Hardware {
    /// Simulated devices, used when the server runs away from the robot.
    pub fn simulated(video: &crate::config::VideoConfig) -> Self {
        Self {
            servos: Arc::new(sim::SimServos::new()),
            range: Arc::new(sim::SimRange::new()),
            power: Arc::new(sim::SimPower::new(7.8)),
            imu: Arc::new(sim::SimImu::new()),
            indicator: Arc::new(sim::SimIndicator::new()),
            camera: Arc::new(sim::SimCamera::new(video.width, video.height, video.jpeg_quality)),
        }
    }
}
