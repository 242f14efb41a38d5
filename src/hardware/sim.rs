//! sim.rs
//! Simulated devices for running the server without a robot attached.
//! - Sensors return a settable base value plus small random noise.
//! - The servo driver records the last angle per channel and counts writes.
//! - The camera renders a moving test pattern and JPEG-encodes it.

use std::{
    io::Cursor,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use log::debug;
use parking_lot::Mutex;
use rand::random_range;

use super::{
    Attitude, AttitudeSensor, BeepPattern, Camera, Indicator, LightPattern, PowerSensor,
    RangeSensor, ServoDriver,
};
use crate::error::{ActuatorError, CameraError, SensorError};

pub const SERVO_CHANNELS: usize = 16;

/// Servo driver that remembers what it was told.
pub struct SimServos {
    angles: Mutex<[Option<f64>; SERVO_CHANNELS]>,
    pwm_enabled: AtomicBool,
    writes: AtomicU64,
    fail_channel: Mutex<Option<u8>>,
}

impl SimServos {
    pub fn new() -> Self {
        Self {
            angles: Mutex::new([None; SERVO_CHANNELS]),
            pwm_enabled: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            fail_channel: Mutex::new(None),
        }
    }

    pub fn angle(&self, channel: u8) -> Option<f64> {
        self.angles.lock().get(channel as usize).copied().flatten()
    }

    pub fn pwm_enabled(&self) -> bool {
        self.pwm_enabled.load(Ordering::Acquire)
    }

    /// Successful angle writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Makes every write to `channel` fail, simulating a bus fault.
    pub fn fail_channel(&self, channel: Option<u8>) {
        *self.fail_channel.lock() = channel;
    }
}

impl Default for SimServos {
    fn default() -> Self {
        Self::new()
    }
}

impl ServoDriver for SimServos {
    fn set_servo_angle(&self, channel: u8, degrees: f64) -> Result<(), ActuatorError> {
        if *self.fail_channel.lock() == Some(channel) {
            return Err(ActuatorError::Write {
                channel,
                reason: "simulated bus fault".into(),
            });
        }
        let mut angles = self.angles.lock();
        let slot = angles
            .get_mut(channel as usize)
            .ok_or_else(|| ActuatorError::Write {
                channel,
                reason: "no such channel".into(),
            })?;
        *slot = Some(degrees.clamp(0.0, 180.0));
        self.pwm_enabled.store(true, Ordering::Release);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop_all_pwm(&self) -> Result<(), ActuatorError> {
        self.pwm_enabled.store(false, Ordering::Release);
        Ok(())
    }
}

pub struct SimRange;

impl SimRange {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimRange {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeSensor for SimRange {
    fn read_distance_cm(&self) -> Result<f64, SensorError> {
        Ok(random_range(20.0..200.0_f64).round())
    }
}

/// Battery whose voltage a test can move around.
pub struct SimPower {
    voltage: Mutex<f64>,
    failing: AtomicBool,
}

impl SimPower {
    pub fn new(voltage: f64) -> Self {
        Self {
            voltage: Mutex::new(voltage),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_voltage(&self, voltage: f64) {
        *self.voltage.lock() = voltage;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl PowerSensor for SimPower {
    fn read_voltage(&self) -> Result<f64, SensorError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(SensorError::Read {
                sensor: "adc",
                reason: "simulated read failure".into(),
            });
        }
        Ok(*self.voltage.lock())
    }
}

/// IMU reporting a settable attitude with a little jitter on top.
pub struct SimImu {
    base: Mutex<Attitude>,
    noise_deg: f64,
    failing: AtomicBool,
}

impl SimImu {
    pub fn new() -> Self {
        Self::with_noise(0.05)
    }

    pub fn with_noise(noise_deg: f64) -> Self {
        Self {
            base: Mutex::new(Attitude::default()),
            noise_deg,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_attitude(&self, attitude: Attitude) {
        *self.base.lock() = attitude;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn jitter(&self) -> f64 {
        if self.noise_deg > 0.0 {
            random_range(-self.noise_deg..self.noise_deg)
        } else {
            0.0
        }
    }
}

impl Default for SimImu {
    fn default() -> Self {
        Self::new()
    }
}

impl AttitudeSensor for SimImu {
    fn read_attitude(&self) -> Result<Attitude, SensorError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(SensorError::Unavailable("imu"));
        }
        let base = *self.base.lock();
        Ok(Attitude {
            roll: base.roll + self.jitter(),
            pitch: base.pitch + self.jitter(),
            yaw: base.yaw + self.jitter(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorEvent {
    Beep(BeepPattern),
    Light(LightPattern),
}

/// Indicator that logs and records every request instead of driving hardware.
pub struct SimIndicator {
    events: Mutex<Vec<IndicatorEvent>>,
}

impl SimIndicator {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.events.lock().clone()
    }
}

impl Default for SimIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator for SimIndicator {
    fn beep(&self, pattern: &BeepPattern) -> Result<(), ActuatorError> {
        debug!("[SIM] buzzer {:?}", pattern);
        self.events.lock().push(IndicatorEvent::Beep(pattern.clone()));
        Ok(())
    }

    fn light(&self, pattern: &LightPattern) -> Result<(), ActuatorError> {
        debug!("[SIM] led {:?}", pattern);
        self.events.lock().push(IndicatorEvent::Light(pattern.clone()));
        Ok(())
    }
}

/// Camera producing a scrolling gradient, encoded the same way a real
/// capture pipeline hands frames to the streamer.
pub struct SimCamera {
    width: u32,
    height: u32,
    quality: u8,
    started: AtomicBool,
    frame: AtomicU64,
    fail_start: AtomicBool,
    fail_capture: AtomicBool,
}

impl SimCamera {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
            started: AtomicBool::new(false),
            frame: AtomicU64::new(0),
            fail_start: AtomicBool::new(false),
            fail_capture: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Release);
    }

    /// Makes every capture fail while the camera stays started.
    pub fn set_fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::Release);
    }

    fn render(&self, frame: u64) -> RgbImage {
        let shift = (frame % 256) as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let r = ((x + shift) % 256) as u8;
            let g = ((y + shift) % 256) as u8;
            let b = ((x ^ y) % 256) as u8;
            Rgb([r, g, b])
        })
    }
}

impl Camera for SimCamera {
    fn start(&self) -> Result<(), CameraError> {
        if self.fail_start.load(Ordering::Acquire) {
            return Err(CameraError::Start("simulated sensor missing".into()));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>, CameraError> {
        if !self.is_started() {
            return Err(CameraError::Capture("camera not started".into()));
        }
        if self.fail_capture.load(Ordering::Acquire) {
            return Err(CameraError::Capture("simulated frame timeout".into()));
        }
        let frame = self.frame.fetch_add(1, Ordering::AcqRel);
        let img = self.render(frame);

        let mut buf = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode_image(&img)
            .map_err(|e| CameraError::Encode(e.to_string()))?;
        Ok(buf.into_inner())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servo_writes_are_recorded_and_clamped() {
        let servos = SimServos::new();
        servos.set_servo_angle(3, 200.0).unwrap();
        assert_eq!(servos.angle(3), Some(180.0));
        assert!(servos.pwm_enabled());
        servos.stop_all_pwm().unwrap();
        assert!(!servos.pwm_enabled());
        assert_eq!(servos.write_count(), 1);
    }

    #[test]
    fn failing_channel_reports_write_error() {
        let servos = SimServos::new();
        servos.fail_channel(Some(4));
        assert!(matches!(
            servos.set_servo_angle(4, 90.0),
            Err(ActuatorError::Write { channel: 4, .. })
        ));
        assert!(servos.set_servo_angle(5, 90.0).is_ok());
    }

    #[test]
    fn camera_emits_jpeg_only_while_started() {
        let cam = SimCamera::new(64, 48, 70);
        assert!(cam.capture_jpeg().is_err());
        cam.start().unwrap();
        let jpeg = cam.capture_jpeg().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        cam.stop();
        assert!(!cam.is_started());
    }
}
