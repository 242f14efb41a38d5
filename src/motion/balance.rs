//! balance.rs
//! Body posture transform and the IMU-driven attitude balancer.
//!
//! The body is modelled as a rectangle of hip joints (`BODY_LENGTH` x
//! `BODY_WIDTH`) above a slightly wider rectangle of feet. Rotating the body
//! by roll/pitch/yaw while keeping the feet planted yields new foot vectors
//! in each hip's frame:
//!
//! `AB_i = pos + R * foot_i - body_i`, with `R = Rx(roll) * Ry(pitch) * Rz(yaw)`.
//!
//! The balancer runs roll and pitch through independent PID controllers and
//! feeds their outputs back through the same transform, driving the measured
//! tilt to zero.

use std::thread;

use log::debug;
use nalgebra::{Matrix3, Vector3};
use pid::Pid;

use super::kinematics::LegPose;
use crate::{
    config::BalanceConfig,
    error::SensorError,
    hardware::{Attitude, AttitudeSensor},
};

pub const BODY_LENGTH: f64 = 136.0;
pub const BODY_WIDTH: f64 = 76.0;
pub const FOOT_WIDTH: f64 = 76.0;
/// Extra lateral offset of each foot beyond the foot rectangle.
pub const FOOT_OUTSET: f64 = 10.0;

/// How the body is positioned relative to the feet while rotating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFrame {
    /// Rotate about the ground plane; used for commanded attitudes.
    Grounded,
    /// Rotate about the hip plane at the current height; used while balancing.
    Raised,
}

fn rotation(roll_deg: f64, pitch_deg: f64, yaw_deg: f64) -> Matrix3<f64> {
    let (sr, cr) = roll_deg.to_radians().sin_cos();
    let (sp, cp) = pitch_deg.to_radians().sin_cos();
    let (sy, cy) = yaw_deg.to_radians().sin_cos();

    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cr, -sr, 0.0, sr, cr);
    let ry = Matrix3::new(cp, 0.0, -sp, 0.0, 1.0, 0.0, sp, 0.0, cp);
    let rz = Matrix3::new(cy, -sy, 0.0, sy, cy, 0.0, 0.0, 0.0, 1.0);
    rx * ry * rz
}

/// Foot targets for the body rotated by `(roll, pitch, yaw)` degrees at
/// `height`.
pub fn posture_transform(attitude: Attitude, height: f64, frame: BodyFrame) -> LegPose {
    let lift = match frame {
        BodyFrame::Grounded => 0.0,
        BodyFrame::Raised => height,
    };
    let rot = rotation(attitude.roll, attitude.pitch, attitude.yaw);
    let pos = Vector3::new(0.0, 0.0, lift);

    let (hl, hb) = (BODY_LENGTH / 2.0, BODY_WIDTH / 2.0);
    let hw = FOOT_WIDTH / 2.0 + FOOT_OUTSET;
    let signs = [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)];

    let ab = signs.map(|(sx, sy)| {
        let body = Vector3::new(sx * hl, sy * hb, 0.0);
        let foot = Vector3::new(sx * hl, sy * hw, height - lift);
        pos + rot * foot - body
    });

    // Body corners are front-left, front-right, rear-left, rear-right; legs are
    // front-left, rear-left, front-right, rear-right.
    let leg = |v: &Vector3<f64>| [v.x + 10.0, v.z, v.y];
    LegPose([leg(&ab[0]), leg(&ab[2]), leg(&ab[3]), leg(&ab[1])])
}

/// Linear range mapping, as used for client attitude commands.
pub fn map_range(value: f64, from_lo: f64, from_hi: f64, to_lo: f64, to_hi: f64) -> f64 {
    (to_hi - to_lo) * (value - from_lo) / (from_hi - from_lo) + to_lo
}

/// Scales a client attitude command (±20) into a body rotation (±10 degrees).
pub fn commanded_attitude(roll: f64, pitch: f64, yaw: f64) -> Attitude {
    let m = |v: f64| map_range(v, -20.0, 20.0, -10.0, 10.0);
    Attitude {
        roll: m(roll),
        pitch: m(pitch),
        yaw: m(yaw),
    }
}

pub struct AttitudeBalancer {
    roll: Pid<f64>,
    pitch: Pid<f64>,
    zero: Attitude,
    config: BalanceConfig,
}

impl AttitudeBalancer {
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            roll: Self::axis(&config),
            pitch: Self::axis(&config),
            zero: Attitude::default(),
            config,
        }
    }

    fn axis(config: &BalanceConfig) -> Pid<f64> {
        let mut pid = Pid::new(0.0, config.output_limit);
        pid.p(config.kp, config.output_limit)
            .i(config.ki, config.integral_limit)
            .d(config.kd, config.output_limit);
        pid
    }

    /// Clears controller history ahead of a new session.
    pub fn reset(&mut self) {
        self.roll = Self::axis(&self.config);
        self.pitch = Self::axis(&self.config);
    }

    /// Averages `zero_samples` IMU readings into the zero offset. Failed reads
    /// are skipped; if none succeed the previous offset is kept.
    pub fn calibrate(&mut self, imu: &dyn AttitudeSensor) -> Result<Attitude, SensorError> {
        let mut sum = Attitude::default();
        let mut n = 0u32;
        let mut last_err = None;
        for _ in 0..self.config.zero_samples.max(1) {
            match imu.read_attitude() {
                Ok(a) => {
                    sum.roll += a.roll;
                    sum.pitch += a.pitch;
                    sum.yaw += a.yaw;
                    n += 1;
                }
                Err(e) => last_err = Some(e),
            }
            if !self.config.tick.is_zero() {
                thread::sleep(self.config.tick);
            }
        }
        if n == 0 {
            return Err(last_err.unwrap_or(SensorError::Unavailable("imu")));
        }
        let n = f64::from(n);
        self.zero = Attitude {
            roll: sum.roll / n,
            pitch: sum.pitch / n,
            yaw: sum.yaw / n,
        };
        debug!("[MOTION] imu zero offset {:?}", self.zero);
        Ok(self.zero)
    }

    /// One controller update. Returns the body rotation that counters the
    /// measured tilt; yaw is never corrected.
    pub fn correct(&mut self, sample: Attitude) -> Attitude {
        let roll = sample.roll - self.zero.roll;
        let pitch = sample.pitch - self.zero.pitch;
        Attitude {
            roll: self.roll.next_control_output(roll).output,
            pitch: self.pitch.next_control_output(pitch).output,
            yaw: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimImu;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    fn quiet_config() -> BalanceConfig {
        BalanceConfig {
            zero_samples: 10,
            tick: Duration::ZERO,
            ..BalanceConfig::default()
        }
    }

    #[test]
    fn identity_rotation_gives_neutral_stance() {
        for frame in [BodyFrame::Grounded, BodyFrame::Raised] {
            let pose = posture_transform(Attitude::default(), 99.0, frame);
            let neutral = LegPose::neutral(99.0);
            for (got, want) in pose.0.iter().zip(neutral.0.iter()) {
                for axis in 0..3 {
                    assert_abs_diff_eq!(got[axis], want[axis], epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn roll_raises_one_side_and_lowers_the_other() {
        let pose = posture_transform(
            Attitude { roll: 10.0, pitch: 0.0, yaw: 0.0 },
            99.0,
            BodyFrame::Grounded,
        );
        // Left and right feet move in opposite directions along y.
        let left = pose.0[0][1] - 99.0;
        let right = pose.0[2][1] - 99.0;
        assert!(left * right < 0.0, "left {left} right {right}");
        assert!(pose.check_reach().is_ok());
    }

    #[test]
    fn commanded_attitude_halves_range() {
        let a = commanded_attitude(20.0, -20.0, 0.0);
        assert_abs_diff_eq!(a.roll, 10.0);
        assert_abs_diff_eq!(a.pitch, -10.0);
        assert_abs_diff_eq!(a.yaw, 0.0);
    }

    #[test]
    fn calibration_averages_out_static_tilt() {
        let imu = SimImu::with_noise(0.0);
        imu.set_attitude(Attitude { roll: 2.0, pitch: -1.0, yaw: 5.0 });
        let mut balancer = AttitudeBalancer::new(quiet_config());
        let zero = balancer.calibrate(&imu).unwrap();
        assert_abs_diff_eq!(zero.roll, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(zero.pitch, -1.0, epsilon = 1e-9);

        let out = balancer.correct(Attitude { roll: 2.0, pitch: -1.0, yaw: 5.0 });
        assert_abs_diff_eq!(out.roll, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out.pitch, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn correction_opposes_tilt() {
        let mut balancer = AttitudeBalancer::new(quiet_config());
        let out = balancer.correct(Attitude { roll: 4.0, pitch: -6.0, yaw: 30.0 });
        assert!(out.roll < 0.0);
        assert!(out.pitch > 0.0);
        assert_eq!(out.yaw, 0.0);
        assert_abs_diff_eq!(out.roll, -2.0, epsilon = 1e-9);
    }

    #[test]
    fn calibration_fails_when_imu_is_down() {
        let imu = SimImu::with_noise(0.0);
        imu.set_failing(true);
        let mut balancer = AttitudeBalancer::new(quiet_config());
        assert!(balancer.calibrate(&imu).is_err());
    }
}
