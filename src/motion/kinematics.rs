//! Leg kinematics.
//!
//! Each leg is a three-link chain: a hip link `L1` swinging in the body's
//! y/z plane, followed by an upper (`L2`) and lower (`L3`) link swinging
//! forward/back. Foot targets are expressed in millimetres in the leg's own
//! frame (x forward, y down, z lateral), angles in degrees.
//!
//! Everything here is pure: no state, no I/O.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::error::MotionError;

pub const L1: f64 = 23.0;
pub const L2: f64 = 55.0;
pub const L3: f64 = 55.0;

/// Reachable envelope for a foot target, measured from the hip origin.
pub const MIN_REACH: f64 = 25.0;
pub const MAX_REACH: f64 = 130.0;

/// Servo channels per leg, ordered hip, shoulder, knee.
pub const LEG_CHANNELS: [[u8; 3]; 4] = [[4, 3, 2], [7, 6, 5], [8, 9, 10], [11, 12, 13]];

pub type FootTarget = [f64; 3];

/// Per-joint angle corrections added before mirroring, indexed `[leg][joint]`.
pub type JointOffsets = [[f64; 3]; 4];

/// Foot targets for all four legs: front-left, rear-left, front-right, rear-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegPose(pub [FootTarget; 4]);

impl LegPose {
    /// Standing stance at `height`, feet 10 mm outboard.
    pub fn neutral(height: f64) -> Self {
        Self([
            [10.0, height, 10.0],
            [10.0, height, 10.0],
            [10.0, height, -10.0],
            [10.0, height, -10.0],
        ])
    }

    /// Pose the legs are assumed to hold at power-on.
    pub fn initial(height: f64) -> Self {
        Self([
            [0.0, height, 10.0],
            [0.0, height, 10.0],
            [0.0, height, -10.0],
            [0.0, height, -10.0],
        ])
    }

    /// Folded lying-down posture.
    pub fn relaxed() -> Self {
        Self([[55.0, 78.0, 0.0]; 4])
    }

    /// Distance of each foot from its hip origin.
    pub fn reach(&self) -> [f64; 4] {
        self.0.map(|[x, y, z]| (x * x + y * y + z * z).sqrt())
    }

    /// Rejects the pose if any foot lies outside `[MIN_REACH, MAX_REACH]`.
    pub fn check_reach(&self) -> Result<(), MotionError> {
        for (leg, length) in self.reach().into_iter().enumerate() {
            if !(MIN_REACH..=MAX_REACH).contains(&length) {
                return Err(MotionError::UnreachablePose { leg, length });
            }
        }
        Ok(())
    }

    /// Point `k/steps` of the way from `self` to `target`.
    pub fn lerp(&self, target: &LegPose, k: u32, steps: u32) -> LegPose {
        if k >= steps {
            return *target;
        }
        let t = f64::from(k) / f64::from(steps);
        let mut out = self.0;
        for (leg, foot) in out.iter_mut().enumerate() {
            for (axis, v) in foot.iter_mut().enumerate() {
                *v += (target.0[leg][axis] - *v) * t;
            }
        }
        LegPose(out)
    }
}

/// Joint angles actually sent to the servos, `[leg][hip, shoulder, knee]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointAngles(pub [[f64; 3]; 4]);

impl JointAngles {
    /// `(channel, degrees)` pairs in write order.
    pub fn channel_writes(&self) -> impl Iterator<Item = (u8, f64)> + '_ {
        self.0.iter().zip(LEG_CHANNELS.iter()).flat_map(|(angles, channels)| {
            channels.iter().copied().zip(angles.iter().copied())
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn unit(v: f64) -> f64 {
    round2(v).clamp(-1.0, 1.0)
}

/// Inverse kinematics for one foot target. Returns `[hip, shoulder, knee]` in
/// whole degrees.
pub fn coordinate_to_angle(x: f64, y: f64, z: f64) -> [f64; 3] {
    coordinate_to_angle_with(x, y, z, L1, L2, L3)
}

pub fn coordinate_to_angle_with(x: f64, y: f64, z: f64, l1: f64, l2: f64, l3: f64) -> [f64; 3] {
    let a = FRAC_PI_2 - z.atan2(y);
    let y4 = l1 * a.sin();
    let z4 = l1 * a.cos();
    let l23 = ((z - z4).powi(2) + (y - y4).powi(2) + x * x).sqrt();

    let w = unit(x / l23);
    let v = unit((l2 * l2 + l23 * l23 - l3 * l3) / (2.0 * l2 * l23));
    let b = w.asin() - v.acos();
    let c = PI - unit((l2 * l2 + l3 * l3 - l23 * l23) / (2.0 * l3 * l2)).acos();

    [a.to_degrees().round(), b.to_degrees().round(), c.to_degrees().round()]
}

/// Forward kinematics: joint angles in degrees back to a foot target.
pub fn angle_to_coordinate(hip: f64, shoulder: f64, knee: f64) -> FootTarget {
    angle_to_coordinate_with(hip, shoulder, knee, L1, L2, L3)
}

pub fn angle_to_coordinate_with(
    hip: f64,
    shoulder: f64,
    knee: f64,
    l1: f64,
    l2: f64,
    l3: f64,
) -> FootTarget {
    let a = hip.to_radians();
    let b = shoulder.to_radians();
    let c = knee.to_radians();
    let reach = l3 * (b + c).cos() + l2 * b.cos() + l1;
    let x = l3 * (b + c).sin() + l2 * b.sin();
    [x, a.sin() * reach, a.cos() * reach]
}

/// Solves all four legs and converts raw IK angles into servo angles.
///
/// Left legs (0, 1) and right legs (2, 3) are mounted mirrored, so the
/// shoulder and knee are reflected on one side. Offsets are applied before the
/// reflection and the result is clamped to `[0, 180]`.
pub fn solve_pose(pose: &LegPose, offsets: &JointOffsets) -> Result<JointAngles, MotionError> {
    pose.check_reach()?;

    let mut out = [[0.0; 3]; 4];
    for (leg, &[x, y, z]) in pose.0.iter().enumerate() {
        let [a, b, c] = coordinate_to_angle(x, y, z);
        let [oa, ob, oc] = offsets[leg];
        let (shoulder, knee) = if leg < 2 {
            (90.0 - (b + ob), c + oc)
        } else {
            (90.0 + b + ob, 180.0 - (c + oc))
        };
        out[leg] = [
            (a + oa).clamp(0.0, 180.0),
            shoulder.clamp(0.0, 180.0),
            knee.clamp(0.0, 180.0),
        ];
    }
    Ok(JointAngles(out))
}
