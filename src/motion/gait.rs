//! Gait primitives.
//!
//! A gait sweeps a phase angle and, for every phase step, produces two
//! foot trajectories from sinusoids: one shared by legs 0/2 and one by legs
//! 1/3, half a cycle apart. No foot is ever allowed below the body height
//! line (`y > height`), which keeps the stance feet planted.

use super::kinematics::LegPose;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gait {
    Forward,
    Backward,
    StrafeLeft,
    StrafeRight,
    TurnLeft,
    TurnRight,
}

impl Gait {
    pub fn name(&self) -> &'static str {
        match self {
            Gait::Forward => "forward",
            Gait::Backward => "backward",
            Gait::StrafeLeft => "strafe-left",
            Gait::StrafeRight => "strafe-right",
            Gait::TurnLeft => "turn-left",
            Gait::TurnRight => "turn-right",
        }
    }

    /// Phase angles in degrees for one full cycle at `speed` degrees per step.
    pub fn phases(&self, speed: u32) -> Vec<i32> {
        let step = speed.max(1) as usize;
        match self {
            Gait::Forward | Gait::StrafeLeft => (90..=450).step_by(step).collect(),
            Gait::Backward | Gait::StrafeRight => (90..=450).rev().step_by(step).collect(),
            Gait::TurnLeft | Gait::TurnRight => (0..=360).step_by(step).collect(),
        }
    }

    /// Foot targets for `phase` degrees into the cycle.
    pub fn pose_at(&self, phase: i32, height: f64) -> LegPose {
        let p1 = f64::from(phase).to_radians();
        let p2 = f64::from(phase + 180).to_radians();

        match self {
            Gait::Forward | Gait::Backward => {
                let (x1, y1) = (12.0 * p1.cos(), (6.0 * p1.sin() + height).min(height));
                let (x2, y2) = (12.0 * p2.cos(), (6.0 * p2.sin() + height).min(height));
                stride(x1, y1, 0.0, x2, y2, 0.0)
            }
            Gait::StrafeLeft | Gait::StrafeRight => {
                let (z1, y1) = (10.0 * p1.cos(), (5.0 * p1.sin() + height).min(height));
                let (z2, y2) = (10.0 * p2.cos(), (5.0 * p2.sin() + height).min(height));
                stride(0.0, y1, z1, 0.0, y2, z2)
            }
            Gait::TurnLeft => {
                let (s1, y1) = (3.0 * p1.cos(), (8.0 * p1.sin() + height).min(height));
                let (s2, y2) = (3.0 * p2.cos(), (8.0 * p2.sin() + height).min(height));
                LegPose([
                    [-s1 + 10.0, y1, s1 + 10.0],
                    [-s2 + 10.0, y2, -s2 + 10.0],
                    [s1 + 10.0, y1, -s1 - 10.0],
                    [s2 + 10.0, y2, s2 - 10.0],
                ])
            }
            Gait::TurnRight => {
                let (s1, y1) = (3.0 * p1.cos(), (8.0 * p1.sin() + height).min(height));
                let (s2, y2) = (3.0 * p2.cos(), (8.0 * p2.sin() + height).min(height));
                LegPose([
                    [s1 + 10.0, y1, -s1 + 10.0],
                    [s2 + 10.0, y2, s2 + 10.0],
                    [-s1 + 10.0, y1, s1 - 10.0],
                    [-s2 + 10.0, y2, -s2 - 10.0],
                ])
            }
        }
    }
}

/// Diagonal-pair placement shared by walking and strafing.
fn stride(x1: f64, y1: f64, z1: f64, x2: f64, y2: f64, z2: f64) -> LegPose {
    LegPose([
        [x1 + 10.0, y1, z1 + 10.0],
        [x2 + 10.0, y2, z2 + 10.0],
        [x1 + 10.0, y1, z1 - 10.0],
        [x2 + 10.0, y2, z2 - 10.0],
    ])
}

/// Moves every foot to `height` with a forward lean of `lean` millimetres.
/// Lateral positions are kept from `current`.
pub fn level_pose(current: &LegPose, lean: f64, height: f64) -> LegPose {
    let mut out = current.0;
    for foot in out.iter_mut() {
        foot[0] = lean + 10.0;
        foot[1] = height;
    }
    LegPose(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const ALL: [Gait; 6] = [
        Gait::Forward,
        Gait::Backward,
        Gait::StrafeLeft,
        Gait::StrafeRight,
        Gait::TurnLeft,
        Gait::TurnRight,
    ];

    #[test]
    fn forward_sweep_covers_full_cycle() {
        let phases = Gait::Forward.phases(8);
        assert_eq!(phases.first(), Some(&90));
        assert_eq!(phases.last(), Some(&450));
        assert_eq!(phases.len(), 46);

        let back = Gait::Backward.phases(8);
        assert_eq!(back.first(), Some(&450));
        assert_eq!(back.last(), Some(&90));
    }

    #[test]
    fn zero_speed_still_advances() {
        assert_eq!(Gait::TurnLeft.phases(0).len(), 361);
    }

    #[test]
    fn feet_never_drop_below_height() {
        for gait in ALL {
            for phase in gait.phases(5) {
                let pose = gait.pose_at(phase, 99.0);
                for foot in pose.0 {
                    assert!(foot[1] <= 99.0, "{} phase {phase}: {:?}", gait.name(), foot);
                }
                assert!(pose.check_reach().is_ok());
            }
        }
    }

    #[test]
    fn forward_start_lifts_rear_pair() {
        let pose = Gait::Forward.pose_at(90, 99.0);
        assert_abs_diff_eq!(pose.0[0][0], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.0[0][1], 99.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.0[1][1], 93.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.0[2][2], -10.0, epsilon = 1e-9);
    }

    #[test]
    fn turn_left_mirrors_lateral_offsets() {
        let pose = Gait::TurnLeft.pose_at(0, 99.0);
        assert_abs_diff_eq!(pose.0[0][0], 7.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.0[0][2], 13.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.0[2][2], -13.0, epsilon = 1e-9);
    }

    #[test]
    fn level_pose_keeps_lateral_placement() {
        let start = LegPose::neutral(99.0);
        let leaned = level_pose(&start, 15.0, 109.0);
        for (before, after) in start.0.iter().zip(leaned.0.iter()) {
            assert_eq!(after[0], 25.0);
            assert_eq!(after[1], 109.0);
            assert_eq!(after[2], before[2]);
        }
    }
}
