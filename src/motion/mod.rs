// Motion: everything between a decoded order and the servo writes
// kinematics: leg IK/FK and pose validation
// gait: phase tables for walking and turning
// balance: posture transform and PID attitude correction
// calibration: per-leg offsets persisted to point.txt
// state: shared motion state read by telemetry
// executor: the single thread that drives the legs

pub mod balance;
pub mod calibration;
pub mod executor;
pub mod gait;
pub mod kinematics;
pub mod state;
