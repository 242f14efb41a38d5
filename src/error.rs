//! Error taxonomy for the control server.
//!
//! Every failure the server can observe is one of these types. None of them
//! terminate the process except [`ServerError`] raised while binding at startup;
//! the rest are logged at the point they are handled and the owning loop
//! carries on.

use std::{io, path::PathBuf};

use thiserror::Error;

/// A control line that could not be decoded into a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command line")]
    Empty,

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("{command} is missing parameter #{index}")]
    MissingParam { command: &'static str, index: usize },

    #[error("{command} has an invalid parameter {value:?}")]
    InvalidParam { command: &'static str, value: String },
}

/// A write command was refused because another client holds ownership.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("control owned by {owner}")]
pub struct OwnershipDenied {
    pub owner: String,
}

impl OwnershipDenied {
    /// Wire form sent back to the denied client.
    pub fn reply(&self) -> String {
        format!("CMD_BUSY#OWNER:{}\n", self.owner)
    }
}

/// Motion-level rejection of a pose before any actuator is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotionError {
    #[error("leg {leg} target out of reach (length {length:.1} mm)")]
    UnreachablePose { leg: usize, length: f64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("servo channel {channel} write failed: {reason}")]
    Write { channel: u8, reason: String },

    #[error("PWM output could not be disabled: {0}")]
    Disable(String),

    #[error("indicator failed: {0}")]
    Indicator(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} read failed: {reason}")]
    Read { sensor: &'static str, reason: String },

    #[error("{0} not available")]
    Unavailable(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera failed to start: {0}")]
    Start(String),

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("calibration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("calibration data: {0}")]
    Csv(#[from] csv::Error),

    #[error("calibration file has {0} rows, expected 4")]
    RowCount(usize),

    #[error("unknown calibration leg {0:?}")]
    UnknownLeg(String),
}

/// Startup and lifecycle failures. These are the only errors that end the process.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {role} listener on port {port}: {source}")]
    Bind {
        role: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("listener is not bound")]
    NotBound,

    #[error(transparent)]
    Io(#[from] io::Error),
}
