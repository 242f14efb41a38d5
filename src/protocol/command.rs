//! Control-port command decoding.
//!
//! A control line is `NAME#param#param...`. It is decoded once, at the
//! connection boundary, into a [`Command`]; everything downstream matches on
//! the enum and never re-reads the raw text.

use std::fmt;

use crate::{
    error::ProtocolError,
    motion::{calibration::parse_leg, gait::Gait, kinematics::FootTarget},
};

pub const CMD_MOVE_STOP: &str = "CMD_MOVE_STOP";
pub const CMD_MOVE_FORWARD: &str = "CMD_MOVE_FORWARD";
pub const CMD_MOVE_BACKWARD: &str = "CMD_MOVE_BACKWARD";
pub const CMD_MOVE_LEFT: &str = "CMD_MOVE_LEFT";
pub const CMD_MOVE_RIGHT: &str = "CMD_MOVE_RIGHT";
pub const CMD_TURN_LEFT: &str = "CMD_TURN_LEFT";
pub const CMD_TURN_RIGHT: &str = "CMD_TURN_RIGHT";
pub const CMD_BUZZER: &str = "CMD_BUZZER";
pub const CMD_LED_MOD: &str = "CMD_LED_MOD";
pub const CMD_LED: &str = "CMD_LED";
pub const CMD_BALANCE: &str = "CMD_BALANCE";
pub const CMD_SONIC: &str = "CMD_SONIC";
pub const CMD_HEIGHT: &str = "CMD_HEIGHT";
pub const CMD_HORIZON: &str = "CMD_HORIZON";
pub const CMD_HEAD: &str = "CMD_HEAD";
pub const CMD_CALIBRATION: &str = "CMD_CALIBRATION";
pub const CMD_POWER: &str = "CMD_POWER";
pub const CMD_ATTITUDE: &str = "CMD_ATTITUDE";
pub const CMD_RELAX: &str = "CMD_RELAX";
pub const CMD_WORKING_TIME: &str = "CMD_WORKING_TIME";
pub const CMD_STOP_PWM: &str = "CMD_STOP_PWM";

/// How a command is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Answered on the requesting connection; never reaches the executor.
    Telemetry,
    /// Always accepted, from anyone, in any battery state.
    Safety,
    /// Requires write ownership and is refused during low-battery lockout.
    Write,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `speed` is `None` when the client sent no usable speed; the executor
    /// then keeps its current one.
    Move { gait: Gait, speed: Option<u32> },
    Stop,
    Relax,
    StopPwm,
    Head(f64),
    Height(f64),
    Horizon(f64),
    AttitudeQuery,
    Attitude { roll: f64, pitch: f64, yaw: f64 },
    Balance(bool),
    Power,
    Sonic,
    WorkingTime,
    Calibrate { leg: usize, point: FootTarget },
    SaveCalibration,
    Led(Vec<String>),
    LedMode(Vec<String>),
    Buzzer(bool),
}

impl Command {
    /// Decodes one control line (without its newline).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut fields: Vec<&str> = line.split('#').map(str::trim).collect();
        while fields.len() > 1 && fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        let (name, params) = match fields.split_first() {
            Some((name, params)) => (*name, params),
            None => return Err(ProtocolError::Empty),
        };

        let cmd = match name {
            CMD_MOVE_STOP => Command::Stop,
            CMD_MOVE_FORWARD => Self::movement(Gait::Forward, params),
            CMD_MOVE_BACKWARD => Self::movement(Gait::Backward, params),
            CMD_MOVE_LEFT => Self::movement(Gait::StrafeLeft, params),
            CMD_MOVE_RIGHT => Self::movement(Gait::StrafeRight, params),
            CMD_TURN_LEFT => Self::movement(Gait::TurnLeft, params),
            CMD_TURN_RIGHT => Self::movement(Gait::TurnRight, params),
            CMD_RELAX => Command::Relax,
            CMD_STOP_PWM => Command::StopPwm,
            CMD_HEAD => Command::Head(number(CMD_HEAD, params, 0)?),
            CMD_HEIGHT => Command::Height(number(CMD_HEIGHT, params, 0)?),
            CMD_HORIZON => Command::Horizon(number(CMD_HORIZON, params, 0)?),
            CMD_ATTITUDE if params.len() >= 3 => Command::Attitude {
                roll: number(CMD_ATTITUDE, params, 0)?,
                pitch: number(CMD_ATTITUDE, params, 1)?,
                yaw: number(CMD_ATTITUDE, params, 2)?,
            },
            CMD_ATTITUDE => Command::AttitudeQuery,
            CMD_BALANCE => match param(CMD_BALANCE, params, 0)? {
                "1" => Command::Balance(true),
                "0" => Command::Balance(false),
                other => {
                    return Err(ProtocolError::InvalidParam {
                        command: CMD_BALANCE,
                        value: other.to_string(),
                    });
                }
            },
            CMD_POWER => Command::Power,
            CMD_SONIC => Command::Sonic,
            CMD_WORKING_TIME => Command::WorkingTime,
            CMD_CALIBRATION => Self::calibration(params)?,
            CMD_LED => Command::Led(owned(params)),
            CMD_LED_MOD => Command::LedMode(owned(params)),
            CMD_BUZZER => Command::Buzzer(param(CMD_BUZZER, params, 0)? != "0"),
            other => return Err(ProtocolError::Unknown(other.to_string())),
        };
        Ok(cmd)
    }

    fn movement(gait: Gait, params: &[&str]) -> Command {
        let speed = params
            .first()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 1.0)
            .map(|s| s as u32);
        Command::Move { gait, speed }
    }

    fn calibration(params: &[&str]) -> Result<Command, ProtocolError> {
        let target = param(CMD_CALIBRATION, params, 0)?;
        if target.eq_ignore_ascii_case("save") {
            return Ok(Command::SaveCalibration);
        }
        let leg = parse_leg(target).map_err(|_| ProtocolError::InvalidParam {
            command: CMD_CALIBRATION,
            value: target.to_string(),
        })?;
        let point = [
            number(CMD_CALIBRATION, params, 1)?,
            number(CMD_CALIBRATION, params, 2)?,
            number(CMD_CALIBRATION, params, 3)?,
        ];
        Ok(Command::Calibrate { leg, point })
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Move { gait, .. } => match gait {
                Gait::Forward => CMD_MOVE_FORWARD,
                Gait::Backward => CMD_MOVE_BACKWARD,
                Gait::StrafeLeft => CMD_MOVE_LEFT,
                Gait::StrafeRight => CMD_MOVE_RIGHT,
                Gait::TurnLeft => CMD_TURN_LEFT,
                Gait::TurnRight => CMD_TURN_RIGHT,
            },
            Command::Stop => CMD_MOVE_STOP,
            Command::Relax => CMD_RELAX,
            Command::StopPwm => CMD_STOP_PWM,
            Command::Head(_) => CMD_HEAD,
            Command::Height(_) => CMD_HEIGHT,
            Command::Horizon(_) => CMD_HORIZON,
            Command::AttitudeQuery | Command::Attitude { .. } => CMD_ATTITUDE,
            Command::Balance(_) => CMD_BALANCE,
            Command::Power => CMD_POWER,
            Command::Sonic => CMD_SONIC,
            Command::WorkingTime => CMD_WORKING_TIME,
            Command::Calibrate { .. } | Command::SaveCalibration => CMD_CALIBRATION,
            Command::Led(_) => CMD_LED,
            Command::LedMode(_) => CMD_LED_MOD,
            Command::Buzzer(_) => CMD_BUZZER,
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Command::Power | Command::Sonic | Command::WorkingTime | Command::AttitudeQuery => {
                CommandClass::Telemetry
            }
            Command::Stop | Command::Relax | Command::StopPwm => CommandClass::Safety,
            Command::Move { .. }
            | Command::Head(_)
            | Command::Height(_)
            | Command::Horizon(_)
            | Command::Attitude { .. }
            | Command::Balance(_)
            | Command::Calibrate { .. }
            | Command::SaveCalibration
            | Command::Led(_)
            | Command::LedMode(_)
            | Command::Buzzer(_) => CommandClass::Write,
        }
    }

    pub fn gait(&self) -> Option<Gait> {
        match self {
            Command::Move { gait, .. } => Some(*gait),
            _ => None,
        }
    }

    /// True when both commands drive the same primitive, ignoring parameters.
    pub fn same_kind(&self, other: &Command) -> bool {
        match (self, other) {
            (Command::Move { gait: a, .. }, Command::Move { gait: b, .. }) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }

    /// Commands clients send several times a second; logged at debug level.
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            Command::Power | Command::Sonic | Command::Led(_) | Command::LedMode(_) | Command::Buzzer(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move { speed: Some(s), .. } => write!(f, "{}#{}", self.name(), s),
            Command::Head(v) | Command::Height(v) | Command::Horizon(v) => {
                write!(f, "{}#{}", self.name(), v)
            }
            Command::Attitude { roll, pitch, yaw } => {
                write!(f, "{}#{}#{}#{}", self.name(), roll, pitch, yaw)
            }
            Command::Balance(on) => write!(f, "{}#{}", self.name(), u8::from(*on)),
            Command::Calibrate { leg, point } => write!(
                f,
                "{}#{}#{}#{}#{}",
                self.name(),
                leg,
                point[0],
                point[1],
                point[2]
            ),
            Command::SaveCalibration => write!(f, "{}#save", self.name()),
            Command::Buzzer(on) => write!(f, "{}#{}", self.name(), u8::from(*on)),
            _ => f.write_str(self.name()),
        }
    }
}

fn param<'a>(command: &'static str, params: &[&'a str], index: usize) -> Result<&'a str, ProtocolError> {
    params
        .get(index)
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or(ProtocolError::MissingParam {
            command,
            index: index + 1,
        })
}

fn number(command: &'static str, params: &[&str], index: usize) -> Result<f64, ProtocolError> {
    let raw = param(command, params, index)?;
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidParam {
            command,
            value: raw.to_string(),
        })
}

fn owned(params: &[&str]) -> Vec<String> {
    params.iter().map(|s| s.to_string()).collect()
}
