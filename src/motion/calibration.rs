//! Calibration store.
//!
//! A calibration point is where a leg's foot actually lands when the servos
//! are commanded to the neutral pose. The difference between the IK angles of
//! that point and of the neutral point is the per-joint offset fed into
//! [`solve_pose`](super::kinematics::solve_pose).
//!
//! Points persist as four tab-separated rows of integers (`x\ty\tz`), one per
//! leg, with no header. Older files carry a trailing tab, which is tolerated.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::kinematics::{FootTarget, JointOffsets, LegPose, coordinate_to_angle};
use crate::error::CalibrationError;

/// Neutral pose the calibration points are measured against.
pub fn reference_pose() -> LegPose {
    LegPose::initial(99.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CalibrationRow {
    x: i32,
    y: i32,
    z: i32,
}

impl From<CalibrationRow> for FootTarget {
    fn from(row: CalibrationRow) -> Self {
        [f64::from(row.x), f64::from(row.y), f64::from(row.z)]
    }
}

impl From<&FootTarget> for CalibrationRow {
    fn from(p: &FootTarget) -> Self {
        Self {
            x: p[0].round() as i32,
            y: p[1].round() as i32,
            z: p[2].round() as i32,
        }
    }
}

/// Parses `0..=3` or `one..four` into a leg index.
pub fn parse_leg(s: &str) -> Result<usize, CalibrationError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "0" | "one" => Ok(0),
        "1" | "two" => Ok(1),
        "2" | "three" => Ok(2),
        "3" | "four" => Ok(3),
        other => Err(CalibrationError::UnknownLeg(other.to_string())),
    }
}

pub struct CalibrationStore {
    path: PathBuf,
    points: LegPose,
    offsets: JointOffsets,
}

impl CalibrationStore {
    /// Store with every point equal to the reference pose (zero offsets).
    pub fn neutral(path: impl Into<PathBuf>) -> Self {
        let points = reference_pose();
        Self {
            path: path.into(),
            offsets: derive_offsets(&points),
            points,
        }
    }

    /// Loads `path`, falling back to neutral calibration if it is missing or
    /// malformed.
    pub fn load_or_neutral(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_points(&path) {
            Ok(points) => {
                info!("[MOTION] calibration loaded from {}", path.display());
                Self {
                    offsets: derive_offsets(&points),
                    points,
                    path,
                }
            }
            Err(e) => {
                warn!("[MOTION] {e}; using neutral calibration");
                Self::neutral(path)
            }
        }
    }

    pub fn offsets(&self) -> &JointOffsets {
        &self.offsets
    }

    pub fn points(&self) -> &LegPose {
        &self.points
    }

    /// Replaces one leg's calibration point and re-derives all offsets.
    pub fn set_point(&mut self, leg: usize, point: FootTarget) {
        if let Some(slot) = self.points.0.get_mut(leg) {
            *slot = point;
            self.offsets = derive_offsets(&self.points);
        }
    }

    pub fn save(&self) -> Result<(), CalibrationError> {
        write_points(&self.path, &self.points)?;
        info!("[MOTION] calibration saved to {}", self.path.display());
        Ok(())
    }
}

/// `IK(calibration point) - IK(reference point)` per leg and joint.
pub fn derive_offsets(points: &LegPose) -> JointOffsets {
    let reference = reference_pose();
    let mut offsets = [[0.0; 3]; 4];
    for (leg, out) in offsets.iter_mut().enumerate() {
        let [cx, cy, cz] = points.0[leg];
        let [rx, ry, rz] = reference.0[leg];
        let cal = coordinate_to_angle(cx, cy, cz);
        let neutral = coordinate_to_angle(rx, ry, rz);
        for j in 0..3 {
            out[j] = cal[j] - neutral[j];
        }
    }
    offsets
}

fn read_points(path: &Path) -> Result<LegPose, CalibrationError> {
    let file = File::open(path).map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(file);

    let mut rows = Vec::with_capacity(4);
    for record in reader.records() {
        let record = record?;
        let fields: StringRecord = record.iter().filter(|f| !f.is_empty()).take(3).collect();
        if fields.is_empty() {
            continue;
        }
        let row: CalibrationRow = fields.deserialize(None)?;
        rows.push(FootTarget::from(row));
    }

    let points: [FootTarget; 4] = rows
        .try_into()
        .map_err(|rows: Vec<FootTarget>| CalibrationError::RowCount(rows.len()))?;
    Ok(LegPose(points))
}

fn write_points(path: &Path, points: &LegPose) -> Result<(), CalibrationError> {
    let file = File::create(path).map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    for p in &points.0 {
        writer.serialize(CalibrationRow::from(p))?;
    }
    writer.flush().map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
