//! Rigid poses for tracked tools and reference frames
//!
//! Positions are in millimeters, angles in radians. A pose maps points from
//! its local frame into its parent frame (tool frame to tracking space, or
//! anatomical frame to tracking space).

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when deciding whether a matrix is a rigid transform
const RIGID_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("Failed to parse pose: {0}")]
    ParseError(String),
    #[error("Matrix is not a rigid transform: {0}")]
    NotRigid(String),
    #[error("Pose contains non-finite values")]
    NonFinite,
}

/// Rigid transform (rotation + translation) of a tracked body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PoseRecord", into = "PoseRecord")]
pub struct Pose {
    iso: Isometry3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            iso: Isometry3::identity(),
        }
    }

    pub fn new(position: Point3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self {
            iso: Isometry3::from_parts(Translation3::from(position.coords), orientation),
        }
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z), UnitQuaternion::identity())
    }

    /// Build from position and roll/pitch/yaw (radians, applied yaw * pitch * roll)
    pub fn from_xyz_rpy(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self::new(
            Point3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    /// Build from a row-major 4x4 homogeneous matrix
    ///
    /// The upper-left 3x3 block must be orthonormal with determinant +1 and
    /// the bottom row must be `0 0 0 1`.
    pub fn from_matrix(m: &[[f64; 4]; 4]) -> Result<Self, PoseError> {
        if m.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PoseError::NonFinite);
        }

        let bottom = m[3];
        if bottom[0].abs() > RIGID_TOLERANCE
            || bottom[1].abs() > RIGID_TOLERANCE
            || bottom[2].abs() > RIGID_TOLERANCE
            || (bottom[3] - 1.0).abs() > RIGID_TOLERANCE
        {
            return Err(PoseError::NotRigid(format!(
                "bottom row must be 0 0 0 1, got {:?}",
                bottom
            )));
        }

        let rot = Matrix3::new(
            m[0][0], m[0][1], m[0][2],
            m[1][0], m[1][1], m[1][2],
            m[2][0], m[2][1], m[2][2],
        );

        let orthogonality = (rot.transpose() * rot - Matrix3::identity()).abs().max();
        if orthogonality > RIGID_TOLERANCE {
            return Err(PoseError::NotRigid(format!(
                "rotation block is not orthonormal (deviation {:.3e})",
                orthogonality
            )));
        }
        if rot.determinant() < 0.0 {
            return Err(PoseError::NotRigid("rotation block is a reflection".to_string()));
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rot));
        Ok(Self::new(Point3::new(m[0][3], m[1][3], m[2][3]), rotation))
    }

    /// Row-major 4x4 homogeneous matrix
    pub fn to_matrix(&self) -> [[f64; 4]; 4] {
        let h = self.iso.to_homogeneous();
        let mut out = [[0.0; 4]; 4];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = h[(r, c)];
            }
        }
        out
    }

    pub fn position(&self) -> Point3<f64> {
        Point3::from(self.iso.translation.vector)
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.iso.rotation
    }

    pub fn isometry(&self) -> &Isometry3<f64> {
        &self.iso
    }

    /// `self * other`: apply `other` first, then `self`
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose {
            iso: self.iso * other.iso,
        }
    }

    pub fn inverse(&self) -> Pose {
        Pose {
            iso: self.iso.inverse(),
        }
    }

    /// Express this pose in the coordinates of `frame`
    ///
    /// Both poses must share the same parent space.
    pub fn relative_to(&self, frame: &Pose) -> Pose {
        frame.inverse().compose(self)
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.iso.transform_point(point)
    }

    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.iso.transform_vector(vector)
    }

    pub fn is_finite(&self) -> bool {
        self.iso.translation.vector.iter().all(|v| v.is_finite())
            && self.iso.rotation.coords.iter().all(|v| v.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Serialized form of a pose
///
/// Accepts either a row-major homogeneous matrix or the
/// `x y z roll pitch yaw` fields. Serializes as the latter. Unknown keys
/// are rejected so a malformed record never decodes as the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoseRecord {
    Matrix(MatrixRecord),
    Euler(EulerRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixRecord {
    pub matrix: [[f64; 4]; 4],
}

/// Position is required; rotation angles default to zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EulerRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub roll: f64,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
}

impl TryFrom<PoseRecord> for Pose {
    type Error = PoseError;

    fn try_from(record: PoseRecord) -> Result<Self, Self::Error> {
        let pose = match record {
            PoseRecord::Matrix(MatrixRecord { matrix }) => Pose::from_matrix(&matrix)?,
            PoseRecord::Euler(e) => Pose::from_xyz_rpy(e.x, e.y, e.z, e.roll, e.pitch, e.yaw),
        };
        if !pose.is_finite() {
            return Err(PoseError::NonFinite);
        }
        Ok(pose)
    }
}

impl From<Pose> for PoseRecord {
    fn from(pose: Pose) -> Self {
        let p = pose.position();
        let (roll, pitch, yaw) = pose.orientation().euler_angles();
        PoseRecord::Euler(EulerRecord {
            x: p.x,
            y: p.y,
            z: p.z,
            roll,
            pitch,
            yaw,
        })
    }
}

/// Parse a pose string "x y z roll pitch yaw" (millimeters, radians)
pub fn parse_pose_string(s: &str) -> Result<Pose, PoseError> {
    let parts: Vec<f64> = s
        .split_whitespace()
        .map(|p| {
            p.parse()
                .map_err(|_| PoseError::ParseError(format!("not a number: {:?}", p)))
        })
        .collect::<Result<_, _>>()?;

    if parts.len() != 6 {
        return Err(PoseError::ParseError(format!(
            "expected 6 values, got {}",
            parts.len()
        )));
    }

    let pose = Pose::from_xyz_rpy(parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]);
    if !pose.is_finite() {
        return Err(PoseError::NonFinite);
    }
    Ok(pose)
}
