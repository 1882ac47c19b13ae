//! Geometric checks between tool poses and anatomical references
//!
//! Each check is a pure function of its inputs. Margins are validated on
//! every call; an undefined geometric quantity is reported as `NotFound`
//! and never folded into pass or fail.

use nalgebra::{Matrix3, Point3, Rotation3, UnitQuaternion, Vector3};
use serde::Serialize;

use crate::engine::EvaluationError;
use crate::mesh::TriangleMesh;
use crate::pose::Pose;
use crate::tool::ToolGeometry;

/// Relative singular value below which a point set is treated as collinear
const RANK_TOLERANCE: f64 = 1e-9;

/// Ensure a margin is finite and non-negative
pub fn validate_margin(name: &str, value: f64) -> Result<f64, EvaluationError> {
    if !value.is_finite() {
        return Err(EvaluationError::InvalidMargin {
            name: name.to_string(),
            reason: format!("{} is not finite", value),
        });
    }
    if value < 0.0 {
        return Err(EvaluationError::InvalidMargin {
            name: name.to_string(),
            reason: format!("{} is negative", value),
        });
    }
    Ok(value)
}

/// Unsigned angle between two directions, in degrees within `[0, 180]`
///
/// Returns `None` if either vector has zero length.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> Option<f64> {
    if a.norm() < f64::EPSILON || b.norm() < f64::EPSILON {
        return None;
    }
    if !a.iter().chain(b.iter()).all(|v| v.is_finite()) {
        return None;
    }
    // atan2 stays accurate near 0 and 180 where acos loses precision
    Some(a.cross(b).norm().atan2(a.dot(b)).to_degrees())
}

/// Result of an angle check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AngleCheck {
    pub within_margin: bool,
    pub angle_deg: f64,
}

/// Angle between a tool's long axis (under `pose`) and a reference direction
pub fn check_angle(
    pose: &Pose,
    tool: &ToolGeometry,
    reference: &Vector3<f64>,
    margin_deg: f64,
) -> Result<AngleCheck, EvaluationError> {
    let margin = validate_margin("angle_margin_deg", margin_deg)?;
    let axis = pose.transform_vector(&tool.long_axis());
    let angle_deg = angle_between(&axis, reference)
        .ok_or_else(|| EvaluationError::NotFound("angle to reference direction".to_string()))?;

    Ok(AngleCheck {
        within_margin: angle_deg <= margin,
        angle_deg,
    })
}

/// Outcome of a point-to-surface query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceDistance {
    Found {
        distance: f64,
        closest: Point3<f64>,
    },
    NotFound(&'static str),
}

impl SurfaceDistance {
    pub fn distance(&self) -> Option<f64> {
        match self {
            SurfaceDistance::Found { distance, .. } => Some(*distance),
            SurfaceDistance::NotFound(_) => None,
        }
    }
}

/// Distance from `point` to the nearest point of `mesh`
///
/// With a `search_radius`, points farther than the radius from the surface
/// (or outside the mesh bounds grown by it) give `NotFound`.
pub fn check_point_to_surface_distance(
    point: &Point3<f64>,
    mesh: &TriangleMesh,
    search_radius: Option<f64>,
) -> SurfaceDistance {
    if !point.coords.iter().all(|c| c.is_finite()) {
        return SurfaceDistance::NotFound("query point is not finite");
    }

    let Some(bounds) = mesh.bounds() else {
        return SurfaceDistance::NotFound("surface has no triangles");
    };

    if let Some(radius) = search_radius {
        if !bounds.expanded(radius).contains(point) {
            return SurfaceDistance::NotFound("point outside surface search volume");
        }
    }

    match mesh.closest_point(point) {
        Some((closest, distance)) => match search_radius {
            Some(radius) if distance > radius => {
                SurfaceDistance::NotFound("no surface within search radius")
            }
            _ => SurfaceDistance::Found { distance, closest },
        },
        None => SurfaceDistance::NotFound("surface has only degenerate triangles"),
    }
}

/// Two-sided distance tolerance: `low < d < high` passes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceBand {
    low: f64,
    high: f64,
}

impl DistanceBand {
    pub fn new(low: f64, high: f64) -> Result<Self, EvaluationError> {
        let low = validate_margin("band_low_mm", low)?;
        let high = validate_margin("band_high_mm", high)?;
        if low > high {
            return Err(EvaluationError::InvalidMargin {
                name: "distance_band".to_string(),
                reason: format!("low {} exceeds high {}", low, high),
            });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }
}

/// Where a distance falls relative to a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandClass {
    TooClose,
    Within,
    TooFar,
}

/// Classify a distance; both band edges count as failing
///
/// A distance exactly on `low` is `TooClose`: the tip has not cleared the near edge.
pub fn classify_band(distance: f64, band: &DistanceBand) -> BandClass {
    let d = distance.abs();
    if d <= band.low {
        BandClass::TooClose
    } else if d < band.high {
        BandClass::Within
    } else {
        BandClass::TooFar
    }
}

/// Result of a distance band check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandCheck {
    pub class: BandClass,
    pub distance: f64,
}

impl BandCheck {
    pub fn within_band(&self) -> bool {
        self.class == BandClass::Within
    }
}

/// Euclidean distance from `point` to `target`, classified against `band`
pub fn check_distance_band(point: &Point3<f64>, target: &Point3<f64>, band: &DistanceBand) -> BandCheck {
    let distance = (point - target).norm();
    BandCheck {
        class: classify_band(distance, band),
        distance,
    }
}

/// Rotation that best maps `current` fiducials onto `ideal` fiducials
///
/// Kabsch alignment over paired points. Needs at least three points that
/// do not all lie on one line.
pub fn rotation_from_ideal(
    current: &[Point3<f64>],
    ideal: &[Point3<f64>],
) -> Result<UnitQuaternion<f64>, EvaluationError> {
    if current.len() != ideal.len() {
        return Err(EvaluationError::MissingInput(format!(
            "paired fiducials: {} current vs {} ideal",
            current.len(),
            ideal.len()
        )));
    }
    if current.len() < 3 {
        return Err(EvaluationError::NotFound(
            "rotation needs at least three fiducials".to_string(),
        ));
    }

    let current_centroid = centroid(current);
    let ideal_centroid = centroid(ideal);

    let mut h = Matrix3::zeros();
    for (c, i) in current.iter().zip(ideal) {
        h += (c.coords - current_centroid) * (i.coords - ideal_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let largest = svd.singular_values.max();
    let rank = svd
        .singular_values
        .iter()
        .filter(|s| **s > largest * RANK_TOLERANCE)
        .count();
    if largest <= f64::EPSILON || rank < 2 {
        return Err(EvaluationError::NotFound(
            "fiducials are collinear, rotation undefined".to_string(),
        ));
    }

    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(EvaluationError::NotFound("SVD did not converge".to_string()));
    };

    let mut v = v_t.transpose();
    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        // Reflection: flip the axis of the smallest singular value
        let (smallest, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .fold((0, f64::INFINITY), |acc, (i, s)| if *s < acc.1 { (i, *s) } else { acc });
        for row in 0..3 {
            v[(row, smallest)] = -v[(row, smallest)];
        }
        r = v * u.transpose();
    }

    Ok(UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r)))
}

fn centroid(points: &[Point3<f64>]) -> Vector3<f64> {
    points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64
}
