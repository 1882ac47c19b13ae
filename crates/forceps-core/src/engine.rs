//! Pose evaluation engine
//!
//! Given a step definition and the current tool poses, decides whether the
//! trainee's placement is within margin and produces the feedback messages
//! shown for it. Evaluation is a pure read of poses and reference geometry:
//! calling it twice with the same inputs yields the same result.

use chrono::{DateTime, Utc};
use nalgebra::{Point3, Vector3};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::checks::{
    check_angle, check_distance_band, check_point_to_surface_distance, rotation_from_ideal,
    BandClass, SurfaceDistance,
};
use crate::landmark::{GeometryStore, Landmark};
use crate::mesh::TriangleMesh;
use crate::pose::Pose;
use crate::step::{StepCheck, StepDefinition, StepId};
use crate::tool::{Side, ToolGeometry, ToolId, ToolSet};
use crate::tracking::PoseSource;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Missing input: {0}")]
    MissingInput(String),
    #[error("Geometric query had no result: {0}")]
    NotFound(String),
    #[error("Invalid margin {name}: {reason}")]
    InvalidMargin { name: String, reason: String },
}

/// Overall outcome of a step evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// No violation, but at least one check could not be computed
    Inconclusive,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
            Verdict::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// Named numeric value recorded while evaluating
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub step: StepId,
    pub verdict: Verdict,
    /// Feedback messages, in check order, each at most once
    pub violations: Vec<String>,
    /// Checks whose geometric query produced no result
    pub inconclusive: Vec<String>,
    pub measurements: Vec<Measurement>,
}

impl EvaluationResult {
    pub fn within_margin(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Newline-joined feedback text
    pub fn message(&self) -> String {
        self.violations.join("\n")
    }

    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.iter().find(|m| m.name == name).map(|m| m.value)
    }
}

/// Accumulates the outcome of every sub-check of one step
struct Outcome {
    violations: Vec<String>,
    inconclusive: Vec<String>,
    measurements: Vec<Measurement>,
}

impl Outcome {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            inconclusive: Vec::new(),
            measurements: Vec::new(),
        }
    }

    fn violation(&mut self, message: &str) {
        if !self.violations.iter().any(|v| v == message) {
            self.violations.push(message.to_string());
        }
    }

    fn inconclusive(&mut self, check: &str, reason: &str) {
        warn!(check = check, reason = reason, "Check inconclusive");
        self.inconclusive.push(check.to_string());
    }

    fn measure(&mut self, name: &str, value: f64) {
        self.measurements.push(Measurement {
            name: name.to_string(),
            value,
        });
    }

    fn into_result(self, step: StepId) -> EvaluationResult {
        let verdict = if !self.violations.is_empty() {
            Verdict::Fail
        } else if !self.inconclusive.is_empty() {
            Verdict::Inconclusive
        } else {
            Verdict::Pass
        };
        EvaluationResult {
            step,
            verdict,
            violations: self.violations,
            inconclusive: self.inconclusive,
            measurements: self.measurements,
        }
    }
}

/// Evaluates training steps against sampled tool poses
pub struct PoseEvaluationEngine<P: PoseSource, G: GeometryStore> {
    poses: P,
    geometry: G,
    tools: ToolSet,
    /// Vertical reference direction, in the anatomical frame
    vertical: Vector3<f64>,
    search_radius: Option<f64>,
}

impl<P: PoseSource, G: GeometryStore> PoseEvaluationEngine<P, G> {
    pub fn new(poses: P, geometry: G, tools: ToolSet) -> Self {
        Self {
            poses,
            geometry,
            tools,
            vertical: Vector3::z(),
            search_radius: None,
        }
    }

    /// Reference direction for initial placement (default `+z`)
    pub fn with_vertical(mut self, vertical: Vector3<f64>) -> Self {
        self.vertical = vertical;
        self
    }

    /// Limit surface queries to points within `radius` of the surface
    pub fn with_surface_search_radius(mut self, radius: Option<f64>) -> Self {
        self.search_radius = radius;
        self
    }

    pub fn pose_source(&self) -> &P {
        &self.poses
    }

    pub fn pose_source_mut(&mut self) -> &mut P {
        &mut self.poses
    }

    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Evaluate `step` against the tool poses sampled at `at`
    ///
    /// Every input is resolved before any check runs; all sub-checks then
    /// run so the result lists every violation, not just the first.
    pub fn evaluate_step(
        &self,
        step: &StepDefinition,
        at: DateTime<Utc>,
    ) -> Result<EvaluationResult, EvaluationError> {
        step.check.validate()?;

        let anatomy = self.geometry.anatomy_pose();
        let mut outcome = Outcome::new();

        match &step.check {
            StepCheck::Arrangement { margin_mm } => {
                let (left_geo, left) = self.tool_in_anatomy(&ToolId::forceps(Side::Left), at, &anatomy)?;
                let (right_geo, right) = self.tool_in_anatomy(&ToolId::forceps(Side::Right), at, &anatomy)?;
                self.arrangement(left_geo, &left, right_geo, &right, *margin_mm, &mut outcome)?;
            }
            StepCheck::Presentation {
                angle_margin_deg,
                vertical_margin_mm,
                ideal_left,
                ideal_right,
            } => {
                let (left_geo, left) = self.tool_in_anatomy(&ToolId::forceps(Side::Left), at, &anatomy)?;
                let (right_geo, right) = self.tool_in_anatomy(&ToolId::forceps(Side::Right), at, &anatomy)?;
                let ideal_left = self.landmark(ideal_left)?;
                let ideal_right = self.landmark(ideal_right)?;

                let left_points = left_geo.fiducials_at(&left);
                let right_points = right_geo.fiducials_at(&right);
                check_paired(&left_points, &right_points)?;

                // Vertical order of the blades
                let mut max_rise = f64::NEG_INFINITY;
                for (l, r) in pairs_but_last(&left_points, &right_points) {
                    let rise = l.z - r.z;
                    max_rise = max_rise.max(rise);
                    if rise >= *vertical_margin_mm {
                        outcome.violation("FORCEPS UPSIDE DOWN");
                    }
                }
                if max_rise.is_finite() {
                    outcome.measure("vertical_offset_mm", max_rise);
                }

                for (side, points, ideal) in [
                    (Side::Left, &left_points, ideal_left),
                    (Side::Right, &right_points, ideal_right),
                ] {
                    self.rotation(side, points, ideal, *angle_margin_deg, &mut outcome)?;
                }
            }
            StepCheck::InitialPlacement {
                side,
                angle_margin_deg,
                distance_margin_mm,
                surface,
            } => {
                let (geo, pose) = self.tool_in_anatomy(&ToolId::forceps(*side), at, &anatomy)?;
                let surface = self.surface(surface)?;

                match check_angle(&pose, geo, &self.vertical, *angle_margin_deg) {
                    Ok(angle) => {
                        outcome.measure("angle_to_vertical_deg", angle.angle_deg);
                        if !angle.within_margin {
                            outcome.violation("INCORRECT ANGLE");
                        }
                    }
                    Err(EvaluationError::NotFound(reason)) => {
                        outcome.inconclusive("angle_to_vertical", &reason)
                    }
                    Err(e) => return Err(e),
                }

                let tip = pose.transform_point(&geo.tip());
                match check_point_to_surface_distance(&tip, surface, self.search_radius) {
                    SurfaceDistance::Found { distance, .. } => {
                        outcome.measure("tip_to_fetus_mm", distance);
                        if distance > *distance_margin_mm {
                            outcome.violation("TIP TOO FAR FROM FETUS");
                        }
                    }
                    SurfaceDistance::NotFound(reason) => outcome.inconclusive("tip_to_fetus", reason),
                }
            }
            StepCheck::FinalPlacement {
                side,
                cheek_margin_mm,
                eye,
                ear,
                surface,
                ..
            } => {
                let (geo, pose) = self.tool_in_anatomy(&ToolId::forceps(*side), at, &anatomy)?;
                let eye = self.landmark(eye)?;
                let ear = self.landmark(ear)?;
                let surface = self.surface(surface)?;
                let band = step.check.eye_ear_band()?.ok_or_else(|| {
                    EvaluationError::MissingInput(format!("distance band for step {}", step.id))
                })?;

                let tip = pose.transform_point(&geo.tip());

                let to_eye = check_distance_band(&tip, &eye.point(), &band);
                outcome.measure("tip_to_eye_mm", to_eye.distance);
                match to_eye.class {
                    BandClass::TooClose => outcome.violation("TOO CLOSE TO EYE"),
                    BandClass::TooFar => outcome.violation("TOO FAR FROM EYE"),
                    BandClass::Within => {}
                }

                let to_ear = check_distance_band(&tip, &ear.point(), &band);
                outcome.measure("tip_to_ear_mm", to_ear.distance);
                match to_ear.class {
                    BandClass::TooClose => outcome.violation("TOO CLOSE TO EAR"),
                    BandClass::TooFar => outcome.violation("TOO FAR FROM EAR"),
                    BandClass::Within => {}
                }

                match check_point_to_surface_distance(&tip, surface, self.search_radius) {
                    SurfaceDistance::Found { distance, .. } => {
                        outcome.measure("tip_to_cheek_mm", distance);
                        if distance > *cheek_margin_mm {
                            outcome.violation("TOO FAR FROM CHEEKS");
                        }
                    }
                    SurfaceDistance::NotFound(reason) => outcome.inconclusive("tip_to_cheek", reason),
                }
            }
        }

        let result = outcome.into_result(step.id);
        debug!(
            step = %step.id,
            verdict = %result.verdict,
            violations = result.violations.len(),
            inconclusive = result.inconclusive.len(),
            "Evaluated step"
        );
        Ok(result)
    }

    /// Tool geometry and its pose expressed in the anatomical frame
    fn tool_in_anatomy(
        &self,
        id: &ToolId,
        at: DateTime<Utc>,
        anatomy: &Pose,
    ) -> Result<(&ToolGeometry, Pose), EvaluationError> {
        let geometry = self
            .tools
            .get(id)
            .ok_or_else(|| EvaluationError::MissingInput(format!("geometry of tool {}", id)))?;
        let pose = self
            .poses
            .sample_tool_pose(id, at)
            .filter(|p| p.is_finite())
            .ok_or_else(|| EvaluationError::MissingInput(format!("pose of tool {}", id)))?;
        Ok((geometry, pose.relative_to(anatomy)))
    }

    fn landmark(&self, name: &str) -> Result<&Landmark, EvaluationError> {
        self.geometry
            .landmark(name)
            .ok_or_else(|| EvaluationError::MissingInput(format!("landmark {}", name)))
    }

    fn surface(&self, name: &str) -> Result<&TriangleMesh, EvaluationError> {
        self.geometry
            .surface(name)
            .ok_or_else(|| EvaluationError::MissingInput(format!("surface {}", name)))
    }

    /// Offsets between paired fiducials, measured in the left blade's frame
    fn arrangement(
        &self,
        left_geo: &ToolGeometry,
        left: &Pose,
        right_geo: &ToolGeometry,
        right: &Pose,
        margin: f64,
        outcome: &mut Outcome,
    ) -> Result<(), EvaluationError> {
        let left_points = left_geo.fiducials().to_vec();
        let right_in_left = right.relative_to(left);
        let right_points = right_geo.fiducials_at(&right_in_left);
        check_paired(&left_points, &right_points)?;

        let mut max_forward: f64 = 0.0;
        for (l, r) in left_points.iter().zip(&right_points) {
            let forward = (l.y - r.y).abs();
            max_forward = max_forward.max(forward);
            if forward > margin {
                outcome.violation("HANDLES NOT AT THE SAME LEVEL");
            }
        }
        outcome.measure("forward_offset_mm", max_forward);

        let mut max_lateral: f64 = 0.0;
        for (l, r) in pairs_but_last(&left_points, &right_points) {
            let lateral = (l.x - r.x).abs();
            max_lateral = max_lateral.max(lateral);
            if lateral > margin {
                outcome.violation("FORCEPS NOT CORRECTLY CLOSED");
            }
        }
        outcome.measure("lateral_offset_mm", max_lateral);
        Ok(())
    }

    /// Rotation about the anterior axis from current to ideal placement
    fn rotation(
        &self,
        side: Side,
        current: &[Point3<f64>],
        ideal: &Landmark,
        margin_deg: f64,
        outcome: &mut Outcome,
    ) -> Result<(), EvaluationError> {
        let check_name = format!("{}_rotation", side);
        match rotation_from_ideal(current, ideal.points()) {
            Ok(rotation) => {
                let (_, pitch, _) = rotation.euler_angles();
                let pitch_deg = pitch.to_degrees();
                outcome.measure(&format!("{}_rotation_deg", side), pitch_deg);
                if pitch_deg.abs() > margin_deg {
                    let message = match side {
                        Side::Left => "LEFT FORCEPS ROTATED",
                        Side::Right => "RIGHT FORCEPS ROTATED",
                    };
                    outcome.violation(message);
                }
                Ok(())
            }
            Err(EvaluationError::NotFound(reason)) => {
                outcome.inconclusive(&check_name, &reason);
                Ok(())
            }
            Err(EvaluationError::MissingInput(what)) => Err(EvaluationError::MissingInput(format!(
                "landmark {} for {} blade: {}",
                ideal.name(),
                side,
                what
            ))),
            Err(e) => Err(e),
        }
    }
}

fn check_paired(left: &[Point3<f64>], right: &[Point3<f64>]) -> Result<(), EvaluationError> {
    if left.len() != right.len() {
        return Err(EvaluationError::MissingInput(format!(
            "paired fiducials: left blade has {}, right blade has {}",
            left.len(),
            right.len()
        )));
    }
    Ok(())
}

/// Fiducial pairs excluding the last one (the handle end in the lateral
/// and vertical checks)
fn pairs_but_last<'a>(
    left: &'a [Point3<f64>],
    right: &'a [Point3<f64>],
) -> impl Iterator<Item = (&'a Point3<f64>, &'a Point3<f64>)> {
    let n = left.len().min(right.len()).saturating_sub(1);
    left[..n].iter().zip(&right[..n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::StaticGeometryStore;
    use crate::step::StepTable;
    use crate::tracking::FixedPoseSource;
    use approx::assert_relative_eq;

    /// Blade with tip at +z 100 and handle at the origin, plus two side
    /// fiducials so rotations are defined
    fn blade(name: &str) -> ToolGeometry {
        ToolGeometry::new(
            name,
            vec![
                Point3::new(0.0, 0.0, 100.0),
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(10.0, 0.0, 50.0),
                Point3::new(0.0, 10.0, 50.0),
            ],
        )
        .unwrap()
    }

    fn tools() -> ToolSet {
        ToolSet::new()
            .with_tool(ToolId::forceps(Side::Left), blade("forceps_left"))
            .with_tool(ToolId::forceps(Side::Right), blade("forceps_right"))
    }

    fn head() -> TriangleMesh {
        TriangleMesh::disc(Point3::new(0.0, 0.0, 130.0), Vector3::z(), 50.0, 32)
    }

    fn geometry() -> StaticGeometryStore {
        let ideal: Vec<_> = blade("ideal").fiducials().to_vec();
        StaticGeometryStore::new()
            .with_surface("head_surface", head())
            .with_landmark(Landmark::single("eye_left", Point3::new(15.0, 0.0, 100.0)).unwrap())
            .with_landmark(Landmark::single("ear_left", Point3::new(0.0, 15.0, 100.0)).unwrap())
            .with_landmark(Landmark::single("eye_right", Point3::new(-15.0, 0.0, 100.0)).unwrap())
            .with_landmark(Landmark::single("ear_right", Point3::new(0.0, -15.0, 100.0)).unwrap())
            .with_landmark(Landmark::new("ideal_forceps_left", ideal.clone()).unwrap())
            .with_landmark(Landmark::new("ideal_forceps_right", ideal).unwrap())
    }

    fn final_left(low: f64, high: f64) -> StepDefinition {
        StepDefinition {
            id: StepId::FinalPlacementLeft,
            title: "Final Placement Left".to_string(),
            instruction: String::new(),
            label_model: None,
            check: StepCheck::FinalPlacement {
                side: Side::Left,
                distance_margin_mm: low,
                far_margin_mm: Some(high),
                cheek_margin_mm: 50.0,
                eye: "eye_left".to_string(),
                ear: "ear_left".to_string(),
                surface: "head_surface".to_string(),
            },
        }
    }

    fn engine(poses: FixedPoseSource) -> PoseEvaluationEngine<FixedPoseSource, StaticGeometryStore> {
        PoseEvaluationEngine::new(poses, geometry(), tools())
    }

    fn table_step(id: StepId) -> StepDefinition {
        StepTable::forceps_delivery().get(id).unwrap().clone()
    }

    #[test]
    fn test_eye_band_scenarios() {
        let now = Utc::now();
        // Eye sits 15mm from the tip at identity; move the blade along x to
        // set the tip-to-eye distance, keeping the ear inside the band
        let cases = [
            (7.0, Some("TOO CLOSE TO EYE")),
            (-10.0, Some("TOO FAR FROM EYE")),
            (0.0, None),
        ];
        for (dx, expected) in cases {
            let poses = FixedPoseSource::new()
                .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(dx, 0.0, 0.0));
            let engine = engine(poses);
            let result = engine.evaluate_step(&final_left(10.0, 20.0), now).unwrap();

            let eye_messages: Vec<_> = result
                .violations
                .iter()
                .filter(|v| v.contains("EYE"))
                .cloned()
                .collect();
            match expected {
                Some(message) => assert_eq!(eye_messages, vec![message.to_string()], "dx {}", dx),
                None => assert!(eye_messages.is_empty(), "dx {}: {:?}", dx, eye_messages),
            }
        }
    }

    #[test]
    fn test_eye_distance_exact_values() {
        let now = Utc::now();
        let poses = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(7.0, 0.0, 0.0));
        let result = engine(poses).evaluate_step(&final_left(10.0, 20.0), now).unwrap();
        assert_relative_eq!(result.measurement("tip_to_eye_mm").unwrap(), 8.0, epsilon = 1e-9);
        assert_eq!(result.verdict, Verdict::Fail);
        assert!(!result.within_margin());
    }

    #[test]
    fn test_all_pass_has_no_messages() {
        let now = Utc::now();
        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Left), Pose::identity());
        let result = engine(poses).evaluate_step(&final_left(10.0, 20.0), now).unwrap();

        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.within_margin());
        assert!(result.violations.is_empty());
        assert!(result.message().is_empty());
        assert_relative_eq!(result.measurement("tip_to_cheek_mm").unwrap(), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let now = Utc::now();
        let poses = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_xyz_rpy(3.0, -4.0, 1.0, 0.2, 0.1, 0.0))
            .with_pose(ToolId::forceps(Side::Right), Pose::from_translation(30.0, 2.0, 0.0));
        let engine = engine(poses);

        for id in [
            StepId::Arrangement,
            StepId::Presentation,
            StepId::InitialPlacementLeft,
            StepId::FinalPlacementLeft,
        ] {
            let step = table_step(id);
            let first = engine.evaluate_step(&step, now).unwrap();
            let second = engine.evaluate_step(&step, now).unwrap();
            assert_eq!(first, second, "step {}", id);
        }
    }

    #[test]
    fn test_missing_inputs() {
        let now = Utc::now();
        let engine = engine(FixedPoseSource::new());
        assert!(matches!(
            engine.evaluate_step(&table_step(StepId::InitialPlacementLeft), now),
            Err(EvaluationError::MissingInput(_))
        ));

        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Right), Pose::identity());
        let engine = PoseEvaluationEngine::new(poses, StaticGeometryStore::new(), tools());
        // Right blade is tracked but eye, ear and surface are absent
        assert!(matches!(
            engine.evaluate_step(&table_step(StepId::FinalPlacementRight), now),
            Err(EvaluationError::MissingInput(_))
        ));
    }

    #[test]
    fn test_invalid_margin_is_rejected() {
        let now = Utc::now();
        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Left), Pose::identity());
        let step = final_left(20.0, 10.0);
        assert!(matches!(
            engine(poses).evaluate_step(&step, now),
            Err(EvaluationError::InvalidMargin { .. })
        ));
    }

    #[test]
    fn test_initial_placement() {
        let now = Utc::now();
        let step = table_step(StepId::InitialPlacementLeft);

        // Upright, tip 30mm below the head surface
        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Left), Pose::identity());
        let result = engine(poses).evaluate_step(&step, now).unwrap();
        assert_eq!(result.violations, vec!["TIP TOO FAR FROM FETUS".to_string()]);

        // Raised so the tip touches the surface
        let poses = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(0.0, 0.0, 30.0));
        let result = engine(poses).evaluate_step(&step, now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.measurement("tip_to_fetus_mm").unwrap() < 1e-6);

        // Tilted 20 degrees and touching: only the angle fails
        let tilt = 20f64.to_radians();
        let tilted = Pose::from_xyz_rpy(100.0 * tilt.sin(), 0.0, 130.0 - 100.0 * tilt.cos(), 0.0, -tilt, 0.0);
        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Left), tilted);
        let result = engine(poses).evaluate_step(&step, now).unwrap();
        assert_eq!(result.violations, vec!["INCORRECT ANGLE".to_string()]);
        assert_relative_eq!(result.measurement("angle_to_vertical_deg").unwrap(), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_right_blade_placement() {
        let now = Utc::now();
        let right = ToolId::forceps(Side::Right);

        // Only the right blade is tracked
        let initial = table_step(StepId::InitialPlacementRight);
        let poses = FixedPoseSource::new().with_pose(right.clone(), Pose::identity());
        let result = engine(poses).evaluate_step(&initial, now).unwrap();
        assert_eq!(result.violations, vec!["TIP TOO FAR FROM FETUS".to_string()]);

        let poses = FixedPoseSource::new().with_pose(right.clone(), Pose::from_translation(0.0, 0.0, 30.0));
        let result = engine(poses).evaluate_step(&initial, now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);

        let final_right = StepDefinition {
            id: StepId::FinalPlacementRight,
            title: "Final Placement Right".to_string(),
            instruction: String::new(),
            label_model: None,
            check: StepCheck::FinalPlacement {
                side: Side::Right,
                distance_margin_mm: 10.0,
                far_margin_mm: Some(20.0),
                cheek_margin_mm: 50.0,
                eye: "eye_right".to_string(),
                ear: "ear_right".to_string(),
                surface: "head_surface".to_string(),
            },
        };
        let poses = FixedPoseSource::new().with_pose(right.clone(), Pose::identity());
        let result = engine(poses).evaluate_step(&final_right, now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);

        // Toward the right eye, which sits on -x
        let poses = FixedPoseSource::new().with_pose(right, Pose::from_translation(-7.0, 0.0, 0.0));
        let result = engine(poses).evaluate_step(&final_right, now).unwrap();
        assert_eq!(result.violations, vec!["TOO CLOSE TO EYE".to_string()]);
        assert_relative_eq!(result.measurement("tip_to_eye_mm").unwrap(), 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_surface_not_found_is_inconclusive() {
        let now = Utc::now();
        let poses = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(0.0, 0.0, -500.0));
        let engine = engine(poses).with_surface_search_radius(Some(20.0));

        let result = engine
            .evaluate_step(&table_step(StepId::InitialPlacementLeft), now)
            .unwrap();
        assert_eq!(result.verdict, Verdict::Inconclusive);
        assert_eq!(result.inconclusive, vec!["tip_to_fetus".to_string()]);
        assert!(!result.within_margin());

        // A violation elsewhere still makes the step fail
        let result = engine
            .evaluate_step(&final_left(10.0, 20.0), now)
            .unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.inconclusive, vec!["tip_to_cheek".to_string()]);
    }

    #[test]
    fn test_anatomy_pose_moves_reference_frame() {
        let now = Utc::now();
        let offset = Pose::from_translation(500.0, 0.0, 0.0);
        let geometry = geometry().with_anatomy_pose(offset);
        let poses = FixedPoseSource::new().with_pose(ToolId::forceps(Side::Left), offset);
        let engine = PoseEvaluationEngine::new(poses, geometry, tools());

        let result = engine.evaluate_step(&final_left(10.0, 20.0), now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
    }

    #[test]
    fn test_arrangement() {
        let now = Utc::now();
        let step = table_step(StepId::Arrangement);

        let together = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::identity())
            .with_pose(ToolId::forceps(Side::Right), Pose::from_translation(3.0, 2.0, 0.0));
        let result = engine(together).evaluate_step(&step, now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);

        let apart = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::identity())
            .with_pose(ToolId::forceps(Side::Right), Pose::from_translation(20.0, 8.0, 0.0));
        let result = engine(apart).evaluate_step(&step, now).unwrap();
        assert_eq!(
            result.violations,
            vec![
                "HANDLES NOT AT THE SAME LEVEL".to_string(),
                "FORCEPS NOT CORRECTLY CLOSED".to_string(),
            ]
        );
        assert_relative_eq!(result.measurement("forward_offset_mm").unwrap(), 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_presentation() {
        let now = Utc::now();
        let step = table_step(StepId::Presentation);

        // Left blade sits lower than the right one and both match their ideals
        let upright = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(0.0, 0.0, -5.0))
            .with_pose(ToolId::forceps(Side::Right), Pose::identity());
        let result = engine(upright).evaluate_step(&step, now).unwrap();
        assert_eq!(result.verdict, Verdict::Pass, "{:?}", result.violations);

        // Left blade above the right one, right blade pitched 40 degrees
        let flipped = FixedPoseSource::new()
            .with_pose(ToolId::forceps(Side::Left), Pose::from_translation(0.0, 0.0, 5.0))
            .with_pose(
                ToolId::forceps(Side::Right),
                Pose::from_xyz_rpy(0.0, 0.0, 0.0, 0.0, 40f64.to_radians(), 0.0),
            );
        let result = engine(flipped).evaluate_step(&step, now).unwrap();
        assert!(result.violations.contains(&"FORCEPS UPSIDE DOWN".to_string()));
        assert!(result.violations.contains(&"RIGHT FORCEPS ROTATED".to_string()));
        assert!(!result.violations.contains(&"LEFT FORCEPS ROTATED".to_string()));
    }
}
