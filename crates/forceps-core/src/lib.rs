//! Forceps Core - Pose evaluation for forceps delivery training
//!
//! This crate provides the evaluation side of the forceps delivery exercise:
//! - Rigid poses for tracked tools and the anatomical reference frame
//! - Triangle meshes and landmark storage for anatomical reference geometry
//! - Geometric checks (angles, distance bands, point-to-surface distance)
//! - The pose evaluation engine that classifies a training step
//! - A table-driven step sequencer gating evaluation on start/stop/next

pub mod checks;
pub mod engine;
pub mod landmark;
pub mod mesh;
pub mod pose;
pub mod sequencer;
pub mod step;
pub mod tool;
pub mod tracking;

pub use checks::{
    angle_between, check_angle, check_distance_band, check_point_to_surface_distance,
    classify_band, rotation_from_ideal, AngleCheck, BandCheck, BandClass, DistanceBand,
    SurfaceDistance,
};
pub use engine::{EvaluationError, EvaluationResult, Measurement, PoseEvaluationEngine, Verdict};
pub use landmark::{GeometryStore, Landmark, LandmarkError, StaticGeometryStore};
pub use mesh::{Aabb, MeshError, TriangleMesh};
pub use pose::{parse_pose_string, EulerRecord, MatrixRecord, Pose, PoseError, PoseRecord};
pub use sequencer::{Controls, SequencerError, SequencerOptions, SequencerState, StepSequencer};
pub use step::{StepCheck, StepDefinition, StepError, StepId, StepTable, Tolerance};
pub use tool::{Side, ToolError, ToolGeometry, ToolId, ToolSet};
pub use tracking::{FixedPoseSource, PoseSample, PoseSource, RecordedPoseSource};
