//! Anatomical landmarks and the reference geometry store interface

use nalgebra::Point3;
use std::collections::HashMap;
use thiserror::Error;

use crate::mesh::TriangleMesh;
use crate::pose::Pose;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandmarkError {
    #[error("Landmark {0} has no points")]
    Empty(String),
    #[error("Landmark {0} has a non-finite point")]
    NonFinite(String),
}

/// Named point set in the anatomical reference frame
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    name: String,
    points: Vec<Point3<f64>>,
}

impl Landmark {
    pub fn new(name: impl Into<String>, points: Vec<Point3<f64>>) -> Result<Self, LandmarkError> {
        let name = name.into();
        if points.is_empty() {
            return Err(LandmarkError::Empty(name));
        }
        if points.iter().any(|p| !p.coords.iter().all(|c| c.is_finite())) {
            return Err(LandmarkError::NonFinite(name));
        }
        Ok(Self { name, points })
    }

    pub fn single(name: impl Into<String>, point: Point3<f64>) -> Result<Self, LandmarkError> {
        Self::new(name, vec![point])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First (or only) point of the landmark
    pub fn point(&self) -> Point3<f64> {
        self.points[0]
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }
}

/// Read-only source of reference geometry for evaluation
///
/// Landmarks and surfaces are expressed in the anatomical frame;
/// `anatomy_pose` places that frame in tracking space.
pub trait GeometryStore {
    fn landmark(&self, name: &str) -> Option<&Landmark>;

    fn surface(&self, name: &str) -> Option<&TriangleMesh>;

    /// Anatomical frame to tracking space
    fn anatomy_pose(&self) -> Pose;
}

/// In-memory geometry store for synthetic anatomy
#[derive(Debug, Clone, Default)]
pub struct StaticGeometryStore {
    landmarks: HashMap<String, Landmark>,
    surfaces: HashMap<String, TriangleMesh>,
    anatomy_pose: Pose,
}

impl StaticGeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_landmark(mut self, landmark: Landmark) -> Self {
        self.landmarks.insert(landmark.name().to_string(), landmark);
        self
    }

    pub fn with_surface(mut self, name: impl Into<String>, mesh: TriangleMesh) -> Self {
        self.surfaces.insert(name.into(), mesh);
        self
    }

    pub fn with_anatomy_pose(mut self, pose: Pose) -> Self {
        self.anatomy_pose = pose;
        self
    }
}

impl GeometryStore for StaticGeometryStore {
    fn landmark(&self, name: &str) -> Option<&Landmark> {
        self.landmarks.get(name)
    }

    fn surface(&self, name: &str) -> Option<&TriangleMesh> {
        self.surfaces.get(name)
    }

    fn anatomy_pose(&self) -> Pose {
        self.anatomy_pose
    }
}
