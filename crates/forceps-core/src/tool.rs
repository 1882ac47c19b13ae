//! Tracked tools and their fiducial geometry

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::pose::Pose;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool {0} needs at least two fiducials (tip and handle)")]
    TooFewFiducials(String),
    #[error("Tool {0} has coincident tip and handle fiducials")]
    DegenerateAxis(String),
}

/// Identifier of a tracked tool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(pub String);

impl ToolId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Conventional id of the forceps blade held on `side`
    pub fn forceps(side: Side) -> Self {
        match side {
            Side::Left => Self::new("forceps_left"),
            Side::Right => Self::new("forceps_right"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of the fetal head a blade is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Fiducials of a tool in its own frame
///
/// Fiducial 0 is the tip, fiducial 1 the handle reference. The long axis
/// points from handle to tip.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolGeometry {
    fiducials: Vec<Point3<f64>>,
}

impl ToolGeometry {
    pub fn new(name: &str, fiducials: Vec<Point3<f64>>) -> Result<Self, ToolError> {
        if fiducials.len() < 2 {
            return Err(ToolError::TooFewFiducials(name.to_string()));
        }
        if (fiducials[0] - fiducials[1]).norm() < f64::EPSILON {
            return Err(ToolError::DegenerateAxis(name.to_string()));
        }
        Ok(Self { fiducials })
    }

    pub fn tip(&self) -> Point3<f64> {
        self.fiducials[0]
    }

    pub fn handle(&self) -> Point3<f64> {
        self.fiducials[1]
    }

    /// Unit vector from handle to tip, in tool frame
    pub fn long_axis(&self) -> Vector3<f64> {
        (self.tip() - self.handle()).normalize()
    }

    pub fn fiducials(&self) -> &[Point3<f64>] {
        &self.fiducials
    }

    /// Fiducials mapped through `pose`
    pub fn fiducials_at(&self, pose: &Pose) -> Vec<Point3<f64>> {
        self.fiducials.iter().map(|f| pose.transform_point(f)).collect()
    }
}

/// Geometry for every tracked tool in a session
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: HashMap<ToolId, ToolGeometry>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ToolId, geometry: ToolGeometry) {
        self.tools.insert(id, geometry);
    }

    pub fn with_tool(mut self, id: ToolId, geometry: ToolGeometry) -> Self {
        self.insert(id, geometry);
        self
    }

    pub fn get(&self, id: &ToolId) -> Option<&ToolGeometry> {
        self.tools.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ToolId> {
        self.tools.keys()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
