//! Scene graph - named models, landmark sets and transforms with display state
//!
//! Nodes are looked up by name. `lookup_or_create` replaces the
//! get-or-fail-then-create pattern with one explicit call.

use forceps_core::engine::Verdict;
use forceps_core::landmark::{GeometryStore, Landmark};
use forceps_core::mesh::TriangleMesh;
use forceps_core::pose::Pose;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// RGB color, components in `[0, 1]`
pub type Color = [f32; 3];

/// Placement within margin
pub const PASS_COLOR: Color = [0.0, 1.0, 0.0];
/// Placement out of margin
pub const FAIL_COLOR: Color = [1.0, 0.0, 0.0];
/// Idle tools, stopped steps and inconclusive evaluations
pub const NEUTRAL_COLOR: Color = [0.8, 0.8, 0.8];
/// Fetal and maternal skin
pub const SKIN_COLOR: Color = [1.0, 0.68, 0.62];

/// Name of the transform node placing the anatomical frame in tracking space
pub const ANATOMY_NODE: &str = "anatomy";

/// Color a tool model takes for an evaluation verdict
pub fn feedback_color(verdict: Verdict) -> Color {
    match verdict {
        Verdict::Pass => PASS_COLOR,
        Verdict::Fail => FAIL_COLOR,
        Verdict::Inconclusive => NEUTRAL_COLOR,
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("Node {0} already exists")]
    DuplicateNode(String),
    #[error("Unknown node id {0}")]
    UnknownNode(NodeId),
    #[error("Node {0} is not a transform")]
    NotATransform(String),
}

/// Handle of a node in a `Scene`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Model(Arc<TriangleMesh>),
    Landmarks(Arc<Landmark>),
    Transform(Pose),
}

/// Display state of a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Display {
    pub color: Color,
    pub visible: bool,
    pub opacity: f32,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            color: NEUTRAL_COLOR,
            visible: true,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub display: Display,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; names are unique
    pub fn add(&mut self, name: &str, kind: NodeKind) -> Result<NodeId, SceneError> {
        if self.by_name.contains_key(name) {
            return Err(SceneError::DuplicateNode(name.to_string()));
        }
        Ok(self.insert(name, kind))
    }

    fn insert(&mut self, name: &str, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            display: Display::default(),
        });
        self.by_name.insert(name.to_string(), id);
        debug!(node = name, id = %id, "Added scene node");
        id
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Existing node named `name`, or a new one built by `make`
    pub fn lookup_or_create(&mut self, name: &str, make: impl FnOnce() -> NodeKind) -> NodeId {
        match self.lookup(name) {
            Some(id) => id,
            None => self.insert(name, make()),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.lookup(name).and_then(|id| self.node(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, SceneError> {
        self.nodes.get_mut(id.0).ok_or(SceneError::UnknownNode(id))
    }

    pub fn set_color(&mut self, id: NodeId, color: Color) -> Result<(), SceneError> {
        self.node_mut(id)?.display.color = color;
        Ok(())
    }

    pub fn set_visibility(&mut self, id: NodeId, visible: bool) -> Result<(), SceneError> {
        self.node_mut(id)?.display.visible = visible;
        Ok(())
    }

    pub fn set_opacity(&mut self, id: NodeId, opacity: f32) -> Result<(), SceneError> {
        self.node_mut(id)?.display.opacity = opacity.clamp(0.0, 1.0);
        Ok(())
    }

    /// Replace the pose of a transform node
    pub fn set_transform(&mut self, id: NodeId, pose: Pose) -> Result<(), SceneError> {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::Transform(current) => {
                *current = pose;
                Ok(())
            }
            _ => Err(SceneError::NotATransform(node.name.clone())),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of the reference geometry for evaluation
    ///
    /// Shares mesh and landmark data with the scene. The anatomy pose comes
    /// from the `anatomy` transform node, identity if there is none.
    pub fn geometry_store(&self) -> SceneGeometry {
        let mut surfaces = HashMap::new();
        let mut landmarks = HashMap::new();
        let mut anatomy_pose = Pose::identity();

        for node in &self.nodes {
            match &node.kind {
                NodeKind::Model(mesh) => {
                    surfaces.insert(node.name.clone(), Arc::clone(mesh));
                }
                NodeKind::Landmarks(landmark) => {
                    landmarks.insert(node.name.clone(), Arc::clone(landmark));
                }
                NodeKind::Transform(pose) if node.name == ANATOMY_NODE => {
                    anatomy_pose = *pose;
                }
                NodeKind::Transform(_) => {}
            }
        }

        SceneGeometry {
            surfaces,
            landmarks,
            anatomy_pose,
        }
    }
}

/// Reference geometry taken from a `Scene`
#[derive(Debug, Clone)]
pub struct SceneGeometry {
    surfaces: HashMap<String, Arc<TriangleMesh>>,
    landmarks: HashMap<String, Arc<Landmark>>,
    anatomy_pose: Pose,
}

impl GeometryStore for SceneGeometry {
    fn landmark(&self, name: &str) -> Option<&Landmark> {
        self.landmarks.get(name).map(|l| l.as_ref())
    }

    fn surface(&self, name: &str) -> Option<&TriangleMesh> {
        self.surfaces.get(name).map(|m| m.as_ref())
    }

    fn anatomy_pose(&self) -> Pose {
        self.anatomy_pose
    }
}
