//! Asset manifest - models, landmarks and tools making up a training scene
//!
//! ```toml
//! version = "1.0"
//! anatomy_pose = "0 0 0 0 0 0"
//!
//! [[model]]
//! name = "head_surface"
//! file = "models/baby_head.stl"
//! sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! color = [1.0, 0.68, 0.62]
//!
//! [[landmark]]
//! name = "eye_left"
//! points = [[32.0, -41.5, 12.0]]
//!
//! [[tool]]
//! name = "forceps_left"
//! model = "forceps_left_model"
//! fiducials = [[0.0, 0.0, 120.0], [0.0, 0.0, 0.0], [8.0, 0.0, 60.0]]
//! ```
//!
//! Model paths are relative to the manifest's directory.

use forceps_core::landmark::{Landmark, LandmarkError};
use forceps_core::pose::{parse_pose_string, PoseError};
use forceps_core::tool::{ToolError, ToolGeometry, ToolId, ToolSet};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::scene::{Color, NodeKind, Scene, SceneError, ANATOMY_NODE, NEUTRAL_COLOR};
use crate::stl::{parse_stl, StlError};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read asset manifest: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse asset manifest: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize asset manifest: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Failed to read model {path}: {source}")]
    ModelRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to load model {name}: {source}")]
    Model {
        name: String,
        #[source]
        source: StlError,
    },
    #[error("SHA mismatch for {name}: expected {expected}, got {actual}")]
    ShaMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("Invalid anatomy pose: {0}")]
    Pose(#[from] PoseError),
    #[error("Invalid landmark: {0}")]
    Landmark(#[from] LandmarkError),
    #[error("Invalid tool: {0}")]
    Tool(#[from] ToolError),
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
    #[error("Asset {0} is defined more than once")]
    DuplicateAsset(String),
}

/// A surface or label model loaded from STL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    /// STL file, relative to the manifest directory
    pub file: String,
    /// Expected SHA256 of the file, checked on load when present
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_color")]
    pub color: Color,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_color() -> Color {
    NEUTRAL_COLOR
}

fn default_true() -> bool {
    true
}

/// A named point set in the anatomical frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkEntry {
    pub name: String,
    pub points: Vec<[f64; 3]>,
}

/// A tracked tool and its fiducials in tool frame (tip first, then handle)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    /// Scene model recolored with evaluation feedback
    #[serde(default)]
    pub model: Option<String>,
    pub fiducials: Vec<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(default = "default_version")]
    pub version: String,
    /// Anatomical frame in tracking space, "x y z roll pitch yaw"
    #[serde(default = "default_anatomy_pose")]
    pub anatomy_pose: String,
    #[serde(default)]
    pub model: Vec<ModelEntry>,
    #[serde(default)]
    pub landmark: Vec<LandmarkEntry>,
    #[serde(default)]
    pub tool: Vec<ToolEntry>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_anatomy_pose() -> String {
    "0 0 0 0 0 0".to_string()
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            version: default_version(),
            anatomy_pose: default_anatomy_pose(),
            model: Vec::new(),
            landmark: Vec::new(),
            tool: Vec::new(),
        }
    }
}

impl AssetManifest {
    /// Load a manifest from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load a manifest from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ManifestError> {
        let manifest: AssetManifest = toml::from_str(content)?;
        manifest.check_unique_names()?;
        Ok(manifest)
    }

    /// Save the manifest to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn check_unique_names(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        let names = self
            .model
            .iter()
            .map(|m| &m.name)
            .chain(self.landmark.iter().map(|l| &l.name))
            .chain(self.tool.iter().map(|t| &t.name));
        for name in names {
            if !seen.insert(name) {
                return Err(ManifestError::DuplicateAsset(name.clone()));
            }
        }
        Ok(())
    }

    /// Build the scene: load and verify every model, add landmarks and the
    /// anatomy transform
    pub fn load_scene(&self, base_dir: &Path) -> Result<Scene, ManifestError> {
        let mut scene = Scene::new();

        let anatomy = parse_pose_string(&self.anatomy_pose)?;
        scene.add(ANATOMY_NODE, NodeKind::Transform(anatomy))?;

        for entry in &self.model {
            let mesh = load_model(entry, base_dir)?;
            debug!(model = %entry.name, faces = mesh.face_count(), "Loaded model");
            let id = scene.add(&entry.name, NodeKind::Model(Arc::new(mesh)))?;
            scene.set_color(id, entry.color)?;
            scene.set_visibility(id, entry.visible)?;
        }

        for entry in &self.landmark {
            let landmark = Landmark::new(entry.name.clone(), to_points(&entry.points))?;
            scene.add(&entry.name, NodeKind::Landmarks(Arc::new(landmark)))?;
        }

        info!(
            models = self.model.len(),
            landmarks = self.landmark.len(),
            "Scene loaded"
        );
        Ok(scene)
    }

    /// Tool geometry for every tool entry
    pub fn tool_set(&self) -> Result<ToolSet, ManifestError> {
        let mut tools = ToolSet::new();
        for entry in &self.tool {
            let geometry = ToolGeometry::new(&entry.name, to_points(&entry.fiducials))?;
            tools.insert(ToolId::new(&entry.name), geometry);
        }
        Ok(tools)
    }

    /// Scene model recolored for a tool, if any
    pub fn tool_model(&self, tool: &ToolId) -> Option<&str> {
        self.tool
            .iter()
            .find(|t| t.name == tool.as_str())
            .and_then(|t| t.model.as_deref())
    }
}

fn to_points(coords: &[[f64; 3]]) -> Vec<Point3<f64>> {
    coords.iter().map(|c| Point3::new(c[0], c[1], c[2])).collect()
}

fn load_model(
    entry: &ModelEntry,
    base_dir: &Path,
) -> Result<forceps_core::mesh::TriangleMesh, ManifestError> {
    let path = base_dir.join(&entry.file);
    let data = std::fs::read(&path).map_err(|source| ManifestError::ModelRead {
        path: path.clone(),
        source,
    })?;

    if let Some(expected) = &entry.sha256 {
        let actual = sha256_hex(&data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ManifestError::ShaMismatch {
                name: entry.name.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    parse_stl(&data).map_err(|source| ManifestError::Model {
        name: entry.name.clone(),
        source,
    })
}

/// Compute SHA256 hash of data as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
