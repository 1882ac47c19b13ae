//! Forceps Scene - scene graph and assets for forceps delivery training
//!
//! Stands in for the host application's scene: named nodes with display
//! state, STL model loading, and the asset manifest describing the
//! anatomy, landmarks and tracked tools of a session.

pub mod manifest;
pub mod scene;
pub mod stl;

pub use manifest::{sha256_hex, AssetManifest, LandmarkEntry, ManifestError, ModelEntry, ToolEntry};
pub use scene::{
    feedback_color, Color, Display, Node, NodeId, NodeKind, Scene, SceneError, SceneGeometry,
    ANATOMY_NODE, FAIL_COLOR, NEUTRAL_COLOR, PASS_COLOR, SKIN_COLOR,
};
pub use stl::{load_stl, parse_stl, StlError};
