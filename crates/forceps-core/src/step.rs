//! Step table - the training phases and the margins each one checks
//!
//! The table is a TOML index:
//!
//! ```toml
//! version = "1.0"
//!
//! [[step]]
//! id = "arrangement"
//! title = "Forceps Arrangement"
//! instruction = "Place forceps together"
//! label_model = "arrangement"
//!
//! [step.check]
//! kind = "arrangement"
//! margin_mm = 5.0
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::checks::{validate_margin, DistanceBand};
use crate::engine::EvaluationError;
use crate::tool::{Side, ToolId};

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Failed to read step table: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse step table: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize step table: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Step {0} is defined more than once")]
    DuplicateStep(StepId),
    #[error("Step table is empty")]
    Empty,
    #[error("Step {step}: {source}")]
    InvalidStep {
        step: StepId,
        #[source]
        source: EvaluationError,
    },
}

/// Named training phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Arrangement,
    Presentation,
    InitialPlacementLeft,
    FinalPlacementLeft,
    InitialPlacementRight,
    FinalPlacementRight,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Arrangement => "arrangement",
            StepId::Presentation => "presentation",
            StepId::InitialPlacementLeft => "initial_placement_left",
            StepId::FinalPlacementLeft => "final_placement_left",
            StepId::InitialPlacementRight => "initial_placement_right",
            StepId::FinalPlacementRight => "final_placement_right",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// System-wide tolerance added on top of every step margin
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// Added to every distance margin (mm)
    #[serde(default)]
    pub extra_distance_mm: f64,
    /// Added to every angle margin (degrees)
    #[serde(default)]
    pub extra_angle_deg: f64,
}

impl Tolerance {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        validate_margin("extra_distance_mm", self.extra_distance_mm)?;
        validate_margin("extra_angle_deg", self.extra_angle_deg)?;
        Ok(())
    }
}

/// Checks a step runs, with their margins and the landmarks they consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepCheck {
    /// Both blades held together: forward and lateral offsets between
    /// paired fiducials in the left blade's frame
    Arrangement {
        #[serde(default = "default_arrangement_margin")]
        margin_mm: f64,
    },
    /// Blades presented in front of the fetal head: upright and not
    /// rotated away from their ideal final placement
    Presentation {
        #[serde(default = "default_presentation_angle")]
        angle_margin_deg: f64,
        #[serde(default)]
        vertical_margin_mm: f64,
        #[serde(default = "default_ideal_left")]
        ideal_left: String,
        #[serde(default = "default_ideal_right")]
        ideal_right: String,
    },
    /// Blade held vertically with its tip against the fetal head
    InitialPlacement {
        side: Side,
        #[serde(default = "default_placement_angle")]
        angle_margin_deg: f64,
        #[serde(default = "default_placement_distance")]
        distance_margin_mm: f64,
        #[serde(default = "default_surface")]
        surface: String,
    },
    /// Blade introduced along the cheek, between eye and ear
    FinalPlacement {
        side: Side,
        #[serde(default = "default_final_distance")]
        distance_margin_mm: f64,
        /// Upper edge of the eye/ear band; twice the distance margin if unset
        #[serde(default)]
        far_margin_mm: Option<f64>,
        #[serde(default = "default_cheek_distance")]
        cheek_margin_mm: f64,
        eye: String,
        ear: String,
        #[serde(default = "default_surface")]
        surface: String,
    },
}

fn default_arrangement_margin() -> f64 {
    5.0
}

fn default_presentation_angle() -> f64 {
    22.5
}

fn default_placement_angle() -> f64 {
    10.0
}

fn default_placement_distance() -> f64 {
    10.0
}

fn default_final_distance() -> f64 {
    30.0
}

fn default_cheek_distance() -> f64 {
    10.0
}

fn default_surface() -> String {
    "head_surface".to_string()
}

fn default_ideal_left() -> String {
    "ideal_forceps_left".to_string()
}

fn default_ideal_right() -> String {
    "ideal_forceps_right".to_string()
}

impl StepCheck {
    /// Tools whose poses this check samples
    pub fn tools(&self) -> Vec<ToolId> {
        match self {
            StepCheck::Arrangement { .. } | StepCheck::Presentation { .. } => {
                vec![ToolId::forceps(Side::Left), ToolId::forceps(Side::Right)]
            }
            StepCheck::InitialPlacement { side, .. } | StepCheck::FinalPlacement { side, .. } => {
                vec![ToolId::forceps(*side)]
            }
        }
    }

    /// Landmark names this check resolves from the geometry store
    pub fn landmarks(&self) -> Vec<&str> {
        match self {
            StepCheck::Arrangement { .. } | StepCheck::InitialPlacement { .. } => Vec::new(),
            StepCheck::Presentation {
                ideal_left,
                ideal_right,
                ..
            } => vec![ideal_left, ideal_right],
            StepCheck::FinalPlacement { eye, ear, .. } => vec![eye, ear],
        }
    }

    /// Surface names this check resolves from the geometry store
    pub fn surfaces(&self) -> Vec<&str> {
        match self {
            StepCheck::InitialPlacement { surface, .. } | StepCheck::FinalPlacement { surface, .. } => {
                vec![surface]
            }
            _ => Vec::new(),
        }
    }

    /// Copy with the system tolerance added to every margin
    pub fn with_tolerance(&self, tolerance: &Tolerance) -> StepCheck {
        let d = tolerance.extra_distance_mm;
        let a = tolerance.extra_angle_deg;
        let mut check = self.clone();
        match &mut check {
            StepCheck::Arrangement { margin_mm } => *margin_mm += d,
            StepCheck::Presentation {
                angle_margin_deg,
                vertical_margin_mm,
                ..
            } => {
                *angle_margin_deg += a;
                *vertical_margin_mm += d;
            }
            StepCheck::InitialPlacement {
                angle_margin_deg,
                distance_margin_mm,
                ..
            } => {
                *angle_margin_deg += a;
                *distance_margin_mm += d;
            }
            StepCheck::FinalPlacement {
                distance_margin_mm,
                far_margin_mm,
                cheek_margin_mm,
                ..
            } => {
                *distance_margin_mm += d;
                if let Some(far) = far_margin_mm {
                    *far += d;
                }
                *cheek_margin_mm += d;
            }
        }
        check
    }

    /// Check that every margin is finite, non-negative and consistent
    pub fn validate(&self) -> Result<(), EvaluationError> {
        match self {
            StepCheck::Arrangement { margin_mm } => {
                validate_margin("margin_mm", *margin_mm)?;
            }
            StepCheck::Presentation {
                angle_margin_deg,
                vertical_margin_mm,
                ..
            } => {
                validate_margin("angle_margin_deg", *angle_margin_deg)?;
                validate_margin("vertical_margin_mm", *vertical_margin_mm)?;
            }
            StepCheck::InitialPlacement {
                angle_margin_deg,
                distance_margin_mm,
                ..
            } => {
                validate_margin("angle_margin_deg", *angle_margin_deg)?;
                validate_margin("distance_margin_mm", *distance_margin_mm)?;
            }
            StepCheck::FinalPlacement { cheek_margin_mm, .. } => {
                validate_margin("cheek_margin_mm", *cheek_margin_mm)?;
                self.eye_ear_band()?;
            }
        }
        Ok(())
    }

    /// Band the eye and ear distances must fall in (final placement only)
    pub fn eye_ear_band(&self) -> Result<Option<DistanceBand>, EvaluationError> {
        match self {
            StepCheck::FinalPlacement {
                distance_margin_mm,
                far_margin_mm,
                ..
            } => {
                let low = validate_margin("distance_margin_mm", *distance_margin_mm)?;
                let high = far_margin_mm.unwrap_or(low * 2.0);
                DistanceBand::new(low, high).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// A named training phase and what it evaluates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    pub title: String,
    /// Instruction shown to the trainee
    #[serde(default)]
    pub instruction: String,
    /// Scene model shown while the step is being evaluated
    #[serde(default)]
    pub label_model: Option<String>,
    pub check: StepCheck,
}

impl StepDefinition {
    pub fn with_tolerance(&self, tolerance: &Tolerance) -> StepDefinition {
        StepDefinition {
            check: self.check.with_tolerance(tolerance),
            ..self.clone()
        }
    }
}

/// Ordered list of training steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTable {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub step: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for StepTable {
    fn default() -> Self {
        Self::forceps_delivery()
    }
}

impl StepTable {
    /// The six-step forceps delivery exercise
    pub fn forceps_delivery() -> Self {
        let placement = |side: Side, id: StepId, title: &str, instruction: &str, label: &str| {
            StepDefinition {
                id,
                title: title.to_string(),
                instruction: instruction.to_string(),
                label_model: Some(label.to_string()),
                check: StepCheck::InitialPlacement {
                    side,
                    angle_margin_deg: default_placement_angle(),
                    distance_margin_mm: default_placement_distance(),
                    surface: default_surface(),
                },
            }
        };
        let final_placement = |side: Side, id: StepId, title: &str, instruction: &str, label: &str| {
            StepDefinition {
                id,
                title: title.to_string(),
                instruction: instruction.to_string(),
                label_model: Some(label.to_string()),
                check: StepCheck::FinalPlacement {
                    side,
                    distance_margin_mm: default_final_distance(),
                    far_margin_mm: None,
                    cheek_margin_mm: default_cheek_distance(),
                    eye: format!("eye_{}", side),
                    ear: format!("ear_{}", side),
                    surface: default_surface(),
                },
            }
        };

        Self {
            version: default_version(),
            step: vec![
                StepDefinition {
                    id: StepId::Arrangement,
                    title: "Forceps Arrangement".to_string(),
                    instruction: "Place forceps together".to_string(),
                    label_model: Some("arrangement".to_string()),
                    check: StepCheck::Arrangement {
                        margin_mm: default_arrangement_margin(),
                    },
                },
                StepDefinition {
                    id: StepId::Presentation,
                    title: "Forceps Presentation".to_string(),
                    instruction: "Present forceps".to_string(),
                    label_model: Some("presentation".to_string()),
                    check: StepCheck::Presentation {
                        angle_margin_deg: default_presentation_angle(),
                        vertical_margin_mm: 0.0,
                        ideal_left: default_ideal_left(),
                        ideal_right: default_ideal_right(),
                    },
                },
                placement(
                    Side::Left,
                    StepId::InitialPlacementLeft,
                    "Initial Placement Left",
                    "Place left forceps vertically",
                    "initialPlacementLeft",
                ),
                final_placement(
                    Side::Left,
                    StepId::FinalPlacementLeft,
                    "Final Placement Left",
                    "Introduce the left forceps",
                    "finalPlacementLeft",
                ),
                placement(
                    Side::Right,
                    StepId::InitialPlacementRight,
                    "Initial Placement Right",
                    "Place right forceps vertically",
                    "initialPlacementRight",
                ),
                final_placement(
                    Side::Right,
                    StepId::FinalPlacementRight,
                    "Final Placement Right",
                    "Introduce the right forceps",
                    "finalPlacementRight",
                ),
            ],
        }
    }

    /// Load a step table from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, StepError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load a step table from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, StepError> {
        let table: StepTable = toml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    /// Save the table to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), StepError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject empty tables, duplicate ids and invalid margins
    pub fn validate(&self) -> Result<(), StepError> {
        if self.step.is_empty() {
            return Err(StepError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &self.step {
            if !seen.insert(step.id) {
                return Err(StepError::DuplicateStep(step.id));
            }
            step.check.validate().map_err(|source| StepError::InvalidStep {
                step: step.id,
                source,
            })?;
        }
        Ok(())
    }

    /// Copy with the system tolerance applied to every step
    pub fn with_tolerance(&self, tolerance: &Tolerance) -> StepTable {
        StepTable {
            version: self.version.clone(),
            step: self.step.iter().map(|s| s.with_tolerance(tolerance)).collect(),
        }
    }

    pub fn get(&self, id: StepId) -> Option<&StepDefinition> {
        self.step.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDefinition> {
        self.step.iter()
    }

    pub fn len(&self) -> usize {
        self.step.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_table_matches_exercise() {
        let table = StepTable::forceps_delivery();
        table.validate().unwrap();

        let ids: Vec<_> = table.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                StepId::Arrangement,
                StepId::Presentation,
                StepId::InitialPlacementLeft,
                StepId::FinalPlacementLeft,
                StepId::InitialPlacementRight,
                StepId::FinalPlacementRight,
            ]
        );

        let final_left = table.get(StepId::FinalPlacementLeft).unwrap();
        let band = final_left.check.eye_ear_band().unwrap().unwrap();
        assert_eq!(band.low(), 30.0);
        assert_eq!(band.high(), 60.0);
        assert_eq!(final_left.check.landmarks(), vec!["eye_left", "ear_left"]);
        assert_eq!(final_left.check.tools(), vec![ToolId::forceps(Side::Left)]);
    }

    #[test]
    fn test_parse_step_table() {
        let toml = r#"
version = "1.0"

[[step]]
id = "arrangement"
title = "Forceps Arrangement"

[step.check]
kind = "arrangement"

[[step]]
id = "final_placement_right"
title = "Final Placement Right"
instruction = "Introduce the right forceps"
label_model = "finalPlacementRight"

[step.check]
kind = "final_placement"
side = "right"
distance_margin_mm = 10.0
far_margin_mm = 20.0
eye = "eye_right"
ear = "ear_right"
"#;

        let table = StepTable::from_toml(toml).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(StepId::Arrangement).unwrap().check,
            StepCheck::Arrangement { margin_mm: 5.0 }
        );

        let step = table.get(StepId::FinalPlacementRight).unwrap();
        match &step.check {
            StepCheck::FinalPlacement {
                side,
                cheek_margin_mm,
                surface,
                ..
            } => {
                assert_eq!(*side, Side::Right);
                assert_eq!(*cheek_margin_mm, 10.0);
                assert_eq!(surface, "head_surface");
            }
            other => panic!("unexpected check {:?}", other),
        }
        let band = step.check.eye_ear_band().unwrap().unwrap();
        assert_eq!((band.low(), band.high()), (10.0, 20.0));
    }

    #[test]
    fn test_rejects_invalid_tables() {
        let inverted = r#"
[[step]]
id = "final_placement_left"
title = "Final"
[step.check]
kind = "final_placement"
side = "left"
distance_margin_mm = 30.0
far_margin_mm = 20.0
eye = "eye_left"
ear = "ear_left"
"#;
        assert!(matches!(
            StepTable::from_toml(inverted),
            Err(StepError::InvalidStep {
                step: StepId::FinalPlacementLeft,
                source: EvaluationError::InvalidMargin { .. }
            })
        ));

        let negative = r#"
[[step]]
id = "arrangement"
title = "Arrangement"
[step.check]
kind = "arrangement"
margin_mm = -1.0
"#;
        assert!(matches!(
            StepTable::from_toml(negative),
            Err(StepError::InvalidStep { .. })
        ));

        let duplicate = r#"
[[step]]
id = "arrangement"
title = "A"
[step.check]
kind = "arrangement"

[[step]]
id = "arrangement"
title = "B"
[step.check]
kind = "arrangement"
"#;
        assert!(matches!(
            StepTable::from_toml(duplicate),
            Err(StepError::DuplicateStep(StepId::Arrangement))
        ));

        assert!(matches!(StepTable::from_toml(""), Err(StepError::Empty)));
    }

    #[test]
    fn test_tolerance_applies_to_all_margins() {
        let tolerance = Tolerance {
            extra_distance_mm: 2.0,
            extra_angle_deg: 5.0,
        };
        let table = StepTable::forceps_delivery().with_tolerance(&tolerance);

        assert_eq!(
            table.get(StepId::Arrangement).unwrap().check,
            StepCheck::Arrangement { margin_mm: 7.0 }
        );
        match &table.get(StepId::InitialPlacementRight).unwrap().check {
            StepCheck::InitialPlacement {
                angle_margin_deg,
                distance_margin_mm,
                ..
            } => {
                assert_eq!(*angle_margin_deg, 15.0);
                assert_eq!(*distance_margin_mm, 12.0);
            }
            other => panic!("unexpected check {:?}", other),
        }

        // The far edge follows the widened near edge when not set explicitly
        let band = table
            .get(StepId::FinalPlacementLeft)
            .unwrap()
            .check
            .eye_ear_band()
            .unwrap()
            .unwrap();
        assert_eq!((band.low(), band.high()), (32.0, 64.0));
    }

    #[test]
    fn test_table_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("steps.toml");

        let table = StepTable::forceps_delivery();
        table.to_file(&path).unwrap();

        let loaded = StepTable::from_file(&path).unwrap();
        assert_eq!(loaded, table);
    }
}
