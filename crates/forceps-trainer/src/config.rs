//! Configuration loading and validation

use anyhow::{Context, Result};
use forceps_core::sequencer::SequencerOptions;
use forceps_core::step::{StepTable, Tolerance};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    /// System error margins added to every step margin
    #[serde(default)]
    pub tolerance: Tolerance,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the asset manifest
    #[serde(default = "default_assets_path")]
    pub assets: String,
    /// Path to a step table; the built-in exercise when absent
    #[serde(default)]
    pub steps: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assets: default_assets_path(),
            steps: None,
        }
    }
}

fn default_assets_path() -> String {
    "./assets/assets.toml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Pose samples older than this are treated as tracking loss
    #[serde(default = "default_max_sample_age")]
    pub max_sample_age_ms: u64,
    /// Consecutive passing evaluations before Next is enabled
    #[serde(default = "default_required_passes")]
    pub required_passes: u32,
    /// Stopping a step enables Next
    #[serde(default = "default_true")]
    pub advance_on_stop: bool,
    /// Surface queries farther than this report no result (mm)
    #[serde(default)]
    pub surface_search_radius_mm: Option<f64>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_sample_age_ms: default_max_sample_age(),
            required_passes: default_required_passes(),
            advance_on_stop: true,
            surface_search_radius_mm: None,
        }
    }
}

fn default_max_sample_age() -> u64 {
    250
}

fn default_required_passes() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.tolerance
            .validate()
            .context("Invalid [tolerance] section")?;
        if self.tracking.required_passes == 0 {
            anyhow::bail!("tracking.required_passes must be at least 1");
        }
        if let Some(radius) = self.tracking.surface_search_radius_mm {
            if !radius.is_finite() || radius < 0.0 {
                anyhow::bail!("tracking.surface_search_radius_mm must be a non-negative number");
            }
        }
        Ok(())
    }

    pub fn sequencer_options(&self) -> SequencerOptions {
        SequencerOptions {
            required_passes: self.tracking.required_passes,
            advance_on_stop: self.tracking.advance_on_stop,
        }
    }

    pub fn max_sample_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.tracking.max_sample_age_ms.min(i64::MAX as u64) as i64)
    }

    /// Step table with the configured tolerance applied
    pub fn step_table(&self) -> Result<StepTable> {
        let table = match &self.session.steps {
            Some(path) => StepTable::from_file(Path::new(path))
                .with_context(|| format!("Failed to load step table {}", path))?,
            None => StepTable::forceps_delivery(),
        };
        Ok(table.with_tolerance(&self.tolerance))
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        session: SessionConfig {
            assets: default_assets_path(),
            steps: Some("./assets/steps.toml".to_string()),
        },
        tolerance: Tolerance {
            extra_distance_mm: 0.0,
            extra_angle_deg: 0.0,
        },
        tracking: TrackingConfig {
            surface_search_radius_mm: Some(100.0),
            ..TrackingConfig::default()
        },
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
