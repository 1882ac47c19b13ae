//! Table-driven step sequencer
//!
//! One state machine drives every step of the exercise:
//!
//! ```text
//! Idle --start--> Armed --(required passes)--> AdvanceReady
//!   ^               |                               |
//!   +-----stop------+                               |
//!   |                                               |
//!   +------------------next-------------------------+  (last step: Completed)
//! ```
//!
//! Pose updates are only evaluated while armed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EvaluationError, EvaluationResult, PoseEvaluationEngine};
use crate::landmark::GeometryStore;
use crate::step::{StepDefinition, StepTable};
use crate::tracking::PoseSource;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    #[error("Step table has no steps")]
    EmptyTable,
    #[error("Step is not running")]
    NotArmed,
    #[error("Step is already running")]
    AlreadyArmed,
    #[error("Next is not enabled for the current step")]
    NextDisabled,
    #[error("All steps are completed")]
    Completed,
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    /// Current step waits for Start
    Idle,
    /// Pose updates are being evaluated
    Armed,
    /// Required number of consecutive passes reached
    AdvanceReady,
    /// Past the last step
    Completed,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "idle"),
            SequencerState::Armed => write!(f, "armed"),
            SequencerState::AdvanceReady => write!(f, "advance_ready"),
            SequencerState::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerOptions {
    /// Consecutive passing evaluations before Next is enabled
    pub required_passes: u32,
    /// Stopping an armed step enables Next
    pub advance_on_stop: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            required_passes: 3,
            advance_on_stop: true,
        }
    }
}

/// UI-facing state of the current step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Controls {
    pub start_label: &'static str,
    pub start_enabled: bool,
    pub next_enabled: bool,
    /// Scene model to show; `None` hides every label model
    pub visible_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StepSequencer {
    table: StepTable,
    options: SequencerOptions,
    index: usize,
    state: SequencerState,
    next_enabled: bool,
    pass_streak: u32,
    last_result: Option<EvaluationResult>,
}

impl StepSequencer {
    pub fn new(table: StepTable, options: SequencerOptions) -> Result<Self, SequencerError> {
        if table.is_empty() {
            return Err(SequencerError::EmptyTable);
        }
        Ok(Self {
            table,
            options,
            index: 0,
            state: SequencerState::Idle,
            next_enabled: false,
            pass_streak: 0,
            last_result: None,
        })
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn table(&self) -> &StepTable {
        &self.table
    }

    /// Step being trained, `None` once completed
    pub fn current_step(&self) -> Option<&StepDefinition> {
        match self.state {
            SequencerState::Completed => None,
            _ => self.table.step.get(self.index),
        }
    }

    pub fn last_result(&self) -> Option<&EvaluationResult> {
        self.last_result.as_ref()
    }

    pub fn controls(&self) -> Controls {
        let armed = self.state == SequencerState::Armed;
        Controls {
            start_label: if armed { "Stop" } else { "Start" },
            start_enabled: self.state != SequencerState::Completed,
            next_enabled: self.next_enabled,
            visible_label: if armed {
                self.current_step().and_then(|s| s.label_model.clone())
            } else {
                None
            },
        }
    }

    /// Arm the current step
    pub fn start(&mut self) -> Result<(), SequencerError> {
        match self.state {
            SequencerState::Completed => return Err(SequencerError::Completed),
            SequencerState::Armed => return Err(SequencerError::AlreadyArmed),
            SequencerState::Idle | SequencerState::AdvanceReady => {}
        }
        self.state = SequencerState::Armed;
        self.next_enabled = false;
        self.pass_streak = 0;
        self.last_result = None;
        if let Some(step) = self.current_step() {
            info!(step = %step.id, "Step started");
        }
        Ok(())
    }

    /// Disarm the current step
    pub fn stop(&mut self) -> Result<(), SequencerError> {
        match self.state {
            SequencerState::Armed => {
                self.next_enabled = self.options.advance_on_stop;
            }
            SequencerState::AdvanceReady => {}
            SequencerState::Idle => return Err(SequencerError::NotArmed),
            SequencerState::Completed => return Err(SequencerError::Completed),
        }
        self.state = SequencerState::Idle;
        if let Some(step) = self.current_step() {
            info!(step = %step.id, next_enabled = self.next_enabled, "Step stopped");
        }
        Ok(())
    }

    /// Evaluate the armed step against the poses at `at`
    ///
    /// Returns `Ok(None)` without evaluating when no step is armed.
    pub fn on_pose_update<P: PoseSource, G: GeometryStore>(
        &mut self,
        engine: &PoseEvaluationEngine<P, G>,
        at: DateTime<Utc>,
    ) -> Result<Option<EvaluationResult>, SequencerError> {
        if self.state != SequencerState::Armed {
            return Ok(None);
        }
        let Some(step) = self.table.step.get(self.index) else {
            return Err(SequencerError::Completed);
        };

        let result = match engine.evaluate_step(step, at) {
            Ok(result) => result,
            Err(e) => {
                warn!(step = %step.id, error = %e, "Evaluation failed");
                self.pass_streak = 0;
                return Err(e.into());
            }
        };

        if result.within_margin() {
            self.pass_streak += 1;
        } else {
            self.pass_streak = 0;
        }

        if self.pass_streak >= self.options.required_passes.max(1) {
            self.state = SequencerState::AdvanceReady;
            self.next_enabled = true;
            info!(step = %step.id, passes = self.pass_streak, "Step ready to advance");
        }

        self.last_result = Some(result.clone());
        Ok(Some(result))
    }

    /// Move to the next step
    pub fn next(&mut self) -> Result<Option<&StepDefinition>, SequencerError> {
        if self.state == SequencerState::Completed {
            return Err(SequencerError::Completed);
        }
        if !self.next_enabled {
            return Err(SequencerError::NextDisabled);
        }

        self.index += 1;
        self.next_enabled = false;
        self.pass_streak = 0;
        self.last_result = None;

        if self.index >= self.table.len() {
            self.state = SequencerState::Completed;
            info!("All steps completed");
            return Ok(None);
        }

        self.state = SequencerState::Idle;
        let step = self.current_step();
        if let Some(step) = step {
            info!(step = %step.id, "Moved to next step");
        }
        Ok(step)
    }
}
