//! Offline replay of recorded training sessions
//!
//! A recording is a JSON-lines file of `TrainingEvent`s: tracked poses and
//! the trainee's Start/Stop/Next presses, in time order. Replaying drives
//! the sequencer and engine exactly as a live session would, updating the
//! scene's display state along the way.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forceps_core::engine::{EvaluationResult, PoseEvaluationEngine, Verdict};
use forceps_core::sequencer::{SequencerError, SequencerState, StepSequencer};
use forceps_core::step::StepId;
use forceps_core::tool::{ToolId, ToolSet};
use forceps_core::tracking::{PoseSample, RecordedPoseSource};
use forceps_scene::{feedback_color, NodeId, Scene, SceneGeometry, NEUTRAL_COLOR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One entry of a recorded session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainingEvent {
    Pose(PoseSample),
    Start { timestamp: DateTime<Utc> },
    Stop { timestamp: DateTime<Utc> },
    Next { timestamp: DateTime<Utc> },
}

impl TrainingEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TrainingEvent::Pose(sample) => sample.timestamp,
            TrainingEvent::Start { timestamp }
            | TrainingEvent::Stop { timestamp }
            | TrainingEvent::Next { timestamp } => *timestamp,
        }
    }
}

/// Read a JSON-lines recording; blank lines are skipped
pub fn read_events(path: &Path) -> Result<Vec<TrainingEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recording {}", path.display()))?;
    parse_events(&content)
}

pub fn parse_events(content: &str) -> Result<Vec<TrainingEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", idx + 1))
        })
        .collect()
}

/// Per-step counters collected during a replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub step: StepId,
    pub title: String,
    pub evaluations: usize,
    pub passes: usize,
    pub failures: usize,
    pub inconclusive: usize,
    /// Updates that could not be evaluated (missing pose or geometry)
    pub errors: usize,
    pub last_verdict: Option<Verdict>,
    pub last_violations: Vec<String>,
    pub advance_ready: bool,
}

impl StepSummary {
    fn new(step: StepId, title: &str) -> Self {
        Self {
            step,
            title: title.to_string(),
            evaluations: 0,
            passes: 0,
            failures: 0,
            inconclusive: 0,
            errors: 0,
            last_verdict: None,
            last_violations: Vec::new(),
            advance_ready: false,
        }
    }

    fn record(&mut self, result: &EvaluationResult) {
        self.evaluations += 1;
        match result.verdict {
            Verdict::Pass => self.passes += 1,
            Verdict::Fail => self.failures += 1,
            Verdict::Inconclusive => self.inconclusive += 1,
        }
        self.last_verdict = Some(result.verdict);
        self.last_violations = result.violations.clone();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub session_id: Uuid,
    pub replayed_at: DateTime<Utc>,
    pub events: usize,
    /// Button presses the sequencer refused (e.g. Next while disabled)
    pub rejected_events: usize,
    pub final_state: SequencerState,
    pub steps: Vec<StepSummary>,
}

/// Replays events through a sequencer, engine and scene
pub struct ReplaySession {
    engine: PoseEvaluationEngine<RecordedPoseSource, SceneGeometry>,
    sequencer: StepSequencer,
    scene: Scene,
    /// Scene model recolored for each tool
    tool_nodes: HashMap<ToolId, NodeId>,
    /// Label models of every step found in the scene
    label_nodes: Vec<(String, NodeId)>,
    summaries: Vec<StepSummary>,
    events: usize,
    rejected_events: usize,
}

impl ReplaySession {
    pub fn new(
        scene: Scene,
        tools: ToolSet,
        tool_models: &[(ToolId, String)],
        sequencer: StepSequencer,
        max_sample_age: chrono::Duration,
        search_radius: Option<f64>,
    ) -> Result<Self> {
        let engine = PoseEvaluationEngine::new(
            RecordedPoseSource::new(max_sample_age),
            scene.geometry_store(),
            tools,
        )
        .with_surface_search_radius(search_radius);

        let tool_nodes = tool_models
            .iter()
            .filter_map(|(tool, model)| scene.lookup(model).map(|id| (tool.clone(), id)))
            .collect();

        let table = sequencer.table();
        let label_nodes = table
            .iter()
            .filter_map(|s| s.label_model.as_ref())
            .filter_map(|name| scene.lookup(name).map(|id| (name.clone(), id)))
            .collect();

        let summaries = table.iter().map(|s| StepSummary::new(s.id, &s.title)).collect();

        let mut session = Self {
            engine,
            sequencer,
            scene,
            tool_nodes,
            label_nodes,
            summaries,
            events: 0,
            rejected_events: 0,
        };
        session.sync_labels()?;
        Ok(session)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn sequencer(&self) -> &StepSequencer {
        &self.sequencer
    }

    /// Apply one event
    pub fn apply(&mut self, event: TrainingEvent) -> Result<()> {
        self.events += 1;
        let at = event.timestamp();

        match event {
            TrainingEvent::Pose(sample) => {
                self.engine.pose_source_mut().record(sample);
                match self.sequencer.on_pose_update(&self.engine, at) {
                    Ok(Some(result)) => self.on_result(&result)?,
                    Ok(None) => {}
                    Err(SequencerError::Evaluation(e)) => {
                        debug!(error = %e, "Pose update not evaluated");
                        if let Some(summary) = self.current_summary() {
                            summary.errors += 1;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TrainingEvent::Start { .. } => {
                let started = self.sequencer.start();
                self.press("start", started)?;
            }
            TrainingEvent::Stop { .. } => {
                let stopped = self.sequencer.stop();
                if stopped.is_ok() {
                    self.reset_tool_colors()?;
                }
                self.press("stop", stopped)?;
            }
            TrainingEvent::Next { .. } => {
                let result = self.sequencer.next().map(|_| ());
                self.press("next", result)?;
            }
        }

        self.sync_labels()
    }

    /// Consume the session and summarize it
    pub fn finish(self) -> ReplayReport {
        ReplayReport {
            session_id: Uuid::new_v4(),
            replayed_at: Utc::now(),
            events: self.events,
            rejected_events: self.rejected_events,
            final_state: self.sequencer.state(),
            steps: self.summaries,
        }
    }

    fn press(&mut self, button: &str, result: Result<(), SequencerError>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(SequencerError::Evaluation(e)) => Err(e.into()),
            Err(e) => {
                warn!(button = button, error = %e, "Button press rejected");
                self.rejected_events += 1;
                Ok(())
            }
        }
    }

    fn on_result(&mut self, result: &EvaluationResult) -> Result<()> {
        let advance_ready = self.sequencer.state() == SequencerState::AdvanceReady;
        if let Some(summary) = self.current_summary() {
            summary.record(result);
            summary.advance_ready |= advance_ready;
        }
        if !result.violations.is_empty() {
            info!(step = %result.step, message = %result.message().replace('\n', "; "), "Placement out of margin");
        }
        self.color_tools(feedback_color(result.verdict))
    }

    fn current_summary(&mut self) -> Option<&mut StepSummary> {
        let id = self.sequencer.current_step()?.id;
        self.summaries.iter_mut().find(|s| s.step == id)
    }

    /// Recolor the models of the tools the current step checks
    fn color_tools(&mut self, color: forceps_scene::Color) -> Result<()> {
        let Some(step) = self.sequencer.current_step() else {
            return Ok(());
        };
        for tool in step.check.tools() {
            if let Some(id) = self.tool_nodes.get(&tool) {
                self.scene.set_color(*id, color)?;
            }
        }
        Ok(())
    }

    /// Every tool model back to neutral, whichever step colored it
    fn reset_tool_colors(&mut self) -> Result<()> {
        for id in self.tool_nodes.values() {
            self.scene.set_color(*id, NEUTRAL_COLOR)?;
        }
        Ok(())
    }

    /// Show only the label model the sequencer asks for
    fn sync_labels(&mut self) -> Result<()> {
        let visible = self.sequencer.controls().visible_label;
        for (name, id) in &self.label_nodes {
            let show = visible.as_deref() == Some(name.as_str());
            self.scene.set_visibility(*id, show)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forceps_core::landmark::Landmark;
    use forceps_core::mesh::TriangleMesh;
    use forceps_core::pose::Pose;
    use forceps_core::sequencer::SequencerOptions;
    use forceps_core::step::{StepCheck, StepDefinition, StepTable};
    use forceps_core::tool::{Side, ToolGeometry};
    use forceps_scene::{NodeKind, FAIL_COLOR, PASS_COLOR};
    use nalgebra::{Point3, Vector3};
    use std::sync::Arc;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_800_000_000_000 + ms).unwrap()
    }

    fn table() -> StepTable {
        StepTable {
            version: "1.0".to_string(),
            step: vec![
                StepDefinition {
                    id: StepId::InitialPlacementLeft,
                    title: "Initial Placement Left".to_string(),
                    instruction: String::new(),
                    label_model: Some("initialPlacementLeft".to_string()),
                    check: StepCheck::InitialPlacement {
                        side: Side::Left,
                        angle_margin_deg: 10.0,
                        distance_margin_mm: 10.0,
                        surface: "head_surface".to_string(),
                    },
                },
                StepDefinition {
                    id: StepId::FinalPlacementLeft,
                    title: "Final Placement Left".to_string(),
                    instruction: String::new(),
                    label_model: Some("finalPlacementLeft".to_string()),
                    check: StepCheck::FinalPlacement {
                        side: Side::Left,
                        distance_margin_mm: 10.0,
                        far_margin_mm: None,
                        cheek_margin_mm: 10.0,
                        eye: "eye_left".to_string(),
                        ear: "ear_left".to_string(),
                        surface: "head_surface".to_string(),
                    },
                },
            ],
        }
    }

    fn session() -> ReplaySession {
        let mut scene = Scene::new();
        let head = TriangleMesh::disc(Point3::new(0.0, 0.0, 100.0), Vector3::z(), 40.0, 16);
        scene.add("head_surface", NodeKind::Model(Arc::new(head))).unwrap();
        for (name, point) in [
            ("eye_left", Point3::new(15.0, 0.0, 100.0)),
            ("ear_left", Point3::new(0.0, 15.0, 100.0)),
        ] {
            let landmark = Landmark::single(name, point).unwrap();
            scene.add(name, NodeKind::Landmarks(Arc::new(landmark))).unwrap();
        }
        for label in ["initialPlacementLeft", "finalPlacementLeft"] {
            scene
                .add(label, NodeKind::Model(Arc::new(TriangleMesh::default())))
                .unwrap();
        }
        for model in ["forceps_left_model", "forceps_right_model"] {
            scene
                .add(model, NodeKind::Model(Arc::new(TriangleMesh::default())))
                .unwrap();
        }

        let tools = ToolSet::new().with_tool(
            ToolId::forceps(Side::Left),
            ToolGeometry::new("forceps_left", vec![Point3::new(0.0, 0.0, 100.0), Point3::origin()])
                .unwrap(),
        );
        let options = SequencerOptions {
            required_passes: 1,
            ..SequencerOptions::default()
        };
        let sequencer = StepSequencer::new(table(), options).unwrap();
        ReplaySession::new(
            scene,
            tools,
            &[
                (ToolId::forceps(Side::Left), "forceps_left_model".to_string()),
                (ToolId::forceps(Side::Right), "forceps_right_model".to_string()),
            ],
            sequencer,
            chrono::Duration::milliseconds(250),
            None,
        )
        .unwrap()
    }

    fn pose_event(ms: i64, z: f64) -> TrainingEvent {
        TrainingEvent::Pose(PoseSample {
            tool: ToolId::forceps(Side::Left),
            timestamp: at_ms(ms),
            pose: Pose::from_translation(0.0, 0.0, z),
        })
    }

    fn color_of(session: &ReplaySession, name: &str) -> forceps_scene::Color {
        session.scene().node_by_name(name).unwrap().display.color
    }

    fn visible(session: &ReplaySession, name: &str) -> bool {
        session.scene().node_by_name(name).unwrap().display.visible
    }

    #[test]
    fn test_parse_events() {
        let content = r#"
{"event":"start","timestamp":"2027-01-15T08:00:00Z"}
{"event":"pose","tool":"forceps_left","timestamp":"2027-01-15T08:00:00.100Z","pose":{"x":0.0,"y":0.0,"z":5.0}}

{"event":"stop","timestamp":"2027-01-15T08:00:01Z"}
{"event":"next","timestamp":"2027-01-15T08:00:02Z"}
"#;
        let events = parse_events(content).unwrap();
        assert_eq!(events.len(), 4);
        match &events[1] {
            TrainingEvent::Pose(sample) => {
                assert_eq!(sample.tool, ToolId::forceps(Side::Left));
                assert_eq!(sample.pose.position().z, 5.0);
            }
            other => panic!("expected pose event, got {:?}", other),
        }

        let err = parse_events("{\"event\":\"start\"}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_replay_updates_scene_and_report() {
        let mut session = session();
        assert!(!visible(&session, "initialPlacementLeft"));

        // Poses before Start are recorded but not evaluated
        session.apply(pose_event(0, -50.0)).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), NEUTRAL_COLOR);

        session.apply(TrainingEvent::Start { timestamp: at_ms(10) }).unwrap();
        assert!(visible(&session, "initialPlacementLeft"));
        assert!(!visible(&session, "finalPlacementLeft"));

        // Tip 50mm short of the head
        session.apply(pose_event(20, -50.0)).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), FAIL_COLOR);

        // Tip touching the head
        session.apply(pose_event(40, 0.0)).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), PASS_COLOR);
        assert_eq!(session.sequencer().state(), SequencerState::AdvanceReady);
        assert!(!visible(&session, "initialPlacementLeft"));

        session.apply(TrainingEvent::Next { timestamp: at_ms(50) }).unwrap();
        // Next again while disabled is rejected, not fatal
        session.apply(TrainingEvent::Next { timestamp: at_ms(60) }).unwrap();

        let report = session.finish();
        assert_eq!(report.events, 6);
        assert_eq!(report.rejected_events, 1);
        assert_eq!(report.final_state, SequencerState::Idle);

        let first = &report.steps[0];
        assert_eq!(first.evaluations, 2);
        assert_eq!(first.failures, 1);
        assert_eq!(first.passes, 1);
        assert!(first.advance_ready);
        assert_eq!(first.last_verdict, Some(Verdict::Pass));
        assert_eq!(report.steps[1].evaluations, 0);
    }

    #[test]
    fn test_stale_pose_counts_as_error() {
        let mut session = session();
        session.apply(TrainingEvent::Start { timestamp: at_ms(0) }).unwrap();
        session.apply(pose_event(0, -50.0)).unwrap();

        // Stop resets the tool color
        session.apply(TrainingEvent::Stop { timestamp: at_ms(10) }).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), NEUTRAL_COLOR);

        session.apply(TrainingEvent::Start { timestamp: at_ms(20) }).unwrap();
        // A different tool's pose arrives long after the last left blade sample
        session
            .apply(TrainingEvent::Pose(PoseSample {
                tool: ToolId::forceps(Side::Right),
                timestamp: at_ms(1000),
                pose: Pose::identity(),
            }))
            .unwrap();

        let report = session.finish();
        assert_eq!(report.steps[0].errors, 1);
        assert_eq!(report.steps[0].evaluations, 1);
        assert_eq!(report.final_state, SequencerState::Armed);
    }

    #[test]
    fn test_stop_resets_every_tool_color() {
        let mut session = session();
        session.apply(TrainingEvent::Start { timestamp: at_ms(0) }).unwrap();
        session.apply(pose_event(10, -50.0)).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), FAIL_COLOR);

        // Right blade still red from an earlier step
        let right = session.scene.lookup("forceps_right_model").unwrap();
        session.scene.set_color(right, FAIL_COLOR).unwrap();

        session.apply(TrainingEvent::Stop { timestamp: at_ms(20) }).unwrap();
        assert_eq!(color_of(&session, "forceps_left_model"), NEUTRAL_COLOR);
        assert_eq!(color_of(&session, "forceps_right_model"), NEUTRAL_COLOR);
    }
}
