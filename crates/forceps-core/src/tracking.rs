//! Pose sources: where the engine gets tool poses from

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

use crate::pose::Pose;
use crate::tool::ToolId;

/// Supplies the current pose of a tracked tool
///
/// `None` means the tool is unavailable at that instant (not tracked, or
/// the last sample is too old).
pub trait PoseSource {
    fn sample_tool_pose(&self, tool: &ToolId, at: DateTime<Utc>) -> Option<Pose>;
}

/// One tracked pose of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub tool: ToolId,
    pub timestamp: DateTime<Utc>,
    pub pose: Pose,
}

/// Time-ordered pose history per tool, with a staleness window
///
/// Only samples that an in-order query can still reach are kept: everything
/// newer than `latest - max_age` plus the last sample at or before it.
#[derive(Debug, Clone)]
pub struct RecordedPoseSource {
    samples: HashMap<ToolId, VecDeque<(DateTime<Utc>, Pose)>>,
    max_age: Duration,
}

impl RecordedPoseSource {
    pub fn new(max_age: Duration) -> Self {
        Self {
            samples: HashMap::new(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Add a sample, keeping each tool's history ordered by timestamp
    pub fn record(&mut self, sample: PoseSample) {
        let history = self.samples.entry(sample.tool).or_default();
        let idx = history.partition_point(|(t, _)| *t <= sample.timestamp);
        history.insert(idx, (sample.timestamp, sample.pose));

        let Some(&(latest, _)) = history.back() else {
            return;
        };
        let cutoff = latest - self.max_age;
        while history.get(1).is_some_and(|(t, _)| *t <= cutoff) {
            history.pop_front();
        }
    }

    /// Drop all samples of one tool (tracking lost)
    pub fn clear_tool(&mut self, tool: &ToolId) {
        self.samples.remove(tool);
    }

    pub fn sample_count(&self, tool: &ToolId) -> usize {
        self.samples.get(tool).map_or(0, |h| h.len())
    }
}

impl PoseSource for RecordedPoseSource {
    fn sample_tool_pose(&self, tool: &ToolId, at: DateTime<Utc>) -> Option<Pose> {
        let history = self.samples.get(tool)?;
        let idx = history.partition_point(|(t, _)| *t <= at);
        let (timestamp, pose) = history.get(idx.checked_sub(1)?)?;

        if at - *timestamp > self.max_age {
            trace!(tool = %tool, age_ms = (at - *timestamp).num_milliseconds(), "Pose sample is stale");
            return None;
        }
        Some(*pose)
    }
}

/// Constant poses, independent of time
#[derive(Debug, Clone, Default)]
pub struct FixedPoseSource {
    poses: HashMap<ToolId, Pose>,
}

impl FixedPoseSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pose(mut self, tool: ToolId, pose: Pose) -> Self {
        self.poses.insert(tool, pose);
        self
    }

    pub fn set_pose(&mut self, tool: ToolId, pose: Pose) {
        self.poses.insert(tool, pose);
    }
}

impl PoseSource for FixedPoseSource {
    fn sample_tool_pose(&self, tool: &ToolId, _at: DateTime<Utc>) -> Option<Pose> {
        self.poses.get(tool).copied()
    }
}
