//! Pipeline run state machine
//!
//! `Queued -> Formatting -> Downloading -> Writing -> Verifying -> Done`,
//! with `Failed` reachable from any non-terminal stage. Downloading is
//! skipped for local images. Each working stage owns a slice of the overall
//! percent range; [`PipelineRun::record`] rescales local percents into it and
//! never lets the overall value go down.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::config::defaults::ranges;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Formatting,
    Downloading,
    Writing,
    Verifying,
    Done,
    Failed,
}

impl Stage {
    /// Whether no further stage may follow
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// Forward moves (including skips) and same-stage retries are legal;
    /// `Failed` is reachable from anything non-terminal.
    pub fn can_advance_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next >= self
    }

    /// Name used for stage child subcommands
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Formatting => "formatting",
            Self::Downloading => "downloading",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal stage transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal stage transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Overall percent sub-range per working stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRanges {
    pub formatting: (f64, f64),
    pub downloading: (f64, f64),
    pub writing: (f64, f64),
    pub verifying: (f64, f64),
}

impl Default for StageRanges {
    fn default() -> Self {
        Self {
            formatting: ranges::FORMATTING,
            downloading: ranges::DOWNLOADING,
            writing: ranges::WRITING,
            verifying: ranges::VERIFYING,
        }
    }
}

impl StageRanges {
    /// Range reserved for a stage
    pub fn for_stage(&self, stage: Stage) -> (f64, f64) {
        match stage {
            Stage::Queued => (0.0, 0.0),
            Stage::Formatting => self.formatting,
            Stage::Downloading => self.downloading,
            Stage::Writing => self.writing,
            Stage::Verifying => self.verifying,
            Stage::Done | Stage::Failed => (100.0, 100.0),
        }
    }

    /// Whether the ranges are ordered and non-overlapping within 0-100
    pub fn is_monotonic(&self) -> bool {
        let bounds = [
            self.formatting,
            self.downloading,
            self.writing,
            self.verifying,
        ];
        let mut prev_end = 0.0;
        for (start, end) in bounds {
            if start < prev_end || end < start || end > 100.0 {
                return false;
            }
            prev_end = end;
        }
        true
    }
}

/// State of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: Uuid,
    pub stage: Stage,
    pub overall_percent: f64,
    pub error: Option<String>,
    ranges: StageRanges,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new(StageRanges::default())
    }
}

impl PipelineRun {
    pub fn new(ranges: StageRanges) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: Stage::Queued,
            overall_percent: 0.0,
            error: None,
            ranges,
        }
    }

    /// Move to another stage
    ///
    /// Entering a working stage lifts the overall percent to the stage's
    /// range start, and returns that value.
    pub fn advance(&mut self, next: Stage) -> Result<f64, InvalidTransition> {
        if !self.stage.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        if next == Stage::Done {
            self.overall_percent = 100.0;
        } else if next != Stage::Failed {
            let (start, _) = self.ranges.for_stage(next);
            self.overall_percent = self.overall_percent.max(start);
        }
        Ok(self.overall_percent)
    }

    /// Rescale a stage-local percent into the overall range
    ///
    /// `None` stays `None` and leaves the overall percent untouched.
    pub fn record(&mut self, local: Option<f64>) -> Option<f64> {
        let local = local.filter(|p| p.is_finite())?;
        let (start, end) = self.ranges.for_stage(self.stage);
        let scaled = start + (end - start) * local.clamp(0.0, 100.0) / 100.0;
        self.overall_percent = self.overall_percent.max(scaled);
        Some(self.overall_percent)
    }

    /// Mark the run failed
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.stage = Stage::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
