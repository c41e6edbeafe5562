//! Per-pair diagnostics: an ordered, structured log of what each stage
//! actually did — which backend ran, which fell back, which was skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage names as they appear in diagnostics and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DetectSource,
    DetectTarget,
    Align,
    Blend,
    Enhance,
    Score,
    Embed,
    Cache,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::DetectSource => "detect_source",
            Stage::DetectTarget => "detect_target",
            Stage::Align => "align",
            Stage::Blend => "blend",
            Stage::Enhance => "enhance",
            Stage::Score => "score",
            Stage::Embed => "embed",
            Stage::Cache => "cache",
        };
        write!(f, "{s}")
    }
}

/// What a stage (or one of its backends) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Executed,
    /// Ran, but on a fallback path (degraded blend mode, identity transform).
    Degraded,
    /// Not run at all (unavailable backend, missing model).
    Skipped,
    Failed,
}

/// One entry in the per-pair log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub detail: String,
}

/// Structured log for one source/target pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub pair_id: Uuid,
    pub started_at: DateTime<Utc>,
    events: Vec<StageEvent>,
    /// Cosine similarity between source-face and composited-face embeddings,
    /// when an embedding model is configured.
    pub identity_similarity: Option<f32>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            pair_id: Uuid::new_v4(),
            started_at: Utc::now(),
            events: Vec::new(),
            identity_similarity: None,
        }
    }

    pub fn record(&mut self, stage: Stage, outcome: StageOutcome, detail: impl Into<String>) {
        self.events.push(StageEvent {
            stage,
            outcome,
            detail: detail.into(),
        });
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    /// True when any stage took a fallback path.
    pub fn any_degraded(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.outcome == StageOutcome::Degraded)
    }

    /// Events for one stage, in order.
    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &StageEvent> {
        self.events.iter().filter(move |e| e.stage == stage)
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
