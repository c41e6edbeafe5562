//! Host-facing reports: human-readable text that is also parseable as
//! `key: value` lines, plus a JSON form of the same data.

use crate::batch::{BatchOutcome, PairOutcome};
use crate::pipeline::{PairFailure, SwapResult};
use serde_json::json;

/// Render one successful swap as `key: value` lines.
pub fn render_pair_text(result: &SwapResult) -> String {
    let q = &result.quality;
    let d = &result.diagnostics;
    let mut lines = vec![
        format!("pair_id: {}", d.pair_id),
        format!("started_at: {}", d.started_at.to_rfc3339()),
        format!("overall_quality: {:.3}", q.overall),
        format!("detection_confidence: {:.3}", q.detection_confidence),
        format!("sharpness: {:.3}", q.sharpness),
        format!("lighting: {:.3}", q.lighting),
        format!("pose: {:.3}", q.pose),
        format!("occlusion: {:.3}", q.occlusion),
        format!("degraded: {}", d.any_degraded()),
    ];

    if let Some(sim) = d.identity_similarity {
        lines.push(format!("identity_similarity: {sim:.3}"));
    }

    for (i, rec) in q.recommendations.iter().enumerate() {
        lines.push(format!("recommendation.{i}: {rec}"));
    }

    for (i, event) in d.events().iter().enumerate() {
        lines.push(format!(
            "stage.{i}: {} {:?} {}",
            event.stage, event.outcome, event.detail
        ));
    }

    lines.join("\n")
}

/// JSON form of the pair report (quality + diagnostics, no pixels).
pub fn render_pair_json(result: &SwapResult) -> serde_json::Value {
    json!({
        "quality": result.quality,
        "diagnostics": result.diagnostics,
    })
}

/// Render a pair failure as `key: value` lines naming the failed stage and
/// the attempted fallback.
pub fn render_failure_text(failure: &PairFailure) -> String {
    let mut lines = vec![
        format!("pair_id: {}", failure.diagnostics.pair_id),
        format!("failed_stage: {}", failure.stage),
        format!("error: {}", failure.message),
    ];
    if let Some(fb) = &failure.fallback_attempted {
        lines.push(format!("fallback_attempted: {fb}"));
    }
    for (i, event) in failure.diagnostics.events().iter().enumerate() {
        lines.push(format!(
            "stage.{i}: {} {:?} {}",
            event.stage, event.outcome, event.detail
        ));
    }
    lines.join("\n")
}

/// Aggregate batch report: one status line per item plus summary counters.
pub fn render_batch_text(outcome: &BatchOutcome) -> String {
    let mut lines = Vec::with_capacity(outcome.items.len() + 2);
    for item in &outcome.items {
        let status = match &item.outcome {
            PairOutcome::Completed(result) => {
                format!("done overall={:.3}", result.quality.overall)
            }
            PairOutcome::Failed(failure) => {
                format!("failed stage={} error={}", failure.stage, failure.message)
            }
            PairOutcome::Cancelled => "cancelled".to_string(),
            PairOutcome::TimedOut { budget } => {
                format!("failed timeout={}s", budget.as_secs())
            }
        };
        lines.push(format!(
            "item.{}: {} elapsed_ms={} {}",
            item.index,
            item.id,
            item.elapsed.as_millis(),
            status
        ));
    }
    lines.push(format!("batch.completed: {}", outcome.completed()));
    lines.push(format!("batch.failed: {}", outcome.failed()));
    lines.join("\n")
}
