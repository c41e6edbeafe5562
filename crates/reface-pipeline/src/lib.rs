//! reface-pipeline — orchestration around the reface-core stages.
//!
//! The per-pair swap engine, the batch orchestrator with its execution
//! modes and per-pair state machine, the injected TTL result cache,
//! configuration loading and host-facing reports.

pub mod batch;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod pipeline;
pub mod report;

pub use batch::{
    BatchItem, BatchOrchestrator, BatchOutcome, CancelHandle, PairOutcome, PairState,
};
pub use cache::{CacheKey, ResultCache};
pub use config::{BatchConfig, ExecutionMode, PipelineConfig};
pub use diagnostics::{Diagnostics, Stage, StageEvent, StageOutcome};
pub use pipeline::{PairFailure, PairPhase, SwapEngine, SwapResult};
