//! Batch orchestration over many source/target pairs.
//!
//! Drives the per-pair state machine (Pending → Detecting → Aligning →
//! Blending → Enhancing → Scored → Done, with Failed/Cancelled terminals),
//! in sequential, bounded-parallel or adaptive execution modes. Pairs share
//! no mutable state; the injected TTL cache is the only shared resource.
//! A fatal pair never aborts the batch.

use crate::cache::{CacheKey, ResultCache};
use crate::config::{BatchConfig, ExecutionMode};
use crate::diagnostics::{Diagnostics, Stage, StageOutcome};
use crate::pipeline::{PairFailure, PairPhase, SwapEngine, SwapResult};
use reface_core::RgbBuffer;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Pairs per adaptive round.
const ADAPTIVE_BATCH_SIZE: usize = 4;
/// Mean per-pair latency above which the adaptive mode switches the next
/// round to parallel execution; below it, spawning is not worth the memory.
const ADAPTIVE_LATENCY_THRESHOLD: Duration = Duration::from_millis(150);

/// Per-pair lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Pending,
    Detecting,
    Aligning,
    Blending,
    Enhancing,
    Scored,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PairState::Pending => "pending",
            PairState::Detecting => "detecting",
            PairState::Aligning => "aligning",
            PairState::Blending => "blending",
            PairState::Enhancing => "enhancing",
            PairState::Scored => "scored",
            PairState::Done => "done",
            PairState::Failed => "failed",
            PairState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome of one pair.
#[derive(Debug)]
pub enum PairOutcome {
    Completed(Box<SwapResult>),
    Failed(Box<PairFailure>),
    /// Dropped before it started because the batch was cancelled.
    Cancelled,
    /// The per-pair wall-clock budget expired; the work was skipped and
    /// recorded, per the orchestrator timeout policy.
    TimedOut { budget: Duration },
}

/// One pair's ledger entry in the batch report.
#[derive(Debug)]
pub struct BatchItem {
    pub index: usize,
    pub id: Uuid,
    pub elapsed: Duration,
    pub outcome: PairOutcome,
}

impl BatchItem {
    pub fn state(&self) -> PairState {
        match &self.outcome {
            PairOutcome::Completed(_) => PairState::Done,
            PairOutcome::Failed(_) => PairState::Failed,
            PairOutcome::Cancelled => PairState::Cancelled,
            PairOutcome::TimedOut { .. } => PairState::Failed,
        }
    }
}

/// Aggregate result of a batch run, ordered by pair index.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub items: Vec<BatchItem>,
}

impl BatchOutcome {
    pub fn completed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, PairOutcome::Completed(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.completed()
    }
}

/// Cooperative cancellation: in-progress pairs finish, not-yet-started
/// pairs are dropped.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Orchestrates the swap engine over a list of pairs.
pub struct BatchOrchestrator {
    engine: Arc<SwapEngine>,
    config: BatchConfig,
    cache: Option<Arc<ResultCache>>,
    states: Arc<Mutex<Vec<PairState>>>,
}

impl BatchOrchestrator {
    /// Build an orchestrator; the cache is created here when enabled so it
    /// is always an explicit object owned by this layer, never global.
    pub fn new(engine: Arc<SwapEngine>, config: BatchConfig) -> Self {
        let cache = if config.cache_enabled {
            Some(Arc::new(ResultCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            )))
        } else {
            None
        };
        Self {
            engine,
            config,
            cache,
            states: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Inject a pre-built (possibly shared) cache.
    pub fn with_cache(engine: Arc<SwapEngine>, config: BatchConfig, cache: Arc<ResultCache>) -> Self {
        Self {
            engine,
            config,
            cache: Some(cache),
            states: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the per-pair state table.
    pub fn states(&self) -> Vec<PairState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Process all pairs and return the per-item ledger, ordered by index.
    pub async fn run(
        &self,
        pairs: Vec<(RgbBuffer, RgbBuffer)>,
        cancel: CancelHandle,
    ) -> BatchOutcome {
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            *states = vec![PairState::Pending; pairs.len()];
        }
        tracing::info!(
            pairs = pairs.len(),
            mode = ?self.config.execution,
            workers = self.config.workers,
            "batch started"
        );

        let items = match self.config.execution {
            ExecutionMode::Sequential => self.run_sequential(pairs, &cancel).await,
            ExecutionMode::Parallel => self.run_parallel(pairs, &cancel).await,
            ExecutionMode::Adaptive => self.run_adaptive(pairs, &cancel).await,
        };

        let outcome = BatchOutcome { items };
        tracing::info!(
            completed = outcome.completed(),
            failed = outcome.failed(),
            "batch finished"
        );
        outcome
    }

    async fn run_sequential(
        &self,
        pairs: Vec<(RgbBuffer, RgbBuffer)>,
        cancel: &CancelHandle,
    ) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(pairs.len());
        for (index, (source, target)) in pairs.into_iter().enumerate() {
            if cancel.is_cancelled() {
                items.push(self.cancelled_item(index));
                continue;
            }
            items.push(self.run_one(index, source, target).await);
        }
        items
    }

    async fn run_parallel(
        &self,
        pairs: Vec<(RgbBuffer, RgbBuffer)>,
        cancel: &CancelHandle,
    ) -> Vec<BatchItem> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(pairs.len());

        for (index, (source, target)) in pairs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let this = self.clone_refs();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                if cancel.is_cancelled() {
                    return this.cancelled_item(index);
                }
                this.run_one(index, source, target).await
            }));
        }

        let mut items = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(item) => items.push(item),
                Err(e) => tracing::error!(error = %e, "batch worker task failed to join"),
            }
        }
        items.sort_by_key(|i| i.index);
        items
    }

    async fn run_adaptive(
        &self,
        pairs: Vec<(RgbBuffer, RgbBuffer)>,
        cancel: &CancelHandle,
    ) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(pairs.len());
        let mut go_parallel = false;
        let mut remaining: Vec<(usize, (RgbBuffer, RgbBuffer))> =
            pairs.into_iter().enumerate().collect();

        while !remaining.is_empty() {
            let round: Vec<(usize, (RgbBuffer, RgbBuffer))> = remaining
                .drain(..ADAPTIVE_BATCH_SIZE.min(remaining.len()))
                .collect();

            let round_items = if go_parallel {
                let indexed: Vec<(RgbBuffer, RgbBuffer)> =
                    round.iter().map(|(_, p)| p.clone()).collect();
                let offset: Vec<usize> = round.iter().map(|(i, _)| *i).collect();
                let mut out = self.run_parallel_indexed(indexed, &offset, cancel).await;
                out.sort_by_key(|i| i.index);
                out
            } else {
                let mut out = Vec::new();
                for (index, (source, target)) in round {
                    if cancel.is_cancelled() {
                        out.push(self.cancelled_item(index));
                        continue;
                    }
                    out.push(self.run_one(index, source, target).await);
                }
                out
            };

            // Strategy for the next round follows this round's mean latency
            let finished: Vec<&BatchItem> = round_items
                .iter()
                .filter(|i| !matches!(i.outcome, PairOutcome::Cancelled))
                .collect();
            if !finished.is_empty() {
                let mean = finished.iter().map(|i| i.elapsed).sum::<Duration>()
                    / finished.len() as u32;
                let next_parallel = mean > ADAPTIVE_LATENCY_THRESHOLD;
                if next_parallel != go_parallel {
                    tracing::debug!(
                        mean_ms = mean.as_millis() as u64,
                        parallel = next_parallel,
                        "adaptive mode switching strategy"
                    );
                }
                go_parallel = next_parallel;
            }

            items.extend(round_items);
        }

        items.sort_by_key(|i| i.index);
        items
    }

    async fn run_parallel_indexed(
        &self,
        pairs: Vec<(RgbBuffer, RgbBuffer)>,
        indices: &[usize],
        cancel: &CancelHandle,
    ) -> Vec<BatchItem> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(pairs.len());
        for (slot, (source, target)) in pairs.into_iter().enumerate() {
            let index = indices[slot];
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let this = self.clone_refs();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                if cancel.is_cancelled() {
                    return this.cancelled_item(index);
                }
                this.run_one(index, source, target).await
            }));
        }
        let mut items = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(item) = handle.await {
                items.push(item);
            }
        }
        items
    }

    /// Cheap handle clone for worker tasks: shared engine, cache and states.
    fn clone_refs(&self) -> BatchOrchestrator {
        BatchOrchestrator {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            cache: self.cache.clone(),
            states: Arc::clone(&self.states),
        }
    }

    fn cancelled_item(&self, index: usize) -> BatchItem {
        self.set_state(index, PairState::Cancelled);
        BatchItem {
            index,
            id: Uuid::new_v4(),
            elapsed: Duration::ZERO,
            outcome: PairOutcome::Cancelled,
        }
    }

    fn set_state(&self, index: usize, state: PairState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = states.get_mut(index) {
            *slot = state;
        }
    }

    /// Run one pair to completion: cache probe, pipeline, state updates,
    /// optional wall-clock timeout.
    async fn run_one(&self, index: usize, source: RgbBuffer, target: RgbBuffer) -> BatchItem {
        let started = Instant::now();
        let id = Uuid::new_v4();

        let engine = Arc::clone(&self.engine);
        let cache = self.cache.clone();
        let states = Arc::clone(&self.states);

        let task = tokio::task::spawn_blocking(move || {
            if let Some(cache) = &cache {
                let key = CacheKey::compute(&source, &target, &engine.config().fingerprint());
                if let Some(mut hit) = cache.get(&key) {
                    hit.diagnostics
                        .record(Stage::Cache, StageOutcome::Executed, "cache hit");
                    return PairOutcome::Completed(Box::new(hit));
                }

                let observer = state_observer(&states, index);
                match engine.swap_observed(&source, &target, &observer) {
                    Ok(result) => {
                        cache.insert(key, result.clone());
                        PairOutcome::Completed(Box::new(result))
                    }
                    Err(failure) => PairOutcome::Failed(failure),
                }
            } else {
                let observer = state_observer(&states, index);
                match engine.swap_observed(&source, &target, &observer) {
                    Ok(result) => PairOutcome::Completed(Box::new(result)),
                    Err(failure) => PairOutcome::Failed(failure),
                }
            }
        });

        let outcome = match self.config.pair_timeout_secs {
            Some(secs) => {
                let budget = Duration::from_secs(secs);
                match tokio::time::timeout(budget, task).await {
                    Ok(joined) => flatten_join(joined),
                    Err(_) => {
                        tracing::warn!(index, budget_secs = secs, "pair exceeded its time budget; skipping");
                        PairOutcome::TimedOut { budget }
                    }
                }
            }
            None => flatten_join(task.await),
        };

        self.set_state(
            index,
            match &outcome {
                PairOutcome::Completed(_) => PairState::Done,
                PairOutcome::Failed(_) => PairState::Failed,
                PairOutcome::Cancelled => PairState::Cancelled,
                PairOutcome::TimedOut { .. } => PairState::Failed,
            },
        );

        BatchItem {
            index,
            id,
            elapsed: started.elapsed(),
            outcome,
        }
    }
}

/// Map pipeline phases onto the batch state table.
fn state_observer(
    states: &Arc<Mutex<Vec<PairState>>>,
    index: usize,
) -> impl Fn(PairPhase) + '_ {
    move |phase| {
        let state = match phase {
            PairPhase::Detecting => PairState::Detecting,
            PairPhase::Aligning => PairState::Aligning,
            PairPhase::Blending => PairState::Blending,
            PairPhase::Enhancing => PairState::Enhancing,
            PairPhase::Scoring => PairState::Scored,
        };
        let mut states = states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = states.get_mut(index) {
            *slot = state;
        }
    }
}

/// A panicked worker is a failed pair, not a failed batch.
fn flatten_join(joined: Result<PairOutcome, tokio::task::JoinError>) -> PairOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "pair worker panicked");
            let mut diagnostics = Diagnostics::new();
            diagnostics.record(Stage::DetectSource, StageOutcome::Failed, e.to_string());
            PairOutcome::Failed(Box::new(PairFailure {
                stage: Stage::DetectSource,
                message: format!("worker panicked: {e}"),
                fallback_attempted: None,
                diagnostics,
            }))
        }
    }
}
