//! Pipeline and batch configuration.
//!
//! Loaded from `REFACE_*` environment variables with typed defaults, or
//! deserialized from a TOML file by the CLI. Every host-facing scalar
//! (`detection_model`, `blending_mode`, `strength`, ...) lands here and is
//! resolved to its typed form exactly once.

use reface_core::{
    AlignMethod, AlignOptions, BackendPolicy, BlendMode, EnhanceMode, FaceSelection,
    PoissonBudget, QualityThresholds, QualityWeights,
};
use serde::{Deserialize, Serialize};

/// Configuration for the per-pair pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the SCRFD detection model (ONNX). `None` disables the backend.
    pub scrfd_model: Option<String>,
    /// Path to the SeetaFace detection model. `None` disables the backend.
    pub seeta_model: Option<String>,
    /// Path to the embedding model for the identity diagnostic. Optional.
    pub embed_model: Option<String>,
    pub backend_policy: BackendPolicy,
    pub face_selection: FaceSelection,
    pub align_method: AlignMethod,
    /// 0.0 = no pose correction, 1.0 = full estimated transform.
    pub pose_strength: f32,
    pub blend_mode: BlendMode,
    /// Global blend strength in [0, 1].
    pub strength: f32,
    /// Mask feather amount in [0, 1].
    pub feathering: f32,
    pub enhance_mode: EnhanceMode,
    pub quality_weights: QualityWeights,
    pub quality_thresholds: QualityThresholds,
    pub poisson_budget: PoissonBudget,
    /// When true, a degenerate alignment degrades to the identity transform
    /// instead of failing the pair.
    pub allow_identity_fallback: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scrfd_model: None,
            seeta_model: None,
            embed_model: None,
            backend_policy: BackendPolicy::Priority,
            face_selection: FaceSelection::ConfidenceBased,
            align_method: AlignMethod::RobustSimilarity,
            pose_strength: 1.0,
            blend_mode: BlendMode::MultiBand,
            strength: 1.0,
            feathering: 0.5,
            enhance_mode: EnhanceMode::Full,
            quality_weights: QualityWeights::default(),
            quality_thresholds: QualityThresholds::default(),
            poisson_budget: PoissonBudget::default(),
            allow_identity_fallback: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `REFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scrfd_model: std::env::var("REFACE_SCRFD_MODEL").ok(),
            seeta_model: std::env::var("REFACE_SEETA_MODEL").ok(),
            embed_model: std::env::var("REFACE_EMBED_MODEL").ok(),
            backend_policy: env_parsed("REFACE_BACKEND_POLICY", defaults.backend_policy),
            face_selection: env_parsed("REFACE_FACE_SELECTION", defaults.face_selection),
            align_method: env_parsed("REFACE_ALIGN_METHOD", defaults.align_method),
            pose_strength: env_f32("REFACE_POSE_STRENGTH", defaults.pose_strength),
            blend_mode: env_parsed("REFACE_BLEND_MODE", defaults.blend_mode),
            strength: env_f32("REFACE_STRENGTH", defaults.strength),
            feathering: env_f32("REFACE_FEATHERING", defaults.feathering),
            enhance_mode: env_parsed("REFACE_ENHANCE_MODE", defaults.enhance_mode),
            quality_weights: defaults.quality_weights,
            quality_thresholds: defaults.quality_thresholds,
            poisson_budget: PoissonBudget {
                max_iterations: env_usize(
                    "REFACE_POISSON_MAX_ITERATIONS",
                    defaults.poisson_budget.max_iterations,
                ),
                tolerance: env_f32("REFACE_POISSON_TOLERANCE", defaults.poisson_budget.tolerance),
            },
            allow_identity_fallback: std::env::var("REFACE_ALLOW_IDENTITY_FALLBACK")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.allow_identity_fallback),
        }
    }

    /// Alignment options derived from the config scalars.
    pub fn align_options(&self) -> AlignOptions {
        AlignOptions {
            method: self.align_method,
            pose_strength: self.pose_strength,
        }
    }

    /// Stable string identifying every parameter that affects the output.
    /// Used as part of the result-cache key.
    pub fn fingerprint(&self) -> String {
        format!(
            "policy={:?};select={:?};align={:?};pose={};blend={};strength={};feather={};enhance={:?};poisson={}x{};idfb={}",
            self.backend_policy,
            self.face_selection,
            self.align_method,
            self.pose_strength,
            self.blend_mode,
            self.strength,
            self.feathering,
            self.enhance_mode,
            self.poisson_budget.max_iterations,
            self.poisson_budget.tolerance,
            self.allow_identity_fallback,
        )
    }
}

/// How the batch orchestrator schedules pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One pair at a time, deterministic order.
    Sequential,
    /// Concurrent pairs up to the worker bound.
    Parallel,
    /// Batched; switches strategy based on observed per-pair latency.
    Adaptive,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "adaptive" => Ok(ExecutionMode::Adaptive),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Batch orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub execution: ExecutionMode,
    /// Worker bound for parallel execution.
    pub workers: usize,
    /// Optional wall-clock budget per pair, in seconds. Expired pairs are
    /// recorded as failed and the batch moves on.
    pub pair_timeout_secs: Option<u64>,
    /// Result cache switch and sizing.
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Sequential,
            workers: 4,
            pair_timeout_secs: None,
            cache_enabled: false,
            cache_capacity: 64,
            cache_ttl_secs: 300,
        }
    }
}

impl BatchConfig {
    /// Load configuration from `REFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            execution: env_parsed("REFACE_EXECUTION", defaults.execution),
            workers: env_usize("REFACE_WORKERS", defaults.workers).max(1),
            pair_timeout_secs: std::env::var("REFACE_PAIR_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            cache_enabled: std::env::var("REFACE_CACHE_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.cache_enabled),
            cache_capacity: env_usize("REFACE_CACHE_CAPACITY", defaults.cache_capacity),
            cache_ttl_secs: env_u64("REFACE_CACHE_TTL_SECS", defaults.cache_ttl_secs),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
