//! Per-pair swap pipeline: detect → select → align → blend → enhance →
//! score, with the error-absorption policy from the component contracts.
//!
//! Recoverable failures (blend degradation, identity-transform fallback,
//! embedding errors) are recorded in diagnostics and the pair continues;
//! fatal failures (no detection, degenerate alignment without fallback)
//! become a per-pair failure value, never a panic or batch abort.

use crate::config::PipelineConfig;
use crate::diagnostics::{Diagnostics, Stage, StageOutcome};
use reface_core::{
    align, blend, enhance, face_mask, identity_alignment, quality, BackendRun, EnsembleDetector,
    FaceCandidate, FaceEmbedder, RgbBuffer,
};
use std::sync::Mutex;

/// Output of a successful swap.
#[derive(Debug, Clone)]
pub struct SwapResult {
    pub image: RgbBuffer,
    pub quality: quality::QualityScore,
    pub diagnostics: Diagnostics,
}

/// A pair-fatal failure: which stage died, why, and what fallback (if any)
/// was attempted before giving up.
#[derive(Debug, Clone)]
pub struct PairFailure {
    pub stage: Stage,
    pub message: String,
    pub fallback_attempted: Option<String>,
    pub diagnostics: Diagnostics,
}

impl std::fmt::Display for PairFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.message)?;
        if let Some(fb) = &self.fallback_attempted {
            write!(f, " (fallback attempted: {fb})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PairFailure {}

/// Coarse pipeline phase, reported to the orchestrator's state machine as
/// the pair progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    Detecting,
    Aligning,
    Blending,
    Enhancing,
    Scoring,
}

/// The per-pair engine: probed detector ensemble, optional embedder, and
/// the stage configuration. One instance serves the whole batch; the
/// stateful model sessions sit behind locks so pairs can run concurrently.
pub struct SwapEngine {
    config: PipelineConfig,
    detector: Mutex<EnsembleDetector>,
    embedder: Option<Mutex<FaceEmbedder>>,
}

impl SwapEngine {
    /// Probe backends per the configuration. Detector backends that fail to
    /// load are skipped (and recorded per call); a missing embedding model
    /// just disables the identity diagnostic.
    pub fn from_config(config: PipelineConfig) -> Self {
        let detector = EnsembleDetector::probe(
            config.scrfd_model.as_deref(),
            config.seeta_model.as_deref(),
        );

        let embedder = match config.embed_model.as_deref() {
            Some(path) => match FaceEmbedder::load(path) {
                Ok(e) => Some(Mutex::new(e)),
                Err(e) => {
                    tracing::warn!(path, error = %e, "embedding model unavailable; identity diagnostic disabled");
                    None
                }
            },
            None => None,
        };

        Self {
            config,
            detector: Mutex::new(detector),
            embedder,
        }
    }

    /// Build an engine from pre-constructed components (tests, custom hosts).
    pub fn with_components(
        config: PipelineConfig,
        detector: EnsembleDetector,
        embedder: Option<FaceEmbedder>,
    ) -> Self {
        Self {
            config,
            detector: Mutex::new(detector),
            embedder: embedder.map(Mutex::new),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline for one source/target pair.
    pub fn swap(&self, source: &RgbBuffer, target: &RgbBuffer) -> Result<SwapResult, Box<PairFailure>> {
        self.swap_observed(source, target, &|_| {})
    }

    /// Like [`swap`](Self::swap), reporting phase transitions to `observe`.
    pub fn swap_observed(
        &self,
        source: &RgbBuffer,
        target: &RgbBuffer,
        observe: &dyn Fn(PairPhase),
    ) -> Result<SwapResult, Box<PairFailure>> {
        let mut diagnostics = Diagnostics::new();
        let config = &self.config;

        // --- Detection ---
        observe(PairPhase::Detecting);
        let source_face =
            self.detect_one(source, Stage::DetectSource, &mut diagnostics)?;
        let target_face =
            self.detect_one(target, Stage::DetectTarget, &mut diagnostics)?;

        // --- Alignment ---
        observe(PairPhase::Aligning);
        let (tw, th) = target.dimensions();
        let aligned = match align(
            source,
            &source_face.landmarks,
            &target_face.landmarks,
            tw,
            th,
            &config.align_options(),
        ) {
            Ok(a) => {
                diagnostics.record(
                    Stage::Align,
                    StageOutcome::Executed,
                    format!(
                        "scale {:.3}, rotation {:.1} deg",
                        a.transform.scale, a.transform.rotation_degrees
                    ),
                );
                a
            }
            Err(e) if config.allow_identity_fallback => {
                tracing::warn!(error = %e, "alignment degenerate; using identity transform");
                diagnostics.record(
                    Stage::Align,
                    StageOutcome::Degraded,
                    format!("{e}; identity transform fallback"),
                );
                identity_alignment(source, tw, th)
            }
            Err(e) => {
                diagnostics.record(Stage::Align, StageOutcome::Failed, e.to_string());
                return Err(Box::new(PairFailure {
                    stage: Stage::Align,
                    message: e.to_string(),
                    fallback_attempted: Some("identity fallback disabled by configuration".into()),
                    diagnostics,
                }));
            }
        };

        // --- Blending ---
        observe(PairPhase::Blending);
        let mask = face_mask(
            &target_face.landmarks,
            &target_face.bbox,
            tw,
            th,
            config.feathering,
        )
        .multiply(&aligned.coverage);

        let blended = match blend(
            target,
            &aligned.warped,
            &mask,
            config.blend_mode,
            config.strength,
            Some(&target_face.landmarks),
            &config.poisson_budget,
        ) {
            Ok(outcome) => {
                if outcome.degraded() {
                    diagnostics.record(
                        Stage::Blend,
                        StageOutcome::Degraded,
                        format!("{} -> {}", outcome.requested, outcome.used),
                    );
                } else {
                    diagnostics.record(
                        Stage::Blend,
                        StageOutcome::Executed,
                        outcome.used.to_string(),
                    );
                }
                outcome.output
            }
            Err(e) => {
                diagnostics.record(Stage::Blend, StageOutcome::Failed, e.to_string());
                return Err(Box::new(PairFailure {
                    stage: Stage::Blend,
                    message: e.to_string(),
                    fallback_attempted: Some("alpha".into()),
                    diagnostics,
                }));
            }
        };

        // --- Enhancement ---
        observe(PairPhase::Enhancing);
        let source_stats = enhance::RegionStats::measure(&aligned.warped, &mask);
        let target_stats = enhance::RegionStats::measure(target, &mask);
        let composited = enhance::enhance(
            &blended,
            &mask,
            &source_stats,
            &target_stats,
            config.enhance_mode,
        );
        diagnostics.record(
            Stage::Enhance,
            StageOutcome::Executed,
            format!("{:?}", config.enhance_mode),
        );

        // --- Scoring ---
        observe(PairPhase::Scoring);
        let quality = quality::score(
            &target_face,
            &composited,
            &config.quality_weights,
            &config.quality_thresholds,
        );
        diagnostics.record(
            Stage::Score,
            StageOutcome::Executed,
            format!("overall {:.3}", quality.overall),
        );

        // --- Identity diagnostic (optional, never fatal) ---
        if let Some(embedder) = &self.embedder {
            let mut embedder = embedder.lock().unwrap_or_else(|e| e.into_inner());
            let similarity = embedder.extract(source, &source_face).and_then(|src_emb| {
                let dst_emb = embedder.extract(&composited, &target_face)?;
                Ok(src_emb.similarity(&dst_emb))
            });
            match similarity {
                Ok(similarity) => {
                    diagnostics.identity_similarity = Some(similarity);
                    diagnostics.record(
                        Stage::Embed,
                        StageOutcome::Executed,
                        format!("identity similarity {similarity:.3}"),
                    );
                }
                Err(e) => {
                    diagnostics.record(Stage::Embed, StageOutcome::Failed, e.to_string());
                }
            }
        }

        Ok(SwapResult {
            image: composited,
            quality,
            diagnostics,
        })
    }

    /// Detect in one image and apply the face-selection policy. Appends the
    /// per-backend run log to diagnostics under the given stage.
    fn detect_one(
        &self,
        image: &RgbBuffer,
        stage: Stage,
        diagnostics: &mut Diagnostics,
    ) -> Result<FaceCandidate, Box<PairFailure>> {
        let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
        match detector.detect(image, self.config.backend_policy) {
            Ok((result, runs)) => {
                for run in runs {
                    record_backend_run(diagnostics, stage, &run);
                }
                match result.select(self.config.face_selection) {
                    Some(face) => Ok(face.clone()),
                    None => {
                        let message = format!(
                            "face selection {:?} matched none of {} candidates",
                            self.config.face_selection,
                            result.len()
                        );
                        diagnostics.record(stage, StageOutcome::Failed, message.clone());
                        Err(Box::new(PairFailure {
                            stage,
                            message,
                            fallback_attempted: None,
                            diagnostics: diagnostics.clone(),
                        }))
                    }
                }
            }
            Err(e) => {
                diagnostics.record(stage, StageOutcome::Failed, e.to_string());
                Err(Box::new(PairFailure {
                    stage,
                    message: e.to_string(),
                    fallback_attempted: None,
                    diagnostics: diagnostics.clone(),
                }))
            }
        }
    }
}

fn record_backend_run(diagnostics: &mut Diagnostics, stage: Stage, run: &BackendRun) {
    match run {
        BackendRun::Ran { kind, candidates } => diagnostics.record(
            stage,
            StageOutcome::Executed,
            format!("{kind}: {candidates} candidates"),
        ),
        BackendRun::Failed { kind, error } => {
            diagnostics.record(stage, StageOutcome::Failed, format!("{kind}: {error}"))
        }
        BackendRun::SkippedUnavailable { kind, reason } => {
            diagnostics.record(stage, StageOutcome::Skipped, format!("{kind}: {reason}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reface_core::{
        BackendKind, BlendMode, BoundingBox, DetectError, DetectorBackend, EnhanceMode,
        FaceCandidate, Landmarks,
    };

    /// Deterministic backend yielding one synthetic face per image.
    struct StubBackend {
        candidates: Vec<FaceCandidate>,
    }

    impl DetectorBackend for StubBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Scrfd
        }

        fn detect(&mut self, _image: &RgbBuffer) -> Result<Vec<FaceCandidate>, DetectError> {
            Ok(self.candidates.clone())
        }
    }

    fn face_at(cx: f32, cy: f32, size: f32, conf: f32) -> FaceCandidate {
        let half = size / 2.0;
        FaceCandidate {
            bbox: BoundingBox::new(cx - half, cy - half, size, size),
            landmarks: Landmarks::Five([
                (cx - 0.2 * size, cy - 0.12 * size),
                (cx + 0.2 * size, cy - 0.12 * size),
                (cx, cy + 0.08 * size),
                (cx - 0.16 * size, cy + 0.28 * size),
                (cx + 0.16 * size, cy + 0.28 * size),
            ]),
            confidence: conf,
            source: BackendKind::Scrfd,
        }
    }

    fn textured(w: u32, h: u32, phase: u32) -> RgbBuffer {
        let mut img = RgbBuffer::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = if ((x + phase) / 3 + y / 3) % 2 == 0 { 0.3 } else { 0.7 };
                img.set_pixel(x, y, [v, v * 0.9, v * 0.8]);
            }
        }
        img
    }

    fn engine_with(candidates: Vec<FaceCandidate>, config: PipelineConfig) -> SwapEngine {
        let ensemble = EnsembleDetector::new(
            vec![Box::new(StubBackend { candidates })],
            vec![],
        );
        SwapEngine::with_components(config, ensemble, None)
    }

    #[test]
    fn test_swap_happy_path() {
        let config = PipelineConfig {
            blend_mode: BlendMode::Alpha,
            ..Default::default()
        };
        let engine = engine_with(vec![face_at(32.0, 32.0, 30.0, 0.9)], config);

        let source = textured(64, 64, 0);
        let target = textured(64, 64, 1);
        let result = engine.swap(&source, &target).unwrap();

        assert_eq!(result.image.dimensions(), target.dimensions());
        assert!(result.quality.overall > 0.0);
        assert!(result
            .diagnostics
            .for_stage(Stage::Blend)
            .any(|e| e.outcome == StageOutcome::Executed));
    }

    #[test]
    fn test_swap_records_phases_in_order() {
        let engine = engine_with(
            vec![face_at(32.0, 32.0, 30.0, 0.9)],
            PipelineConfig {
                blend_mode: BlendMode::Alpha,
                ..Default::default()
            },
        );
        let phases = std::sync::Mutex::new(Vec::new());
        engine
            .swap_observed(&textured(64, 64, 0), &textured(64, 64, 1), &|p| {
                phases.lock().unwrap().push(p);
            })
            .unwrap();
        let phases = phases.into_inner().unwrap();
        assert_eq!(
            phases,
            vec![
                PairPhase::Detecting,
                PairPhase::Aligning,
                PairPhase::Blending,
                PairPhase::Enhancing,
                PairPhase::Scoring,
            ]
        );
    }

    #[test]
    fn test_no_faces_is_pair_fatal() {
        let engine = engine_with(vec![], PipelineConfig::default());
        let err = engine
            .swap(&textured(64, 64, 0), &textured(64, 64, 1))
            .unwrap_err();
        assert_eq!(err.stage, Stage::DetectSource);
        assert!(err.message.contains("no face detected"));
    }

    #[test]
    fn test_degenerate_alignment_fails_without_fallback() {
        // All landmarks coincident: the similarity solve is singular
        let mut face = face_at(32.0, 32.0, 30.0, 0.9);
        face.landmarks = Landmarks::Five([(32.0, 32.0); 5]);
        let engine = engine_with(vec![face], PipelineConfig::default());
        let err = engine
            .swap(&textured(64, 64, 0), &textured(64, 64, 1))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Align);
        assert!(err.fallback_attempted.is_some());
    }

    #[test]
    fn test_degenerate_alignment_with_identity_fallback() {
        let mut face = face_at(32.0, 32.0, 30.0, 0.9);
        face.landmarks = Landmarks::Five([(32.0, 32.0); 5]);
        let config = PipelineConfig {
            allow_identity_fallback: true,
            blend_mode: BlendMode::Alpha,
            enhance_mode: EnhanceMode::None,
            ..Default::default()
        };
        let engine = engine_with(vec![face], config);
        let result = engine
            .swap(&textured(64, 64, 0), &textured(64, 64, 1))
            .unwrap();
        assert!(result
            .diagnostics
            .for_stage(Stage::Align)
            .any(|e| e.outcome == StageOutcome::Degraded));
    }

    #[test]
    fn test_selection_index_out_of_range_fails() {
        let config = PipelineConfig {
            face_selection: reface_core::FaceSelection::Index(5),
            ..Default::default()
        };
        let engine = engine_with(vec![face_at(32.0, 32.0, 30.0, 0.9)], config);
        let err = engine
            .swap(&textured(64, 64, 0), &textured(64, 64, 1))
            .unwrap_err();
        assert!(err.message.contains("face selection"));
    }

    #[test]
    fn test_poisson_degradation_recorded_and_output_valid() {
        let config = PipelineConfig {
            blend_mode: BlendMode::PoissonSeamless,
            poisson_budget: reface_core::PoissonBudget {
                max_iterations: 1,
                tolerance: 1e-12,
            },
            enhance_mode: EnhanceMode::None,
            ..Default::default()
        };
        let engine = engine_with(vec![face_at(32.0, 32.0, 30.0, 0.9)], config);
        let result = engine
            .swap(&textured(64, 64, 0), &textured(64, 64, 1))
            .unwrap();
        assert_eq!(result.image.dimensions(), (64, 64));
        assert!(result
            .diagnostics
            .for_stage(Stage::Blend)
            .any(|e| e.outcome == StageOutcome::Degraded));
    }

    #[test]
    fn test_full_mask_alpha_swap_equals_warped_source() {
        // Alpha blend at strength 1: inside the mask the composite is
        // exactly the warped source, outside it is exactly the target.
        let face = face_at(128.0, 128.0, 120.0, 0.95);
        let config = PipelineConfig {
            blend_mode: BlendMode::Alpha,
            strength: 1.0,
            feathering: 0.0,
            enhance_mode: EnhanceMode::None,
            ..Default::default()
        };
        let engine = engine_with(vec![face.clone()], config.clone());

        let source = textured(256, 256, 0);
        let target = textured(256, 256, 1);
        let result = engine.swap(&source, &target).unwrap();

        // Recompute the warp independently; align is deterministic, so the
        // engine produced byte-identical warped pixels.
        let expected = reface_core::align(
            &source,
            &face.landmarks,
            &face.landmarks,
            256,
            256,
            &config.align_options(),
        )
        .unwrap();

        let mask = face_mask(&face.landmarks, &face.bbox, 256, 256, 0.0)
            .multiply(&expected.coverage);
        let mut checked = 0;
        for y in 0..256u32 {
            for x in 0..256u32 {
                if mask.get(x, y) == 1.0 {
                    assert_eq!(result.image.pixel(x, y), expected.warped.pixel(x, y));
                    checked += 1;
                } else if mask.get(x, y) == 0.0 {
                    assert_eq!(result.image.pixel(x, y), target.pixel(x, y));
                }
            }
        }
        assert!(checked > 1000, "mask interior unexpectedly small: {checked}");
    }
}
