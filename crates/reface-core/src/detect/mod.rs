//! Face detection — backend trait, capability probing and ensemble policies.
//!
//! Individual backends (SCRFD via ONNX Runtime, SeetaFace via rustface)
//! produce raw candidate lists; this module owns ranking, deduplication,
//! confidence-weighted merging and primary-face selection.

mod scrfd;
mod seeta;

pub use scrfd::ScrfdDetector;
pub use seeta::SeetaDetector;

use crate::geometry::{BoundingBox, Landmarks};
use crate::imagebuf::RgbBuffer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IoU above which two candidates from different backends are considered
/// the same face.
const ENSEMBLE_IOU_THRESHOLD: f32 = 0.5;
/// Confidence gap below which primary-face selection falls back to bbox area.
const PRIMARY_CONFIDENCE_MARGIN: f32 = 0.02;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no face detected by any available backend")]
    NoFaceDetected,
    #[error("no detection backend is available")]
    NoBackendAvailable,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Which backend produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Scrfd,
    Seeta,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Scrfd => write!(f, "scrfd"),
            BackendKind::Seeta => write!(f, "seeta"),
        }
    }
}

/// A detected face: bounding box, landmarks, confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
    pub source: BackendKind,
}

/// Candidates for one image, ordered by confidence descending; exact ties
/// broken by larger bbox area.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    candidates: Vec<FaceCandidate>,
}

/// How to pick one face out of a multi-face detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSelection {
    /// The top-ranked candidate.
    First,
    /// The candidate with the largest bbox area.
    Largest,
    /// Highest confidence, with the near-tie area rule.
    ConfidenceBased,
    /// A caller-specified index into the ranked list.
    Index(usize),
}

impl DetectionResult {
    pub fn from_candidates(mut candidates: Vec<FaceCandidate>) -> Self {
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.bbox
                        .area()
                        .partial_cmp(&a.bbox.area())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        Self { candidates }
    }

    pub fn candidates(&self) -> &[FaceCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Primary face: highest confidence; when the top candidates are within
    /// [`PRIMARY_CONFIDENCE_MARGIN`] of each other, the larger bbox wins.
    pub fn primary(&self) -> Option<&FaceCandidate> {
        let best = self.candidates.first()?;
        let mut pick = best;
        for c in &self.candidates[1..] {
            if best.confidence - c.confidence > PRIMARY_CONFIDENCE_MARGIN {
                break;
            }
            if c.bbox.area() > pick.bbox.area() {
                pick = c;
            }
        }
        Some(pick)
    }

    /// Apply a face-selection policy to the ranked list.
    pub fn select(&self, policy: FaceSelection) -> Option<&FaceCandidate> {
        match policy {
            FaceSelection::First => self.candidates.first(),
            FaceSelection::Largest => self
                .candidates
                .iter()
                .max_by(|a, b| {
                    a.bbox
                        .area()
                        .partial_cmp(&b.bbox.area())
                        .unwrap_or(std::cmp::Ordering::Equal)
                }),
            FaceSelection::ConfidenceBased => self.primary(),
            FaceSelection::Index(i) => self.candidates.get(i),
        }
    }
}

/// Composite detection policy, resolved once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPolicy {
    /// First backend in priority order that yields at least one candidate.
    Priority,
    /// Run all backends, union candidates, dedupe by IoU keeping the
    /// highest confidence.
    Hybrid,
    /// Run all backends, merge overlapping candidates by confidence-weighted
    /// averaging of bbox and landmarks.
    ConfidenceWeighted,
}

impl std::str::FromStr for FaceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(FaceSelection::First),
            "largest" => Ok(FaceSelection::Largest),
            "confidence" | "confidence_based" => Ok(FaceSelection::ConfidenceBased),
            other => other
                .parse::<usize>()
                .map(FaceSelection::Index)
                .map_err(|_| format!("unknown face selection: {other}")),
        }
    }
}

impl std::str::FromStr for BackendPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(BackendPolicy::Priority),
            "hybrid" => Ok(BackendPolicy::Hybrid),
            "confidence_weighted" => Ok(BackendPolicy::ConfidenceWeighted),
            other => Err(format!("unknown backend policy: {other}")),
        }
    }
}

/// A single detection backend. Implementations hold their model handle and
/// are probed once at construction (missing models mean the backend simply
/// never enters the ensemble).
pub trait DetectorBackend: Send {
    fn kind(&self) -> BackendKind;
    fn detect(&mut self, image: &RgbBuffer) -> Result<Vec<FaceCandidate>, DetectError>;
}

/// What happened to each backend during one detect call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendRun {
    Ran { kind: BackendKind, candidates: usize },
    Failed { kind: BackendKind, error: String },
    SkippedUnavailable { kind: BackendKind, reason: String },
}

/// Ensemble over the probed backends, in fixed priority order.
pub struct EnsembleDetector {
    backends: Vec<Box<dyn DetectorBackend>>,
    /// Backends that failed the startup probe, with the reason. Consulted by
    /// diagnostics; the dispatch loop never re-probes.
    unavailable: Vec<(BackendKind, String)>,
}

impl EnsembleDetector {
    /// Build an ensemble from already-probed backends. Priority order is the
    /// order of the vector.
    pub fn new(
        backends: Vec<Box<dyn DetectorBackend>>,
        unavailable: Vec<(BackendKind, String)>,
    ) -> Self {
        Self {
            backends,
            unavailable,
        }
    }

    /// Probe the standard backend set: SCRFD (if a model path is given),
    /// then SeetaFace. Each load failure is recorded, not raised.
    pub fn probe(scrfd_model: Option<&str>, seeta_model: Option<&str>) -> Self {
        let mut backends: Vec<Box<dyn DetectorBackend>> = Vec::new();
        let mut unavailable = Vec::new();

        match scrfd_model {
            Some(path) => match ScrfdDetector::load(path) {
                Ok(d) => {
                    tracing::info!(path, "SCRFD backend available");
                    backends.push(Box::new(d));
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "SCRFD backend unavailable");
                    unavailable.push((BackendKind::Scrfd, e.to_string()));
                }
            },
            None => unavailable.push((BackendKind::Scrfd, "no model configured".into())),
        }

        match seeta_model {
            Some(path) => match SeetaDetector::load(path) {
                Ok(d) => {
                    tracing::info!(path, "SeetaFace backend available");
                    backends.push(Box::new(d));
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "SeetaFace backend unavailable");
                    unavailable.push((BackendKind::Seeta, e.to_string()));
                }
            },
            None => unavailable.push((BackendKind::Seeta, "no model configured".into())),
        }

        Self {
            backends,
            unavailable,
        }
    }

    /// Kinds of the backends that survived the probe, in priority order.
    pub fn available(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// Detect faces under the given policy.
    ///
    /// Per-backend failures are tolerated and recorded; zero candidates
    /// across every viable backend is a hard error.
    pub fn detect(
        &mut self,
        image: &RgbBuffer,
        policy: BackendPolicy,
    ) -> Result<(DetectionResult, Vec<BackendRun>), DetectError> {
        if self.backends.is_empty() {
            return Err(DetectError::NoBackendAvailable);
        }

        let mut runs: Vec<BackendRun> = self
            .unavailable
            .iter()
            .map(|(kind, reason)| BackendRun::SkippedUnavailable {
                kind: *kind,
                reason: reason.clone(),
            })
            .collect();

        let mut pools: Vec<Vec<FaceCandidate>> = Vec::new();

        for backend in &mut self.backends {
            let kind = backend.kind();
            match backend.detect(image) {
                Ok(candidates) => {
                    tracing::debug!(backend = %kind, count = candidates.len(), "backend ran");
                    runs.push(BackendRun::Ran {
                        kind,
                        candidates: candidates.len(),
                    });
                    let got_any = !candidates.is_empty();
                    pools.push(candidates);
                    if got_any && policy == BackendPolicy::Priority {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(backend = %kind, error = %e, "backend failed; skipping");
                    runs.push(BackendRun::Failed {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        let all: Vec<FaceCandidate> = pools.into_iter().flatten().collect();
        if all.is_empty() {
            return Err(DetectError::NoFaceDetected);
        }

        let merged = match policy {
            BackendPolicy::Priority => all,
            BackendPolicy::Hybrid => suppress_overlaps(all, ENSEMBLE_IOU_THRESHOLD),
            BackendPolicy::ConfidenceWeighted => {
                merge_confidence_weighted(all, ENSEMBLE_IOU_THRESHOLD)
            }
        };

        Ok((DetectionResult::from_candidates(merged), runs))
    }
}

/// Greedy non-maximum suppression keeping the highest-confidence candidate
/// of each overlapping group. Shared by the SCRFD decoder and the hybrid
/// ensemble policy.
pub(crate) fn suppress_overlaps(
    mut candidates: Vec<FaceCandidate>,
    iou_threshold: f32,
) -> Vec<FaceCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceCandidate> = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(candidates[i].clone());
    }

    keep
}

/// Cluster candidates by IoU and collapse each cluster into one candidate
/// whose bbox and landmarks are the confidence-weighted average of its
/// members. Landmarks are merged on the five-point stable subset so that
/// mixed 5/68-point clusters stay well-defined.
fn merge_confidence_weighted(candidates: Vec<FaceCandidate>, iou_threshold: f32) -> Vec<FaceCandidate> {
    let mut assigned = vec![false; candidates.len()];
    let mut merged = Vec::new();

    // Seed clusters from the highest-confidence candidate outward.
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .confidence
            .partial_cmp(&candidates[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for &seed in &order {
        if assigned[seed] {
            continue;
        }
        let mut cluster = vec![seed];
        assigned[seed] = true;
        for &other in &order {
            if !assigned[other]
                && candidates[seed].bbox.iou(&candidates[other].bbox) > iou_threshold
            {
                assigned[other] = true;
                cluster.push(other);
            }
        }

        if cluster.len() == 1 {
            merged.push(candidates[seed].clone());
            continue;
        }

        let total_w: f32 = cluster.iter().map(|&i| candidates[i].confidence).sum();
        let mut bbox = BoundingBox::new(0.0, 0.0, 0.0, 0.0);
        let mut points = [(0.0f32, 0.0f32); 5];
        for &i in &cluster {
            let c = &candidates[i];
            let w = c.confidence / total_w;
            bbox.x += c.bbox.x * w;
            bbox.y += c.bbox.y * w;
            bbox.width += c.bbox.width * w;
            bbox.height += c.bbox.height * w;
            for (p, s) in points.iter_mut().zip(c.landmarks.stable_subset()) {
                p.0 += s.0 * w;
                p.1 += s.1 * w;
            }
        }

        merged.push(FaceCandidate {
            bbox,
            landmarks: Landmarks::Five(points),
            confidence: candidates[cluster[0]].confidence,
            source: candidates[cluster[0]].source,
        });
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceCandidate {
        FaceCandidate {
            bbox: BoundingBox::new(x, y, w, h),
            landmarks: Landmarks::Five([
                (x + 0.3 * w, y + 0.4 * h),
                (x + 0.7 * w, y + 0.4 * h),
                (x + 0.5 * w, y + 0.6 * h),
                (x + 0.35 * w, y + 0.8 * h),
                (x + 0.65 * w, y + 0.8 * h),
            ]),
            confidence: conf,
            source: BackendKind::Scrfd,
        }
    }

    struct StubBackend {
        kind: BackendKind,
        result: Result<Vec<FaceCandidate>, String>,
    }

    impl DetectorBackend for StubBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn detect(&mut self, _image: &RgbBuffer) -> Result<Vec<FaceCandidate>, DetectError> {
            match &self.result {
                Ok(c) => Ok(c.clone()),
                Err(e) => Err(DetectError::InferenceFailed(e.clone())),
            }
        }
    }

    #[test]
    fn test_result_ordering() {
        let r = DetectionResult::from_candidates(vec![
            candidate(0.0, 0.0, 10.0, 10.0, 0.5),
            candidate(0.0, 0.0, 10.0, 10.0, 0.9),
            candidate(0.0, 0.0, 10.0, 10.0, 0.7),
        ]);
        let confs: Vec<f32> = r.candidates().iter().map(|c| c.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn test_exact_tie_broken_by_area() {
        let r = DetectionResult::from_candidates(vec![
            candidate(0.0, 0.0, 10.0, 10.0, 0.8),
            candidate(50.0, 50.0, 40.0, 40.0, 0.8),
        ]);
        assert_eq!(r.candidates()[0].bbox.width, 40.0);
    }

    #[test]
    fn test_primary_prefers_confidence() {
        let r = DetectionResult::from_candidates(vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.6),
            candidate(200.0, 0.0, 10.0, 10.0, 0.9),
        ]);
        assert_eq!(r.primary().unwrap().confidence, 0.9);
    }

    #[test]
    fn test_primary_near_tie_prefers_area() {
        let r = DetectionResult::from_candidates(vec![
            candidate(200.0, 0.0, 10.0, 10.0, 0.90),
            candidate(0.0, 0.0, 100.0, 100.0, 0.89),
        ]);
        // 0.90 vs 0.89 is within the margin, so the bigger face wins
        assert_eq!(r.primary().unwrap().bbox.width, 100.0);
    }

    #[test]
    fn test_selection_policies() {
        let r = DetectionResult::from_candidates(vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.5),
            candidate(200.0, 0.0, 10.0, 10.0, 0.9),
        ]);
        assert_eq!(r.select(FaceSelection::First).unwrap().confidence, 0.9);
        assert_eq!(
            r.select(FaceSelection::Largest).unwrap().bbox.width,
            100.0
        );
        assert_eq!(r.select(FaceSelection::Index(1)).unwrap().confidence, 0.5);
        assert!(r.select(FaceSelection::Index(9)).is_none());
    }

    #[test]
    fn test_suppress_overlaps() {
        let result = suppress_overlaps(
            vec![
                candidate(0.0, 0.0, 100.0, 100.0, 0.9),
                candidate(5.0, 5.0, 100.0, 100.0, 0.8),
                candidate(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_merge_leans_toward_confident_candidate() {
        // Overlapping candidates at 0.9 and 0.3 confidence; merged bbox must
        // land closer to the 0.9 one.
        let strong = candidate(100.0, 100.0, 50.0, 50.0, 0.9);
        let weak = candidate(110.0, 110.0, 50.0, 50.0, 0.3);
        let merged = merge_confidence_weighted(vec![strong.clone(), weak.clone()], 0.3);
        assert_eq!(merged.len(), 1);

        let m = &merged[0].bbox;
        let d_strong = (m.x - strong.bbox.x).abs() + (m.y - strong.bbox.y).abs();
        let d_weak = (m.x - weak.bbox.x).abs() + (m.y - weak.bbox.y).abs();
        assert!(d_strong < d_weak, "merged bbox should favor the 0.9 candidate");
    }

    #[test]
    fn test_weighted_merge_keeps_disjoint_faces() {
        let a = candidate(0.0, 0.0, 40.0, 40.0, 0.8);
        let b = candidate(300.0, 300.0, 40.0, 40.0, 0.7);
        let merged = merge_confidence_weighted(vec![a, b], 0.5);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_ensemble_priority_stops_at_first_hit() {
        let mut ensemble = EnsembleDetector::new(
            vec![
                Box::new(StubBackend {
                    kind: BackendKind::Scrfd,
                    result: Ok(vec![candidate(0.0, 0.0, 50.0, 50.0, 0.9)]),
                }),
                Box::new(StubBackend {
                    kind: BackendKind::Seeta,
                    result: Ok(vec![candidate(0.0, 0.0, 50.0, 50.0, 0.5)]),
                }),
            ],
            vec![],
        );
        let image = RgbBuffer::new(64, 64);
        let (result, runs) = ensemble.detect(&image, BackendPolicy::Priority).unwrap();
        assert_eq!(result.len(), 1);
        // Second backend never ran
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn test_ensemble_skips_failing_backend() {
        let mut ensemble = EnsembleDetector::new(
            vec![
                Box::new(StubBackend {
                    kind: BackendKind::Scrfd,
                    result: Err("onnx session crashed".into()),
                }),
                Box::new(StubBackend {
                    kind: BackendKind::Seeta,
                    result: Ok(vec![candidate(0.0, 0.0, 50.0, 50.0, 0.5)]),
                }),
            ],
            vec![],
        );
        let image = RgbBuffer::new(64, 64);
        let (result, runs) = ensemble.detect(&image, BackendPolicy::Priority).unwrap();
        assert_eq!(result.len(), 1);
        assert!(matches!(runs[0], BackendRun::Failed { .. }));
        assert!(matches!(runs[1], BackendRun::Ran { .. }));
    }

    #[test]
    fn test_ensemble_total_failure_is_hard_error() {
        let mut ensemble = EnsembleDetector::new(
            vec![Box::new(StubBackend {
                kind: BackendKind::Scrfd,
                result: Ok(vec![]),
            })],
            vec![],
        );
        let image = RgbBuffer::new(64, 64);
        let err = ensemble.detect(&image, BackendPolicy::Hybrid).unwrap_err();
        assert!(matches!(err, DetectError::NoFaceDetected));
    }

    #[test]
    fn test_ensemble_no_backends() {
        let mut ensemble = EnsembleDetector::new(vec![], vec![]);
        let image = RgbBuffer::new(64, 64);
        let err = ensemble.detect(&image, BackendPolicy::Priority).unwrap_err();
        assert!(matches!(err, DetectError::NoBackendAvailable));
    }

    #[test]
    fn test_hybrid_dedupes_across_backends() {
        let mut ensemble = EnsembleDetector::new(
            vec![
                Box::new(StubBackend {
                    kind: BackendKind::Scrfd,
                    result: Ok(vec![candidate(100.0, 100.0, 50.0, 50.0, 0.9)]),
                }),
                Box::new(StubBackend {
                    kind: BackendKind::Seeta,
                    result: Ok(vec![candidate(102.0, 102.0, 50.0, 50.0, 0.6)]),
                }),
            ],
            vec![],
        );
        let image = RgbBuffer::new(256, 256);
        let (result, _) = ensemble.detect(&image, BackendPolicy::Hybrid).unwrap();
        assert_eq!(result.len(), 1);
        assert!((result.candidates()[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "hybrid".parse::<BackendPolicy>().unwrap(),
            BackendPolicy::Hybrid
        );
        assert_eq!(
            "confidence_weighted".parse::<BackendPolicy>().unwrap(),
            BackendPolicy::ConfidenceWeighted
        );
        assert!("best_effort".parse::<BackendPolicy>().is_err());
    }
}
