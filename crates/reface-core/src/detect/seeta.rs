//! SeetaFace cascade detection backend via the `rustface` crate.
//!
//! Pure-Rust funnel-structured cascade; no landmarks of its own, so the
//! five canonical points are synthesized from fixed bbox proportions.

use super::{BackendKind, DetectError, DetectorBackend, FaceCandidate};
use crate::geometry::{BoundingBox, Landmarks};
use crate::imagebuf::RgbBuffer;
use std::path::Path;

const SEETA_MIN_FACE_SIZE: u32 = 20;
const SEETA_SCORE_THRESHOLD: f64 = 2.0;
const SEETA_PYRAMID_SCALE: f32 = 0.8;
const SEETA_WINDOW_STEP: u32 = 4;
/// Cascade scores grow without bound; score/(score+K) maps them into [0, 1).
const SEETA_SCORE_SOFTNESS: f32 = 5.0;

// Canonical five-point positions as fractions of the bbox. Eyes sit at
// roughly 40% height, the mouth corners at 78%.
const LANDMARK_FRACTIONS: [(f32, f32); 5] = [
    (0.30, 0.38), // left eye
    (0.70, 0.38), // right eye
    (0.50, 0.58), // nose tip
    (0.34, 0.78), // left mouth
    (0.66, 0.78), // right mouth
];

/// SeetaFace-based detection backend.
pub struct SeetaDetector {
    model: rustface::Model,
}

impl std::fmt::Debug for SeetaDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeetaDetector").finish_non_exhaustive()
    }
}

impl SeetaDetector {
    /// Load a SeetaFace frontal-face model from disk.
    pub fn load(model_path: &str) -> Result<Self, DetectError> {
        if !Path::new(model_path).exists() {
            return Err(DetectError::ModelNotFound(model_path.to_string()));
        }
        let bytes = std::fs::read(model_path)
            .map_err(|e| DetectError::InferenceFailed(format!("read {model_path}: {e}")))?;
        let model = rustface::read_model(std::io::Cursor::new(bytes))
            .map_err(|e| DetectError::InferenceFailed(format!("parse {model_path}: {e}")))?;
        Ok(Self { model })
    }

    /// Synthesize the five canonical landmarks from bbox proportions.
    fn synthetic_landmarks(bbox: &BoundingBox) -> Landmarks {
        let mut points = [(0.0f32, 0.0f32); 5];
        for (p, (fx, fy)) in points.iter_mut().zip(LANDMARK_FRACTIONS) {
            *p = (bbox.x + fx * bbox.width, bbox.y + fy * bbox.height);
        }
        Landmarks::Five(points)
    }
}

impl DetectorBackend for SeetaDetector {
    fn kind(&self) -> BackendKind {
        BackendKind::Seeta
    }

    fn detect(&mut self, image: &RgbBuffer) -> Result<Vec<FaceCandidate>, DetectError> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(SEETA_MIN_FACE_SIZE);
        detector.set_score_thresh(SEETA_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(SEETA_PYRAMID_SCALE);
        detector.set_slide_window_step(SEETA_WINDOW_STEP, SEETA_WINDOW_STEP);

        let gray = image.to_luma_u8();
        let faces = detector.detect(&rustface::ImageData::new(
            &gray,
            image.width(),
            image.height(),
        ));

        let candidates = faces
            .iter()
            .map(|face| {
                let b = face.bbox();
                let bbox = BoundingBox::new(
                    b.x() as f32,
                    b.y() as f32,
                    b.width() as f32,
                    b.height() as f32,
                );
                let score = face.score() as f32;
                FaceCandidate {
                    landmarks: Self::synthetic_landmarks(&bbox),
                    bbox,
                    confidence: (score / (score + SEETA_SCORE_SOFTNESS)).clamp(0.0, 1.0),
                    source: BackendKind::Seeta,
                }
            })
            .collect();

        Ok(candidates)
    }
}
