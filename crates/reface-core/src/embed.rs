//! ArcFace-style face embedding via ONNX Runtime.
//!
//! Optional backend used for the identity-preservation diagnostic: embeds
//! the source face and the composited face, and reports their cosine
//! similarity. Never folded into the quality score.

use crate::align::{estimate_similarity, warp_into, AlignError};
use crate::detect::FaceCandidate;
use crate::imagebuf::RgbBuffer;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 0.5;
const ARCFACE_STD: f32 = 0.5; // symmetric normalization to [-1, 1]
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Canonical five-point landmark positions for a 112×112 aligned crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("alignment for embedding failed: {0}")]
    Alignment(#[from] AlignError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// An L2-normalized face embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar identity.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// ArcFace-based embedding backend.
pub struct FaceEmbedder {
    session: Session,
}

impl std::fmt::Debug for FaceEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceEmbedder").finish_non_exhaustive()
    }
}

impl FaceEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded embedding model");
        Ok(Self { session })
    }

    /// Extract an embedding for a detected face.
    ///
    /// The face is aligned to the canonical 112×112 position from its
    /// five-point landmarks before inference.
    pub fn extract(
        &mut self,
        image: &RgbBuffer,
        face: &FaceCandidate,
    ) -> Result<Embedding, EmbedError> {
        let src = face.landmarks.stable_subset();
        let dst: Vec<(f32, f32)> = REFERENCE_LANDMARKS_112.to_vec();
        let transform = estimate_similarity(&src, &dst, None)?;
        let (aligned, _) = warp_into(image, &transform, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE);

        let input = Self::preprocess(&aligned);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding { values })
    }

    /// Preprocess a 112×112 RGB crop into a NCHW float tensor.
    fn preprocess(aligned: &RgbBuffer) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let px = aligned.pixel(x as u32, y as u32);
                for c in 0..3 {
                    tensor[[0, c, y, x]] = (px[c] - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }
        tensor
    }
}
