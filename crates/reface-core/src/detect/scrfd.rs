//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free detection with three stride levels, five-point landmark
//! regression and NMS post-processing. Input is letterboxed RGB.

use super::{suppress_overlaps, BackendKind, DetectError, DetectorBackend, FaceCandidate};
use crate::geometry::{BoundingBox, Landmarks};
use crate::imagebuf::RgbBuffer;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 0.5;
const SCRFD_STD: f32 = 0.50196;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based detection backend.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectError> {
        if !Path::new(model_path).exists() {
            return Err(DetectError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Preprocess an RGB buffer into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, image: &RgbBuffer) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (image.width() as usize, image.height() as usize);

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = (width as f32 * scale).round() as usize;
        let new_h = (height as f32 * scale).round() as usize;
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let inv_scale = 1.0 / scale;

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));

        for y in 0..self.input_height {
            for x in 0..self.input_width {
                let px = if y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w
                {
                    let src_x = ((x - pad_x_start) as f32 + 0.5) * inv_scale - 0.5;
                    let src_y = ((y - pad_y_start) as f32 + 0.5) * inv_scale - 0.5;
                    image
                        .sample_bilinear(
                            src_x.clamp(0.0, (width - 1) as f32),
                            src_y.clamp(0.0, (height - 1) as f32),
                        )
                        .unwrap_or([SCRFD_MEAN; 3])
                } else {
                    [SCRFD_MEAN; 3] // pad value normalizes to 0.0
                };

                for c in 0..3 {
                    tensor[[0, c, y, x]] = (px[c] - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, letterbox)
    }
}

impl DetectorBackend for ScrfdDetector {
    fn kind(&self) -> BackendKind {
        BackendKind::Scrfd
    }

    fn detect(&mut self, image: &RgbBuffer) -> Result<Vec<FaceCandidate>, DetectError> {
        let (input, letterbox) = self.preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;
            let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectError::InferenceFailed(format!("kps stride {stride}: {e}"))
            })?;

            all.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(suppress_overlaps(all, SCRFD_NMS_THRESHOLD))
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports may name tensors "score_8", "bbox_16", "kps_32" or use
/// generic numeric names; in the latter case the standard positional
/// ordering applies: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES.iter().all(|&stride| {
        find("score", stride).is_some()
            && find("bbox", stride).is_some()
            && find("kps", stride).is_some()
    });

    if named {
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (
                find("score", stride).unwrap(),
                find("bbox", stride).unwrap(),
                find("kps", stride).unwrap(),
            )
        })
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping"
        );
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// Decode detections for a single stride level into original-image space.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<FaceCandidate> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    let mut candidates = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let cy = (anchor_idx / grid_w) as f32;
        let cx = (anchor_idx % grid_w) as f32;
        let anchor_cx = cx * stride as f32;
        let anchor_cy = cy * stride as f32;

        // Bbox offsets are [left, top, right, bottom] distances in stride units
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[bbox_off] * stride as f32;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride as f32;

        let demap = |x: f32, y: f32| {
            (
                (x - letterbox.pad_x) / letterbox.scale,
                (y - letterbox.pad_y) / letterbox.scale,
            )
        };
        let (orig_x1, orig_y1) = demap(x1, y1);
        let (orig_x2, orig_y2) = demap(x2, y2);

        let kps_off = idx * 10;
        if kps_off + 9 >= kps.len() {
            continue;
        }
        let mut points = [(0.0f32, 0.0f32); 5];
        for (i, p) in points.iter_mut().enumerate() {
            let lx = anchor_cx + kps[kps_off + i * 2] * stride as f32;
            let ly = anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32;
            *p = demap(lx, ly);
        }

        candidates.push(FaceCandidate {
            bbox: BoundingBox::new(orig_x1, orig_y1, orig_x2 - orig_x1, orig_y2 - orig_y1),
            landmarks: Landmarks::Five(points),
            confidence: score.clamp(0.0, 1.0),
            source: BackendKind::Scrfd,
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8",
            "kps_16", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], (0, 3, 6));
        assert_eq!(indices[1], (1, 4, 7));
        assert_eq!(indices[2], (2, 5, 8));
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32",
            "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_maps_back_to_image_space() {
        // One anchor above threshold at grid position (1, 1), stride 8,
        // letterboxed at scale 2 with no padding.
        let grid = (640 / 8) * (640 / 8) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; grid];
        let mut bboxes = vec![0.0f32; grid * 4];
        let kps = vec![0.0f32; grid * 10];

        // anchor_idx = 1*80 + 1, two anchors per cell
        let idx = (80 + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        // one-stride-wide box around the anchor center
        bboxes[idx * 4] = 1.0;
        bboxes[idx * 4 + 1] = 1.0;
        bboxes[idx * 4 + 2] = 1.0;
        bboxes[idx * 4 + 3] = 1.0;

        let letterbox = LetterboxInfo {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = decode_stride(&scores, &bboxes, &kps, 8, 640, 640, &letterbox, 0.5);
        assert_eq!(out.len(), 1);

        // Anchor center (8, 8) in letterbox space → (4, 4) in image space,
        // box spans ±8 letterbox pixels → ±4 image pixels.
        let bbox = out[0].bbox;
        assert!((bbox.x - 0.0).abs() < 1e-4);
        assert!((bbox.y - 0.0).abs() < 1e-4);
        assert!((bbox.width - 8.0).abs() < 1e-4);
        assert!((bbox.height - 8.0).abs() < 1e-4);
        assert_eq!(out[0].landmarks.len(), 5);
    }

    #[test]
    fn test_decode_stride_below_threshold_yields_nothing() {
        let grid = (640 / 32) * (640 / 32) * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.1f32; grid];
        let bboxes = vec![0.0f32; grid * 4];
        let kps = vec![0.0f32; grid * 10];
        let letterbox = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = decode_stride(&scores, &bboxes, &kps, 32, 640, 640, &letterbox, 0.5);
        assert!(out.is_empty());
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let width = 320.0f32;
        let scale = (640.0 / width).min(640.0 / 240.0);
        let new_w = (width * scale).round();
        let pad_x = (640.0 - new_w) / 2.0;
        let pad_y = (640.0 - (240.0 * scale).round()) / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        let orig = (100.0f32, 50.0f32);
        let boxed = (orig.0 * scale + pad_x, orig.1 * scale + pad_y);
        let recovered = (
            (boxed.0 - letterbox.pad_x) / letterbox.scale,
            (boxed.1 - letterbox.pad_y) / letterbox.scale,
        );

        assert!((recovered.0 - orig.0).abs() < 0.1);
        assert!((recovered.1 - orig.1).abs() < 0.1);
    }
}
