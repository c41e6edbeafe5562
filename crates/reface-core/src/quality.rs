//! Quality and compatibility scoring for a detected face region.
//!
//! Five component scores in [0, 1] (higher is better), a configurable
//! weighted overall score, and threshold-driven recommendation text.

use crate::detect::FaceCandidate;
use crate::imagebuf::{MaskBuffer, RgbBuffer};
use serde::{Deserialize, Serialize};

/// Laplacian-variance knee: variance at which sharpness reaches 0.5.
const SHARPNESS_KNEE: f32 = 0.002;
/// Luma standard deviation that counts as full contrast.
const LIGHTING_FULL_SPREAD: f32 = 0.25;
/// Local luma std below which a landmark neighborhood counts as obstructed.
const OCCLUSION_CONTRAST_FLOOR: f32 = 0.01;
/// Half-size of the neighborhood sampled around each landmark.
const OCCLUSION_WINDOW: i64 = 2;

/// Component weights for the overall score. The defaults lean on detection
/// confidence and sharpness; deployments may override any of them, and the
/// combination always renormalizes to sum 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityWeights {
    pub detection: f32,
    pub sharpness: f32,
    pub lighting: f32,
    pub pose: f32,
    pub occlusion: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            detection: 0.30,
            sharpness: 0.25,
            lighting: 0.15,
            pose: 0.15,
            occlusion: 0.15,
        }
    }
}

impl QualityWeights {
    fn sum(&self) -> f32 {
        self.detection + self.sharpness + self.lighting + self.pose + self.occlusion
    }
}

/// Per-component thresholds below which a recommendation is emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub detection: f32,
    pub sharpness: f32,
    pub lighting: f32,
    pub pose: f32,
    pub occlusion: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            detection: 0.5,
            sharpness: 0.3,
            lighting: 0.3,
            pose: 0.4,
            occlusion: 0.5,
        }
    }
}

/// Scored quality of a face region. All components are goodness scores in
/// [0, 1]; `occlusion` is 1.0 when no obstruction is suspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub detection_confidence: f32,
    pub sharpness: f32,
    pub lighting: f32,
    pub pose: f32,
    pub occlusion: f32,
    pub overall: f32,
    pub recommendations: Vec<String>,
}

/// Score a detected face against its image region.
pub fn score(
    candidate: &FaceCandidate,
    region: &RgbBuffer,
    weights: &QualityWeights,
    thresholds: &QualityThresholds,
) -> QualityScore {
    let luma = region.to_luma();

    let detection_confidence = candidate.confidence.clamp(0.0, 1.0);
    let sharpness = sharpness_score(&luma);
    let lighting = lighting_score(&luma);
    let pose = pose_score(candidate);
    let occlusion = occlusion_score(candidate, &luma);

    let wsum = weights.sum().max(1e-6);
    let overall = ((weights.detection * detection_confidence
        + weights.sharpness * sharpness
        + weights.lighting * lighting
        + weights.pose * pose
        + weights.occlusion * occlusion)
        / wsum)
        .clamp(0.0, 1.0);

    let mut recommendations = Vec::new();
    if sharpness < thresholds.sharpness {
        recommendations.push("increase source resolution or use a sharper image".to_string());
    }
    if lighting < thresholds.lighting {
        recommendations.push("improve lighting; the face region is flat or poorly exposed".to_string());
    }
    if pose < thresholds.pose {
        recommendations.push("use a more frontal face; head rotation is too strong".to_string());
    }
    if occlusion < thresholds.occlusion {
        recommendations.push("remove obstructions covering facial features".to_string());
    }
    if detection_confidence < thresholds.detection {
        recommendations.push("detection confidence is low; use a clearer face image".to_string());
    }

    QualityScore {
        detection_confidence,
        sharpness,
        lighting,
        pose,
        occlusion,
        overall,
        recommendations,
    }
}

/// Normalized variance of the Laplacian response. Flat regions score 0;
/// the knee constant sets where the curve reaches 0.5.
fn sharpness_score(luma: &MaskBuffer) -> f32 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = 4.0 * luma.get(x, y)
                - luma.get(x - 1, y)
                - luma.get(x + 1, y)
                - luma.get(x, y - 1)
                - luma.get(x, y + 1);
            sum += lap as f64;
            sum_sq += (lap * lap) as f64;
            count += 1;
        }
    }
    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0) as f32;

    (variance / (variance + SHARPNESS_KNEE)).clamp(0.0, 1.0)
}

/// Histogram-spread contrast heuristic combined with an exposure penalty:
/// a well-lit face has both dynamic range and a mid-level mean.
fn lighting_score(luma: &MaskBuffer) -> f32 {
    let data = luma.data();
    if data.is_empty() {
        return 0.0;
    }
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = data
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let spread = ((var.sqrt() as f32) / LIGHTING_FULL_SPREAD).clamp(0.0, 1.0);
    let exposure = (1.0 - 2.0 * (mean as f32 - 0.5).abs()).clamp(0.0, 1.0);
    (spread * exposure).clamp(0.0, 1.0)
}

/// Left/right symmetry of the stable landmarks around the nose: the ratio
/// of the shorter to the longer nose-to-eye distance. Frontal faces score
/// near 1, strongly turned heads fall toward 0.
fn pose_score(candidate: &FaceCandidate) -> f32 {
    let pts = candidate.landmarks.stable_subset();
    if pts.len() < 5 {
        return 0.0;
    }
    let (left_eye, right_eye, nose) = (pts[0], pts[1], pts[2]);
    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let left = dist(nose, left_eye);
    let right = dist(nose, right_eye);
    if left <= 0.0 || right <= 0.0 {
        return 0.0;
    }
    (left.min(right) / left.max(right)).clamp(0.0, 1.0)
}

/// Fraction of landmark neighborhoods that still show local contrast.
/// A feature hidden behind a hand or mask goes locally flat.
fn occlusion_score(candidate: &FaceCandidate, luma: &MaskBuffer) -> f32 {
    let (w, h) = luma.dimensions();
    let pts = candidate.landmarks.stable_subset();
    if pts.is_empty() {
        return 0.0;
    }

    let mut visible = 0usize;
    for &(px, py) in &pts {
        let cx = px.round() as i64;
        let cy = py.round() as i64;

        let mut samples = Vec::new();
        for dy in -OCCLUSION_WINDOW..=OCCLUSION_WINDOW {
            for dx in -OCCLUSION_WINDOW..=OCCLUSION_WINDOW {
                let x = cx + dx;
                let y = cy + dy;
                if x >= 0 && y >= 0 && x < w as i64 && y < h as i64 {
                    samples.push(luma.get(x as u32, y as u32));
                }
            }
        }
        if samples.len() < 4 {
            continue; // landmark outside the region: treated as obstructed
        }
        let n = samples.len() as f32;
        let mean = samples.iter().sum::<f32>() / n;
        let std = (samples.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
        if std >= OCCLUSION_CONTRAST_FLOOR {
            visible += 1;
        }
    }

    (visible as f32 / pts.len() as f32).clamp(0.0, 1.0)
}
