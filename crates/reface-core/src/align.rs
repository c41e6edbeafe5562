//! Face alignment via 4-DOF similarity transform.
//!
//! Estimates the least-squares similarity transform (rotation, uniform
//! scale, translation) mapping source-face landmarks onto target-face
//! landmarks, optionally refined by iterative re-weighting, then warps the
//! source image into target coordinate space with bilinear sampling.

use crate::geometry::{AlignmentTransform, Landmarks};
use crate::imagebuf::{MaskBuffer, RgbBuffer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transforms with estimated scale outside this range are rejected.
const SCALE_MIN: f32 = 0.1;
const SCALE_MAX: f32 = 10.0;
/// Iteration cap for the robust re-weighting refinement.
const IRLS_ITERATIONS: usize = 3;
/// Huber threshold as a multiple of the median absolute residual.
const HUBER_FACTOR: f32 = 1.5;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("need at least 3 corresponding point pairs, got {got}")]
    TooFewPoints { got: usize },
    #[error("source and target landmark counts differ: {src} vs {dst}")]
    MismatchedPoints { src: usize, dst: usize },
    #[error("degenerate transform: scale {scale} outside [{SCALE_MIN}, {SCALE_MAX}]")]
    Degenerate { scale: f32 },
    #[error("transform could not be computed: normal equations are singular")]
    Singular,
}

/// Estimation method, resolved from the host's `alignment_method` scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignMethod {
    /// Plain least-squares over the stable landmark subset.
    Similarity,
    /// Least-squares refined by Huber re-weighting of outlier pairs.
    RobustSimilarity,
}

impl std::str::FromStr for AlignMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similarity" => Ok(AlignMethod::Similarity),
            "robust" | "robust_similarity" => Ok(AlignMethod::RobustSimilarity),
            other => Err(format!("unknown alignment method: {other}")),
        }
    }
}

/// Alignment options supplied by the pipeline configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlignOptions {
    pub method: AlignMethod,
    /// 0.0 = identity transform (no pose correction), 1.0 = full estimated
    /// transform. Interpolated linearly in parameter space.
    pub pose_strength: f32,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            method: AlignMethod::RobustSimilarity,
            pose_strength: 1.0,
        }
    }
}

/// Result of aligning a source face into target coordinate space.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Source pixels warped into target space.
    pub warped: RgbBuffer,
    /// 1.0 where the inverse map hit the source image, 0.0 where it left
    /// the source bounds (no-data). Intersected with the blend mask later.
    pub coverage: MaskBuffer,
    pub transform: AlignmentTransform,
}

/// Estimate the similarity transform and warp `source` into an output of
/// the given dimensions (the target image space).
pub fn align(
    source: &RgbBuffer,
    source_landmarks: &Landmarks,
    target_landmarks: &Landmarks,
    out_width: u32,
    out_height: u32,
    options: &AlignOptions,
) -> Result<Alignment, AlignError> {
    let src = source_landmarks.stable_subset();
    let dst = target_landmarks.stable_subset();

    if src.len() != dst.len() {
        return Err(AlignError::MismatchedPoints {
            src: src.len(),
            dst: dst.len(),
        });
    }
    if src.len() < 3 {
        return Err(AlignError::TooFewPoints { got: src.len() });
    }

    let full = match options.method {
        AlignMethod::Similarity => estimate_similarity(&src, &dst, None)?,
        AlignMethod::RobustSimilarity => estimate_similarity_robust(&src, &dst)?,
    };

    if !full.scale.is_finite() || full.scale < SCALE_MIN || full.scale > SCALE_MAX {
        return Err(AlignError::Degenerate { scale: full.scale });
    }

    let transform = full.lerp_from_identity(options.pose_strength);
    tracing::debug!(
        scale = transform.scale,
        rotation = transform.rotation_degrees,
        pose_strength = options.pose_strength,
        "alignment transform estimated"
    );

    let (warped, coverage) = warp_into(source, &transform, out_width, out_height);
    Ok(Alignment {
        warped,
        coverage,
        transform,
    })
}

/// Alignment that skips pose correction entirely: the source is copied
/// into target space through the identity transform. This is the
/// configuration-gated fallback for degenerate estimates.
pub fn identity_alignment(source: &RgbBuffer, out_width: u32, out_height: u32) -> Alignment {
    let transform = AlignmentTransform::identity();
    let (warped, coverage) = warp_into(source, &transform, out_width, out_height);
    Alignment {
        warped,
        coverage,
        transform,
    }
}

/// Least-squares similarity estimation over N point pairs via normal
/// equations, optionally weighted per pair.
///
/// Solves A·[a, b, tx, ty]ᵀ = B where each pair (sx, sy) → (dx, dy)
/// contributes the rows [sx, -sy, 1, 0] → dx and [sy, sx, 0, 1] → dy.
pub fn estimate_similarity(
    src: &[(f32, f32)],
    dst: &[(f32, f32)],
    weights: Option<&[f32]>,
) -> Result<AlignmentTransform, AlignError> {
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4];

    for i in 0..src.len() {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let w = weights.map(|ws| ws[i]).unwrap_or(1.0);

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += w * (r1[j] * r1[k] + r2[j] * r2[k]);
            }
            atb[j] += w * (r1[j] * dx + r2[j] * dy);
        }
    }

    let x = solve_4x4(&ata, &atb).ok_or(AlignError::Singular)?;
    Ok(AlignmentTransform::from_params(x[0], x[1], x[2], x[3]))
}

/// Robust estimation: plain least-squares, then a fixed number of Huber
/// re-weighting rounds that down-weight outlier correspondences.
fn estimate_similarity_robust(
    src: &[(f32, f32)],
    dst: &[(f32, f32)],
) -> Result<AlignmentTransform, AlignError> {
    let mut transform = estimate_similarity(src, dst, None)?;

    for _ in 0..IRLS_ITERATIONS {
        let residuals: Vec<f32> = src
            .iter()
            .zip(dst.iter())
            .map(|(&(sx, sy), &(dx, dy))| {
                let (px, py) = transform.apply(sx, sy);
                ((px - dx).powi(2) + (py - dy).powi(2)).sqrt()
            })
            .collect();

        let mut sorted = residuals.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];
        if median < 1e-6 {
            break; // already an exact fit
        }

        let delta = HUBER_FACTOR * median;
        let weights: Vec<f32> = residuals
            .iter()
            .map(|&r| if r <= delta { 1.0 } else { delta / r })
            .collect();

        transform = estimate_similarity(src, dst, Some(&weights))?;
    }

    Ok(transform)
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
/// Returns `None` when the system is singular.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> Option<[f32; 4]> {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Warp `source` through `transform` into an out_width×out_height buffer.
///
/// The transform maps source coordinates to target coordinates, so each
/// output pixel is inverse-mapped and bilinearly sampled; samples falling
/// outside the source get coverage 0.
pub(crate) fn warp_into(
    source: &RgbBuffer,
    transform: &AlignmentTransform,
    out_width: u32,
    out_height: u32,
) -> (RgbBuffer, MaskBuffer) {
    let m = &transform.matrix;
    let (a, b) = (m[0], m[3]);
    let (tx, ty) = (m[2], m[5]);

    let mut warped = RgbBuffer::new(out_width, out_height);
    let mut coverage = MaskBuffer::new(out_width, out_height);

    // Invert the 2x2 similarity part: M = [[a, -b], [b, a]], det = a² + b²
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return (warped, coverage);
    }
    let ia = a / det;
    let ib = b / det;

    for oy in 0..out_height {
        for ox in 0..out_width {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            if let Some(px) = source.sample_bilinear(sx, sy) {
                warped.set_pixel(ox, oy, px);
                coverage.set(ox, oy, 1.0);
            }
        }
    }

    (warped, coverage)
}
