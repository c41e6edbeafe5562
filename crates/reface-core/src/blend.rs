//! Compositing of the warped source face into the target image.
//!
//! Owns blend-mask generation (landmark convex hull with an inward feather
//! ramp, bbox-ellipse fallback) and the blend modes: plain alpha,
//! multi-band Laplacian pyramid, Poisson seamless cloning, and the
//! weight-map variants that feed the first two. Every non-alpha mode
//! degrades to alpha on failure; the pipeline never aborts on a blend
//! error alone.

use crate::geometry::{BoundingBox, Landmarks};
use crate::imagebuf::{MaskBuffer, RgbBuffer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default pyramid depth; the effective depth is capped by image size.
const PYRAMID_LEVELS: usize = 5;
/// Smallest image dimension a pyramid level may have.
const PYRAMID_MIN_DIM: u32 = 4;
/// Feather radius as a fraction of the face bbox's smaller dimension,
/// at feathering = 1.0.
const FEATHER_MAX_FRACTION: f32 = 0.15;
/// Hull expansion factors: five landmark points cover only the eye/mouth
/// region, so their hull is grown outward from the centroid.
const HULL_EXPANSION_FIVE: f32 = 1.9;
const HULL_EXPANSION_DENSE: f32 = 1.05;
/// Mask threshold above which a pixel belongs to the Poisson interior.
const POISSON_INTERIOR_THRESHOLD: f32 = 0.5;
/// Gradient gain for the edge-preserving weight map.
const EDGE_WEIGHT_GAIN: f32 = 4.0;
/// Feature-guided boost around the stable landmark points.
const FEATURE_BOOST: f32 = 0.35;

#[derive(Error, Debug)]
pub enum BlendError {
    #[error("blend inputs have mismatched shapes: target {target:?}, source {source_dims:?}, mask {mask:?}")]
    ShapeMismatch {
        target: (u32, u32),
        source_dims: (u32, u32),
        mask: (u32, u32),
    },
    #[error("region {0}x{1} is too small for a multi-band pyramid")]
    TooSmallForPyramid(u32, u32),
    #[error("poisson solver exhausted its budget of {iterations} iterations (residual {residual})")]
    PoissonBudgetExhausted { iterations: usize, residual: f32 },
    #[error("feature-guided blending requires landmarks")]
    MissingLandmarks,
}

/// Blend strategy, resolved once per call from the host's `blending_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    Alpha,
    MultiBand,
    PoissonSeamless,
    AdaptiveWeighted,
    EdgePreserving,
    FeatureGuided,
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlendMode::Alpha => "alpha",
            BlendMode::MultiBand => "multi_band",
            BlendMode::PoissonSeamless => "poisson_seamless",
            BlendMode::AdaptiveWeighted => "adaptive_weighted",
            BlendMode::EdgePreserving => "edge_preserving",
            BlendMode::FeatureGuided => "feature_guided",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BlendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alpha" => Ok(BlendMode::Alpha),
            "multi_band" => Ok(BlendMode::MultiBand),
            "poisson_seamless" => Ok(BlendMode::PoissonSeamless),
            "adaptive_weighted" => Ok(BlendMode::AdaptiveWeighted),
            "edge_preserving" => Ok(BlendMode::EdgePreserving),
            "feature_guided" => Ok(BlendMode::FeatureGuided),
            other => Err(format!("unknown blend mode: {other}")),
        }
    }
}

/// Iteration/convergence budget for the Poisson solver (spec leaves the
/// exact numbers open; these are deliberately configurable).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoissonBudget {
    pub max_iterations: usize,
    /// Mean absolute update per interior pixel below which the solve is
    /// considered converged.
    pub tolerance: f32,
}

impl Default for PoissonBudget {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            tolerance: 1e-4,
        }
    }
}

/// Result of a blend call: the composite plus which mode actually ran.
#[derive(Debug, Clone)]
pub struct BlendOutcome {
    pub output: RgbBuffer,
    pub requested: BlendMode,
    /// The mode that produced the output; differs from `requested` when a
    /// failure degraded the call down the fallback ladder.
    pub used: BlendMode,
}

impl BlendOutcome {
    pub fn degraded(&self) -> bool {
        self.requested != self.used
    }
}

/// Generate the blend mask for a face: filled landmark convex hull with an
/// inward feather ramp, or an inscribed bbox ellipse when the landmarks
/// are unusable. Values outside the face region are exactly 0.
pub fn face_mask(
    landmarks: &Landmarks,
    bbox: &BoundingBox,
    width: u32,
    height: u32,
    feathering: f32,
) -> MaskBuffer {
    let expansion = match landmarks {
        Landmarks::Five(_) => HULL_EXPANSION_FIVE,
        Landmarks::SixtyEight(_) => HULL_EXPANSION_DENSE,
    };

    let points = landmarks.points();
    let hull = convex_hull(&points);

    let binary = if hull.len() >= 3 {
        let (cx, cy) = landmarks.centroid();
        let expanded: Vec<(f32, f32)> = hull
            .iter()
            .map(|&(x, y)| (cx + (x - cx) * expansion, cy + (y - cy) * expansion))
            .collect();
        fill_polygon(&expanded, width, height)
    } else {
        fill_ellipse(bbox, width, height)
    };

    let feathering = feathering.clamp(0.0, 1.0);
    if feathering == 0.0 {
        return binary;
    }

    let radius = (feathering * FEATHER_MAX_FRACTION * bbox.width.min(bbox.height)).round() as u32;
    if radius == 0 {
        return binary;
    }

    // Feather inward: blur the hard mask, then gate it with the hard mask so
    // everything outside the face region stays exactly 0.
    binary.box_blur(radius, 3).multiply(&binary)
}

/// Composite `source` into `target` under `mask` using the requested mode.
///
/// Mode-specific failures degrade down the ladder (poisson → multi-band →
/// alpha); only shape mismatches are surfaced as hard errors.
pub fn blend(
    target: &RgbBuffer,
    source: &RgbBuffer,
    mask: &MaskBuffer,
    mode: BlendMode,
    strength: f32,
    landmarks: Option<&Landmarks>,
    budget: &PoissonBudget,
) -> Result<BlendOutcome, BlendError> {
    if target.dimensions() != source.dimensions() || target.dimensions() != mask.dimensions() {
        return Err(BlendError::ShapeMismatch {
            target: target.dimensions(),
            source_dims: source.dimensions(),
            mask: mask.dimensions(),
        });
    }
    let strength = strength.clamp(0.0, 1.0);

    let mut used = mode;
    let output = match mode {
        BlendMode::Alpha => alpha_blend(target, source, mask, strength),
        BlendMode::MultiBand => match multi_band_blend(target, source, mask, strength) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "multi-band blend failed; degrading to alpha");
                used = BlendMode::Alpha;
                alpha_blend(target, source, mask, strength)
            }
        },
        BlendMode::PoissonSeamless => {
            match poisson_blend(target, source, mask, strength, budget) {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(error = %e, "poisson blend failed; degrading to multi-band");
                    match multi_band_blend(target, source, mask, strength) {
                        Ok(out) => {
                            used = BlendMode::MultiBand;
                            out
                        }
                        Err(e2) => {
                            tracing::warn!(error = %e2, "multi-band fallback failed; degrading to alpha");
                            used = BlendMode::Alpha;
                            alpha_blend(target, source, mask, strength)
                        }
                    }
                }
            }
        }
        BlendMode::AdaptiveWeighted => {
            let weighted = mask.multiply(&smoothness_weights(source));
            match multi_band_blend(target, source, &weighted, strength) {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(error = %e, "adaptive-weighted blend failed; degrading to alpha");
                    used = BlendMode::Alpha;
                    alpha_blend(target, source, &weighted, strength)
                }
            }
        }
        BlendMode::EdgePreserving => {
            let weighted = mask.multiply(&edge_weights(target));
            alpha_blend(target, source, &weighted, strength)
        }
        BlendMode::FeatureGuided => match landmarks {
            Some(lm) => {
                let weighted = feature_weights(mask, lm);
                alpha_blend(target, source, &weighted, strength)
            }
            None => {
                tracing::warn!("feature-guided blend without landmarks; degrading to alpha");
                used = BlendMode::Alpha;
                alpha_blend(target, source, mask, strength)
            }
        },
    };

    Ok(BlendOutcome {
        output,
        requested: mode,
        used,
    })
}

/// `out = target·(1 − mask·strength) + source·mask·strength`.
pub fn alpha_blend(
    target: &RgbBuffer,
    source: &RgbBuffer,
    mask: &MaskBuffer,
    strength: f32,
) -> RgbBuffer {
    let (w, h) = target.dimensions();
    let mut out = RgbBuffer::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let a = mask.get(x, y) * strength;
            let t = target.pixel(x, y);
            let s = source.pixel(x, y);
            out.set_pixel(
                x,
                y,
                [
                    t[0] * (1.0 - a) + s[0] * a,
                    t[1] * (1.0 - a) + s[1] * a,
                    t[2] * (1.0 - a) + s[2] * a,
                ],
            );
        }
    }
    out
}

/// Multi-band blend: per-level Laplacian mixing under a Gaussian mask
/// pyramid, reconstructed bottom-up.
fn multi_band_blend(
    target: &RgbBuffer,
    source: &RgbBuffer,
    mask: &MaskBuffer,
    strength: f32,
) -> Result<RgbBuffer, BlendError> {
    let (w, h) = target.dimensions();
    if w < PYRAMID_MIN_DIM || h < PYRAMID_MIN_DIM {
        return Err(BlendError::TooSmallForPyramid(w, h));
    }

    // Cap depth so the coarsest level keeps a usable size
    let max_levels = (w.min(h) as f32 / PYRAMID_MIN_DIM as f32).log2().floor() as usize;
    let levels = PYRAMID_LEVELS.min(max_levels.max(1));

    // Effective mask folds in strength once, so every level sees it
    let mut eff = mask.clone();
    for v in eff.data_mut() {
        *v *= strength;
    }

    let gauss_t = gaussian_pyramid(target, levels);
    let gauss_s = gaussian_pyramid(source, levels);
    let gauss_m = mask_pyramid(&eff, levels);

    let lap_t = laplacian_pyramid(&gauss_t);
    let lap_s = laplacian_pyramid(&gauss_s);

    // Blend the coarsest Gaussian level, then add blended Laplacian bands
    let top = levels;
    let mut acc = alpha_blend(&gauss_t[top], &gauss_s[top], &gauss_m[top], 1.0);

    for i in (0..levels).rev() {
        let (lw, lh) = gauss_t[i].dimensions();
        let up = upsample_to(&acc, lw, lh);
        let band = alpha_blend(&lap_t[i], &lap_s[i], &gauss_m[i], 1.0);
        acc = add_buffers(&up, &band);
    }

    Ok(acc)
}

/// Poisson seamless cloning over the mask interior: source gradients,
/// target boundary conditions, Gauss-Seidel iteration under a fixed budget.
fn poisson_blend(
    target: &RgbBuffer,
    source: &RgbBuffer,
    mask: &MaskBuffer,
    strength: f32,
    budget: &PoissonBudget,
) -> Result<RgbBuffer, BlendError> {
    let (w, h) = target.dimensions();

    // Interior = masked pixels with all four neighbors in-bounds
    let mut interior = Vec::new();
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            if mask.get(x, y) > POISSON_INTERIOR_THRESHOLD {
                interior.push((x, y));
            }
        }
    }
    if interior.is_empty() {
        // Nothing to solve; alpha handles the (empty) region exactly
        return Ok(alpha_blend(target, source, mask, strength));
    }

    // Initialize the solution from the alpha composite for faster convergence
    let mut solved = alpha_blend(target, source, mask, 1.0);

    let mut residual = f32::MAX;
    let mut converged = false;
    for iteration in 0..budget.max_iterations {
        let mut total_update = 0.0f64;

        for &(x, y) in &interior {
            let neighbors = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)];
            let s_p = source.pixel(x, y);
            let mut new_px = [0.0f32; 3];

            for c in 0..3 {
                let mut acc = 0.0f32;
                for &(nx, ny) in &neighbors {
                    // Boundary pixels contribute target values (Dirichlet);
                    // interior pixels contribute the evolving solution.
                    let neighbor_val = if mask.get(nx, ny) > POISSON_INTERIOR_THRESHOLD {
                        solved.pixel(nx, ny)[c]
                    } else {
                        target.pixel(nx, ny)[c]
                    };
                    let s_q = source.pixel(nx, ny)[c];
                    acc += neighbor_val + (s_p[c] - s_q);
                }
                new_px[c] = acc / 4.0;
            }

            let old = solved.pixel(x, y);
            total_update += (0..3)
                .map(|c| (new_px[c] - old[c]).abs() as f64)
                .sum::<f64>();
            solved.set_pixel(x, y, new_px);
        }

        residual = (total_update / (interior.len() * 3) as f64) as f32;
        if residual < budget.tolerance {
            tracing::debug!(iteration, residual, "poisson solver converged");
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(BlendError::PoissonBudgetExhausted {
            iterations: budget.max_iterations,
            residual,
        });
    }

    // Strength mixes the solved clone back toward the untouched target
    let (w, h) = target.dimensions();
    let mut out = RgbBuffer::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let a = if mask.get(x, y) > POISSON_INTERIOR_THRESHOLD {
                strength
            } else {
                mask.get(x, y) * strength
            };
            let t = target.pixel(x, y);
            let s = solved.pixel(x, y);
            out.set_pixel(
                x,
                y,
                [
                    t[0] * (1.0 - a) + s[0] * a,
                    t[1] * (1.0 - a) + s[1] * a,
                    t[2] * (1.0 - a) + s[2] * a,
                ],
            );
        }
    }
    Ok(out)
}

/// Weight map that suppresses blending across strong target edges.
fn edge_weights(image: &RgbBuffer) -> MaskBuffer {
    let grad = gradient_magnitude(image);
    let (w, h) = image.dimensions();
    let mut out = MaskBuffer::new(w, h);
    for (o, g) in out.data_mut().iter_mut().zip(grad.data().iter()) {
        *o = 1.0 / (1.0 + EDGE_WEIGHT_GAIN * g);
    }
    out
}

/// Weight map favoring smooth source regions (full weight) over highly
/// textured ones (slightly reduced weight).
fn smoothness_weights(image: &RgbBuffer) -> MaskBuffer {
    let grad = gradient_magnitude(image);
    let (w, h) = image.dimensions();
    let mut out = MaskBuffer::new(w, h);
    for (o, g) in out.data_mut().iter_mut().zip(grad.data().iter()) {
        *o = (1.0 - 0.5 * g.min(1.0)).clamp(0.0, 1.0);
    }
    out
}

/// Boost the mask around the stable landmark points so eyes, nose and
/// mouth take more of the source face than the cheek periphery.
fn feature_weights(mask: &MaskBuffer, landmarks: &Landmarks) -> MaskBuffer {
    let (w, h) = mask.dimensions();
    let anchors = landmarks.stable_subset();
    // Influence radius tied to the landmark spread
    let (cx, cy) = landmarks.centroid();
    let spread = anchors
        .iter()
        .map(|&(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
        .fold(0.0f32, f32::max)
        .max(1.0);

    let mut out = mask.clone();
    for y in 0..h {
        for x in 0..w {
            let m = out.get(x, y);
            if m == 0.0 {
                continue; // never grow the mask outside the face region
            }
            let d = anchors
                .iter()
                .map(|&(ax, ay)| ((x as f32 - ax).powi(2) + (y as f32 - ay).powi(2)).sqrt())
                .fold(f32::MAX, f32::min);
            let proximity = (1.0 - d / spread).clamp(0.0, 1.0);
            out.set(x, y, (m * (1.0 + FEATURE_BOOST * proximity)).min(1.0));
        }
    }
    out
}

/// Per-pixel luma gradient magnitude, roughly normalized to [0, 1].
fn gradient_magnitude(image: &RgbBuffer) -> MaskBuffer {
    let luma = image.to_luma();
    let (w, h) = image.dimensions();
    let mut out = MaskBuffer::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let xr = luma.get((x + 1).min(w - 1), y);
            let xl = luma.get(x.saturating_sub(1), y);
            let yd = luma.get(x, (y + 1).min(h - 1));
            let yu = luma.get(x, y.saturating_sub(1));
            let gx = (xr - xl) / 2.0;
            let gy = (yd - yu) / 2.0;
            out.set(x, y, (gx * gx + gy * gy).sqrt().min(1.0));
        }
    }
    out
}

// --- Pyramid machinery ---

/// 5-tap binomial blur [1, 4, 6, 4, 1]/16, separable, edge-clamped.
fn binomial_blur(data: &[f32], width: u32, height: u32, channels: u32) -> Vec<f32> {
    const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];
    let w = width as i64;
    let h = height as i64;
    let ch = channels as i64;

    let idx = |x: i64, y: i64, c: i64| ((y * w + x) * ch + c) as usize;

    let mut tmp = vec![0.0f32; data.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                let mut acc = 0.0;
                for (k, coeff) in KERNEL.iter().enumerate() {
                    let sx = (x + k as i64 - 2).clamp(0, w - 1);
                    acc += coeff * data[idx(sx, y, c)];
                }
                tmp[idx(x, y, c)] = acc;
            }
        }
    }

    let mut out = vec![0.0f32; data.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                let mut acc = 0.0;
                for (k, coeff) in KERNEL.iter().enumerate() {
                    let sy = (y + k as i64 - 2).clamp(0, h - 1);
                    acc += coeff * tmp[idx(x, sy, c)];
                }
                out[idx(x, y, c)] = acc;
            }
        }
    }
    out
}

fn downsample(image: &RgbBuffer) -> RgbBuffer {
    let (w, h) = image.dimensions();
    let blurred = binomial_blur(image.data(), w, h, 3);
    let nw = w.div_ceil(2);
    let nh = h.div_ceil(2);
    let mut out = RgbBuffer::new(nw, nh);
    for y in 0..nh {
        for x in 0..nw {
            let sx = (x * 2).min(w - 1);
            let sy = (y * 2).min(h - 1);
            let i = ((sy * w + sx) * 3) as usize;
            out.set_pixel(x, y, [blurred[i], blurred[i + 1], blurred[i + 2]]);
        }
    }
    out
}

fn downsample_mask(mask: &MaskBuffer) -> MaskBuffer {
    let (w, h) = mask.dimensions();
    let blurred = binomial_blur(mask.data(), w, h, 1);
    let nw = w.div_ceil(2);
    let nh = h.div_ceil(2);
    let mut out = MaskBuffer::new(nw, nh);
    for y in 0..nh {
        for x in 0..nw {
            let sx = (x * 2).min(w - 1);
            let sy = (y * 2).min(h - 1);
            out.set(x, y, blurred[(sy * w + sx) as usize]);
        }
    }
    out
}

/// Bilinear upsample to exact target dimensions.
fn upsample_to(image: &RgbBuffer, width: u32, height: u32) -> RgbBuffer {
    let (sw, sh) = image.dimensions();
    let mut out = RgbBuffer::new(width, height);
    let sx_scale = sw as f32 / width as f32;
    let sy_scale = sh as f32 / height as f32;
    for y in 0..height {
        for x in 0..width {
            let sx = ((x as f32 + 0.5) * sx_scale - 0.5).clamp(0.0, (sw - 1) as f32);
            let sy = ((y as f32 + 0.5) * sy_scale - 0.5).clamp(0.0, (sh - 1) as f32);
            let px = image
                .sample_bilinear(sx, sy)
                .unwrap_or([0.0, 0.0, 0.0]);
            out.set_pixel(x, y, px);
        }
    }
    out
}

fn gaussian_pyramid(image: &RgbBuffer, levels: usize) -> Vec<RgbBuffer> {
    let mut pyr = vec![image.clone()];
    for _ in 0..levels {
        let next = downsample(pyr.last().expect("pyramid never empty"));
        pyr.push(next);
    }
    pyr
}

fn mask_pyramid(mask: &MaskBuffer, levels: usize) -> Vec<MaskBuffer> {
    let mut pyr = vec![mask.clone()];
    for _ in 0..levels {
        let next = downsample_mask(pyr.last().expect("pyramid never empty"));
        pyr.push(next);
    }
    pyr
}

/// L[i] = G[i] − upsample(G[i+1]); the coarsest Gaussian level is kept
/// separately by the caller.
fn laplacian_pyramid(gaussians: &[RgbBuffer]) -> Vec<RgbBuffer> {
    let mut laps = Vec::with_capacity(gaussians.len() - 1);
    for i in 0..gaussians.len() - 1 {
        let (w, h) = gaussians[i].dimensions();
        let up = upsample_to(&gaussians[i + 1], w, h);
        laps.push(sub_buffers(&gaussians[i], &up));
    }
    laps
}

fn add_buffers(a: &RgbBuffer, b: &RgbBuffer) -> RgbBuffer {
    let (w, h) = a.dimensions();
    let data = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| x + y)
        .collect();
    RgbBuffer::from_raw(w, h, data)
}

fn sub_buffers(a: &RgbBuffer, b: &RgbBuffer) -> RgbBuffer {
    let (w, h) = a.dimensions();
    let data = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| x - y)
        .collect();
    RgbBuffer::from_raw(w, h, data)
}

// --- Mask geometry ---

/// Andrew monotone-chain convex hull. Returns the hull in counterclockwise
/// order; fewer than 3 input points yield the input unchanged.
fn convex_hull(points: &[(f32, f32)]) -> Vec<(f32, f32)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let cross = |o: (f32, f32), a: (f32, f32), b: (f32, f32)| {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };

    let mut lower: Vec<(f32, f32)> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<(f32, f32)> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Scanline even-odd polygon fill into a binary mask.
fn fill_polygon(polygon: &[(f32, f32)], width: u32, height: u32) -> MaskBuffer {
    let mut mask = MaskBuffer::new(width, height);
    if polygon.len() < 3 {
        return mask;
    }

    for y in 0..height {
        let fy = y as f32 + 0.5;
        let mut crossings: Vec<f32> = Vec::new();
        for i in 0..polygon.len() {
            let (x1, y1) = polygon[i];
            let (x2, y2) = polygon[(i + 1) % polygon.len()];
            if (y1 <= fy && y2 > fy) || (y2 <= fy && y1 > fy) {
                crossings.push(x1 + (fy - y1) / (y2 - y1) * (x2 - x1));
            }
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        for pair in crossings.chunks_exact(2) {
            let x_start = pair[0].ceil().max(0.0) as u32;
            let x_end = pair[1].floor().min((width - 1) as f32) as u32;
            for x in x_start..=x_end.min(width - 1) {
                mask.set(x, y, 1.0);
            }
        }
    }
    mask
}

/// Ellipse inscribed in the bbox — the landmark-free fallback region.
fn fill_ellipse(bbox: &BoundingBox, width: u32, height: u32) -> MaskBuffer {
    let mut mask = MaskBuffer::new(width, height);
    let (cx, cy) = bbox.center();
    let rx = (bbox.width / 2.0).max(1.0);
    let ry = (bbox.height / 2.0).max(1.0);
    for y in 0..height {
        for x in 0..width {
            let nx = (x as f32 + 0.5 - cx) / rx;
            let ny = (y as f32 + 0.5 - cy) / ry;
            if nx * nx + ny * ny <= 1.0 {
                mask.set(x, y, 1.0);
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(w: u32, h: u32) -> RgbBuffer {
        let mut img = RgbBuffer::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = x as f32 / w as f32;
                img.set_pixel(x, y, [v, v * 0.5, 1.0 - v]);
            }
        }
        img
    }

    fn flat_image(w: u32, h: u32, v: [f32; 3]) -> RgbBuffer {
        let mut img = RgbBuffer::new(w, h);
        for y in 0..h {
            for x in 0..w {
                img.set_pixel(x, y, v);
            }
        }
        img
    }

    fn test_landmarks() -> Landmarks {
        Landmarks::Five([
            (20.0, 24.0),
            (44.0, 24.0),
            (32.0, 36.0),
            (23.0, 48.0),
            (41.0, 48.0),
        ])
    }

    #[test]
    fn test_alpha_blend_shape_and_zero_mask() {
        let target = gradient_image(32, 32);
        let source = flat_image(32, 32, [1.0, 0.0, 0.0]);
        let mask = MaskBuffer::new(32, 32);
        let out = alpha_blend(&target, &source, &mask, 1.0);
        assert_eq!(out.dimensions(), target.dimensions());
        // Zero mask leaves every target pixel byte-for-byte unchanged
        assert_eq!(out.data(), target.data());
    }

    #[test]
    fn test_alpha_blend_full_mask_full_strength() {
        let target = gradient_image(16, 16);
        let source = flat_image(16, 16, [0.2, 0.4, 0.6]);
        let mask = MaskBuffer::filled(16, 16, 1.0);
        let out = alpha_blend(&target, &source, &mask, 1.0);
        assert_eq!(out.data(), source.data());
    }

    #[test]
    fn test_all_modes_preserve_shape() {
        let target = gradient_image(64, 64);
        let source = flat_image(64, 64, [0.5, 0.3, 0.2]);
        let mask = MaskBuffer::filled(64, 64, 0.7);
        let budget = PoissonBudget::default();
        let lm = test_landmarks();
        for mode in [
            BlendMode::Alpha,
            BlendMode::MultiBand,
            BlendMode::PoissonSeamless,
            BlendMode::AdaptiveWeighted,
            BlendMode::EdgePreserving,
            BlendMode::FeatureGuided,
        ] {
            let out = blend(&target, &source, &mask, mode, 0.8, Some(&lm), &budget).unwrap();
            assert_eq!(out.output.dimensions(), (64, 64), "mode {mode}");
        }
    }

    #[test]
    fn test_shape_mismatch_is_hard_error() {
        let target = gradient_image(32, 32);
        let source = flat_image(16, 16, [0.0; 3]);
        let mask = MaskBuffer::new(32, 32);
        let err = blend(
            &target,
            &source,
            &mask,
            BlendMode::Alpha,
            1.0,
            None,
            &PoissonBudget::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BlendError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_multi_band_agrees_with_alpha_at_extremes() {
        let target = gradient_image(64, 64);
        let source = flat_image(64, 64, [0.9, 0.1, 0.4]);

        for mask_value in [0.0f32, 1.0] {
            let mask = MaskBuffer::filled(64, 64, mask_value);
            let alpha = alpha_blend(&target, &source, &mask, 1.0);
            let mb = multi_band_blend(&target, &source, &mask, 1.0).unwrap();
            for (a, b) in alpha.data().iter().zip(mb.data().iter()) {
                assert!(
                    (a - b).abs() < 1e-3,
                    "multi-band diverges from alpha at mask={mask_value}: {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn test_multi_band_too_small_fails_over() {
        let target = gradient_image(2, 2);
        let source = flat_image(2, 2, [1.0; 3]);
        let mask = MaskBuffer::filled(2, 2, 1.0);
        let out = blend(
            &target,
            &source,
            &mask,
            BlendMode::MultiBand,
            1.0,
            None,
            &PoissonBudget::default(),
        )
        .unwrap();
        assert_eq!(out.used, BlendMode::Alpha);
        assert!(out.degraded());
    }

    #[test]
    fn test_poisson_budget_exhaustion_degrades_to_multi_band() {
        let target = gradient_image(32, 32);
        let source = flat_image(32, 32, [0.8, 0.2, 0.1]);
        let mut mask = MaskBuffer::new(32, 32);
        for y in 8..24 {
            for x in 8..24 {
                mask.set(x, y, 1.0);
            }
        }
        // One iteration with an unreachable tolerance cannot converge
        let budget = PoissonBudget {
            max_iterations: 1,
            tolerance: 1e-12,
        };
        let out = blend(
            &target,
            &source,
            &mask,
            BlendMode::PoissonSeamless,
            1.0,
            None,
            &budget,
        )
        .unwrap();
        assert!(out.degraded());
        assert_eq!(out.used, BlendMode::MultiBand);
        assert_eq!(out.output.dimensions(), (32, 32));
    }

    #[test]
    fn test_poisson_converges_on_matching_gradients() {
        // Identical source and target: the solve is already exact
        let target = gradient_image(24, 24);
        let source = target.clone();
        let mut mask = MaskBuffer::new(24, 24);
        for y in 6..18 {
            for x in 6..18 {
                mask.set(x, y, 1.0);
            }
        }
        let out = poisson_blend(&target, &source, &mask, 1.0, &PoissonBudget::default()).unwrap();
        for (a, b) in out.data().iter().zip(target.data().iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_face_mask_zero_outside_region() {
        let lm = test_landmarks();
        let bbox = BoundingBox::new(12.0, 14.0, 40.0, 44.0);
        let mask = face_mask(&lm, &bbox, 64, 64, 1.0);
        // Far corners are well outside any expanded hull
        assert_eq!(mask.get(0, 0), 0.0);
        assert_eq!(mask.get(63, 63), 0.0);
        assert_eq!(mask.get(63, 0), 0.0);
        assert_eq!(mask.get(0, 63), 0.0);
        // All values stay within [0, 1]
        assert!(mask.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_face_mask_interior_is_solid() {
        let lm = test_landmarks();
        let bbox = BoundingBox::new(12.0, 14.0, 40.0, 44.0);
        let mask = face_mask(&lm, &bbox, 64, 64, 0.0);
        // Without feathering, the hull centroid area is fully opaque
        let (cx, cy) = lm.centroid();
        assert_eq!(mask.get(cx as u32, cy as u32), 1.0);
    }

    #[test]
    fn test_face_mask_feather_ramps_inward() {
        let lm = test_landmarks();
        let bbox = BoundingBox::new(12.0, 14.0, 40.0, 44.0);
        let hard = face_mask(&lm, &bbox, 64, 64, 0.0);
        let soft = face_mask(&lm, &bbox, 64, 64, 1.0);
        // Feathered mask never exceeds the hard mask (ramp is inward-only)
        for (s, h) in soft.data().iter().zip(hard.data().iter()) {
            assert!(s <= h);
        }
        // And it actually ramps: some interior values are intermediate
        assert!(soft
            .data()
            .iter()
            .any(|&v| v > 0.01 && v < 0.99));
    }

    #[test]
    fn test_face_mask_falls_back_to_ellipse() {
        // Collinear "landmarks" have no 2D hull; bbox ellipse takes over
        let lm = Landmarks::SixtyEight(vec![(10.0, 10.0), (20.0, 10.0)]);
        let bbox = BoundingBox::new(8.0, 8.0, 24.0, 24.0);
        let mask = face_mask(&lm, &bbox, 40, 40, 0.0);
        let (cx, cy) = bbox.center();
        assert_eq!(mask.get(cx as u32, cy as u32), 1.0);
        assert_eq!(mask.get(0, 0), 0.0);
    }

    #[test]
    fn test_convex_hull_square() {
        let pts = vec![
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (0.0, 10.0),
            (5.0, 5.0), // interior point must be dropped
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&(5.0, 5.0)));
    }

    #[test]
    fn test_feature_weights_never_grow_outside_mask() {
        let lm = test_landmarks();
        let mut mask = MaskBuffer::new(64, 64);
        for y in 20..44 {
            for x in 16..48 {
                mask.set(x, y, 0.5);
            }
        }
        let weighted = feature_weights(&mask, &lm);
        for y in 0..64 {
            for x in 0..64 {
                if mask.get(x, y) == 0.0 {
                    assert_eq!(weighted.get(x, y), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_pyramid_roundtrip_flat_image() {
        let img = flat_image(32, 32, [0.3, 0.6, 0.9]);
        let gauss = gaussian_pyramid(&img, 3);
        let laps = laplacian_pyramid(&gauss);
        // Reconstruct and compare
        let mut acc = gauss[3].clone();
        for i in (0..3).rev() {
            let (w, h) = gauss[i].dimensions();
            acc = add_buffers(&upsample_to(&acc, w, h), &laps[i]);
        }
        for (a, b) in acc.data().iter().zip(img.data().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_blend_mode_parsing() {
        assert_eq!("alpha".parse::<BlendMode>().unwrap(), BlendMode::Alpha);
        assert_eq!(
            "poisson_seamless".parse::<BlendMode>().unwrap(),
            BlendMode::PoissonSeamless
        );
        assert!("screen".parse::<BlendMode>().is_err());
    }
}
