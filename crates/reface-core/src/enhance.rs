//! Post-blend adaptation of the composited face region.
//!
//! Skin-tone color transfer, lighting-direction matching, light texture
//! smoothing and seam feathering. Every operation is gated by the blend
//! mask; pixels outside the mask pass through untouched.

use crate::imagebuf::{MaskBuffer, RgbBuffer};
use serde::{Deserialize, Serialize};

/// Blur radius (box passes) used for texture smoothing.
const SMOOTH_RADIUS: u32 = 1;
/// Floor for standard deviations to keep the transfer stable on flat regions.
const STD_FLOOR: f32 = 1e-3;

/// Per-channel mean and standard deviation inside a masked region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ColorStats {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// Linear luma model over a masked region: mean level plus horizontal and
/// vertical brightness slopes (per pixel).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LightingStats {
    pub mean_luma: f32,
    pub gradient_x: f32,
    pub gradient_y: f32,
}

/// Everything the enhancer needs to know about a face region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegionStats {
    pub color: ColorStats,
    pub lighting: LightingStats,
    /// Mask-weighted centroid, the origin of the lighting ramp.
    pub centroid: (f32, f32),
}

impl RegionStats {
    /// Measure color and lighting statistics over the masked pixels.
    /// An empty mask yields neutral stats.
    pub fn measure(image: &RgbBuffer, mask: &MaskBuffer) -> RegionStats {
        let (w, h) = image.dimensions();
        let mut weight_sum = 0.0f64;
        let mut mean = [0.0f64; 3];
        let mut cx = 0.0f64;
        let mut cy = 0.0f64;

        for y in 0..h {
            for x in 0..w {
                let m = mask.get(x, y) as f64;
                if m == 0.0 {
                    continue;
                }
                let px = image.pixel(x, y);
                for c in 0..3 {
                    mean[c] += px[c] as f64 * m;
                }
                cx += x as f64 * m;
                cy += y as f64 * m;
                weight_sum += m;
            }
        }

        if weight_sum == 0.0 {
            return RegionStats {
                color: ColorStats {
                    mean: [0.5; 3],
                    std: [1.0; 3],
                },
                lighting: LightingStats {
                    mean_luma: 0.5,
                    gradient_x: 0.0,
                    gradient_y: 0.0,
                },
                centroid: (w as f32 / 2.0, h as f32 / 2.0),
            };
        }

        for c in mean.iter_mut() {
            *c /= weight_sum;
        }
        let centroid = ((cx / weight_sum) as f32, (cy / weight_sum) as f32);

        // Second pass: variance and luma slopes via weighted least squares
        let mut var = [0.0f64; 3];
        let mut luma_sum = 0.0f64;
        let mut sxx = 0.0f64;
        let mut syy = 0.0f64;
        let mut sxl = 0.0f64;
        let mut syl = 0.0f64;

        for y in 0..h {
            for x in 0..w {
                let m = mask.get(x, y) as f64;
                if m == 0.0 {
                    continue;
                }
                let px = image.pixel(x, y);
                for c in 0..3 {
                    var[c] += m * (px[c] as f64 - mean[c]).powi(2);
                }
                let luma = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
                luma_sum += m * luma;
                let dx = x as f64 - centroid.0 as f64;
                let dy = y as f64 - centroid.1 as f64;
                sxx += m * dx * dx;
                syy += m * dy * dy;
                sxl += m * dx * luma;
                syl += m * dy * luma;
            }
        }

        let color = ColorStats {
            mean: [mean[0] as f32, mean[1] as f32, mean[2] as f32],
            std: [
                (var[0] / weight_sum).sqrt() as f32,
                (var[1] / weight_sum).sqrt() as f32,
                (var[2] / weight_sum).sqrt() as f32,
            ],
        };
        let lighting = LightingStats {
            mean_luma: (luma_sum / weight_sum) as f32,
            gradient_x: if sxx > 0.0 { (sxl / sxx) as f32 } else { 0.0 },
            gradient_y: if syy > 0.0 { (syl / syy) as f32 } else { 0.0 },
        };

        RegionStats {
            color,
            lighting,
            centroid,
        }
    }
}

/// Which adaptations to run, resolved from the host's `enhancement_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceMode {
    /// Pass-through.
    None,
    /// Skin-tone color transfer only.
    ColorTransfer,
    /// Lighting-direction adaptation only.
    Lighting,
    /// Texture smoothing and seam feathering only.
    Smooth,
    /// All of the above in a fixed order.
    Full,
}

impl std::str::FromStr for EnhanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(EnhanceMode::None),
            "color_transfer" => Ok(EnhanceMode::ColorTransfer),
            "lighting" => Ok(EnhanceMode::Lighting),
            "smooth" => Ok(EnhanceMode::Smooth),
            "full" => Ok(EnhanceMode::Full),
            other => Err(format!("unknown enhancement mode: {other}")),
        }
    }
}

/// Adapt the composited region toward the target's color and lighting.
///
/// Operations run in a fixed order (color, lighting, smoothing/feather);
/// each is weighted per pixel by the mask so the transition region blends
/// smoothly and unmasked pixels are never modified.
pub fn enhance(
    region: &RgbBuffer,
    mask: &MaskBuffer,
    source_stats: &RegionStats,
    target_stats: &RegionStats,
    mode: EnhanceMode,
) -> RgbBuffer {
    let mut out = region.clone();

    match mode {
        EnhanceMode::None => return out,
        EnhanceMode::ColorTransfer => {
            apply_color_transfer(&mut out, mask, &source_stats.color, &target_stats.color);
        }
        EnhanceMode::Lighting => {
            apply_lighting(&mut out, mask, target_stats);
        }
        EnhanceMode::Smooth => {
            apply_smoothing(&mut out, mask);
            apply_seam_feather(&mut out, region, mask);
        }
        EnhanceMode::Full => {
            apply_color_transfer(&mut out, mask, &source_stats.color, &target_stats.color);
            apply_lighting(&mut out, mask, target_stats);
            apply_smoothing(&mut out, mask);
            apply_seam_feather(&mut out, region, mask);
        }
    }

    out
}

/// Match masked mean/std per channel to the target statistics.
fn apply_color_transfer(
    image: &mut RgbBuffer,
    mask: &MaskBuffer,
    source: &ColorStats,
    target: &ColorStats,
) {
    let (w, h) = image.dimensions();
    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            if m == 0.0 {
                continue;
            }
            let mut px = image.pixel(x, y);
            for c in 0..3 {
                let normalized = (px[c] - source.mean[c]) / source.std[c].max(STD_FLOOR);
                let transferred = (normalized * target.std[c] + target.mean[c]).clamp(0.0, 1.0);
                px[c] = px[c] * (1.0 - m) + transferred * m;
            }
            image.set_pixel(x, y, px);
        }
    }
}

/// Impose the target's brightness slopes on the masked region.
fn apply_lighting(image: &mut RgbBuffer, mask: &MaskBuffer, target: &RegionStats) {
    let current = RegionStats::measure(image, mask);
    let dgx = target.lighting.gradient_x - current.lighting.gradient_x;
    let dgy = target.lighting.gradient_y - current.lighting.gradient_y;
    let (cx, cy) = current.centroid;

    let (w, h) = image.dimensions();
    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            if m == 0.0 {
                continue;
            }
            let delta = dgx * (x as f32 - cx) + dgy * (y as f32 - cy);
            let mut px = image.pixel(x, y);
            for c in px.iter_mut() {
                *c = (*c + delta * m).clamp(0.0, 1.0);
            }
            image.set_pixel(x, y, px);
        }
    }
}

/// Light blur for texture continuity, mixed in by mask weight.
fn apply_smoothing(image: &mut RgbBuffer, mask: &MaskBuffer) {
    let blurred = blur_rgb(image, SMOOTH_RADIUS);
    let (w, h) = image.dimensions();
    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            if m == 0.0 {
                continue;
            }
            // Half-strength smoothing at full mask keeps skin texture alive
            let a = 0.5 * m;
            let orig = image.pixel(x, y);
            let soft = blurred.pixel(x, y);
            image.set_pixel(
                x,
                y,
                [
                    orig[0] * (1.0 - a) + soft[0] * a,
                    orig[1] * (1.0 - a) + soft[1] * a,
                    orig[2] * (1.0 - a) + soft[2] * a,
                ],
            );
        }
    }
}

/// Extra blur concentrated on the mask's transition band, where residual
/// seams live. `4m(1−m)` peaks at mask 0.5 and vanishes at both extremes.
fn apply_seam_feather(image: &mut RgbBuffer, original: &RgbBuffer, mask: &MaskBuffer) {
    let blurred = blur_rgb(original, SMOOTH_RADIUS * 2);
    let (w, h) = image.dimensions();
    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            if m == 0.0 {
                continue;
            }
            let band = 4.0 * m * (1.0 - m);
            if band == 0.0 {
                continue;
            }
            let orig = image.pixel(x, y);
            let soft = blurred.pixel(x, y);
            image.set_pixel(
                x,
                y,
                [
                    orig[0] * (1.0 - band) + soft[0] * band,
                    orig[1] * (1.0 - band) + soft[1] * band,
                    orig[2] * (1.0 - band) + soft[2] * band,
                ],
            );
        }
    }
}

/// Box blur over all three channels with edge clamping.
fn blur_rgb(image: &RgbBuffer, radius: u32) -> RgbBuffer {
    if radius == 0 {
        return image.clone();
    }
    let (w, h) = image.dimensions();
    let r = radius as i64;
    let norm = 1.0 / ((2 * r + 1) * (2 * r + 1)) as f32;
    let mut out = RgbBuffer::new(w, h);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let mut acc = [0.0f32; 3];
            for dy in -r..=r {
                for dx in -r..=r {
                    let sx = (x + dx).clamp(0, w as i64 - 1) as u32;
                    let sy = (y + dy).clamp(0, h as i64 - 1) as u32;
                    let px = image.pixel(sx, sy);
                    for c in 0..3 {
                        acc[c] += px[c];
                    }
                }
            }
            out.set_pixel(x as u32, y as u32, [acc[0] * norm, acc[1] * norm, acc[2] * norm]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_image(w: u32, h: u32, base: f32) -> RgbBuffer {
        let mut img = RgbBuffer::new(w, h);
        for y in 0..h {
            for x in 0..w {
                // Deterministic checker-ish variation
                let n = ((x * 7 + y * 13) % 10) as f32 / 40.0;
                img.set_pixel(x, y, [base + n, base, base - n * 0.5]);
            }
        }
        img
    }

    fn center_mask(w: u32, h: u32) -> MaskBuffer {
        let mut mask = MaskBuffer::new(w, h);
        for y in h / 4..3 * h / 4 {
            for x in w / 4..3 * w / 4 {
                mask.set(x, y, 1.0);
            }
        }
        mask
    }

    #[test]
    fn test_measure_flat_region() {
        let mut img = RgbBuffer::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                img.set_pixel(x, y, [0.25, 0.5, 0.75]);
            }
        }
        let stats = RegionStats::measure(&img, &MaskBuffer::filled(16, 16, 1.0));
        assert!((stats.color.mean[0] - 0.25).abs() < 1e-5);
        assert!((stats.color.mean[2] - 0.75).abs() < 1e-5);
        assert!(stats.color.std[1] < 1e-5);
        assert!(stats.lighting.gradient_x.abs() < 1e-5);
    }

    #[test]
    fn test_measure_detects_horizontal_gradient() {
        let mut img = RgbBuffer::new(32, 8);
        for y in 0..8 {
            for x in 0..32 {
                let v = x as f32 / 32.0;
                img.set_pixel(x, y, [v, v, v]);
            }
        }
        let stats = RegionStats::measure(&img, &MaskBuffer::filled(32, 8, 1.0));
        assert!(stats.lighting.gradient_x > 0.01);
        assert!(stats.lighting.gradient_y.abs() < 1e-4);
    }

    #[test]
    fn test_empty_mask_neutral_stats() {
        let img = noisy_image(8, 8, 0.5);
        let stats = RegionStats::measure(&img, &MaskBuffer::new(8, 8));
        assert_eq!(stats.color.mean, [0.5; 3]);
    }

    #[test]
    fn test_enhance_none_is_identity() {
        let img = noisy_image(16, 16, 0.4);
        let mask = center_mask(16, 16);
        let src = RegionStats::measure(&img, &mask);
        let out = enhance(&img, &mask, &src, &src, EnhanceMode::None);
        assert_eq!(out.data(), img.data());
    }

    #[test]
    fn test_enhance_preserves_unmasked_pixels() {
        let img = noisy_image(32, 32, 0.4);
        let mask = center_mask(32, 32);
        let src = RegionStats::measure(&img, &mask);
        let mut tgt = src;
        tgt.color.mean = [0.8, 0.3, 0.2];

        let out = enhance(&img, &mask, &src, &tgt, EnhanceMode::Full);
        assert_eq!(out.dimensions(), img.dimensions());
        for y in 0..32 {
            for x in 0..32 {
                if mask.get(x, y) == 0.0 {
                    assert_eq!(out.pixel(x, y), img.pixel(x, y), "pixel ({x},{y}) modified");
                }
            }
        }
    }

    #[test]
    fn test_color_transfer_moves_mean_toward_target() {
        let img = noisy_image(32, 32, 0.4);
        let mask = center_mask(32, 32);
        let src = RegionStats::measure(&img, &mask);
        let mut tgt = src;
        tgt.color.mean = [0.7, 0.5, 0.3];

        let out = enhance(&img, &mask, &src, &tgt, EnhanceMode::ColorTransfer);
        let result = RegionStats::measure(&out, &mask);
        for c in 0..3 {
            let before = (src.color.mean[c] - tgt.color.mean[c]).abs();
            let after = (result.color.mean[c] - tgt.color.mean[c]).abs();
            assert!(after < before, "channel {c}: {after} !< {before}");
        }
    }

    #[test]
    fn test_lighting_flattens_gradient_mismatch() {
        // Composite has a left-to-right ramp; target is flat
        let mut img = RgbBuffer::new(32, 32);
        for y in 0..32 {
            for x in 0..32 {
                let v = 0.25 + 0.5 * x as f32 / 32.0;
                img.set_pixel(x, y, [v, v, v]);
            }
        }
        let mask = MaskBuffer::filled(32, 32, 1.0);
        let src = RegionStats::measure(&img, &mask);
        let mut tgt = src;
        tgt.lighting.gradient_x = 0.0;

        let out = enhance(&img, &mask, &src, &tgt, EnhanceMode::Lighting);
        let result = RegionStats::measure(&out, &mask);
        assert!(
            result.lighting.gradient_x.abs() < src.lighting.gradient_x.abs() / 2.0,
            "gradient not reduced: {} vs {}",
            result.lighting.gradient_x,
            src.lighting.gradient_x
        );
    }

    #[test]
    fn test_smoothing_reduces_local_variance() {
        let img = noisy_image(32, 32, 0.5);
        let mask = MaskBuffer::filled(32, 32, 1.0);
        let src = RegionStats::measure(&img, &mask);
        let out = enhance(&img, &mask, &src, &src, EnhanceMode::Smooth);
        let result = RegionStats::measure(&out, &mask);
        assert!(result.color.std[0] < src.color.std[0]);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("full".parse::<EnhanceMode>().unwrap(), EnhanceMode::Full);
        assert_eq!("none".parse::<EnhanceMode>().unwrap(), EnhanceMode::None);
        assert!("hdr".parse::<EnhanceMode>().is_err());
    }
}
