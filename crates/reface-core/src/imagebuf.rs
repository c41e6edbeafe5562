//! Dense pixel buffer types — RGB images and single-channel masks.
//!
//! All pipeline stages operate on `RgbBuffer` (interleaved RGB, f32 in
//! [0, 1]) and `MaskBuffer` (single channel, f32 in [0, 1]). Conversions
//! to and from the `image` crate types happen only at the caller boundary.

use image::RgbImage;

/// Interleaved RGB pixel buffer, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct RgbBuffer {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl RgbBuffer {
    /// Allocate a black buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width * height * 3) as usize],
        }
    }

    /// Wrap raw interleaved RGB data. Panics if the length does not match.
    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            (width * height * 3) as usize,
            "raw buffer length does not match dimensions"
        );
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, px: [f32; 3]) {
        let i = ((y * self.width + x) * 3) as usize;
        self.data[i] = px[0];
        self.data[i + 1] = px[1];
        self.data[i + 2] = px[2];
    }

    /// Bilinear sample at a sub-pixel position. Returns `None` when the
    /// position falls outside the buffer, so callers can treat it as
    /// no-data rather than clamping.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> Option<[f32; 3]> {
        if x < 0.0 || y < 0.0 || x > (self.width - 1) as f32 || y > (self.height - 1) as f32 {
            return None;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let tl = self.pixel(x0, y0);
        let tr = self.pixel(x1, y0);
        let bl = self.pixel(x0, y1);
        let br = self.pixel(x1, y1);

        let mut out = [0.0f32; 3];
        for c in 0..3 {
            out[c] = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
        }
        Some(out)
    }

    /// Extract a rectangular region. Coordinates are clamped to the buffer.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> RgbBuffer {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let w = w.min(self.width - x);
        let h = h.min(self.height - y);
        let mut out = RgbBuffer::new(w, h);
        for oy in 0..h {
            for ox in 0..w {
                out.set_pixel(ox, oy, self.pixel(x + ox, y + oy));
            }
        }
        out
    }

    /// Write `region` into this buffer with its top-left corner at (x, y).
    /// Out-of-bounds parts of the region are dropped.
    pub fn paste(&mut self, region: &RgbBuffer, x: u32, y: u32) {
        for ry in 0..region.height {
            for rx in 0..region.width {
                let dx = x + rx;
                let dy = y + ry;
                if dx < self.width && dy < self.height {
                    self.set_pixel(dx, dy, region.pixel(rx, ry));
                }
            }
        }
    }

    /// Rec. 601 luma plane as bytes, for detectors that want grayscale input.
    pub fn to_luma_u8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.width * self.height) as usize);
        for px in self.data.chunks_exact(3) {
            let y = 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2];
            out.push((y * 255.0).round().clamp(0.0, 255.0) as u8);
        }
        out
    }

    /// Rec. 601 luma plane in [0, 1].
    pub fn to_luma(&self) -> MaskBuffer {
        let data = self
            .data
            .chunks_exact(3)
            .map(|px| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2])
            .collect();
        MaskBuffer {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Convert from an 8-bit `image` crate buffer.
    pub fn from_rgb_image(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let data = img
            .as_raw()
            .iter()
            .map(|&v| v as f32 / 255.0)
            .collect();
        Self { width, height, data }
    }

    /// Convert to an 8-bit `image` crate buffer, clamping to [0, 255].
    pub fn to_rgb_image(&self) -> RgbImage {
        let raw: Vec<u8> = self
            .data
            .iter()
            .map(|&v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect();
        RgbImage::from_raw(self.width, self.height, raw)
            .expect("raw length matches dimensions by construction")
    }
}

/// Single-channel float buffer in [0, 1] — blend masks and weight maps.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskBuffer {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl MaskBuffer {
    /// Allocate a buffer filled with a constant value.
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; (width * height) as usize],
        }
    }

    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            (width * height) as usize,
            "raw mask length does not match dimensions"
        );
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: f32) {
        self.data[(y * self.width + x) as usize] = v;
    }

    /// Bilinear sample with edge clamping (masks extend their border value).
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        self.get(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + self.get(x1, y0) * fx * (1.0 - fy)
            + self.get(x0, y1) * (1.0 - fx) * fy
            + self.get(x1, y1) * fx * fy
    }

    /// Pointwise product with another mask of the same dimensions.
    pub fn multiply(&self, other: &MaskBuffer) -> MaskBuffer {
        assert_eq!(self.dimensions(), other.dimensions());
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        MaskBuffer {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Separable box blur, applied `passes` times. Three passes of a box
    /// filter approximate a Gaussian closely enough for feather ramps.
    pub fn box_blur(&self, radius: u32, passes: u32) -> MaskBuffer {
        let mut out = self.clone();
        if radius == 0 {
            return out;
        }
        for _ in 0..passes {
            out = out.box_blur_once(radius);
        }
        out
    }

    fn box_blur_once(&self, radius: u32) -> MaskBuffer {
        let w = self.width as i64;
        let h = self.height as i64;
        let r = radius as i64;
        let norm = 1.0 / (2 * r + 1) as f32;

        // Horizontal pass
        let mut tmp = vec![0.0f32; (w * h) as usize];
        for y in 0..h {
            let row = &self.data[(y * w) as usize..((y + 1) * w) as usize];
            for x in 0..w {
                let mut acc = 0.0;
                for dx in -r..=r {
                    let sx = (x + dx).clamp(0, w - 1) as usize;
                    acc += row[sx];
                }
                tmp[(y * w + x) as usize] = acc * norm;
            }
        }

        // Vertical pass
        let mut data = vec![0.0f32; (w * h) as usize];
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for dy in -r..=r {
                    let sy = (y + dy).clamp(0, h - 1);
                    acc += tmp[(sy * w + x) as usize];
                }
                data[(y * w + x) as usize] = acc * norm;
            }
        }

        MaskBuffer {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_black() {
        let buf = RgbBuffer::new(4, 3);
        assert_eq!(buf.dimensions(), (4, 3));
        assert!(buf.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pixel_roundtrip() {
        let mut buf = RgbBuffer::new(8, 8);
        buf.set_pixel(3, 5, [0.25, 0.5, 0.75]);
        assert_eq!(buf.pixel(3, 5), [0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_sample_bilinear_center() {
        let mut buf = RgbBuffer::new(2, 1);
        buf.set_pixel(0, 0, [0.0, 0.0, 0.0]);
        buf.set_pixel(1, 0, [1.0, 1.0, 1.0]);
        let mid = buf.sample_bilinear(0.5, 0.0).unwrap();
        assert!((mid[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sample_bilinear_outside_is_none() {
        let buf = RgbBuffer::new(4, 4);
        assert!(buf.sample_bilinear(-0.1, 0.0).is_none());
        assert!(buf.sample_bilinear(0.0, 3.5).is_none());
    }

    #[test]
    fn test_crop_and_paste() {
        let mut buf = RgbBuffer::new(10, 10);
        buf.set_pixel(4, 4, [1.0, 0.5, 0.0]);
        let crop = buf.crop(3, 3, 4, 4);
        assert_eq!(crop.dimensions(), (4, 4));
        assert_eq!(crop.pixel(1, 1), [1.0, 0.5, 0.0]);

        let mut dst = RgbBuffer::new(10, 10);
        dst.paste(&crop, 3, 3);
        assert_eq!(dst.pixel(4, 4), [1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_rgb_image_roundtrip() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(1, 1, image::Rgb([255, 128, 0]));
        let buf = RgbBuffer::from_rgb_image(&img);
        let back = buf.to_rgb_image();
        assert_eq!(back.get_pixel(1, 1), &image::Rgb([255, 128, 0]));
    }

    #[test]
    fn test_luma_flat_white() {
        let mut buf = RgbBuffer::new(2, 2);
        for y in 0..2 {
            for x in 0..2 {
                buf.set_pixel(x, y, [1.0, 1.0, 1.0]);
            }
        }
        let luma = buf.to_luma();
        assert!(luma.data().iter().all(|&v| (v - 1.0).abs() < 1e-3));
        assert!(buf.to_luma_u8().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_mask_blur_preserves_flat() {
        let mask = MaskBuffer::filled(16, 16, 0.6);
        let blurred = mask.box_blur(2, 3);
        assert!(blurred.data().iter().all(|&v| (v - 0.6).abs() < 1e-5));
    }

    #[test]
    fn test_mask_blur_softens_edge() {
        let mut mask = MaskBuffer::new(16, 1);
        for x in 8..16 {
            mask.set(x, 0, 1.0);
        }
        let blurred = mask.box_blur(2, 1);
        // Edge value becomes intermediate
        let edge = blurred.get(8, 0);
        assert!(edge > 0.0 && edge < 1.0, "edge = {edge}");
    }

    #[test]
    fn test_mask_multiply() {
        let a = MaskBuffer::filled(4, 4, 0.5);
        let b = MaskBuffer::filled(4, 4, 0.5);
        let m = a.multiply(&b);
        assert!(m.data().iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }
}
