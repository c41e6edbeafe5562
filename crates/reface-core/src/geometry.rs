//! Geometry value types shared by every pipeline stage.
//!
//! Bounding boxes, facial landmark sets and 2×3 similarity transforms.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = (x2 - x1).max(0.0);
        let inter_h = (y2 - y1).max(0.0);
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clamp the box to an image of the given dimensions.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let x = self.x.clamp(0.0, width as f32);
        let y = self.y.clamp(0.0, height as f32);
        BoundingBox {
            x,
            y,
            width: self.width.min(width as f32 - x),
            height: self.height.min(height as f32 - y),
        }
    }
}

/// Facial landmark set: either the five canonical points or a 68-point contour.
///
/// Five-point order: [left_eye, right_eye, nose, left_mouth, right_mouth].
/// The 68-point order follows the iBUG annotation scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Landmarks {
    Five([(f32, f32); 5]),
    SixtyEight(Vec<(f32, f32)>),
}

impl Landmarks {
    /// Number of points in the set.
    pub fn len(&self) -> usize {
        match self {
            Landmarks::Five(_) => 5,
            Landmarks::SixtyEight(pts) => pts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All points, in set order.
    pub fn points(&self) -> Vec<(f32, f32)> {
        match self {
            Landmarks::Five(pts) => pts.to_vec(),
            Landmarks::SixtyEight(pts) => pts.clone(),
        }
    }

    /// The stable correspondence subset used for alignment: eye centers,
    /// nose tip and mouth corners. For a five-point set this is the set
    /// itself; for 68 points the iBUG indices are reduced to the same five.
    pub fn stable_subset(&self) -> Vec<(f32, f32)> {
        match self {
            Landmarks::Five(pts) => pts.to_vec(),
            Landmarks::SixtyEight(pts) => {
                if pts.len() < 68 {
                    return pts.clone();
                }
                let mean = |idx: &[usize]| {
                    let (mut sx, mut sy) = (0.0f32, 0.0f32);
                    for &i in idx {
                        sx += pts[i].0;
                        sy += pts[i].1;
                    }
                    (sx / idx.len() as f32, sy / idx.len() as f32)
                };
                vec![
                    mean(&[36, 37, 38, 39, 40, 41]), // left eye center
                    mean(&[42, 43, 44, 45, 46, 47]), // right eye center
                    pts[30],                         // nose tip
                    pts[48],                         // left mouth corner
                    pts[54],                         // right mouth corner
                ]
            }
        }
    }

    /// Mean point of the whole set.
    pub fn centroid(&self) -> (f32, f32) {
        let pts = self.points();
        let n = pts.len().max(1) as f32;
        let (sx, sy) = pts
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    }

    /// Apply a 2×3 affine matrix to every point.
    pub fn transformed(&self, matrix: &[f32; 6]) -> Landmarks {
        let map = |(x, y): (f32, f32)| {
            (
                matrix[0] * x + matrix[1] * y + matrix[2],
                matrix[3] * x + matrix[4] * y + matrix[5],
            )
        };
        match self {
            Landmarks::Five(pts) => {
                let mut out = [(0.0, 0.0); 5];
                for (o, &p) in out.iter_mut().zip(pts.iter()) {
                    *o = map(p);
                }
                Landmarks::Five(out)
            }
            Landmarks::SixtyEight(pts) => {
                Landmarks::SixtyEight(pts.iter().map(|&p| map(p)).collect())
            }
        }
    }
}

/// A 4-DOF similarity transform (uniform scale, rotation, translation)
/// stored as a 2×3 row-major affine matrix plus its decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentTransform {
    /// Row-major [a, -b, tx, b, a, ty]:
    /// ```text
    /// | a  -b  tx |
    /// | b   a  ty |
    /// ```
    pub matrix: [f32; 6],
    pub scale: f32,
    pub rotation_degrees: f32,
    pub translation: (f32, f32),
}

impl AlignmentTransform {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            scale: 1.0,
            rotation_degrees: 0.0,
            translation: (0.0, 0.0),
        }
    }

    /// Build a transform from the similarity parameters (a, b, tx, ty)
    /// where a = s·cosθ and b = s·sinθ.
    pub fn from_params(a: f32, b: f32, tx: f32, ty: f32) -> Self {
        Self {
            matrix: [a, -b, tx, b, a, ty],
            scale: (a * a + b * b).sqrt(),
            rotation_degrees: b.atan2(a).to_degrees(),
            translation: (tx, ty),
        }
    }

    /// Map a point through the transform.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.matrix[0] * x + self.matrix[1] * y + self.matrix[2],
            self.matrix[3] * x + self.matrix[4] * y + self.matrix[5],
        )
    }

    /// Linear interpolation from the identity (t = 0) to this transform
    /// (t = 1) in (a, b, tx, ty) parameter space.
    pub fn lerp_from_identity(&self, t: f32) -> AlignmentTransform {
        let t = t.clamp(0.0, 1.0);
        let a = 1.0 + (self.matrix[0] - 1.0) * t;
        let b = self.matrix[3] * t;
        let tx = self.matrix[2] * t;
        let ty = self.matrix[5] * t;
        AlignmentTransform::from_params(a, b, tx, ty)
    }

    /// True when the transform cannot be meaningfully inverted.
    pub fn is_degenerate(&self) -> bool {
        let det = self.matrix[0] * self.matrix[4] - self.matrix[1] * self.matrix[3];
        !det.is_finite() || det.abs() < 1e-8 || !self.scale.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((a.iou(&b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_clamp() {
        let b = BoundingBox::new(-5.0, -5.0, 50.0, 50.0).clamp_to(40, 40);
        assert_eq!(b.x, 0.0);
        assert_eq!(b.y, 0.0);
        assert!(b.width <= 40.0);
        assert!(b.height <= 40.0);
    }

    #[test]
    fn test_stable_subset_five_is_identity() {
        let pts = [(1.0, 2.0), (3.0, 4.0), (5.0, 6.0), (7.0, 8.0), (9.0, 10.0)];
        let lm = Landmarks::Five(pts);
        assert_eq!(lm.stable_subset(), pts.to_vec());
    }

    #[test]
    fn test_stable_subset_sixty_eight_reduces_to_five() {
        let pts: Vec<(f32, f32)> = (0..68).map(|i| (i as f32, i as f32 * 2.0)).collect();
        let lm = Landmarks::SixtyEight(pts.clone());
        let subset = lm.stable_subset();
        assert_eq!(subset.len(), 5);
        // Nose tip passes through untouched
        assert_eq!(subset[2], pts[30]);
    }

    #[test]
    fn test_identity_transform_roundtrip() {
        let t = AlignmentTransform::identity();
        assert_eq!(t.apply(3.5, -2.0), (3.5, -2.0));
        assert!(!t.is_degenerate());
        assert_eq!(t.scale, 1.0);
    }

    #[test]
    fn test_from_params_decomposition() {
        // Pure 90-degree rotation at scale 2: a = 0, b = 2
        let t = AlignmentTransform::from_params(0.0, 2.0, 5.0, -3.0);
        assert!((t.scale - 2.0).abs() < 1e-6);
        assert!((t.rotation_degrees - 90.0).abs() < 1e-4);
        assert_eq!(t.translation, (5.0, -3.0));
    }

    #[test]
    fn test_lerp_zero_is_identity() {
        let t = AlignmentTransform::from_params(0.8, 0.3, 12.0, -4.0);
        let id = t.lerp_from_identity(0.0);
        assert_eq!(id.matrix, AlignmentTransform::identity().matrix);
    }

    #[test]
    fn test_lerp_one_is_full() {
        let t = AlignmentTransform::from_params(0.8, 0.3, 12.0, -4.0);
        let full = t.lerp_from_identity(1.0);
        for (a, b) in full.matrix.iter().zip(t.matrix.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_landmarks_transformed() {
        let lm = Landmarks::Five([(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (2.0, 2.0)]);
        // Pure translation by (10, 20)
        let out = lm.transformed(&[1.0, 0.0, 10.0, 0.0, 1.0, 20.0]);
        assert_eq!(out.points()[0], (10.0, 20.0));
        assert_eq!(out.points()[4], (12.0, 22.0));
    }
}
