//! Face alignment via 4-DOF similarity transform.
//!
//! Maps five detected landmarks onto the InsightFace reference positions and
//! warps the face into the canonical 112×112 crop ArcFace expects.

use crate::image::{Border, FaceImage};

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = s·R·src + t`, stored as `(a, b, tx, ty)` with
/// `a = s·cosθ`, `b = s·sinθ`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst`.
    ///
    /// Closed form on mean-centered points; degenerate input (all source
    /// points coincident) yields a pure translation.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (sx, sy) = mean(src);
        let (dx, dy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut src_var = 0.0f32;
        for (&(px, py), &(qx, qy)) in src.iter().zip(dst.iter()) {
            let (px, py) = (px - sx, py - sy);
            let (qx, qy) = (qx - dx, qy - dy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            src_var += px * px + py * py;
        }

        let (a, b) = if src_var > 1e-12 {
            (dot / src_var, cross / src_var)
        } else {
            (1.0, 0.0)
        };

        Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// The inverse map in the `[m0..m5]` layout used by [`FaceImage::warp`].
    pub fn inverse_matrix(&self) -> Option<[f32; 6]> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = self.b / det;
        Some([
            ia,
            ib,
            -(ia * self.tx + ib * self.ty),
            -ib,
            ia,
            ib * self.tx - ia * self.ty,
        ])
    }
}

/// Align a detected face to a canonical 112×112 crop.
///
/// Pixels that map outside the frame are black. A degenerate landmark set
/// produces an all-black crop.
pub fn align_face(frame: &FaceImage, landmarks: &[(f32, f32); 5]) -> FaceImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    match transform.inverse_matrix() {
        Some(inverse) => frame.warp(&inverse, ALIGNED_SIZE, ALIGNED_SIZE, Border::Constant(0)),
        None => FaceImage {
            data: vec![0; (ALIGNED_SIZE * ALIGNED_SIZE) as usize],
            width: ALIGNED_SIZE,
            height: ALIGNED_SIZE,
        },
    }
}
