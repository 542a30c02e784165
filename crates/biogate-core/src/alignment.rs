//! Face alignment via 4-DOF similarity transform.
//!
//! Maps five anchor landmarks onto the canonical 112×112 reference layout
//! with a least-squares fit, then warps the frame into an aligned crop.

use crate::frame::ImageFrame;
use crate::types::Point;

/// Reference anchors for a 112×112 aligned face.
pub const REFERENCE_LANDMARKS_112: [Point; 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares estimate mapping `src` onto `dst`.
    ///
    /// Each pair contributes two rows of the normal equations in the
    /// unknowns `[a, b, tx, ty]`:
    /// ```text
    /// sx*a - sy*b + tx = dx
    /// sy*a + sx*b + ty = dy
    /// ```
    pub fn estimate(src: &[Point; 5], dst: &[Point; 5]) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve4(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 },
        }
    }

    pub fn apply(&self, (x, y): Point) -> Point {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse mapping, `None` when the transform is degenerate.
    pub fn invert(&self, (x, y): Point) -> Option<Point> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Gaussian elimination with partial pivoting on a 4×4 system.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in col + 1..4 {
            let f = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= f * m[col][k];
            }
            rhs[row] -= f * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp `frame` so that `anchors` land on the reference layout.
///
/// Returns a 112×112 grayscale crop; samples outside the frame are black.
pub fn align_face(frame: &ImageFrame, anchors: &[Point; 5]) -> Vec<u8> {
    let transform = Similarity::estimate(anchors, &REFERENCE_LANDMARKS_112);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            if let Some((sx, sy)) = transform.invert((ox as f32, oy as f32)) {
                out[oy * ALIGNED_SIZE + ox] = frame.sample_bilinear(sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}
