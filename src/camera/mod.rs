//! Pinhole camera model shared by the keyframe and all reference frames.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Calibrated pinhole intrinsics, fixed at construction.
///
/// The inverse terms are cached because the per-pixel hot paths unproject
/// with them: `K⁻¹ (x, y, 1) = (x·fxi + cxi, y·fyi + cyi, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub fxi: f32,
    pub fyi: f32,
    pub cxi: f32,
    pub cyi: f32,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            fxi: 1.0 / fx,
            fyi: 1.0 / fy,
            cxi: -cx / fx,
            cyi: -cy / fy,
        }
    }

    /// Calibration matrix K.
    pub fn k(&self) -> Matrix3<f32> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Inverse calibration matrix K⁻¹.
    pub fn k_inv(&self) -> Matrix3<f32> {
        Matrix3::new(
            self.fxi, 0.0, self.cxi, //
            0.0, self.fyi, self.cyi, //
            0.0, 0.0, 1.0,
        )
    }

    /// Back-project a pixel to the ray direction at depth 1: K⁻¹ (x, y, 1).
    #[inline]
    pub fn unproject(&self, x: f32, y: f32) -> Vector3<f32> {
        Vector3::new(x * self.fxi + self.cxi, y * self.fyi + self.cyi, 1.0)
    }

    /// Project a camera-space point to pixel coordinates.
    #[inline]
    pub fn project(&self, p: &Vector3<f32>) -> Vector2<f32> {
        Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }
}

/// Perspective divide of a K-premultiplied point: already in pixel units.
#[inline]
pub fn dehomogenize(p: &Vector3<f32>) -> Vector2<f32> {
    Vector2::new(p.x / p.z, p.y / p.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(450.0, 455.0, 160.0, 120.0)
    }

    #[test]
    fn test_unproject_project_roundtrip() {
        let k = intrinsics();
        let ray = k.unproject(200.0, 80.0);
        assert_relative_eq!(ray.z, 1.0);

        let px = k.project(&(ray * 3.7));
        assert_relative_eq!(px.x, 200.0, epsilon = 1e-4);
        assert_relative_eq!(px.y, 80.0, epsilon = 1e-4);
    }

    #[test]
    fn test_k_inv_matches_cached_terms() {
        let k = intrinsics();
        let inv = k.k_inv();
        let identity = k.k() * inv;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(identity[(i, j)], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_dehomogenize_matches_projection_of_premultiplied_point() {
        let k = intrinsics();
        let p = Vector3::new(0.2, -0.1, 2.5);
        let px = k.project(&p);
        let pre = k.k() * p;
        assert_relative_eq!(dehomogenize(&pre), px, epsilon = 1e-4);
    }
}
