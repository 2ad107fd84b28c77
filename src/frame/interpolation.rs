//! Bilinear sampling of the image and gradient buffers.
//!
//! Callers guarantee the sample point stays at least one pixel inside the
//! image; the epipolar search enforces this through its border margins.

use nalgebra::Vector2;

/// Bilinearly interpolated intensity at a sub-pixel position.
#[inline]
pub fn interpolate(image: &[f32], p: Vector2<f32>, width: usize) -> f32 {
    let ix = p.x.floor() as usize;
    let iy = p.y.floor() as usize;
    let dx = p.x - p.x.floor();
    let dy = p.y - p.y.floor();
    let dxdy = dx * dy;

    let idx = ix + iy * width;
    dxdy * image[idx + 1 + width]
        + (dy - dxdy) * image[idx + width]
        + (dx - dxdy) * image[idx + 1]
        + (1.0 - dx - dy + dxdy) * image[idx]
}

/// Bilinearly interpolated (gx, gy) gradient at a sub-pixel position.
#[inline]
pub fn interpolate_gradient(gradients: &[[f32; 2]], p: Vector2<f32>, width: usize) -> Vector2<f32> {
    let ix = p.x.floor() as usize;
    let iy = p.y.floor() as usize;
    let dx = p.x - p.x.floor();
    let dy = p.y - p.y.floor();
    let dxdy = dx * dy;

    let idx = ix + iy * width;
    let w_pp = dxdy;
    let w_0p = dy - dxdy;
    let w_p0 = dx - dxdy;
    let w_00 = 1.0 - dx - dy + dxdy;

    let a = gradients[idx + 1 + width];
    let b = gradients[idx + width];
    let c = gradients[idx + 1];
    let d = gradients[idx];

    Vector2::new(
        w_pp * a[0] + w_0p * b[0] + w_p0 * c[0] + w_00 * d[0],
        w_pp * a[1] + w_0p * b[1] + w_p0 * c[1] + w_00 * d[1],
    )
}
