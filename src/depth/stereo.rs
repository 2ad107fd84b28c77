//! Epipolar stereo search between the active keyframe and one reference
//! frame.
//!
//! For a single keyframe pixel and a prior inverse-depth interval, the search
//! projects the interval into the reference image, slides a five-tap
//! intensity descriptor along the resulting segment, refines the SSD minimum
//! to sub-pixel precision, triangulates the inverse depth back into the
//! keyframe, and calibrates a variance from the geometric and photometric
//! error sources.

use nalgebra::{Vector2, Vector3};

use crate::camera::{dehomogenize, Intrinsics};
use crate::frame::interpolation::{interpolate, interpolate_gradient};
use crate::frame::StereoGeometry;
use crate::settings::Settings;

/// Failure classification of one stereo attempt.
///
/// These are local per-pixel outcomes, not errors in the `std::error::Error`
/// sense; each drives a specific hypothesis-state transition in the
/// observation update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoError {
    /// The epipolar line failed the length, gradient, or angle pre-checks.
    EplRejected,
    /// The search segment leaves the usable image area; retry later.
    OutOfBounds,
    /// No clear winner (two-peak ambiguity, NaN, or negative depth).
    Ambiguous,
    /// The best residual is too large; the pixel may be blacklisted.
    LargeResidual,
    /// Degenerate arithmetic (zero-length or non-finite segment).
    Arithmetic,
}

/// A successful stereo observation.
#[derive(Debug, Clone, Copy)]
pub struct StereoMatch {
    /// SSD residual at the (possibly refined) minimum.
    pub error: f32,

    /// Inverse depth of the match along the keyframe ray.
    pub idepth: f32,

    /// Calibrated variance of `idepth`.
    pub variance: f32,

    /// Length of the searched segment before cropping, in reference pixels.
    pub epl_length: f32,
}

/// Immutable per-keyframe inputs of the search, built once per phase.
pub struct StereoContext<'a> {
    pub key_image: &'a [f32],
    pub key_gradients: &'a [[f32; 2]],
    pub width: usize,
    pub height: usize,
    pub intrinsics: &'a Intrinsics,
    pub settings: &'a Settings,
}

impl StereoContext<'_> {
    /// Search the epipolar segment of keyframe pixel `(x, y)` in one
    /// reference frame.
    ///
    /// `min_idepth`/`max_idepth` bound the searched inverse-depth interval;
    /// `prior_idepth` is the expansion point used to relate sample distances
    /// between the two images. `tracked_residual` is the reference frame's
    /// mean photometric tracking residual, entering the geometric error.
    pub fn line_stereo(
        &self,
        x: usize,
        y: usize,
        min_idepth: f32,
        prior_idepth: f32,
        max_idepth: f32,
        geo: &StereoGeometry,
        tracked_residual: f32,
        ref_image: &[f32],
    ) -> Result<StereoMatch, StereoError> {
        let s = self.settings;
        let coord = Vector2::new(x as f32, y as f32);

        let epl_dir = self
            .epipolar_direction(x, y, &geo.ref_center_in_key)
            .ok_or(StereoError::EplRejected)?;

        // Expansion point of the prior, seen from the reference frame. The
        // ratio of inverse depths relates sample distances along the line in
        // the two images.
        let kinv_p = self.intrinsics.unproject(coord.x, coord.y);
        let p_ref = geo.k_rot_key_to_ref * (kinv_p / prior_idepth) + geo.k_trans_key_to_ref;
        let idepth_ref = 1.0 / p_ref.z;
        let idepth_ratio = prior_idepth / idepth_ref;
        let key_sample_dist = s.reference_sample_distance * idepth_ratio;

        let key_step = epl_dir * key_sample_dist;
        if !self.in_image_range(coord - 2.0 * key_step, 2.0)
            || !self.in_image_range(coord + 2.0 * key_step, 2.0)
        {
            return Err(StereoError::OutOfBounds);
        }
        if !(idepth_ratio > 0.7 && idepth_ratio < 1.4) {
            return Err(StereoError::OutOfBounds);
        }

        // Segment endpoints in the reference image. The close endpoint may
        // lie behind the camera; clamp the interval so it projects at a
        // minimal positive depth.
        let mut max_idepth = max_idepth;
        let mut p_close_h = geo.k_rot_key_to_ref * kinv_p + geo.k_trans_key_to_ref * max_idepth;
        if p_close_h.z < 0.001 {
            let p_inf = geo.k_rot_key_to_ref * kinv_p;
            max_idepth = (0.001 - p_inf.z) / geo.k_trans_key_to_ref.z;
            p_close_h = p_inf + geo.k_trans_key_to_ref * max_idepth;
        }
        let mut p_close = dehomogenize(&p_close_h);

        let p_far_h = geo.k_rot_key_to_ref * kinv_p + geo.k_trans_key_to_ref * min_idepth;
        if p_far_h.z < 0.001 || max_idepth < min_idepth {
            return Err(StereoError::OutOfBounds);
        }
        let mut p_far = dehomogenize(&p_far_h);

        let delta = p_close - p_far;
        let epl_length = delta.norm();
        if !(epl_length > 0.0) || epl_length.is_infinite() {
            return Err(StereoError::Arithmetic);
        }
        let dir = delta / epl_length;
        let step = s.reference_sample_distance * dir;

        if epl_length > s.max_epl_length_crop {
            p_close = p_far + dir * s.max_epl_length_crop;
        }

        // Extend one sample to each side, then pad short segments.
        p_far -= step;
        p_close += step;
        if epl_length < s.min_epl_length_crop {
            let pad = (s.min_epl_length_crop - epl_length) / 2.0;
            p_far -= step * pad;
            p_close += step * pad;
        }

        // The sliding window samples up to two steps past each endpoint; the
        // near endpoint needs at least that much margin.
        if !self.in_image_range(p_far, (s.sample_point_to_border + 1) as f32)
            || !self.in_image_range(p_close, 3.0)
        {
            return Err(StereoError::OutOfBounds);
        }

        // Five-tap descriptor around the keyframe pixel, sampled along the
        // epipolar direction at the key-side sample distance.
        let key_vals = intensities_along_line(self.key_image, self.width, coord, key_step);

        // Sliding five-tap window along the reference segment. The residual
        // vectors of consecutive iterations alternate between two buffers so
        // that, at the winning index, the dot products with both neighbors
        // are recoverable for sub-pixel interpolation.
        let mut ref_vals = [0.0f32; 5];
        ref_vals[0] = interpolate(ref_image, p_far - 2.0 * step, self.width);
        ref_vals[1] = interpolate(ref_image, p_far - 1.0 * step, self.width);
        ref_vals[2] = interpolate(ref_image, p_far, self.width);
        ref_vals[3] = interpolate(ref_image, p_far + 1.0 * step, self.width);

        let mut search = p_far;
        let mut argmin_point = Vector2::new(-1.0f32, -1.0);
        let mut min_error = f32::INFINITY;
        let mut second_min_error = f32::INFINITY;
        let mut argmin: i32 = -1;
        let mut second_argmin: i32 = -1;

        let mut prev_error = -1.0f32;
        let mut next_error = -1.0f32;
        let mut prev_diff = 0.0f32;
        let mut next_diff = 0.0f32;
        let mut last_error = -1.0f32;

        let mut residual_a = [0.0f32; 5];
        let mut residual_b = [0.0f32; 5];

        let mut i: i32 = 0;
        loop {
            if (step.x < 0.0) != (search.x > p_close.x)
                || (step.y < 0.0) != (search.y > p_close.y)
            {
                break;
            }

            ref_vals[4] = interpolate(ref_image, search + 2.0 * step, self.width);

            let mut residual = [0.0f32; 5];
            let mut error = 0.0f32;
            for k in 0..5 {
                let r = ref_vals[k] - key_vals[k];
                residual[k] = r;
                error += r * r;
            }
            if i % 2 == 0 {
                residual_a = residual;
            } else {
                residual_b = residual;
            }

            if error < min_error {
                second_min_error = min_error;
                second_argmin = argmin;

                min_error = error;
                argmin = i;
                argmin_point = search;

                prev_error = last_error;
                prev_diff = dot5(&residual_a, &residual_b);
                next_error = -1.0;
                next_diff = -1.0;
            } else {
                if i - 1 == argmin {
                    next_error = error;
                    next_diff = dot5(&residual_a, &residual_b);
                }
                if error < second_min_error {
                    second_min_error = error;
                    second_argmin = i;
                }
            }

            last_error = error;
            ref_vals.copy_within(1..5, 0);
            search += step;
            i += 1;
        }

        if min_error > 4.0 * s.max_error_stereo {
            return Err(StereoError::LargeResidual);
        }

        // A second minimum farther than one step away must be clearly worse.
        if (argmin - second_argmin).abs() > 1
            && s.min_distance_error_stereo * min_error > second_min_error
        {
            return Err(StereoError::Ambiguous);
        }

        // Sub-pixel refinement: the SSD gradient changes linearly between
        // samples, so a sign change on exactly one side locates the true
        // minimum at the zero crossing.
        let mut did_subpixel = false;
        if s.use_subpixel_stereo && prev_error >= 0.0 && next_error >= 0.0 {
            let grad_prev_prev = -(prev_error - prev_diff);
            let grad_prev_curr = min_error - prev_diff;
            let grad_next_curr = -(min_error - next_diff);
            let grad_next_next = next_error - next_diff;

            let mut interp_prev = false;
            let mut interp_next = false;

            if (grad_next_curr < 0.0) ^ (grad_prev_curr < 0.0) {
                // crossing between the neighbors: keep the integer minimum
            } else if (grad_prev_prev < 0.0) ^ (grad_prev_curr < 0.0) {
                if !((grad_next_next < 0.0) ^ (grad_next_curr < 0.0)) {
                    interp_prev = true;
                }
            } else if (grad_next_next < 0.0) ^ (grad_next_curr < 0.0) {
                interp_next = true;
            }

            if interp_prev {
                let d = grad_prev_curr / (grad_prev_curr - grad_prev_prev);
                argmin_point -= d * step;
                min_error += -2.0 * d * grad_prev_curr - (grad_prev_prev - grad_prev_curr) * d * d;
            } else if interp_next {
                let d = grad_next_curr / (grad_next_curr - grad_next_next);
                argmin_point += d * step;
                min_error += 2.0 * d * grad_next_curr + (grad_next_next - grad_next_curr) * d * d;
            }
            did_subpixel = interp_prev || interp_next;
        }

        let grad_along_line = grad_along_line(&key_vals, key_sample_dist);

        // Allow more residual where the descriptor itself carries a lot of
        // gradient.
        if min_error > s.max_error_stereo + grad_along_line.sqrt() * 20.0 {
            return Err(StereoError::LargeResidual);
        }

        // Triangulate back to inverse depth along the keyframe ray. Both the
        // x- and y-channel give an estimate; the one with the larger step
        // component is numerically better conditioned.
        let r_kinv_p = geo.rot_key_to_ref * kinv_p;
        let q = self.intrinsics.unproject(argmin_point.x, argmin_point.y);
        let t = &geo.trans_key_to_ref;

        let beta = Vector2::new(
            r_kinv_p.x * t.z - r_kinv_p.z * t.x,
            r_kinv_p.y * t.z - r_kinv_p.z * t.y,
        );
        let denom = Vector2::new(q.x * t.z - q.z * t.x, q.y * t.z - q.z * t.y);
        let idepth_candidates = Vector2::new(
            (r_kinv_p.x * q.z - r_kinv_p.z * q.x) / denom.x,
            (r_kinv_p.y * q.z - r_kinv_p.z * q.y) / denom.y,
        );
        let alphas = Vector2::new(
            step.x * self.intrinsics.fxi * beta.x / (denom.x * denom.x),
            step.y * self.intrinsics.fyi * beta.y / (denom.y * denom.y),
        );

        let (idepth_new, alpha) = if step.x * step.x > step.y * step.y {
            (idepth_candidates.x, alphas.x)
        } else {
            (idepth_candidates.y, alphas.y)
        };

        if idepth_new < 0.0 && !s.allow_negative_idepths {
            return Err(StereoError::Ambiguous);
        }

        // Variance: discretization along the key-side step, geometric error
        // from pose/calibration noise, photometric error from pixel noise.
        let grad_interp = interpolate_gradient(self.key_gradients, coord, self.width);
        let geo_disp_error = geometric_disparity_error(
            &grad_interp,
            &(epl_dir * s.reference_sample_distance),
            tracked_residual,
            s.division_eps,
        );
        let coeff = if did_subpixel { 0.05 } else { 0.5 };
        let photo_disp_error =
            4.0 * s.camera_pixel_noise_squared / (grad_along_line + s.division_eps);
        let variance =
            alpha * alpha * (coeff * key_sample_dist * key_sample_dist + geo_disp_error + photo_disp_error);

        Ok(StereoMatch {
            error: min_error,
            idepth: idepth_new,
            variance,
            epl_length,
        })
    }

    /// Normalized epipolar direction at a keyframe pixel, or `None` when the
    /// line is degenerate or carries no usable gradient.
    ///
    /// The line is the intersection of the keyframe image plane with the
    /// plane through both camera centers and the pixel's viewing ray; it
    /// points away from the epipole (the projection of the reference camera
    /// center `ref_center_in_key`).
    pub fn epipolar_direction(
        &self,
        x: usize,
        y: usize,
        ref_center_in_key: &Vector3<f32>,
    ) -> Option<Vector2<f32>> {
        let s = self.settings;
        let k = self.intrinsics;
        let coord = Vector2::new(x as f32, y as f32);

        // t.z · ((x, y) − π(t)) with the division by t.z cancelled, so a
        // pure-lateral baseline stays finite.
        let t = ref_center_in_key;
        let line = Vector2::new(
            t.z * (coord.x - k.cx) - k.fx * t.x,
            t.z * (coord.y - k.cy) - k.fy * t.y,
        );

        let length_squared = line.norm_squared();
        if length_squared < s.min_epl_length_squared {
            return None;
        }

        let idx = x + y * self.width;
        let grad = Vector2::new(
            self.key_image[idx + 1] - self.key_image[idx - 1],
            self.key_image[idx + self.width] - self.key_image[idx - self.width],
        );

        let grad_along = grad.dot(&line);
        if grad_along * grad_along / length_squared < s.min_epl_grad_squared {
            return None;
        }

        if grad_along * grad_along / (length_squared * grad.norm_squared())
            < s.min_epl_angle_squared
        {
            return None;
        }

        Some(line / length_squared.sqrt())
    }

    #[inline]
    fn in_image_range(&self, p: Vector2<f32>, padding: f32) -> bool {
        padding <= p.x
            && padding <= p.y
            && p.x <= (self.width - 1) as f32 - padding
            && p.y <= (self.height - 1) as f32 - padding
    }
}

/// Five interpolated intensities centered on `center`, stepped along `step`.
fn intensities_along_line(
    image: &[f32],
    width: usize,
    center: Vector2<f32>,
    step: Vector2<f32>,
) -> [f32; 5] {
    [
        interpolate(image, center - 2.0 * step, width),
        interpolate(image, center - 1.0 * step, width),
        interpolate(image, center, width),
        interpolate(image, center + 1.0 * step, width),
        interpolate(image, center + 2.0 * step, width),
    ]
}

/// Squared intensity slope of the descriptor per unit of sample distance.
fn grad_along_line(intensities: &[f32; 5], interval: f32) -> f32 {
    let mut sum = 0.0;
    for k in 0..4 {
        let d = intensities[k + 1] - intensities[k];
        sum += d * d;
    }
    sum / (interval * interval)
}

/// Disparity variance from geometric noise (pose and calibration error).
///
/// Grows with the angle between the epipolar direction and the image
/// gradient: displacement orthogonal to the gradient is unobservable.
fn geometric_disparity_error(
    gradient: &Vector2<f32>,
    epl_scaled: &Vector2<f32>,
    tracked_residual: f32,
    eps: f32,
) -> f32 {
    let tracking_error_fac = 0.25 * (1.0 + tracked_residual);
    let p = epl_scaled.dot(gradient) + eps;
    tracking_error_fac * tracking_error_fac * gradient.norm_squared() / (p * p)
}

#[inline]
fn dot5(a: &[f32; 5], b: &[f32; 5]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sim3;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    const W: usize = 64;
    const H: usize = 48;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(50.0, 50.0, 32.0, 24.0)
    }

    /// Smooth horizontally textured image.
    fn textured_image() -> Vec<f32> {
        (0..W * H)
            .map(|i| {
                let x = (i % W) as f32;
                128.0 + 60.0 * (x * 0.35).sin() + 20.0 * (x * 0.11).cos()
            })
            .collect()
    }

    fn gradients_of(image: &[f32]) -> Vec<[f32; 2]> {
        let mut g = vec![[0.0f32; 2]; W * H];
        for y in 1..H - 1 {
            for x in 1..W - 1 {
                let idx = x + y * W;
                g[idx] = [
                    0.5 * (image[idx + 1] - image[idx - 1]),
                    0.5 * (image[idx + W] - image[idx - W]),
                ];
            }
        }
        g
    }

    fn geometry_for_baseline(baseline_x: f32) -> StereoGeometry {
        let frame = crate::frame::Frame::new(1, W, H, vec![0.0; W * H]).unwrap();
        let mut ref_to_key = Sim3::identity();
        ref_to_key.translation = nalgebra::Vector3::new(baseline_x as f64, 0.0, 0.0);
        frame.prepare_stereo_to(&ref_to_key, &intrinsics());
        let geometry = frame.stereo_geometry().unwrap().clone();
        geometry
    }

    #[test]
    fn test_zero_baseline_rejects_epl() {
        let image = textured_image();
        let gradients = gradients_of(&image);
        let k = intrinsics();
        let settings = Settings::default();
        let ctx = StereoContext {
            key_image: &image,
            key_gradients: &gradients,
            width: W,
            height: H,
            intrinsics: &k,
            settings: &settings,
        };

        let geo = geometry_for_baseline(0.0);
        let err = ctx
            .line_stereo(30, 20, 0.0, 1.0, 10.0, &geo, 0.0, &image)
            .unwrap_err();
        assert_eq!(err, StereoError::EplRejected);
    }

    #[test]
    fn test_gradient_orthogonal_to_epl_rejects() {
        // Vertical texture gradient, horizontal epipolar line.
        let image: Vec<f32> = (0..W * H)
            .map(|i| {
                let y = (i / W) as f32;
                128.0 + 50.0 * (y * 0.4).sin()
            })
            .collect();
        let gradients = gradients_of(&image);
        let k = intrinsics();
        let settings = Settings::default();
        let ctx = StereoContext {
            key_image: &image,
            key_gradients: &gradients,
            width: W,
            height: H,
            intrinsics: &k,
            settings: &settings,
        };

        let geo = geometry_for_baseline(0.2);
        let err = ctx
            .line_stereo(30, 21, 0.0, 1.0, 10.0, &geo, 0.0, &image)
            .unwrap_err();
        assert_eq!(err, StereoError::EplRejected);
    }

    #[test]
    fn test_recovers_known_inverse_depth_on_fronto_parallel_plane() {
        // Plane at depth 2 m, camera translated 0.1 m along +x. Every ref
        // pixel sees the key image shifted by fx·b/z = 2.5 px.
        let depth = 2.0f32;
        let baseline = 0.1f32;
        let k = intrinsics();
        let disparity = k.fx * baseline / depth;

        let key_image = textured_image();
        let ref_image: Vec<f32> = (0..W * H)
            .map(|i| {
                let x = (i % W) as f32 + disparity;
                128.0 + 60.0 * (x * 0.35).sin() + 20.0 * (x * 0.11).cos()
            })
            .collect();

        let gradients = gradients_of(&key_image);
        let settings = Settings::default();
        let ctx = StereoContext {
            key_image: &key_image,
            key_gradients: &gradients,
            width: W,
            height: H,
            intrinsics: &k,
            settings: &settings,
        };

        let geo = geometry_for_baseline(baseline);
        let truth = 1.0 / depth;

        let result = ctx
            .line_stereo(30, 20, 0.2, 0.5, 1.0, &geo, 0.0, &ref_image)
            .expect("stereo should succeed on textured plane");

        assert_relative_eq!(result.idepth, truth, epsilon = 0.05);
        assert!(result.variance > 0.0);
        assert!(result.epl_length > 0.0);
    }

    #[test]
    fn test_epipole_direction_points_away_from_epipole() {
        let image = textured_image();
        let gradients = gradients_of(&image);
        let k = intrinsics();
        let settings = Settings::default();
        let ctx = StereoContext {
            key_image: &image,
            key_gradients: &gradients,
            width: W,
            height: H,
            intrinsics: &k,
            settings: &settings,
        };

        // Reference camera 0.2 to the right, slightly forward.
        let t = Vector3::new(0.2, 0.0, 0.05);
        let dir = ctx.epipolar_direction(40, 24, &t).expect("usable epl");
        assert_relative_eq!(dir.norm(), 1.0, epsilon = 1e-5);

        let epipole = k.project(&t);
        let from_epipole = Vector2::new(40.0 - epipole.x, 24.0 - epipole.y).normalize();
        // Same line, orientation fixed by the sign of t.z.
        assert_relative_eq!(dir.dot(&from_epipole).abs(), 1.0, epsilon = 1e-4);
    }
}
