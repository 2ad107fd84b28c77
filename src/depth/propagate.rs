//! Forward propagation of the hypothesis grid to a newly selected keyframe.
//!
//! Every valid cell is warped through the old-to-new rigid transform and
//! lands on a rounded destination cell; collisions are resolved as occlusions
//! (the nearer surface wins) or fused Kalman-style. Unlike the row phases,
//! destinations are arbitrary, so this pass runs single-threaded.

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::{debug, warn};

use crate::depth::hypothesis::{kalman_fuse, PixelHypothesis};
use crate::depth::map::DepthMap;
use crate::frame::interpolation::interpolate;
use crate::frame::Frame;

impl DepthMap {
    /// Warp all hypotheses from the active keyframe's grid into
    /// `new_keyframe`'s grid, writing the back buffer and swapping.
    pub(crate) fn propagate_depth(&mut self, new_keyframe: &Frame) {
        let kf = self
            .active_keyframe
            .clone()
            .expect("propagate_depth requires an active keyframe");

        if new_keyframe.tracking_parent() != Some(kf.id()) {
            warn!(
                "propagating depth from frame {} to {}, which was tracked on a different frame \
                 ({:?}); this works but is not recommended",
                kf.id(),
                new_keyframe.id(),
                new_keyframe.tracking_parent(),
            );
        }

        for cell in &mut self.other {
            *cell = PixelHypothesis::invalid();
        }

        let old_to_new = new_keyframe.this_to_parent().to_se3().inverse();
        let rot: Matrix3<f32> = old_to_new.rotation_matrix().cast();
        let trans: Vector3<f32> = old_to_new.translation.cast();

        let use_tracking_gate = new_keyframe.tracking_parent() == Some(kf.id())
            && new_keyframe.has_tracked_well_mask();

        let s = &self.settings;
        let (width, height) = (self.width, self.height);
        let old_image = kf.image();
        let new_image = new_keyframe.image();
        let new_max_grad = new_keyframe.max_gradients();

        let mut dropped = 0usize;
        let mut occluded = 0usize;
        let mut created = 0usize;
        let mut merged = 0usize;

        for y in 0..height {
            for x in 0..width {
                let source = self.current[x + y * width];
                if !source.valid {
                    continue;
                }

                let p = rot * self.intrinsics.unproject(x as f32, y as f32)
                    / source.idepth_smoothed
                    + trans;
                if p.z <= 0.0 {
                    dropped += 1;
                    continue;
                }

                let new_idepth = 1.0 / p.z;
                let u = p.x * new_idepth * self.intrinsics.fx + self.intrinsics.cx;
                let v = p.y * new_idepth * self.intrinsics.fy + self.intrinsics.cy;

                if !(u > 2.1 && v > 2.1 && u < (width as f32) - 3.1 && v < (height as f32) - 3.1)
                {
                    dropped += 1;
                    continue;
                }

                let x_new = (u + 0.5) as usize;
                let y_new = (v + 0.5) as usize;
                // Keep the permanently-invalid border clear of rounded hits.
                if x_new < 3 || x_new >= width - 3 || y_new < 3 || y_new >= height - 3 {
                    dropped += 1;
                    continue;
                }
                let new_idx = x_new + y_new * width;
                let dest_grad = new_max_grad[new_idx];

                if use_tracking_gate {
                    if new_keyframe.pixel_was_good(x, y) == Some(false)
                        || dest_grad < s.min_abs_grad_decrease
                    {
                        dropped += 1;
                        continue;
                    }
                } else {
                    let residual = interpolate(new_image, Vector2::new(u, v), width)
                        - old_image[x + y * width];
                    if residual * residual
                        / (s.max_diff_constant + s.max_diff_grad_mult * dest_grad * dest_grad)
                        > 1.0
                        || dest_grad < s.min_abs_grad_decrease
                    {
                        dropped += 1;
                        continue;
                    }
                }

                // Near surfaces gain variance when they come closer, far
                // surfaces lose it: fourth power of the inverse-depth ratio.
                let ratio = new_idepth / source.idepth_smoothed;
                let new_var = (ratio * ratio) * (ratio * ratio) * source.idepth_var;

                let dest = &mut self.other[new_idx];

                if dest.valid {
                    let diff = dest.idepth - new_idepth;
                    if s.diff_fac_prop_merge * diff * diff > new_var + dest.idepth_var {
                        // Mutual occlusion: drop whichever surface is farther.
                        if new_idepth < dest.idepth {
                            occluded += 1;
                            continue;
                        }
                        dest.valid = false;
                        occluded += 1;
                    }
                }

                if !dest.valid {
                    *dest = PixelHypothesis::new(new_idepth, new_var, source.validity_counter);
                    created += 1;
                } else {
                    let (fused_idepth, fused_var) =
                        kalman_fuse(dest.idepth, dest.idepth_var, new_idepth, new_var);

                    let cap =
                        (s.validity_counter_max + s.validity_counter_max_variable) as i32;
                    let fused_validity =
                        (source.validity_counter + dest.validity_counter).min(cap);

                    *dest = PixelHypothesis::new(fused_idepth, fused_var, fused_validity);
                    merged += 1;
                }
            }
        }

        std::mem::swap(&mut self.current, &mut self.other);

        debug!(
            "[Propagate] kf={} -> {}: created {}, merged {}, occluded {}, dropped {}",
            kf.id(),
            new_keyframe.id(),
            created,
            merged,
            occluded,
            dropped,
        );
    }
}
