//! Per-frame observation pass: one epipolar stereo attempt per usable
//! keyframe pixel, fused into the hypothesis grid.
//!
//! Rows are processed in parallel; each worker owns its rows of the grid and
//! every update touches only its own cell, so no cross-pixel ordering exists
//! within a pass. The stereo prior is the smoothed state frozen by the
//! previous regularization.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::depth::hypothesis::{unzero, PixelHypothesis};
use crate::depth::map::DepthMap;
use crate::depth::stereo::{StereoContext, StereoError};
use crate::frame::Frame;

#[derive(Default)]
struct ObserveStats {
    created: AtomicUsize,
    updated: AtomicUsize,
    blacklisted: AtomicUsize,
    destroyed: AtomicUsize,
}

impl DepthMap {
    /// Run one observation pass of the active keyframe against the prepared
    /// reference window.
    pub(crate) fn observe_depth(&mut self) {
        let kf = self
            .active_keyframe
            .clone()
            .expect("observe_depth requires an active keyframe");

        let stats = ObserveStats::default();
        let (width, height) = (self.width, self.height);

        let mut current = mem::take(&mut self.current);
        self.reducer.reduce(&mut current, width, 3, height - 3, |y_start, y_end, rows| {
            self.observe_rows(&kf, y_start, y_end, rows, &stats);
        });
        self.current = current;

        debug!(
            "[Observe] kf={}: created {}, updated {}, blacklisted {}, destroyed {}",
            kf.id(),
            stats.created.load(Ordering::Relaxed),
            stats.updated.load(Ordering::Relaxed),
            stats.blacklisted.load(Ordering::Relaxed),
            stats.destroyed.load(Ordering::Relaxed),
        );
    }

    fn observe_rows(
        &self,
        kf: &Arc<Frame>,
        y_start: usize,
        y_end: usize,
        rows: &mut [PixelHypothesis],
        stats: &ObserveStats,
    ) {
        let s = &self.settings;
        let max_grad = kf.max_gradients();
        let ctx = StereoContext {
            key_image: kf.image(),
            key_gradients: kf.gradients(),
            width: self.width,
            height: self.height,
            intrinsics: &self.intrinsics,
            settings: s,
        };

        for y in y_start..y_end {
            for x in 3..self.width - 3 {
                let idx = x + y * self.width;
                let target = &mut rows[idx - y_start * self.width];
                let has_hypothesis = target.valid;

                // Texture died under the pixel: the hypothesis goes with it.
                if has_hypothesis && max_grad[idx] < s.min_abs_grad_decrease {
                    target.valid = false;
                    stats.destroyed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                if max_grad[idx] < s.min_abs_grad_create || target.blacklisted < s.min_blacklist {
                    continue;
                }

                if !has_hypothesis {
                    if self.observe_create(&ctx, kf, x, y, target, stats) {
                        stats.created.fetch_add(1, Ordering::Relaxed);
                    }
                } else if self.observe_update(&ctx, kf, x, y, max_grad[idx], target, stats) {
                    stats.updated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// First stereo attempt on an empty cell, searching the full admissible
    /// inverse-depth range.
    fn observe_create(
        &self,
        ctx: &StereoContext<'_>,
        kf: &Arc<Frame>,
        x: usize,
        y: usize,
        target: &mut PixelHypothesis,
        stats: &ObserveStats,
    ) -> bool {
        let s = &self.settings;
        let ref_frame = if self.active_is_reactivated {
            self.newest_ref.as_ref()
        } else {
            self.oldest_ref.as_ref()
        };
        let Some(ref_frame) = ref_frame else {
            return false;
        };

        if ref_frame.tracking_parent() == Some(kf.id())
            && ref_frame.pixel_was_good(x, y) == Some(false)
        {
            return false;
        }

        let Some(geo) = ref_frame.stereo_geometry() else {
            return false;
        };

        let result = ctx.line_stereo(
            x,
            y,
            0.0,
            1.0,
            s.max_idepth(),
            &geo,
            ref_frame.initial_tracked_residual(),
            ref_frame.image(),
        );

        let observation = match result {
            Ok(m) => m,
            Err(StereoError::Ambiguous) | Err(StereoError::LargeResidual) => {
                target.blacklisted -= 1;
                stats.blacklisted.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Err(_) => return false,
        };

        if observation.variance > s.max_var {
            return false;
        }

        *target = PixelHypothesis::new(
            unzero(observation.idepth),
            observation.variance,
            s.validity_counter_initial_observe,
        );
        true
    }

    /// Stereo against the scheduled reference frame, fused into an existing
    /// hypothesis with a 1-D Kalman update.
    fn observe_update(
        &self,
        ctx: &StereoContext<'_>,
        kf: &Arc<Frame>,
        x: usize,
        y: usize,
        abs_grad: f32,
        target: &mut PixelHypothesis,
        stats: &ObserveStats,
    ) -> bool {
        let s = &self.settings;

        let ref_frame = if self.active_is_reactivated {
            match self.newest_ref.as_ref() {
                Some(f) => f,
                None => return false,
            }
        } else {
            let rel = target.next_stereo_frame_min_id as i64 - self.ref_id_offset as i64;
            if rel >= self.ref_frames.len() as i64 {
                // Scheduled reference not yet available: skip this frame.
                return false;
            }
            if rel < 0 {
                match self.oldest_ref.as_ref() {
                    Some(f) => f,
                    None => return false,
                }
            } else {
                &self.ref_frames[rel as usize]
            }
        };

        if ref_frame.tracking_parent() == Some(kf.id())
            && ref_frame.pixel_was_good(x, y) == Some(false)
        {
            return false;
        }

        let sv = target.idepth_var_smoothed.sqrt();
        let min_idepth = (target.idepth_smoothed - sv * s.stereo_epl_var_fac).max(0.0);
        let max_idepth = (target.idepth_smoothed + sv * s.stereo_epl_var_fac).min(s.max_idepth());

        let Some(geo) = ref_frame.stereo_geometry() else {
            return false;
        };

        let result = ctx.line_stereo(
            x,
            y,
            min_idepth,
            target.idepth_smoothed,
            max_idepth,
            &geo,
            ref_frame.initial_tracked_residual(),
            ref_frame.image(),
        );

        let observation = match result {
            Err(StereoError::EplRejected) => return false,
            // Out of bounds here but in bounds in the keyframe: try again later.
            Err(StereoError::OutOfBounds) => return false,
            Err(StereoError::Ambiguous) => {
                target.validity_counter =
                    (target.validity_counter - s.validity_counter_dec).max(0);
                target.next_stereo_frame_min_id = 0;

                target.idepth_var *= s.fail_var_inc_fac;
                if target.idepth_var > s.max_var {
                    target.valid = false;
                    target.blacklisted -= 1;
                    stats.destroyed.fetch_add(1, Ordering::Relaxed);
                }
                return false;
            }
            Err(StereoError::LargeResidual) => return false,
            Err(StereoError::Arithmetic) => return false,
            Ok(m) => m,
        };

        let diff = observation.idepth - target.idepth_smoothed;

        // Observation disagrees with the smoothed prior beyond their joint
        // uncertainty.
        if s.diff_fac_observe * diff * diff > observation.variance + target.idepth_var_smoothed {
            target.idepth_var *= s.fail_var_inc_fac;
            if target.idepth_var > s.max_var {
                target.valid = false;
                stats.destroyed.fetch_add(1, Ordering::Relaxed);
            }
            return false;
        }

        // Textbook 1-D Kalman update with prediction-noise inflation.
        let prior_var = target.idepth_var * s.succ_var_inc_fac;
        let w = observation.variance / (observation.variance + prior_var);
        let fused = (1.0 - w) * observation.idepth + w * target.idepth;
        target.idepth = unzero(fused);

        // The observation can only shrink the variance.
        let fused_var = prior_var * w;
        if fused_var < target.idepth_var {
            target.idepth_var = fused_var;
        }

        target.validity_counter += s.validity_counter_inc;
        let cap =
            s.validity_counter_max + abs_grad * s.validity_counter_max_variable / 255.0;
        if target.validity_counter as f32 > cap {
            target.validity_counter = cap as i32;
        }

        // A short segment means the pose barely constrains this pixel; skip
        // ahead a few frames so the baseline can grow.
        if observation.epl_length < s.min_epl_length_crop {
            let mut inc = kf.frames_tracked_on_this() as f32
                / (kf.frames_mapped_on_this() as f32 + 5.0);
            if inc < 3.0 {
                inc = 3.0;
            }
            inc += ((observation.epl_length * 10000.0) as i32 % 2) as f32;
            if observation.epl_length < 0.5 * s.min_epl_length_crop {
                inc *= 3.0;
            }

            target.next_stereo_frame_min_id = ref_frame.id() + inc as u32;
        }

        true
    }
}
