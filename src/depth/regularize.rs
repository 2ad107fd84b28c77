//! Spatial regularization: hole filling and occlusion-aware smoothing.
//!
//! Both passes read a snapshot of the grid (`other`, copied before the
//! parallel phase) and write `current`, so the result is independent of row
//! scheduling. Hole filling is gated by a 2-D integral image of the validity
//! counters, making the 5×5 window sum O(1) per pixel.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::depth::hypothesis::{unzero, PixelHypothesis};
use crate::depth::map::DepthMap;
use crate::frame::Frame;

impl DepthMap {
    /// Rebuild the validity-counter integral image from `current`.
    ///
    /// Row prefix sums run in parallel; the column accumulation is a single
    /// sequential sweep.
    pub(crate) fn build_validity_integral(&mut self) {
        let (width, height) = (self.width, self.height);

        let mut integral = mem::take(&mut self.validity_integral);
        self.reducer.reduce(&mut integral, width, 0, height, |y_start, y_end, rows| {
            for y in y_start..y_end {
                let mut sum = 0i32;
                for x in 0..width {
                    let cell = &self.current[x + y * width];
                    if cell.valid {
                        sum += cell.validity_counter;
                    }
                    rows[x + (y - y_start) * width] = sum;
                }
            }
        });

        for idx in width..width * height {
            integral[idx] += integral[idx - width];
        }
        self.validity_integral = integral;
    }

    /// 5×5 validity window sum centered on `(x, y)` via the integral image.
    #[inline]
    pub(crate) fn validity_window_sum(&self, x: usize, y: usize) -> i32 {
        let w = self.width;
        let i = &self.validity_integral;
        i[(x + 2) + (y + 2) * w] - i[(x - 3) + (y + 2) * w] - i[(x + 2) + (y - 3) * w]
            + i[(x - 3) + (y - 3) * w]
    }

    /// Create hypotheses on invalid, textured cells whose neighborhood holds
    /// enough accumulated validity, seeding them with the variance-weighted
    /// neighbor mean.
    pub(crate) fn regularize_fill_holes(&mut self) {
        let kf = self
            .active_keyframe
            .clone()
            .expect("regularize_fill_holes requires an active keyframe");

        self.build_validity_integral();
        self.other.copy_from_slice(&self.current);

        let filled = AtomicUsize::new(0);
        let (width, height) = (self.width, self.height);

        let mut current = mem::take(&mut self.current);
        self.reducer.reduce(&mut current, width, 3, height - 3, |y_start, y_end, rows| {
            self.fill_holes_rows(&kf, y_start, y_end, rows, &filled);
        });
        self.current = current;

        let filled = filled.load(Ordering::Relaxed);
        if filled > 0 {
            debug!("[FillHoles] kf={}: created {} cells", kf.id(), filled);
        }
    }

    fn fill_holes_rows(
        &self,
        kf: &Arc<Frame>,
        y_start: usize,
        y_end: usize,
        rows: &mut [PixelHypothesis],
        filled: &AtomicUsize,
    ) {
        let s = &self.settings;
        let max_grad = kf.max_gradients();
        let width = self.width;

        for y in y_start..y_end {
            for x in 3..width - 3 {
                let idx = x + y * width;
                let dest = &self.other[idx];
                if dest.valid || max_grad[idx] < s.min_abs_grad_decrease {
                    continue;
                }

                let val = self.validity_window_sum(x, y);
                let create = (dest.blacklisted >= s.min_blacklist
                    && val > s.val_sum_min_for_create)
                    || val > s.val_sum_min_for_unblacklist;
                if !create {
                    continue;
                }

                let mut sum_idepth = 0.0f32;
                let mut sum_ivar = 0.0f32;
                for dy in -2i32..=2 {
                    for dx in -2i32..=2 {
                        let source = &self.other
                            [(x as i32 + dx) as usize + ((y as i32 + dy) as usize) * width];
                        if !source.valid {
                            continue;
                        }
                        sum_idepth += source.idepth / source.idepth_var;
                        sum_ivar += 1.0 / source.idepth_var;
                    }
                }

                let idepth = unzero(sum_idepth / sum_ivar);
                rows[idx - y_start * width] =
                    PixelHypothesis::new(idepth, s.var_random_init, 0);
                filled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Variance-weighted 5×5 smoothing with an occlusion test, writing the
    /// smoothed fields that downstream consumers read.
    ///
    /// With `remove_occlusions`, cells dominated by occluding neighbors are
    /// destroyed instead of smoothed (used right after propagation).
    pub(crate) fn regularize(&mut self, remove_occlusions: bool, validity_th: i32) {
        self.other.copy_from_slice(&self.current);

        let destroyed = AtomicUsize::new(0);
        let (width, height) = (self.width, self.height);

        let mut current = mem::take(&mut self.current);
        self.reducer.reduce(&mut current, width, 2, height - 2, |y_start, y_end, rows| {
            self.regularize_rows(remove_occlusions, validity_th, y_start, y_end, rows, &destroyed);
        });
        self.current = current;

        let destroyed = destroyed.load(Ordering::Relaxed);
        if destroyed > 0 {
            debug!(
                "[Regularize] remove_occlusions={}: destroyed {} cells",
                remove_occlusions, destroyed
            );
        }
    }

    fn regularize_rows(
        &self,
        remove_occlusions: bool,
        validity_th: i32,
        y_start: usize,
        y_end: usize,
        rows: &mut [PixelHypothesis],
        destroyed: &AtomicUsize,
    ) {
        const RADIUS: i32 = 2;
        let s = &self.settings;
        let width = self.width;

        for y in y_start..y_end {
            for x in (RADIUS as usize)..width - RADIUS as usize {
                let idx = x + y * width;
                let read = &self.other[idx];
                if !read.valid {
                    continue;
                }

                let mut sum = 0.0f32;
                let mut sum_ivar = 0.0f32;
                let mut val_sum = 0i32;
                let mut num_occluding = 0u32;
                let mut num_not_occluding = 0u32;

                for dx in -RADIUS..=RADIUS {
                    for dy in -RADIUS..=RADIUS {
                        let source = &self.other
                            [(x as i32 + dx) as usize + ((y as i32 + dy) as usize) * width];
                        if !source.valid {
                            continue;
                        }

                        let diff = source.idepth - read.idepth;
                        if s.diff_fac_smoothing * diff * diff
                            > source.idepth_var + read.idepth_var
                        {
                            if remove_occlusions && source.idepth > read.idepth {
                                num_occluding += 1;
                            }
                            continue;
                        }

                        val_sum += source.validity_counter;
                        if remove_occlusions {
                            num_not_occluding += 1;
                        }

                        let dist_fac = (dx * dx + dy * dy) as f32 * s.reg_dist_var;
                        let ivar = 1.0 / (source.idepth_var + dist_fac);
                        sum += source.idepth * ivar;
                        sum_ivar += ivar;
                    }
                }

                let cell = &mut rows[idx - y_start * width];

                if val_sum < validity_th {
                    cell.valid = false;
                    cell.blacklisted -= 1;
                    destroyed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                if remove_occlusions && num_occluding > num_not_occluding {
                    cell.valid = false;
                    destroyed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                cell.idepth_smoothed = unzero(sum / sum_ivar);
                cell.idepth_var_smoothed = 1.0 / sum_ivar;
            }
        }
    }
}
