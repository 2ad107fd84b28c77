//! The semi-dense depth map attached to the active keyframe.
//!
//! `DepthMap` owns the double-buffered hypothesis grid and drives the
//! per-frame pipeline: observation against incoming reference frames,
//! hole filling, smoothing, and — on keyframe change — forward propagation
//! with a scale renormalization that anchors the monocular scale.
//!
//! Lifecycle: `Empty → Initialized → Active(kf) ↔ Active(kf')`, with
//! `invalidate` returning to `Empty` (buffers are kept but carry no
//! keyframe).

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::info;

use crate::camera::Intrinsics;
use crate::depth::hypothesis::PixelHypothesis;
use crate::depth::timing::{Phase, PhaseTimings};
use crate::frame::{ActiveLock, DepthExport, Frame, ReactivationData};
use crate::geometry::Sim3;
use crate::reducer::{ReduceBackend, RowReducer};
use crate::settings::Settings;

/// Per-pixel probabilistic inverse-depth map over one keyframe.
pub struct DepthMap {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) intrinsics: Intrinsics,
    pub(crate) settings: Settings,
    pub(crate) reducer: RowReducer,

    /// Front buffer: the authoritative grid.
    pub(crate) current: Vec<PixelHypothesis>,

    /// Back buffer: regularization snapshot / propagation destination.
    pub(crate) other: Vec<PixelHypothesis>,

    /// 2-D prefix sums of `validity_counter` over valid cells.
    pub(crate) validity_integral: Vec<i32>,

    pub(crate) active_keyframe: Option<Arc<Frame>>,
    pub(crate) active_lock: Option<ActiveLock>,
    pub(crate) active_is_reactivated: bool,

    /// Reference window indexed by `frame.id() - ref_id_offset`; ids between
    /// two frames map to the later one.
    pub(crate) ref_frames: Vec<Arc<Frame>>,
    pub(crate) ref_id_offset: u32,
    pub(crate) oldest_ref: Option<Arc<Frame>>,
    pub(crate) newest_ref: Option<Arc<Frame>>,

    timings: PhaseTimings,
}

impl DepthMap {
    pub fn new(width: usize, height: usize, intrinsics: Intrinsics, settings: Settings) -> Self {
        let backend = if settings.parallel_rows {
            ReduceBackend::Threaded
        } else {
            ReduceBackend::Sequential
        };
        Self {
            width,
            height,
            intrinsics,
            reducer: RowReducer::new(backend),
            current: vec![PixelHypothesis::invalid(); width * height],
            other: vec![PixelHypothesis::invalid(); width * height],
            validity_integral: vec![0; width * height],
            active_keyframe: None,
            active_lock: None,
            active_is_reactivated: false,
            ref_frames: Vec::new(),
            ref_id_offset: 0,
            oldest_ref: None,
            newest_ref: None,
            timings: PhaseTimings::new(),
            settings,
        }
    }

    /// Whether a keyframe is attached.
    pub fn is_valid(&self) -> bool {
        self.active_keyframe.is_some()
    }

    pub fn active_keyframe(&self) -> Option<&Arc<Frame>> {
        self.active_keyframe.as_ref()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The authoritative hypothesis grid, row-major.
    pub fn hypotheses(&self) -> &[PixelHypothesis] {
        &self.current
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// Fold call counts into the timing rates and log them.
    pub fn log_timings(&mut self) {
        self.timings.sample_rates();
    }

    /// Invalidate every cell of both buffers.
    pub fn reset(&mut self) {
        for cell in &mut self.current {
            *cell = PixelHypothesis::invalid();
        }
        for cell in &mut self.other {
            *cell = PixelHypothesis::invalid();
        }
    }

    /// Release the active keyframe and its shared lock.
    pub fn invalidate(&mut self) {
        if self.active_keyframe.is_none() {
            return;
        }
        self.active_keyframe = None;
        self.active_lock = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Seed the grid with random inverse depths on all sufficiently textured
    /// pixels and attach `frame` as the keyframe.
    pub fn initialize_randomly(&mut self, frame: &Arc<Frame>) {
        self.attach_keyframe(frame, false);
        self.reset();

        let s = &self.settings;
        let max_grad = frame.max_gradients();
        let mut rng = rand::thread_rng();
        let mut seeded = 0usize;

        for y in 3..self.height - 3 {
            for x in 3..self.width - 3 {
                let idx = x + y * self.width;
                if max_grad[idx] > s.min_abs_grad_create {
                    let idepth = 0.5 + rng.gen::<f32>();
                    self.current[idx] = PixelHypothesis::new_smoothed(
                        idepth,
                        idepth,
                        s.var_random_init,
                        s.var_random_init,
                        20,
                    );
                    seeded += 1;
                }
            }
        }

        info!(
            "[DepthMap] initialized keyframe {} randomly with {} hypotheses",
            frame.id(),
            seeded
        );
        self.export_depth();
    }

    /// Seed the grid from the frame's prior inverse-depth map.
    pub fn initialize_from_gt_depth(&mut self, frame: &Arc<Frame>) {
        assert!(
            frame.has_idepth_been_set(),
            "initialize_from_gt_depth requires a prior inverse-depth map"
        );
        let prior = frame
            .prior_idepth()
            .expect("initialize_from_gt_depth requires a prior inverse-depth map")
            .to_vec();

        self.attach_keyframe(frame, false);
        self.reset();

        let s = &self.settings;
        let mut seeded = 0usize;
        for y in 3..self.height - 3 {
            for x in 3..self.width - 3 {
                let idx = x + y * self.width;
                let idepth = prior[idx];
                if idepth.is_finite() && idepth > 0.0 {
                    self.current[idx] = PixelHypothesis::new_smoothed(
                        idepth,
                        idepth,
                        s.var_gt_init,
                        s.var_gt_init,
                        20,
                    );
                    seeded += 1;
                }
            }
        }

        info!(
            "[DepthMap] initialized keyframe {} from prior depth with {} hypotheses",
            frame.id(),
            seeded
        );
        self.export_depth();
    }

    /// Reactivate a previously finalized keyframe from its persisted depth
    /// triplets.
    pub fn set_from_existing_kf(&mut self, kf: &Arc<Frame>) {
        assert!(
            kf.has_idepth_been_set(),
            "set_from_existing_kf requires an exported depth map"
        );
        let data = kf
            .reactivation_data()
            .expect("set_from_existing_kf requires captured reactivation data")
            .clone();
        assert_eq!(data.idepth.len(), self.width * self.height);

        self.attach_keyframe(kf, true);
        kf.reset_mapping_counters();

        let s = &self.settings;
        for y in 0..self.height {
            for x in 0..self.width {
                let idx = x + y * self.width;
                let interior =
                    (3..self.width - 3).contains(&x) && (3..self.height - 3).contains(&y);

                if interior && data.idepth_var[idx] > 0.0 {
                    self.current[idx] = PixelHypothesis::new(
                        data.idepth[idx],
                        data.idepth_var[idx],
                        data.validity[idx] as i32,
                    );
                } else {
                    let mut cell = PixelHypothesis::invalid();
                    cell.blacklisted = if data.idepth_var[idx] == -2.0 {
                        s.min_blacklist - 1
                    } else {
                        0
                    };
                    self.current[idx] = cell;
                }
            }
        }

        info!("[DepthMap] reactivated keyframe {}", kf.id());
        self.regularize(false, self.settings.val_sum_min_for_keep);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-frame update
    // ─────────────────────────────────────────────────────────────────────────

    /// Refine the map with a batch of tracked reference frames (oldest
    /// first), then re-regularize and export.
    pub fn update_keyframe(&mut self, reference_frames: &[Arc<Frame>]) {
        assert!(self.is_valid(), "update_keyframe requires an active keyframe");
        assert!(!reference_frames.is_empty());
        let t_update = Instant::now();

        let kf = self.active_keyframe.clone().unwrap();

        self.oldest_ref = Some(reference_frames.first().unwrap().clone());
        self.newest_ref = Some(reference_frames.last().unwrap().clone());
        self.ref_frames.clear();
        self.ref_id_offset = reference_frames.first().unwrap().id();

        for frame in reference_frames {
            assert!(frame.has_tracking_parent());

            let ref_to_kf = if frame.tracking_parent() == Some(kf.id()) {
                frame.this_to_parent()
            } else {
                tracing::warn!(
                    "updating keyframe {} with frame {}, which was tracked on a different \
                     frame ({:?}); this works but is not recommended",
                    kf.id(),
                    frame.id(),
                    frame.tracking_parent(),
                );
                kf.cam_to_world().inverse().compose(&frame.cam_to_world())
            };

            frame.prepare_stereo_to(&ref_to_kf, &self.intrinsics);

            while self.ref_frames.len() as u32 + self.ref_id_offset <= frame.id() {
                self.ref_frames.push(frame.clone());
            }
        }

        let t = Instant::now();
        self.observe_depth();
        self.timings.record(Phase::Observe, t.elapsed());

        let t = Instant::now();
        self.regularize_fill_holes();
        self.timings.record(Phase::FillHoles, t.elapsed());

        let t = Instant::now();
        self.regularize(false, self.settings.val_sum_min_for_keep);
        self.timings.record(Phase::Regularize, t.elapsed());

        // Only push a new export when the previous one has been consumed.
        if !kf.depth_has_been_updated() {
            let t = Instant::now();
            self.export_depth();
            self.timings.record(Phase::SetDepth, t.elapsed());
        }

        kf.note_mapped_on_this();
        self.timings.record(Phase::Update, t_update.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframe change
    // ─────────────────────────────────────────────────────────────────────────

    /// Propagate the map onto a newly selected keyframe, clean it up, and
    /// renormalize the mean inverse depth to one.
    pub fn create_keyframe(&mut self, new_keyframe: &Arc<Frame>) {
        assert!(self.is_valid(), "create_keyframe requires an active keyframe");
        assert!(new_keyframe.has_tracking_parent());
        let t_create = Instant::now();

        let _pinned = new_keyframe.hold_active();
        let old_to_new = new_keyframe.this_to_parent().to_se3().inverse();

        let t = Instant::now();
        self.propagate_depth(new_keyframe);
        self.timings.record(Phase::Propagate, t.elapsed());

        self.attach_keyframe(new_keyframe, false);

        let t = Instant::now();
        self.regularize(true, self.settings.val_sum_min_for_keep);
        self.timings.record(Phase::Regularize, t.elapsed());

        let t = Instant::now();
        self.regularize_fill_holes();
        self.timings.record(Phase::FillHoles, t.elapsed());

        let t = Instant::now();
        self.regularize(false, self.settings.val_sum_min_for_keep);
        self.timings.record(Phase::Regularize, t.elapsed());

        // Renormalize so the mean smoothed inverse depth is one; the
        // reciprocal goes into the pose scale so the world stays consistent.
        let mut sum = 0.0f64;
        let mut num = 0usize;
        for cell in &self.current {
            if cell.valid {
                sum += cell.idepth_smoothed as f64;
                num += 1;
            }
        }

        if num > 0 {
            let factor = num as f64 / sum;
            let factor_f32 = factor as f32;
            let factor_sq = factor_f32 * factor_f32;
            for cell in &mut self.current {
                if !cell.valid {
                    continue;
                }
                cell.idepth *= factor_f32;
                cell.idepth_smoothed *= factor_f32;
                cell.idepth_var *= factor_sq;
                cell.idepth_var_smoothed *= factor_sq;
            }
            new_keyframe
                .set_this_to_parent(Sim3::from_se3_with_scale(&old_to_new.inverse(), factor));
            info!(
                "[DepthMap] new keyframe {}: {} hypotheses, rescaled by {:.4}",
                new_keyframe.id(),
                num,
                factor
            );
        } else {
            tracing::warn!(
                "[DepthMap] new keyframe {} has no valid hypotheses; skipping rescale",
                new_keyframe.id()
            );
        }

        let t = Instant::now();
        self.export_depth();
        self.timings.record(Phase::SetDepth, t.elapsed());

        self.timings.record(Phase::Create, t_create.elapsed());
    }

    /// Final cleanup of the active keyframe before it is retired into the
    /// map: fill, smooth, export, and capture reactivation data.
    pub fn finalize_keyframe(&mut self) {
        assert!(self.is_valid(), "finalize_keyframe requires an active keyframe");
        let t_finalize = Instant::now();

        let t = Instant::now();
        self.regularize_fill_holes();
        self.timings.record(Phase::FillHoles, t.elapsed());

        let t = Instant::now();
        self.regularize(false, self.settings.val_sum_min_for_keep);
        self.timings.record(Phase::Regularize, t.elapsed());

        let t = Instant::now();
        self.export_depth();
        self.capture_reactivation_data();
        self.timings.record(Phase::SetDepth, t.elapsed());

        self.timings.record(Phase::Finalize, t_finalize.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn attach_keyframe(&mut self, frame: &Arc<Frame>, reactivated: bool) {
        self.active_lock = Some(frame.hold_active());
        self.active_keyframe = Some(frame.clone());
        self.active_is_reactivated = reactivated;
    }

    /// Push the smoothed grid into the keyframe's depth arrays.
    fn export_depth(&self) {
        let kf = self.active_keyframe.as_ref().unwrap();
        let n = self.width * self.height;
        let mut idepth = vec![-1.0f32; n];
        let mut idepth_var = vec![-1.0f32; n];

        for (i, cell) in self.current.iter().enumerate() {
            if cell.valid && cell.idepth_smoothed >= -0.05 {
                idepth[i] = cell.idepth_smoothed;
                idepth_var[i] = cell.idepth_var_smoothed;
            }
        }

        kf.set_depth(DepthExport { idepth, idepth_var });
    }

    /// Persist the posterior grid as reactivation triplets on the keyframe.
    fn capture_reactivation_data(&self) {
        let kf = self.active_keyframe.as_ref().unwrap();
        let s = &self.settings;
        let n = self.width * self.height;
        let mut idepth = vec![0.0f32; n];
        let mut idepth_var = vec![-1.0f32; n];
        let mut validity = vec![0u8; n];

        for (i, cell) in self.current.iter().enumerate() {
            if cell.valid {
                idepth[i] = cell.idepth;
                idepth_var[i] = cell.idepth_var;
                validity[i] = cell.validity_counter.clamp(0, 255) as u8;
            } else if cell.blacklisted < s.min_blacklist {
                idepth_var[i] = -2.0;
            }
        }

        kf.store_reactivation_data(ReactivationData {
            idepth,
            idepth_var,
            validity,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 40;
    const H: usize = 30;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(35.0, 35.0, 20.0, 15.0)
    }

    fn textured_frame(id: u32) -> Arc<Frame> {
        let image: Vec<f32> = (0..W * H)
            .map(|i| {
                let x = (i % W) as f32;
                let y = (i / W) as f32;
                128.0 + 50.0 * (x * 0.7).sin() + 30.0 * (y * 0.5).cos()
            })
            .collect();
        Arc::new(Frame::new(id, W, H, image).unwrap())
    }

    fn sequential_settings() -> Settings {
        Settings {
            parallel_rows: false,
            ..Settings::default()
        }
    }

    #[test]
    fn test_random_initialization_respects_border_and_range() {
        let mut map = DepthMap::new(W, H, intrinsics(), sequential_settings());
        let kf = textured_frame(0);
        map.initialize_randomly(&kf);

        assert!(map.is_valid());
        let mut seeded = 0;
        for (i, cell) in map.hypotheses().iter().enumerate() {
            let (x, y) = (i % W, i / W);
            if cell.valid {
                seeded += 1;
                assert!((3..W - 3).contains(&x) && (3..H - 3).contains(&y));
                assert!(cell.idepth >= 0.5 && cell.idepth <= 1.5);
                assert!(cell.idepth_var > 0.0);
            }
        }
        assert!(seeded > 0, "textured frame must seed hypotheses");
        assert!(kf.has_idepth_been_set());
    }

    #[test]
    fn test_gt_initialization_seeds_only_finite_positive() {
        let mut prior = vec![f32::NAN; W * H];
        prior[10 + 10 * W] = 0.5;
        prior[11 + 10 * W] = -0.3; // invalid: negative
        prior[1 + 1 * W] = 0.5; // invalid: border

        let image: Vec<f32> = (0..W * H).map(|i| (i % W) as f32 * 4.0).collect();
        let mut frame = Frame::new(3, W, H, image).unwrap();
        frame.set_prior_idepth(prior).unwrap();
        let frame = Arc::new(frame);

        let mut map = DepthMap::new(W, H, intrinsics(), sequential_settings());
        map.initialize_from_gt_depth(&frame);

        let grid = map.hypotheses();
        assert!(grid[10 + 10 * W].valid);
        assert_eq!(grid[10 + 10 * W].idepth, 0.5);
        assert!(!grid[11 + 10 * W].valid);
        assert!(!grid[1 + 1 * W].valid);
    }

    #[test]
    fn test_invalidate_releases_keyframe() {
        let mut map = DepthMap::new(W, H, intrinsics(), sequential_settings());
        let kf = textured_frame(0);
        map.initialize_randomly(&kf);
        assert!(map.is_valid());

        map.invalidate();
        assert!(!map.is_valid());
        assert!(map.active_keyframe().is_none());
    }

    #[test]
    fn test_reactivation_roundtrip() {
        let mut map = DepthMap::new(W, H, intrinsics(), sequential_settings());
        let kf = textured_frame(0);
        map.initialize_randomly(&kf);
        // Smoothed state is required before finalize exports anything useful.
        map.regularize(false, map.settings.val_sum_min_for_keep);
        map.finalize_keyframe();

        let valid_before: Vec<bool> = map.hypotheses().iter().map(|c| c.valid).collect();

        let mut map2 = DepthMap::new(W, H, intrinsics(), sequential_settings());
        map2.set_from_existing_kf(&kf);
        assert!(map2.is_valid());

        // Reactivation restores the surviving cells (regularization may trim
        // isolated ones, never add new ones).
        for (i, cell) in map2.hypotheses().iter().enumerate() {
            if cell.valid {
                assert!(valid_before[i], "cell {} appeared from nowhere", i);
                assert!(cell.idepth > 0.0);
            }
        }
    }

    #[test]
    fn test_integral_buffer_matches_direct_window_sum() {
        let mut map = DepthMap::new(W, H, intrinsics(), sequential_settings());
        let kf = textured_frame(0);
        map.initialize_randomly(&kf);
        map.build_validity_integral();

        for y in 3..H - 3 {
            for x in 3..W - 3 {
                let mut direct = 0i32;
                for dy in -2i32..=2 {
                    for dx in -2i32..=2 {
                        let cell =
                            &map.current[(x as i32 + dx) as usize + ((y as i32 + dy) as usize) * W];
                        if cell.valid {
                            direct += cell.validity_counter;
                        }
                    }
                }
                assert_eq!(
                    map.validity_window_sum(x, y),
                    direct,
                    "window sum mismatch at ({}, {})",
                    x,
                    y
                );
            }
        }
    }
}
