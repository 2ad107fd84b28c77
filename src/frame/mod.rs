//! Frame - one tracked camera image consumed by the mapping core.
//!
//! A frame carries the grayscale image with its precomputed gradient buffers,
//! the pose estimate relative to its tracking parent, and the per-frame data
//! the depth map reads during stereo: the precomputed keyframe-to-reference
//! geometry, the sub-sampled tracked-well mask, and the tracking residual.
//!
//! Frames are built and fully populated by the host (tracking), then shared
//! as `Arc<Frame>`. The fields the core or the host mutate after sharing —
//! pose (rescaled on keyframe creation), stereo precomputation, exported
//! depth, reactivation data, mapping counters — sit behind locks or atomics.

pub mod interpolation;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use nalgebra::{Matrix3, Vector3};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{MappedRwLockReadGuard, RawRwLock, RwLock, RwLockReadGuard};

use crate::camera::Intrinsics;
use crate::geometry::Sim3;

/// Shared read lock held while a frame is the active keyframe.
///
/// The host's map graph takes the write side when it retires or serializes
/// the frame; holding this guard keeps the frame's buffers pinned.
pub type ActiveLock = ArcRwLockReadGuard<RawRwLock, ()>;

/// Pose state of a frame.
#[derive(Debug, Clone)]
pub struct FramePose {
    /// Similarity transform from this frame to its tracking parent.
    pub this_to_parent: Sim3,

    /// Id of the tracking parent, if any.
    pub parent_id: Option<u32>,

    /// Scaled camera-to-world transform, maintained by the host's pose graph.
    pub cam_to_world: Sim3,
}

impl Default for FramePose {
    fn default() -> Self {
        Self {
            this_to_parent: Sim3::identity(),
            parent_id: None,
            cam_to_world: Sim3::identity(),
        }
    }
}

/// Keyframe-to-reference geometry precomputed once per stereo pairing.
///
/// All matrices are in `f32`; the similarity scale of the relative pose is
/// folded into the rotation blocks.
#[derive(Debug, Clone)]
pub struct StereoGeometry {
    /// K · s·R, mapping keyframe camera points into premultiplied reference pixels.
    pub k_rot_key_to_ref: Matrix3<f32>,

    /// K · t of the keyframe-to-reference transform.
    pub k_trans_key_to_ref: Vector3<f32>,

    /// s·R of the keyframe-to-reference transform.
    pub rot_key_to_ref: Matrix3<f32>,

    /// t of the keyframe-to-reference transform.
    pub trans_key_to_ref: Vector3<f32>,

    /// Reference camera center expressed in keyframe coordinates; its
    /// projection into the keyframe is the epipole.
    pub ref_center_in_key: Vector3<f32>,
}

/// Depth arrays exported to the frame for consumption by tracking.
///
/// Invalid cells hold a negative inverse depth and variance.
#[derive(Debug, Clone)]
pub struct DepthExport {
    pub idepth: Vec<f32>,
    pub idepth_var: Vec<f32>,
}

/// Persisted per-keyframe depth state for later reactivation.
///
/// `idepth_var[i] == -1.0` encodes an invalid cell, `-2.0` a blacklisted
/// never-valid cell.
#[derive(Debug, Clone)]
pub struct ReactivationData {
    pub idepth: Vec<f32>,
    pub idepth_var: Vec<f32>,
    pub validity: Vec<u8>,
}

/// A tracked camera image with the ancillary data the depth map consumes.
pub struct Frame {
    id: u32,
    width: usize,
    height: usize,

    /// Grayscale intensities, row-major, linear, nominally in [0, 255].
    image: Vec<f32>,

    /// Central-difference (gx, gy) per pixel; zero on the 1-pixel border.
    gradients: Vec<[f32; 2]>,

    /// Gradient magnitude maxed over the 3×3 neighborhood.
    max_gradients: Vec<f32>,

    pose: RwLock<FramePose>,

    /// Per-block "pixel was good during tracking" mask, sub-sampled by
    /// `mask_level`. None when the tracker did not produce one.
    tracked_well: Option<Vec<bool>>,

    /// Pyramid shift of the tracked-well sub-sampling.
    mask_level: u32,

    /// Mean photometric residual left by tracking against the parent.
    initial_tracked_residual: f32,

    /// Host-supplied prior inverse depth (ground truth or external sensor).
    prior_idepth: Option<Vec<f32>>,

    stereo: RwLock<Option<StereoGeometry>>,
    depth: RwLock<Option<DepthExport>>,
    reactivation: RwLock<Option<ReactivationData>>,

    depth_updated: AtomicBool,
    frames_tracked_on_this: AtomicU32,
    frames_mapped_on_this: AtomicU32,

    active: Arc<RwLock<()>>,
}

impl Frame {
    /// Build a frame from a grayscale image, precomputing the gradient and
    /// neighborhood-max gradient buffers.
    pub fn new(id: u32, width: usize, height: usize, image: Vec<f32>) -> Result<Self> {
        ensure!(width >= 8 && height >= 8, "frame {}x{} too small", width, height);
        ensure!(
            image.len() == width * height,
            "image length {} does not match {}x{}",
            image.len(),
            width,
            height
        );

        let gradients = build_gradients(&image, width, height);
        let max_gradients = build_max_gradients(&gradients, width, height);

        Ok(Self {
            id,
            width,
            height,
            image,
            gradients,
            max_gradients,
            pose: RwLock::new(FramePose::default()),
            tracked_well: None,
            mask_level: 1,
            initial_tracked_residual: 0.0,
            prior_idepth: None,
            stereo: RwLock::new(None),
            depth: RwLock::new(None),
            reactivation: RwLock::new(None),
            depth_updated: AtomicBool::new(false),
            frames_tracked_on_this: AtomicU32::new(0),
            frames_mapped_on_this: AtomicU32::new(0),
            active: Arc::new(RwLock::new(())),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Host-side population (before the frame is shared)
    // ─────────────────────────────────────────────────────────────────────────

    /// Set the tracking parent and the relative pose towards it.
    pub fn set_tracking_parent(&mut self, parent_id: u32, this_to_parent: Sim3) {
        let mut pose = self.pose.write();
        pose.parent_id = Some(parent_id);
        pose.this_to_parent = this_to_parent;
    }

    /// Set the scaled camera-to-world pose.
    pub fn set_cam_to_world(&mut self, cam_to_world: Sim3) {
        self.pose.write().cam_to_world = cam_to_world;
    }

    /// Install the sub-sampled tracked-well mask produced by the tracker.
    pub fn set_tracked_well_mask(&mut self, mask: Vec<bool>, level: u32) -> Result<()> {
        let expected = (self.width >> level) * (self.height >> level);
        ensure!(
            mask.len() == expected,
            "mask length {} does not match level-{} grid {}",
            mask.len(),
            level,
            expected
        );
        self.tracked_well = Some(mask);
        self.mask_level = level;
        Ok(())
    }

    /// Set the mean photometric residual from tracking against the parent.
    pub fn set_initial_tracked_residual(&mut self, residual: f32) {
        self.initial_tracked_residual = residual;
    }

    /// Attach a prior inverse-depth map (ground truth or external sensor).
    pub fn set_prior_idepth(&mut self, idepth: Vec<f32>) -> Result<()> {
        ensure!(
            idepth.len() == self.width * self.height,
            "prior idepth length {} does not match image",
            idepth.len()
        );
        self.prior_idepth = Some(idepth);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read-only accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn image(&self) -> &[f32] {
        &self.image
    }

    pub fn gradients(&self) -> &[[f32; 2]] {
        &self.gradients
    }

    pub fn max_gradients(&self) -> &[f32] {
        &self.max_gradients
    }

    pub fn pose(&self) -> FramePose {
        self.pose.read().clone()
    }

    pub fn tracking_parent(&self) -> Option<u32> {
        self.pose.read().parent_id
    }

    pub fn has_tracking_parent(&self) -> bool {
        self.tracking_parent().is_some()
    }

    pub fn this_to_parent(&self) -> Sim3 {
        self.pose.read().this_to_parent.clone()
    }

    /// Replace the pose towards the parent (keyframe-scale renormalization).
    pub fn set_this_to_parent(&self, this_to_parent: Sim3) {
        self.pose.write().this_to_parent = this_to_parent;
    }

    pub fn cam_to_world(&self) -> Sim3 {
        self.pose.read().cam_to_world.clone()
    }

    pub fn initial_tracked_residual(&self) -> f32 {
        self.initial_tracked_residual
    }

    pub fn prior_idepth(&self) -> Option<&[f32]> {
        self.prior_idepth.as_deref()
    }

    /// Tracked-well flag for a full-resolution pixel, or `None` when the
    /// tracker produced no mask.
    #[inline]
    pub fn pixel_was_good(&self, x: usize, y: usize) -> Option<bool> {
        let mask = self.tracked_well.as_ref()?;
        let lvl = self.mask_level;
        Some(mask[(x >> lvl) + (self.width >> lvl) * (y >> lvl)])
    }

    pub fn has_tracked_well_mask(&self) -> bool {
        self.tracked_well.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stereo precomputation
    // ─────────────────────────────────────────────────────────────────────────

    /// Precompute the keyframe-to-this geometry used by the epipolar search.
    ///
    /// `this_to_key` is the pose of this (reference) frame relative to the
    /// keyframe the depth map is attached to.
    pub fn prepare_stereo_to(&self, this_to_key: &Sim3, intrinsics: &Intrinsics) {
        let key_to_this = this_to_key.inverse();

        let sr: Matrix3<f32> = key_to_this.scaled_rotation_matrix().cast();
        let t: Vector3<f32> = key_to_this.translation.cast();
        let k = intrinsics.k();

        *self.stereo.write() = Some(StereoGeometry {
            k_rot_key_to_ref: k * sr,
            k_trans_key_to_ref: k * t,
            rot_key_to_ref: sr,
            trans_key_to_ref: t,
            ref_center_in_key: this_to_key.translation.cast(),
        });
    }

    /// The precomputed stereo geometry, if [`prepare_stereo_to`] has run.
    ///
    /// [`prepare_stereo_to`]: Frame::prepare_stereo_to
    pub fn stereo_geometry(&self) -> Option<MappedRwLockReadGuard<'_, StereoGeometry>> {
        RwLockReadGuard::try_map(self.stereo.read(), |s| s.as_ref()).ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Depth output hooks
    // ─────────────────────────────────────────────────────────────────────────

    /// Install the exported smoothed depth arrays and flag them as fresh.
    pub fn set_depth(&self, export: DepthExport) {
        debug_assert_eq!(export.idepth.len(), self.width * self.height);
        *self.depth.write() = Some(export);
        self.depth_updated.store(true, Ordering::SeqCst);
    }

    /// The last exported depth arrays, if any.
    pub fn depth(&self) -> Option<MappedRwLockReadGuard<'_, DepthExport>> {
        RwLockReadGuard::try_map(self.depth.read(), |d| d.as_ref()).ok()
    }

    pub fn has_idepth_been_set(&self) -> bool {
        self.prior_idepth.is_some() || self.depth.read().is_some()
    }

    /// True while an exported depth map is waiting to be consumed.
    pub fn depth_has_been_updated(&self) -> bool {
        self.depth_updated.load(Ordering::SeqCst)
    }

    /// Mark the exported depth as consumed (called by tracking).
    pub fn clear_depth_updated(&self) {
        self.depth_updated.store(false, Ordering::SeqCst);
    }

    /// Persist the depth state for later keyframe reactivation.
    pub fn store_reactivation_data(&self, data: ReactivationData) {
        debug_assert_eq!(data.idepth.len(), self.width * self.height);
        *self.reactivation.write() = Some(data);
    }

    /// The persisted reactivation triplets, if captured.
    pub fn reactivation_data(&self) -> Option<MappedRwLockReadGuard<'_, ReactivationData>> {
        RwLockReadGuard::try_map(self.reactivation.read(), |r| r.as_ref()).ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mapping counters
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of frames tracked against this keyframe (maintained by tracking).
    pub fn frames_tracked_on_this(&self) -> u32 {
        self.frames_tracked_on_this.load(Ordering::Relaxed)
    }

    pub fn note_tracked_on_this(&self) {
        self.frames_tracked_on_this.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of mapping updates performed on this keyframe.
    pub fn frames_mapped_on_this(&self) -> u32 {
        self.frames_mapped_on_this.load(Ordering::Relaxed)
    }

    pub fn note_mapped_on_this(&self) {
        self.frames_mapped_on_this.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_mapping_counters(&self) {
        self.frames_tracked_on_this.store(0, Ordering::Relaxed);
        self.frames_mapped_on_this.store(0, Ordering::Relaxed);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Active lock
    // ─────────────────────────────────────────────────────────────────────────

    /// Take the shared lock that pins this frame while it is the active
    /// keyframe.
    pub fn hold_active(&self) -> ActiveLock {
        self.active.read_arc()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("parent", &self.tracking_parent())
            .field("has_mask", &self.tracked_well.is_some())
            .field("has_depth", &self.depth.read().is_some())
            .finish()
    }
}

/// Central-difference gradients with a zeroed 1-pixel border.
fn build_gradients(image: &[f32], width: usize, height: usize) -> Vec<[f32; 2]> {
    let mut gradients = vec![[0.0f32; 2]; width * height];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = x + y * width;
            gradients[idx] = [
                0.5 * (image[idx + 1] - image[idx - 1]),
                0.5 * (image[idx + width] - image[idx - width]),
            ];
        }
    }
    gradients
}

/// Gradient magnitude maxed over the 3×3 neighborhood, as two separable
/// passes (vertical then horizontal). Border stays zero.
fn build_max_gradients(gradients: &[[f32; 2]], width: usize, height: usize) -> Vec<f32> {
    let magnitude: Vec<f32> = gradients
        .iter()
        .map(|g| (g[0] * g[0] + g[1] * g[1]).sqrt())
        .collect();

    let mut vertical = vec![0.0f32; width * height];
    for y in 1..height - 1 {
        for x in 0..width {
            let idx = x + y * width;
            vertical[idx] = magnitude[idx - width]
                .max(magnitude[idx])
                .max(magnitude[idx + width]);
        }
    }

    let mut max_gradients = vec![0.0f32; width * height];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = x + y * width;
            max_gradients[idx] = vertical[idx - 1].max(vertical[idx]).max(vertical[idx + 1]);
        }
    }
    max_gradients
}
