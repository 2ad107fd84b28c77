//! Tuning constants for the depth-mapping core.
//!
//! All thresholds live in one immutable [`Settings`] value handed to
//! [`DepthMap`](crate::depth::DepthMap) at construction; nothing is read from
//! global state. The defaults are the values the variance model was
//! calibrated against, so change them together or not at all.

use serde::{Deserialize, Serialize};

/// Smallest representable magnitude for an inverse depth.
///
/// Inverse depths are kept strictly non-zero so that `1/idepth` is always
/// finite; [`unzero`](crate::depth::unzero) clamps towards this with the sign
/// preserved.
pub const UNZERO_EPS: f32 = 1e-10;

/// Configuration of the depth-mapping core.
///
/// Grouped by the phase that consumes each constant. Serializable so hosts
/// can load overrides from a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // ─────────────────────────────────────────────────────────────────────────
    // Depth range and variance bounds
    // ─────────────────────────────────────────────────────────────────────────
    /// Closest admissible scene depth in meters; `1/min_depth` caps inverse depth.
    pub min_depth: f32,

    /// Posterior variance above which a hypothesis is destroyed.
    pub max_var: f32,

    /// Variance assigned to randomly initialized and hole-filled hypotheses.
    pub var_random_init: f32,

    /// Variance assigned to ground-truth initialized hypotheses.
    pub var_gt_init: f32,

    // ─────────────────────────────────────────────────────────────────────────
    // Gradient gates
    // ─────────────────────────────────────────────────────────────────────────
    /// Minimum neighborhood-max gradient for creating a hypothesis.
    pub min_abs_grad_create: f32,

    /// Minimum neighborhood-max gradient below which an existing hypothesis dies.
    pub min_abs_grad_decrease: f32,

    // ─────────────────────────────────────────────────────────────────────────
    // Epipolar search
    // ─────────────────────────────────────────────────────────────────────────
    /// Minimum squared length of the epipolar direction in the keyframe.
    pub min_epl_length_squared: f32,

    /// Minimum squared gradient component along the epipolar direction.
    pub min_epl_grad_squared: f32,

    /// Minimum squared cosine between epipolar direction and image gradient.
    pub min_epl_angle_squared: f32,

    /// Maximum searched segment length in reference pixels; longer segments are clipped.
    pub max_epl_length_crop: f32,

    /// Minimum searched segment length; shorter segments are padded on both ends.
    pub min_epl_length_crop: f32,

    /// Step length along the reference epipolar segment, in pixels.
    pub reference_sample_distance: f32,

    /// Border margin required of the far segment endpoint.
    pub sample_point_to_border: i32,

    /// SSD error ceiling; the refined minimum must stay below
    /// `max_error_stereo + 20·√grad_along_line`.
    pub max_error_stereo: f32,

    /// Two-peak ratio: a second minimum farther than one step away must exceed
    /// `min_distance_error_stereo · best` or the match is ambiguous.
    pub min_distance_error_stereo: f32,

    /// Half-width of the prior search interval in units of smoothed standard deviation.
    pub stereo_epl_var_fac: f32,

    /// Assumed photometric noise variance per pixel (intensity units squared).
    pub camera_pixel_noise_squared: f32,

    /// Enable sub-pixel refinement of the SSD minimum.
    pub use_subpixel_stereo: bool,

    /// Accept matches that triangulate to negative inverse depth.
    pub allow_negative_idepths: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Observation update
    // ─────────────────────────────────────────────────────────────────────────
    /// Prediction-noise inflation applied to the prior variance before fusion.
    pub succ_var_inc_fac: f32,

    /// Variance inflation applied on a failed or inconsistent observation.
    pub fail_var_inc_fac: f32,

    /// Consistency factor: `diff_fac_observe · Δ² > σ²_obs + σ²_prior` rejects.
    pub diff_fac_observe: f32,

    // ─────────────────────────────────────────────────────────────────────────
    // Propagation
    // ─────────────────────────────────────────────────────────────────────────
    /// Constant term of the photometric propagation gate.
    pub max_diff_constant: f32,

    /// Gradient-scaled term of the photometric propagation gate.
    pub max_diff_grad_mult: f32,

    /// Occlusion factor for colliding propagated hypotheses.
    pub diff_fac_prop_merge: f32,

    // ─────────────────────────────────────────────────────────────────────────
    // Regularization
    // ─────────────────────────────────────────────────────────────────────────
    /// Occlusion factor for the smoothing neighborhood test.
    pub diff_fac_smoothing: f32,

    /// Variance added per squared pixel of distance in the smoothing weights.
    pub reg_dist_var: f32,

    /// Neighborhood validity sum required for a cell to survive regularization.
    pub val_sum_min_for_keep: i32,

    /// 5×5 validity window sum required to fill a hole.
    pub val_sum_min_for_create: i32,

    /// 5×5 validity window sum that overrides a blacklist when filling holes.
    pub val_sum_min_for_unblacklist: i32,

    // ─────────────────────────────────────────────────────────────────────────
    // Validity counter and blacklist
    // ─────────────────────────────────────────────────────────────────────────
    /// Base saturation value of the validity counter.
    pub validity_counter_max: f32,

    /// Gradient-scaled saturation bonus (full bonus at gradient 255).
    pub validity_counter_max_variable: f32,

    /// Validity increment per successful observation.
    pub validity_counter_inc: i32,

    /// Validity decrement per failed observation.
    pub validity_counter_dec: i32,

    /// Validity assigned on first successful stereo.
    pub validity_counter_initial_observe: i32,

    /// Blacklist value below which a pixel is never re-created.
    pub min_blacklist: i32,

    // ─────────────────────────────────────────────────────────────────────────
    // Misc
    // ─────────────────────────────────────────────────────────────────────────
    /// Guard added to denominators that may vanish.
    pub division_eps: f32,

    /// Run row phases on the worker pool; sequential when false.
    pub parallel_rows: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_depth: 0.05,
            max_var: 0.5 * 0.5,
            var_random_init: 0.5 * 0.5 * 0.5,
            var_gt_init: 0.01 * 0.01,

            min_abs_grad_create: 5.0,
            min_abs_grad_decrease: 5.0,

            min_epl_length_squared: 1.0 * 1.0,
            min_epl_grad_squared: 2.0 * 2.0,
            min_epl_angle_squared: 0.3 * 0.3,
            max_epl_length_crop: 30.0,
            min_epl_length_crop: 3.0,
            reference_sample_distance: 1.0,
            sample_point_to_border: 7,
            max_error_stereo: 1300.0,
            min_distance_error_stereo: 1.5,
            stereo_epl_var_fac: 2.0,
            camera_pixel_noise_squared: 4.0 * 4.0,
            use_subpixel_stereo: true,
            allow_negative_idepths: false,

            succ_var_inc_fac: 1.01,
            fail_var_inc_fac: 1.1,
            diff_fac_observe: 1.0,

            max_diff_constant: 40.0 * 40.0,
            max_diff_grad_mult: 0.5 * 0.5,
            diff_fac_prop_merge: 1.0,

            diff_fac_smoothing: 1.0,
            reg_dist_var: 0.075 * 0.075,
            val_sum_min_for_keep: 24,
            val_sum_min_for_create: 30,
            val_sum_min_for_unblacklist: 100,

            validity_counter_max: 5.0,
            validity_counter_max_variable: 250.0,
            validity_counter_inc: 5,
            validity_counter_dec: 5,
            validity_counter_initial_observe: 5,
            min_blacklist: -1,

            division_eps: 1e-10,
            parallel_rows: true,
        }
    }
}

impl Settings {
    /// Largest admissible inverse depth.
    #[inline]
    pub fn max_idepth(&self) -> f32 {
        1.0 / self.min_depth
    }
}
