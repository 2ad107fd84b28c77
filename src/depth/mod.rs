//! Semi-dense probabilistic inverse-depth mapping.
//!
//! The pipeline for one new reference frame against the active keyframe:
//! observe → fill holes → regularize → export. On keyframe change:
//! propagate → regularize (removing occlusions) → fill holes → regularize →
//! rescale mean inverse depth to one → export.

pub mod hypothesis;
pub mod map;
pub mod stereo;
pub mod timing;

mod observe;
mod propagate;
mod regularize;

#[cfg(test)]
mod tests;

pub use hypothesis::{unzero, PixelHypothesis};
pub use map::DepthMap;
pub use stereo::{StereoContext, StereoError, StereoMatch};
pub use timing::{Phase, PhaseTimings};
