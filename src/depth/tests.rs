//! Pipeline-phase behavior on synthetic scenes.
//!
//! These tests drive individual phases (propagation, hole filling,
//! smoothing) on grids seeded through the prior-depth path, which the public
//! scenario tests in `tests/` cannot reach in isolation.

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::Vector3;

use crate::camera::Intrinsics;
use crate::depth::DepthMap;
use crate::frame::Frame;
use crate::geometry::Sim3;
use crate::settings::Settings;

const W: usize = 64;
const H: usize = 48;

fn intrinsics() -> Intrinsics {
    Intrinsics::new(50.0, 50.0, 32.0, 24.0)
}

fn settings() -> Settings {
    Settings {
        parallel_rows: false,
        ..Settings::default()
    }
}

fn world_intensity(x: f32, y: f32) -> f32 {
    128.0 + 60.0 * (6.0 * x + 4.0 * y).sin() + 30.0 * (4.0 * x - 6.0 * y).cos()
}

/// Fronto-parallel plane at `depth` (keyframe coordinates), viewed by a
/// camera translated by `offset` with no rotation.
fn render_plane(depth: f32, offset: Vector3<f32>) -> Vec<f32> {
    let k = intrinsics();
    (0..W * H)
        .map(|i| {
            let u = (i % W) as f32;
            let v = (i / W) as f32;
            let range = depth - offset.z;
            let x = offset.x + (u - k.cx) * k.fxi * range;
            let y = offset.y + (v - k.cy) * k.fyi * range;
            world_intensity(x, y)
        })
        .collect()
}

fn frame_with_prior(id: u32, image: Vec<f32>, prior: Vec<f32>) -> Arc<Frame> {
    let mut frame = Frame::new(id, W, H, image).unwrap();
    frame.set_prior_idepth(prior).unwrap();
    Arc::new(frame)
}

fn tracked_frame(id: u32, image: Vec<f32>, parent: u32, translation: Vector3<f64>) -> Arc<Frame> {
    let mut frame = Frame::new(id, W, H, image).unwrap();
    let mut this_to_parent = Sim3::identity();
    this_to_parent.translation = translation;
    frame.set_tracking_parent(parent, this_to_parent);
    frame
        .set_tracked_well_mask(vec![true; (W >> 1) * (H >> 1)], 1)
        .unwrap();
    Arc::new(frame)
}

#[test]
fn test_propagation_collision_keeps_nearer_surface() {
    // Two hypotheses whose warps land on the same destination cell: the
    // baseline of -0.04 m shifts idepth 2.0 by +4 px and idepth 0.5 by +1 px.
    let image = render_plane(2.0, Vector3::zeros());

    let a = 20 + 15 * W;
    let b = 23 + 15 * W;
    let mut prior = vec![f32::NAN; W * H];
    prior[a] = 2.0;
    prior[b] = 0.5;

    let kf = frame_with_prior(0, image.clone(), prior);
    let mut map = DepthMap::new(W, H, intrinsics(), settings());
    map.initialize_from_gt_depth(&kf);

    let new_kf = tracked_frame(1, image, 0, Vector3::new(-0.04, 0.0, 0.0));
    map.propagate_depth(&new_kf);

    let dest = 24 + 15 * W;
    let grid = map.hypotheses();
    assert!(grid[dest].valid, "collision cell must survive");
    assert_relative_eq!(grid[dest].idepth, 2.0, epsilon = 1e-3);

    for (i, cell) in grid.iter().enumerate() {
        if i != dest {
            assert!(!cell.valid, "unexpected hypothesis at index {}", i);
        }
    }
}

#[test]
fn test_propagation_merges_compatible_collisions() {
    // Same collision setup, but the two surfaces agree within uncertainty:
    // they fuse instead of occluding.
    let image = render_plane(2.0, Vector3::zeros());

    let a = 20 + 15 * W;
    let b = 23 + 15 * W;
    let mut prior = vec![f32::NAN; W * H];
    prior[a] = 2.0;
    prior[b] = 0.5;

    let kf = frame_with_prior(0, image.clone(), prior);
    let mut map = DepthMap::new(
        W,
        H,
        intrinsics(),
        Settings {
            // Joint uncertainty large enough that |2.0 - 0.5| is compatible.
            var_gt_init: 2.0,
            ..settings()
        },
    );
    map.initialize_from_gt_depth(&kf);

    let new_kf = tracked_frame(1, image, 0, Vector3::new(-0.04, 0.0, 0.0));
    map.propagate_depth(&new_kf);

    let dest = &map.hypotheses()[24 + 15 * W];
    assert!(dest.valid);
    // Equal variances: fused estimate is the midpoint, variance halves.
    assert_relative_eq!(dest.idepth, 1.25, epsilon = 1e-3);
    assert_relative_eq!(dest.idepth_var, 1.0, epsilon = 1e-3);
    assert_eq!(dest.validity_counter, 40);
}

#[test]
fn test_fill_holes_seeds_center_of_valid_ring() {
    let image = render_plane(2.0, Vector3::zeros());
    let (cx, cy) = (16usize, 16usize);

    let mut prior = vec![f32::NAN; W * H];
    for dy in -2i32..=2 {
        for dx in -2i32..=2 {
            if dx == 0 && dy == 0 {
                continue;
            }
            prior[(cx as i32 + dx) as usize + ((cy as i32 + dy) as usize) * W] = 0.8;
        }
    }

    let kf = frame_with_prior(0, image, prior);
    let mut map = DepthMap::new(W, H, intrinsics(), settings());
    map.initialize_from_gt_depth(&kf);

    assert!(!map.hypotheses()[cx + cy * W].valid);
    map.regularize_fill_holes();

    let center = &map.hypotheses()[cx + cy * W];
    assert!(center.valid, "hole inside a valid ring must be filled");
    assert_relative_eq!(center.idepth, 0.8, epsilon = 1e-4);
    assert_eq!(center.validity_counter, 0);
    assert_eq!(center.idepth_var, map.settings().var_random_init);
}

#[test]
fn test_fill_holes_respects_blacklist() {
    let image = render_plane(2.0, Vector3::zeros());
    let (cx, cy) = (16usize, 16usize);

    let mut prior = vec![f32::NAN; W * H];
    for dy in -2i32..=2 {
        for dx in -2i32..=2 {
            if dx == 0 && dy == 0 {
                continue;
            }
            prior[(cx as i32 + dx) as usize + ((cy as i32 + dy) as usize) * W] = 0.8;
        }
    }

    let kf = frame_with_prior(0, image, prior);
    let mut map = DepthMap::new(W, H, intrinsics(), settings());
    map.initialize_from_gt_depth(&kf);

    // Ring validity sums to 24 * 20 = 480, above the creation threshold but
    // below the unblacklist threshold only if... it is not: 480 > 100. Push
    // the counters down so the blacklist actually decides.
    for cell in &mut map.current {
        if cell.valid {
            cell.validity_counter = 2; // window sum 48: create yes, unblacklist no
        }
    }
    map.current[cx + cy * W].blacklisted = map.settings.min_blacklist - 1;

    map.regularize_fill_holes();
    assert!(
        !map.hypotheses()[cx + cy * W].valid,
        "blacklisted pixel must not be re-created below the unblacklist sum"
    );
}

#[test]
fn test_propagation_roundtrip_returns_cells_to_source() {
    // Static plane, one keyframe hop right and one hop back. A baseline of
    // 0.04 m at idepth 0.5 is exactly one pixel of disparity.
    let depth = 2.0f32;
    let image0 = render_plane(depth, Vector3::zeros());
    let image1 = render_plane(depth, Vector3::new(0.04, 0.0, 0.0));

    let prior = vec![1.0 / depth; W * H];
    let kf0 = frame_with_prior(0, image0.clone(), prior);

    let mut map = DepthMap::new(W, H, intrinsics(), settings());
    map.initialize_from_gt_depth(&kf0);
    let valid_before: Vec<bool> = map.hypotheses().iter().map(|c| c.valid).collect();

    let kf1 = tracked_frame(1, image1, 0, Vector3::new(0.04, 0.0, 0.0));
    map.propagate_depth(&kf1);
    map.active_keyframe = Some(kf1.clone());
    map.active_lock = Some(kf1.hold_active());

    // Propagation leaves the smoothed fields unset; the next hop reads them.
    map.regularize(false, map.settings.val_sum_min_for_keep);

    let kf2 = tracked_frame(2, image0, 1, Vector3::new(-0.04, 0.0, 0.0));
    map.propagate_depth(&kf2);

    // Interior cells (away from the swept border) are back where they were.
    // A handful of cells sit on texture minima and drop at the gradient
    // gates; everything that survives must land on its source.
    let grid = map.hypotheses();
    let mut candidates = 0;
    let mut returned = 0;
    for y in 8..H - 8 {
        for x in 8..W - 8 {
            let idx = x + y * W;
            if !valid_before[idx] {
                continue;
            }
            candidates += 1;
            if grid[idx].valid {
                assert_relative_eq!(grid[idx].idepth, 1.0 / depth, epsilon = 1e-3);
                returned += 1;
            }
        }
    }
    assert!(candidates > 500);
    assert!(
        returned as f64 >= 0.9 * candidates as f64,
        "only {}/{} cells returned",
        returned,
        candidates
    );
}

#[test]
fn test_smoothed_estimate_stays_within_joint_uncertainty() {
    let image = render_plane(2.0, Vector3::zeros());
    let kf = Arc::new(Frame::new(0, W, H, image).unwrap());

    let mut map = DepthMap::new(W, H, intrinsics(), settings());
    map.initialize_randomly(&kf);
    map.regularize(false, map.settings.val_sum_min_for_keep);

    let mut checked = 0;
    for cell in map.hypotheses() {
        if !cell.valid || cell.idepth_smoothed < 0.0 {
            continue;
        }
        let bound = 5.0 * (cell.idepth_var + cell.idepth_var_smoothed).sqrt();
        assert!(
            (cell.idepth_smoothed - cell.idepth).abs() <= bound,
            "smoothed estimate drifted: {} vs {} (bound {})",
            cell.idepth_smoothed,
            cell.idepth,
            bound
        );
        checked += 1;
    }
    assert!(checked > 100);
}
