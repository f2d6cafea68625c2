//! Footprint collision queries against a costmap.
//!
//! Two modes: full polygon outline rasterization (accurate, slow) and
//! circle-center sampling (fast). Both can run against the live costmap or a
//! static map-only overlay.

use std::sync::Arc;

use crate::costmap::{Costmap, SharedCostmap};
use crate::geometry::{CellCoord, Pose2D, normalize_angle};

/// Result of a footprint query: the maximum cell cost intersected, or
/// negative when the footprint touches an inscribed/lethal cell.
pub const COLLISION: f64 = -1.0;

/// Transform a base-frame point into the world frame at `pose`.
#[inline]
fn transform_point(pose: &Pose2D, p: [f64; 2]) -> (f64, f64) {
    let (sin, cos) = pose.theta.sin_cos();
    (
        pose.x + p[0] * cos - p[1] * sin,
        pose.y + p[0] * sin + p[1] * cos,
    )
}

/// Pad a footprint polygon outward by `padding` meters on each axis.
pub fn padded_polygon(polygon: &[[f64; 2]], padding: f64) -> Vec<[f64; 2]> {
    polygon
        .iter()
        .map(|&[x, y]| {
            [
                x + padding * if x < 0.0 { -1.0 } else { 1.0 },
                y + padding * if y < 0.0 { -1.0 } else { 1.0 },
            ]
        })
        .collect()
}

/// Extend circle-center sample points outward along each axis.
pub fn extended_centers(centers: &[[f64; 2]], extend_x: f64, extend_y: f64) -> Vec<[f64; 2]> {
    centers
        .iter()
        .map(|&[x, y]| {
            [
                x + extend_x * if x < 0.0 { -1.0 } else { 1.0 },
                y + extend_y * if y < 0.0 { -1.0 } else { 1.0 },
            ]
        })
        .collect()
}

/// Max cost along the Bresenham line between two cells.
fn line_max_cost(map: &Costmap, from: CellCoord, to: CellCoord) -> u8 {
    let mut x0 = from.x;
    let mut y0 = from.y;
    let x1 = to.x;
    let y1 = to.y;

    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx - dy;

    let mut max_cost = 0u8;
    loop {
        max_cost = max_cost.max(map.cost(CellCoord::new(x0, y0)));

        if x0 == x1 && y0 == y1 {
            break;
        }

        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x0 += sx;
        }
        if e2 < dx {
            err += dx;
            y0 += sy;
        }
    }
    max_cost
}

/// Max cost intersected by the polygon outline placed at `pose`.
///
/// Returns [`COLLISION`] when the outline touches an inscribed or lethal
/// cell. The interior is not rasterized; inflation guarantees interior
/// obstacles also mark the outline.
pub fn polygon_cost(map: &Costmap, pose: &Pose2D, polygon: &[[f64; 2]]) -> f64 {
    if polygon.len() < 3 {
        return COLLISION;
    }

    let mut max_cost = 0u8;
    let n = polygon.len();
    for i in 0..n {
        let (x0, y0) = transform_point(pose, polygon[i]);
        let (x1, y1) = transform_point(pose, polygon[(i + 1) % n]);
        let from = map.world_to_grid(x0, y0);
        let to = map.world_to_grid(x1, y1);
        if !map.in_bounds(from) || !map.in_bounds(to) {
            return COLLISION;
        }
        max_cost = max_cost.max(line_max_cost(map, from, to));
        if max_cost >= map.inscribed_cost() {
            return COLLISION;
        }
    }
    max_cost as f64
}

/// Max cost at the circle-center sample points placed at `pose`.
///
/// Returns [`COLLISION`] when any sampled cell is at or above the inscribed
/// threshold.
pub fn circle_center_cost(map: &Costmap, pose: &Pose2D, centers: &[[f64; 2]]) -> f64 {
    let mut max_cost = 0u8;
    for &c in centers {
        let (x, y) = transform_point(pose, c);
        let coord = map.world_to_grid(x, y);
        let cost = map.cost(coord);
        if cost >= map.inscribed_cost() {
            return COLLISION;
        }
        max_cost = max_cost.max(cost);
    }
    max_cost as f64
}

/// Footprint checker bound to the live costmap and an optional static
/// map-only overlay, selected per call.
pub struct FootprintChecker {
    live: SharedCostmap,
    static_map: Option<SharedCostmap>,
}

impl FootprintChecker {
    pub fn new(live: SharedCostmap) -> Self {
        Self {
            live,
            static_map: None,
        }
    }

    pub fn with_static_map(live: SharedCostmap, static_map: SharedCostmap) -> Self {
        Self {
            live,
            static_map: Some(static_map),
        }
    }

    fn map(&self, use_static: bool) -> SharedCostmap {
        if use_static && let Some(s) = &self.static_map {
            return Arc::clone(s);
        }
        Arc::clone(&self.live)
    }

    /// Full polygon check at `pose`.
    pub fn footprint_cost(&self, pose: &Pose2D, polygon: &[[f64; 2]], use_static: bool) -> f64 {
        let map = self.map(use_static);
        let guard = map.read();
        polygon_cost(&guard, pose, polygon)
    }

    /// Fast circle-center check at `pose`.
    pub fn circle_center_cost(&self, pose: &Pose2D, centers: &[[f64; 2]], use_static: bool) -> f64 {
        let map = self.map(use_static);
        let guard = map.read();
        circle_center_cost(&guard, pose, centers)
    }

    /// Search rotations around `pose` for a collision-free footprint.
    ///
    /// Candidate yaws fan out from the current heading in both directions.
    /// Returns the first free yaw together with an escape goal a short
    /// distance ahead along it, or `None` when every rotation collides.
    pub fn recovery_circle_cost(
        &self,
        pose: &Pose2D,
        centers: &[[f64; 2]],
        escape_dis: f64,
    ) -> Option<(f64, Pose2D)> {
        let map = self.map(false);
        let guard = map.read();

        const NUM_YAWS: i32 = 16;
        let step = 2.0 * std::f64::consts::PI / NUM_YAWS as f64;
        // 0, +1, -1, +2, -2, ... fan out from the current heading
        for i in 0..NUM_YAWS {
            let offset = if i % 2 == 0 { i / 2 } else { -(i / 2 + 1) };
            let yaw = normalize_angle(pose.theta + offset as f64 * step);
            let candidate = Pose2D::new(pose.x, pose.y, yaw);
            if circle_center_cost(&guard, &candidate, centers) >= 0.0 {
                let goal = candidate.advanced(escape_dis, yaw);
                if circle_center_cost(&guard, &goal, centers) >= 0.0 {
                    return Some((yaw, goal));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costmap::costs;
    use parking_lot::RwLock;

    fn open_map() -> Costmap {
        Costmap::new_world(100, 100, 0.05, (0.0, 0.0))
    }

    fn square() -> Vec<[f64; 2]> {
        vec![[0.1, 0.1], [0.1, -0.1], [-0.1, -0.1], [-0.1, 0.1]]
    }

    #[test]
    fn test_polygon_free_space() {
        let map = open_map();
        let pose = Pose2D::new(2.5, 2.5, 0.3);
        assert!(polygon_cost(&map, &pose, &square()) >= 0.0);
    }

    #[test]
    fn test_polygon_hits_obstacle() {
        let mut map = open_map();
        map.stamp_lethal_rect(2.4, 2.4, 2.6, 2.6);
        let pose = Pose2D::new(2.5, 2.5, 0.0);
        assert_eq!(polygon_cost(&map, &pose, &square()), COLLISION);
    }

    #[test]
    fn test_polygon_off_map_is_collision() {
        let map = open_map();
        let pose = Pose2D::new(0.0, 0.0, 0.0);
        assert_eq!(polygon_cost(&map, &pose, &square()), COLLISION);
    }

    #[test]
    fn test_circle_center_check() {
        let mut map = open_map();
        map.set_cost(map.world_to_grid(2.6, 2.5), costs::INSCRIBED);

        let centers = vec![[0.1, 0.0], [-0.1, 0.0]];
        let clear = Pose2D::new(1.0, 1.0, 0.0);
        assert!(circle_center_cost(&map, &clear, &centers) >= 0.0);

        // front center lands on the inscribed cell
        let blocked = Pose2D::new(2.5, 2.5, 0.0);
        assert_eq!(circle_center_cost(&map, &blocked, &centers), COLLISION);
    }

    #[test]
    fn test_padded_polygon_grows() {
        let padded = padded_polygon(&square(), 0.05);
        assert!((padded[0][0] - 0.15).abs() < 1e-9);
        assert!((padded[2][1] + 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_finds_free_yaw() {
        let mut map = open_map();
        // wall directly in front of the robot facing +x
        map.stamp_lethal_rect(2.7, 2.0, 2.8, 3.0);
        let shared: SharedCostmap = Arc::new(RwLock::new(map));
        let checker = FootprintChecker::new(shared);

        let centers = vec![[0.15, 0.0], [0.0, 0.0]];
        let pose = Pose2D::new(2.5, 2.5, 0.0);
        let found = checker.recovery_circle_cost(&pose, &centers, 0.3);
        assert!(found.is_some());
        let (yaw, goal) = found.unwrap();
        // escape heading must turn away from the wall ahead
        assert!(yaw.abs() > 0.3, "yaw {yaw} should rotate away from wall");
        assert!(goal.x < 2.7);
    }

    #[test]
    fn test_static_overlay_selected_per_call() {
        let mut live = open_map();
        live.stamp_lethal_rect(2.4, 2.4, 2.6, 2.6);
        let static_map = open_map();

        let checker = FootprintChecker::with_static_map(
            Arc::new(RwLock::new(live)),
            Arc::new(RwLock::new(static_map)),
        );
        let pose = Pose2D::new(2.5, 2.5, 0.0);
        let fp = square();
        assert_eq!(checker.footprint_cost(&pose, &fp, false), COLLISION);
        assert!(checker.footprint_cost(&pose, &fp, true) >= 0.0);
    }
}
