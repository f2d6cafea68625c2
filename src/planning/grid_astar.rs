//! Coarse A* planner on the 2D cost grid.
//!
//! Used for goals beyond the lattice window's reach: a heading-free grid
//! search whose result is resampled into evenly spaced waypoints with
//! headings, installed as the fix path and later refined by lattice replans.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::f64::consts::SQRT_2;

use crate::costmap::Costmap;
use crate::geometry::{CellCoord, Pose2D};

/// Fixed-point scale turning f64 priorities into heap keys.
const PRIORITY_SCALE: f64 = 1024.0;

/// 8-connected neighborhood with step lengths in cells.
const STEPS: [(i32, i32, f64); 8] = [
    (1, 0, 1.0),
    (-1, 0, 1.0),
    (0, 1, 1.0),
    (0, -1, 1.0),
    (1, 1, SQRT_2),
    (1, -1, SQRT_2),
    (-1, 1, SQRT_2),
    (-1, -1, SQRT_2),
];

/// Configuration for the coarse grid planner.
#[derive(Clone, Debug)]
pub struct GridPlannerConfig {
    /// Maximum expansions before giving up
    pub max_iterations: usize,
    /// Weight for inflated-cost penalty in edge costs
    pub cost_penalty_weight: f64,
    /// Goal tolerance in cells
    pub goal_tolerance: i32,
    /// Waypoint spacing for the sampled output (meters)
    pub sample_dis: f64,
}

impl Default for GridPlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200_000,
            cost_penalty_weight: 2.0,
            goal_tolerance: 2,
            sample_dis: 0.10,
        }
    }
}

/// Coarse 2D A* planner.
pub struct GridPlanner {
    config: GridPlannerConfig,
    /// Closest approach to the goal from the last failed attempt
    extend_point: Option<(f64, f64)>,
}

impl GridPlanner {
    pub fn new(config: GridPlannerConfig) -> Self {
        Self {
            config,
            extend_point: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GridPlannerConfig::default())
    }

    /// Where the last failed search got closest to its goal; useful for
    /// reporting how far an unreachable goal could be approached.
    pub fn extend_point(&self) -> Option<(f64, f64)> {
        self.extend_point
    }

    /// Plan from start to goal over the cost grid.
    ///
    /// Returns evenly spaced waypoints with headings, or `None` when no
    /// path exists.
    pub fn plan(&mut self, costmap: &Costmap, start: Pose2D, goal: Pose2D) -> Option<Vec<Pose2D>> {
        self.extend_point = None;
        let start_coord = costmap.world_to_grid(start.x, start.y);
        let goal_coord = costmap.world_to_grid(goal.x, goal.y);

        // a blocked start shifts to the nearest free cell; a blocked goal
        // fails explicitly so the caller can pick a new one
        let actual_start = if !costmap.is_traversable(start_coord) {
            tracing::warn!("start cell blocked, shifting to the nearest free cell");
            nearest_free(costmap, start_coord, 10)?
        } else {
            start_coord
        };
        if !costmap.is_traversable(goal_coord) {
            tracing::warn!(
                "goal cell ({}, {}) is not traversable",
                goal_coord.x,
                goal_coord.y
            );
            return None;
        }

        let cells = self.astar_search(costmap, actual_start, goal_coord)?;

        let waypoints: Vec<(f64, f64)> = cells
            .iter()
            .map(|&coord| costmap.grid_to_world(coord))
            .collect();
        let mut sampled = self.sample_waypoints(&waypoints);
        if let Some(last) = sampled.last_mut() {
            last.theta = goal.theta;
        }
        Some(sampled)
    }

    fn astar_search(
        &mut self,
        costmap: &Costmap,
        start: CellCoord,
        goal: CellCoord,
    ) -> Option<Vec<CellCoord>> {
        // lazy-deletion heap keyed by fixed-point f = g + h
        let mut open: BinaryHeap<Reverse<(u64, i32, i32)>> = BinaryHeap::new();
        let mut g_score: HashMap<CellCoord, f64> = HashMap::new();
        let mut came_from: HashMap<CellCoord, CellCoord> = HashMap::new();
        let mut closed: HashSet<CellCoord> = HashSet::new();

        g_score.insert(start, 0.0);
        open.push(Reverse((
            priority(octile_distance(start, goal)),
            start.x,
            start.y,
        )));

        let mut expansions = 0;
        let mut best_effort: Option<(f64, CellCoord)> = None;

        while let Some(Reverse((_, x, y))) = open.pop() {
            let current = CellCoord::new(x, y);
            if !closed.insert(current) {
                // stale heap entry for an already settled cell
                continue;
            }

            let gap = (current.x - goal.x).abs().max((current.y - goal.y).abs());
            if gap <= self.config.goal_tolerance {
                // walk the parent chain back; the start carries no parent
                let mut trail = VecDeque::new();
                let mut cursor = current;
                trail.push_front(cursor);
                while let Some(&prev) = came_from.get(&cursor) {
                    cursor = prev;
                    trail.push_front(cursor);
                }
                return Some(trail.into());
            }

            expansions += 1;
            if expansions > self.config.max_iterations {
                tracing::warn!("grid planner exceeded max iterations");
                break;
            }

            let remaining = octile_distance(current, goal);
            if best_effort.is_none_or(|(d, _)| remaining < d) {
                best_effort = Some((remaining, current));
            }

            let current_g = g_score[&current];
            for &(dx, dy, step) in &STEPS {
                let neighbor = CellCoord::new(current.x + dx, current.y + dy);
                if closed.contains(&neighbor) || !costmap.is_traversable(neighbor) {
                    continue;
                }

                let penalty = costmap.cost(neighbor) as f64 / costmap.inscribed_cost() as f64;
                let edge = step * (1.0 + self.config.cost_penalty_weight * penalty);
                let tentative = current_g + edge;

                if g_score
                    .get(&neighbor)
                    .is_none_or(|&known| tentative < known)
                {
                    g_score.insert(neighbor, tentative);
                    came_from.insert(neighbor, current);
                    open.push(Reverse((
                        priority(tentative + octile_distance(neighbor, goal)),
                        neighbor.x,
                        neighbor.y,
                    )));
                }
            }
        }

        // no path: remember where we got closest for diagnostics
        if let Some((_, coord)) = best_effort {
            self.extend_point = Some(costmap.grid_to_world(coord));
        }
        None
    }

    /// Resample a cell-center polyline at `sample_dis` spacing, assigning
    /// each waypoint the heading toward its successor.
    fn sample_waypoints(&self, waypoints: &[(f64, f64)]) -> Vec<Pose2D> {
        if waypoints.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<(f64, f64)> = vec![waypoints[0]];
        let mut acc = 0.0;
        for pair in waypoints.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            acc += (x1 - x0).hypot(y1 - y0);
            if acc >= self.config.sample_dis {
                out.push(pair[1]);
                acc = 0.0;
            }
        }
        if out.last() != waypoints.last() {
            out.push(*waypoints.last().unwrap());
        }

        let mut poses = Vec::with_capacity(out.len());
        for i in 0..out.len() {
            let (x, y) = out[i];
            let (nx, ny) = if i + 1 < out.len() { out[i + 1] } else { out[i] };
            let theta = if i + 1 < out.len() {
                (ny - y).atan2(nx - x)
            } else {
                poses
                    .last()
                    .map(|p: &Pose2D| p.theta)
                    .unwrap_or(0.0)
            };
            poses.push(Pose2D::new(x, y, theta));
        }
        poses
    }
}

/// Fixed-point heap priority.
#[inline]
fn priority(f: f64) -> u64 {
    (f * PRIORITY_SCALE) as u64
}

/// Octile distance: exact 8-connected lower bound on free grids, which also
/// breaks ties toward diagonal-efficient cells.
#[inline]
fn octile_distance(from: CellCoord, to: CellCoord) -> f64 {
    let dx = (to.x - from.x).abs() as f64;
    let dy = (to.y - from.y).abs() as f64;
    dx.max(dy) + (SQRT_2 - 1.0) * dx.min(dy)
}

/// Nearest traversable cell within `max_radius` of `center`, by Euclidean
/// cell distance over one block scan.
fn nearest_free(costmap: &Costmap, center: CellCoord, max_radius: i32) -> Option<CellCoord> {
    let mut best: Option<(i32, CellCoord)> = None;
    for dy in -max_radius..=max_radius {
        for dx in -max_radius..=max_radius {
            let candidate = CellCoord::new(center.x + dx, center.y + dy);
            if !costmap.is_traversable(candidate) {
                continue;
            }
            let dist2 = dx * dx + dy * dy;
            if best.is_none_or(|(b, _)| dist2 < b) {
                best = Some((dist2, candidate));
            }
        }
    }
    best.map(|(_, c)| c)
}
