//! The state lattice environment: entry arena, primitive expansion against
//! the cost window, and the 2D heuristic grid.
//!
//! Entries are materialized lazily on first touch (hash index into a slab),
//! and a whole-set invalidation is a counter bump rather than a walk. The
//! anytime search runs backward from the navigation goal, so the heuristic
//! grid is anchored at the search terminus: the robot's current cell.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::costmap::Costmap;
use crate::footprint::{circle_center_cost, polygon_cost};
use crate::geometry::{
    CellCoord, Pose2D, bin_to_theta, cont_to_disc, disc_to_cont, discretize_pose,
};

use super::heap::{EntryId, INVALID_ID};
use super::primitives::{MotionPrimitive, PrimitiveParams, PrimitiveSet};
use super::{INFINITE_COST, LatticeEntry, NO_HEAP_POS};

/// One expansion edge: the neighboring entry, the transition cost, and the
/// primitive that produced it.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub target: EntryId,
    pub cost: u32,
    /// (start heading bin, primitive index)
    pub prim: (u8, usize),
}

/// One interpolated point of an extracted lattice plan, in the window frame.
#[derive(Clone, Copy, Debug)]
pub struct LatticePoint {
    pub pose: Pose2D,
    pub radius: f64,
    pub is_corner: bool,
    pub theta_out: f64,
    pub rotate_direction: i8,
}

/// Construction parameters for the environment.
#[derive(Clone, Debug)]
pub struct EnvironmentParams {
    pub map_size: usize,
    pub resolution: f64,
    pub lethal_cost: u8,
    pub nominal_vel: f64,
    pub footprint: Vec<[f64; 2]>,
    pub circle_centers: Vec<[f64; 2]>,
    pub primitives: PrimitiveParams,
}

pub struct LatticeEnvironment {
    size: i32,
    num_angles: u8,
    resolution: f64,
    nominal_vel: f64,
    /// Robot-centered window with transformed costs
    grid: Costmap,
    primitives: PrimitiveSet,
    footprint: Vec<[f64; 2]>,
    circle_centers: Vec<[f64; 2]>,

    entries: Vec<LatticeEntry>,
    index: HashMap<u32, EntryId>,

    /// 2D lower-bound grid anchored at the search terminus
    heuristic: Vec<u32>,
    heuristic_dirty: bool,
    anchor_cell: Option<CellCoord>,
}

impl LatticeEnvironment {
    pub fn new(params: EnvironmentParams) -> Self {
        let primitives = PrimitiveSet::generate(&params.primitives);
        let size = params.map_size;
        Self {
            size: size as i32,
            num_angles: params.primitives.num_angles,
            resolution: params.resolution,
            nominal_vel: params.nominal_vel,
            grid: Costmap::new_window(size, params.resolution, params.lethal_cost),
            primitives,
            footprint: params.footprint,
            circle_centers: params.circle_centers,
            entries: Vec::new(),
            index: HashMap::new(),
            heuristic: vec![INFINITE_COST; size * size],
            heuristic_dirty: true,
            anchor_cell: None,
        }
    }

    pub fn grid(&self) -> &Costmap {
        &self.grid
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn num_angles(&self) -> u8 {
        self.num_angles
    }

    pub fn primitives(&self) -> &PrimitiveSet {
        &self.primitives
    }

    /// Total number of lattice states the window can hold.
    pub fn num_states(&self) -> usize {
        (self.size * self.size) as usize * self.num_angles as usize
    }

    #[inline]
    pub fn entry(&self, id: EntryId) -> &LatticeEntry {
        &self.entries[id as usize]
    }

    #[inline]
    pub fn entry_mut(&mut self, id: EntryId) -> &mut LatticeEntry {
        &mut self.entries[id as usize]
    }

    pub fn entries_mut(&mut self) -> &mut [LatticeEntry] {
        &mut self.entries
    }

    #[inline]
    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.size && y < self.size
    }

    #[inline]
    fn state_index(&self, x: i32, y: i32, theta: u8) -> u32 {
        ((y * self.size + x) * self.num_angles as i32 + theta as i32) as u32
    }

    /// Get or lazily create the entry for a lattice state. `None` when the
    /// state lies outside the window.
    pub fn entry_id(&mut self, x: i32, y: i32, theta: u8) -> Option<EntryId> {
        if !self.in_bounds(x, y) || theta >= self.num_angles {
            return None;
        }
        let key = self.state_index(x, y, theta);
        if let Some(&id) = self.index.get(&key) {
            return Some(id);
        }
        let id = self.entries.len() as EntryId;
        self.entries.push(LatticeEntry::new(x, y, theta));
        self.index.insert(key, id);
        Some(id)
    }

    /// Entry id for a state that has already been materialized.
    pub fn existing_entry_id(&self, x: i32, y: i32, theta: u8) -> Option<EntryId> {
        if !self.in_bounds(x, y) || theta >= self.num_angles {
            return None;
        }
        self.index.get(&self.state_index(x, y, theta)).copied()
    }

    /// Reset an entry the first time it is touched in a new environment
    /// iteration. Cheap whole-set invalidation without walking the arena.
    pub fn touch(&mut self, id: EntryId, environment_iteration: u32) {
        let e = &mut self.entries[id as usize];
        if e.visited_iteration != environment_iteration {
            e.g = INFINITE_COST;
            e.rhs = INFINITE_COST;
            e.best_next = INVALID_ID;
            e.closed_iteration = 0;
            e.heap_pos = NO_HEAP_POS;
            e.in_incons = false;
            e.visited_iteration = environment_iteration;
        }
    }

    /// Create-or-get the entry for a continuous pose in the window frame.
    pub fn pose_entry(&mut self, pose: &Pose2D) -> Option<EntryId> {
        let coord = discretize_pose(pose, self.resolution, self.num_angles);
        self.entry_id(coord.x, coord.y, coord.theta)
    }

    /// Set the search terminus (the robot pose); re-anchors the heuristic.
    pub fn set_start(&mut self, pose: &Pose2D) -> Option<EntryId> {
        let id = self.pose_entry(pose)?;
        let cell = CellCoord::new(self.entry(id).x, self.entry(id).y);
        if self.anchor_cell != Some(cell) {
            self.anchor_cell = Some(cell);
            self.heuristic_dirty = true;
        }
        Some(id)
    }

    /// Set the navigation goal entry.
    pub fn set_goal(&mut self, pose: &Pose2D) -> Option<EntryId> {
        self.pose_entry(pose)
    }

    /// Continuous window-frame pose at an entry's cell center.
    pub fn entry_pose(&self, id: EntryId) -> Pose2D {
        let e = self.entry(id);
        Pose2D::new(
            disc_to_cont(e.x, self.resolution),
            disc_to_cont(e.y, self.resolution),
            bin_to_theta(e.theta, self.num_angles),
        )
    }

    /// Refresh the window from the world costmap. Returns changed cells and
    /// marks the heuristic dirty when anything moved.
    pub fn refresh_costs(&mut self, world: &Costmap, window_origin: CellCoord) -> Vec<CellCoord> {
        let changed = self.grid.update_from_world(world, window_origin);
        if !changed.is_empty() {
            self.heuristic_dirty = true;
        }
        changed
    }

    /// Directly update one window cell (transformed cost).
    pub fn update_cost(&mut self, cell: CellCoord, cost: u8) {
        if self.grid.cost(cell) != cost {
            self.grid.set_cost(cell, cost);
            self.heuristic_dirty = true;
        }
    }

    /// Expansion edges forward out of an entry.
    pub fn get_succs(&mut self, id: EntryId) -> Vec<Transition> {
        let (x, y, theta) = {
            let e = self.entry(id);
            (e.x, e.y, e.theta)
        };

        let mut out = Vec::with_capacity(7);
        for idx in 0..self.primitives.for_angle(theta).len() {
            let prim = self.primitives.get(theta, idx);
            let (nx, ny, ntheta) = (x + prim.end_dx, y + prim.end_dy, prim.end_theta);
            if !self.in_bounds(nx, ny) {
                continue;
            }
            let Some(max_cell) = self.validate_primitive(x, y, prim) else {
                continue;
            };
            let cost = self
                .primitives
                .get(theta, idx)
                .base_cost
                .saturating_mul(max_cell.max(1));
            if let Some(target) = self.entry_id(nx, ny, ntheta) {
                out.push(Transition {
                    target,
                    cost,
                    prim: (theta, idx),
                });
            }
        }
        out
    }

    /// Expansion edges into an entry, via primitive reversal.
    pub fn get_preds(&mut self, id: EntryId) -> Vec<Transition> {
        let (x, y, theta) = {
            let e = self.entry(id);
            (e.x, e.y, e.theta)
        };

        let incoming: Vec<(u8, usize)> = self.primitives.ending_at(theta).to_vec();
        let mut out = Vec::with_capacity(incoming.len());
        for (start_bin, idx) in incoming {
            let prim = self.primitives.get(start_bin, idx);
            let (px, py) = (x - prim.end_dx, y - prim.end_dy);
            if !self.in_bounds(px, py) {
                continue;
            }
            let Some(max_cell) = self.validate_primitive(px, py, prim) else {
                continue;
            };
            let cost = self
                .primitives
                .get(start_bin, idx)
                .base_cost
                .saturating_mul(max_cell.max(1));
            if let Some(target) = self.entry_id(px, py, start_bin) {
                out.push(Transition {
                    target,
                    cost,
                    prim: (start_bin, idx),
                });
            }
        }
        out
    }

    /// Check a primitive executed from cell (x, y); returns the max cell
    /// cost along it, or `None` when it collides.
    ///
    /// Cheap first: every polyline cell must stay below the inscribed
    /// threshold. Cells above the circumscribed threshold demand the circle
    /// check and then the full footprint rasterization at each sample.
    fn validate_primitive(&self, x: i32, y: i32, prim: &MotionPrimitive) -> Option<u32> {
        let mut max_cell = 0u8;
        for cell in &prim.cells {
            let cost = self.grid.cost(CellCoord::new(x + cell.x, y + cell.y));
            if cost >= self.grid.inscribed_cost() {
                return None;
            }
            max_cell = max_cell.max(cost);
        }

        if max_cell >= self.grid.circumscribed_cost() {
            let base_x = disc_to_cont(x, self.resolution);
            let base_y = disc_to_cont(y, self.resolution);
            for step in &prim.steps {
                let pose = Pose2D::new(base_x + step.dx, base_y + step.dy, step.theta);
                if circle_center_cost(&self.grid, &pose, &self.circle_centers) < 0.0 {
                    return None;
                }
                if polygon_cost(&self.grid, &pose, &self.footprint) < 0.0 {
                    return None;
                }
            }
        }
        Some(max_cell as u32)
    }

    /// Lattice states whose outgoing primitives may cross `cell`.
    pub fn affected_pred_states(&self, cell: CellCoord) -> Vec<(i32, i32, u8)> {
        self.primitives
            .affected_offsets()
            .iter()
            .filter_map(|&(dx, dy, theta)| {
                let (x, y) = (cell.x + dx, cell.y + dy);
                if self.in_bounds(x, y) {
                    Some((x, y, theta))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Recompute the 2D lower-bound grid if costs or the anchor changed.
    pub fn ensure_heuristic_updated(&mut self) {
        if !self.heuristic_dirty {
            return;
        }
        let Some(anchor) = self.anchor_cell else {
            return;
        };

        self.heuristic.fill(INFINITE_COST);
        let size = self.size;
        let idx = |x: i32, y: i32| (y * size + x) as usize;

        // time-scaled step costs matching the straight primitive model
        let straight = (self.resolution / self.nominal_vel * 1000.0).round() as u32;
        let diagonal = (self.resolution * std::f64::consts::SQRT_2 / self.nominal_vel * 1000.0)
            .round() as u32;
        let neighbors: [(i32, i32, u32); 8] = [
            (-1, 0, straight),
            (1, 0, straight),
            (0, -1, straight),
            (0, 1, straight),
            (-1, -1, diagonal),
            (1, -1, diagonal),
            (-1, 1, diagonal),
            (1, 1, diagonal),
        ];

        let mut heap = BinaryHeap::new();
        if self.in_bounds(anchor.x, anchor.y) {
            self.heuristic[idx(anchor.x, anchor.y)] = 0;
            heap.push(Reverse((0u32, anchor.x, anchor.y)));
        }

        while let Some(Reverse((dist, x, y))) = heap.pop() {
            if dist > self.heuristic[idx(x, y)] {
                continue;
            }
            for &(dx, dy, step) in &neighbors {
                let (nx, ny) = (x + dx, y + dy);
                if !self.in_bounds(nx, ny) {
                    continue;
                }
                let cell_cost = self.grid.cost(CellCoord::new(nx, ny));
                if cell_cost >= self.grid.inscribed_cost() {
                    continue;
                }
                let edge = step.saturating_mul((cell_cost as u32).max(1));
                let next = dist.saturating_add(edge);
                if next < self.heuristic[idx(nx, ny)] {
                    self.heuristic[idx(nx, ny)] = next;
                    heap.push(Reverse((next, nx, ny)));
                }
            }
        }

        self.heuristic_dirty = false;
        tracing::debug!(
            "heuristic grid refreshed, anchor ({}, {})",
            anchor.x,
            anchor.y
        );
    }

    /// Admissible lower bound for a cell: max of the 2D grid value and the
    /// kinematic straight-line time to the anchor.
    pub fn heuristic(&self, x: i32, y: i32) -> u32 {
        if !self.in_bounds(x, y) {
            return INFINITE_COST;
        }
        let grid_h = self.heuristic[(y * self.size + x) as usize];
        if grid_h >= INFINITE_COST {
            return INFINITE_COST;
        }
        let euclid = match self.anchor_cell {
            Some(a) => {
                let d = (((x - a.x).pow(2) + (y - a.y).pow(2)) as f64).sqrt();
                (d * self.resolution / self.nominal_vel * 1000.0).round() as u32
            }
            None => 0,
        };
        grid_h.max(euclid)
    }

    /// World-frame cell of a window-frame continuous coordinate.
    pub fn cell_of(&self, x: f64, y: f64) -> CellCoord {
        CellCoord::new(
            cont_to_disc(x, self.resolution),
            cont_to_disc(y, self.resolution),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_params(map_size: usize) -> EnvironmentParams {
        EnvironmentParams {
            map_size,
            resolution: 0.05,
            lethal_cost: 20,
            nominal_vel: 0.4,
            footprint: vec![[0.05, 0.05], [0.05, -0.05], [-0.05, -0.05], [-0.05, 0.05]],
            circle_centers: vec![[0.0, 0.0]],
            primitives: PrimitiveParams {
                num_angles: 16,
                resolution: 0.05,
                nominal_vel: 0.4,
                time_to_turn_45: 0.6,
                forward_cost_mult: 1,
                forward_and_turn_cost_mult: 2,
                turn_in_place_cost_mult: 50,
            },
        }
    }

    #[test]
    fn test_lazy_entry_creation() {
        let mut env = LatticeEnvironment::new(test_params(50));
        assert_eq!(env.entries.len(), 0);

        let a = env.entry_id(10, 10, 0).unwrap();
        let b = env.entry_id(10, 10, 0).unwrap();
        assert_eq!(a, b, "same state must map to the same entry");
        assert_eq!(env.entries.len(), 1);

        assert!(env.entry_id(-1, 0, 0).is_none());
        assert!(env.entry_id(50, 0, 0).is_none());
    }

    #[test]
    fn test_touch_resets_stale_entries() {
        let mut env = LatticeEnvironment::new(test_params(50));
        let id = env.entry_id(5, 5, 0).unwrap();
        env.touch(id, 1);
        env.entry_mut(id).g = 100;
        env.entry_mut(id).rhs = 50;

        // same iteration: values survive
        env.touch(id, 1);
        assert_eq!(env.entry(id).g, 100);

        // new iteration: reset
        env.touch(id, 2);
        assert_eq!(env.entry(id).g, INFINITE_COST);
        assert_eq!(env.entry(id).rhs, INFINITE_COST);
        assert_eq!(env.entry(id).best_next, INVALID_ID);
    }

    #[test]
    fn test_succs_on_open_grid() {
        let mut env = LatticeEnvironment::new(test_params(50));
        let id = env.entry_id(25, 25, 0).unwrap();
        let succs = env.get_succs(id);
        assert_eq!(succs.len(), 7, "all primitives apply in free space");
        for t in &succs {
            assert!(t.cost > 0);
        }
    }

    #[test]
    fn test_succs_blocked_by_obstacle() {
        let mut env = LatticeEnvironment::new(test_params(50));
        // wall across x = 27 blocks forward primitives from (25, 25, 0)
        for y in 0..50 {
            env.update_cost(CellCoord::new(27, y), 20);
        }
        let id = env.entry_id(25, 25, 0).unwrap();
        let succs = env.get_succs(id);
        // long forward (8 cells) and medium (3 cells) are blocked; short
        // forward (1 cell) and turns survive
        assert!(succs.len() < 7);
        assert!(
            succs
                .iter()
                .any(|t| env.primitives.get(t.prim.0, t.prim.1).turn_in_place)
        );
    }

    #[test]
    fn test_preds_mirror_succs() {
        let mut env = LatticeEnvironment::new(test_params(50));
        let id = env.entry_id(25, 25, 0).unwrap();
        let succs = env.get_succs(id);

        // every successor must list the source among its predecessors
        for t in succs {
            let preds = env.get_preds(t.target);
            assert!(
                preds.iter().any(|p| p.target == id),
                "missing reverse edge"
            );
        }
    }

    #[test]
    fn test_heuristic_admissible_lower_bound() {
        let mut env = LatticeEnvironment::new(test_params(50));
        env.set_start(&Pose2D::new(0.5, 0.5, 0.0)).unwrap();
        env.ensure_heuristic_updated();

        let anchor = env.anchor_cell.unwrap();
        assert_eq!(env.heuristic(anchor.x, anchor.y), 0);

        // ten cells along +x: h equals straight-line time cost in free space
        let h = env.heuristic(anchor.x + 10, anchor.y);
        let straight = (10.0_f64 * 0.05 / 0.4 * 1000.0).round() as u32;
        assert_eq!(h, straight);
    }

    #[test]
    fn test_heuristic_routes_around_walls() {
        let mut env = LatticeEnvironment::new(test_params(50));
        // vertical wall with no gap between anchor and the far side
        for y in 0..50 {
            env.update_cost(CellCoord::new(25, y), 20);
        }
        env.set_start(&Pose2D::new(0.5, 0.5, 0.0)).unwrap();
        env.ensure_heuristic_updated();

        assert_eq!(
            env.heuristic(40, 10),
            INFINITE_COST,
            "cells behind a full wall are unreachable in 2D"
        );
    }

    #[test]
    fn test_affected_pred_states_near_cell() {
        let env = LatticeEnvironment::new(test_params(50));
        let states = env.affected_pred_states(CellCoord::new(25, 25));
        assert!(!states.is_empty());
        // the cell itself with every heading is affected
        for theta in 0..16u8 {
            assert!(states.contains(&(25, 25, theta)));
        }
        // out-of-window offsets are filtered
        let edge_states = env.affected_pred_states(CellCoord::new(0, 0));
        assert!(edge_states.iter().all(|&(x, y, _)| x >= 0 && y >= 0));
    }
}
