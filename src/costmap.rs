//! 2D cost grids: the externally maintained world costmap and the
//! robot-centered lattice window with transformed costs.
//!
//! The world costmap uses the usual inflation conventions (lethal 254,
//! inscribed 253, unknown 255). The lattice window re-scales those into a
//! small integer range so primitive costs stay within integer arithmetic.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::geometry::CellCoord;

/// Raw cost conventions of the external costmap layer.
pub mod costs {
    /// Safe to traverse, no penalty
    pub const FREE: u8 = 0;
    /// Robot body would touch an obstacle
    pub const INSCRIBED: u8 = 253;
    /// Obstacle cell
    pub const LETHAL: u8 = 254;
    /// Never observed
    pub const NO_INFORMATION: u8 = 255;
}

/// A rectangular cost grid with collision thresholds.
///
/// Both the world costmap and the lattice window are `Costmap`s; they differ
/// only in their threshold values and cell contents.
#[derive(Clone, Debug)]
pub struct Costmap {
    width: usize,
    height: usize,
    resolution: f64,
    /// World coordinate of the lower-left corner of cell (0, 0)
    origin_x: f64,
    origin_y: f64,
    cells: Vec<u8>,
    /// Cost at or above which a cell is an obstacle
    lethal_cost: u8,
    /// Cost at or above which the robot center may not enter
    inscribed_cost: u8,
    /// Cost above which a full footprint check is required
    circumscribed_cost: u8,
}

impl Costmap {
    /// Create a free world costmap with standard inflation thresholds.
    pub fn new_world(width: usize, height: usize, resolution: f64, origin: (f64, f64)) -> Self {
        Self {
            width,
            height,
            resolution,
            origin_x: origin.0,
            origin_y: origin.1,
            cells: vec![costs::FREE; width * height],
            lethal_cost: costs::LETHAL,
            inscribed_cost: costs::INSCRIBED,
            circumscribed_cost: 128,
        }
    }

    /// Create an empty lattice window with transformed thresholds.
    ///
    /// `lethal_cost` is the transformed lethal value; inscribed is one below
    /// it, and the circumscribed threshold scales down the same way raw costs
    /// do.
    pub fn new_window(size: usize, resolution: f64, lethal_cost: u8) -> Self {
        let inscribed = lethal_cost.saturating_sub(1);
        let multiplier = costs::INSCRIBED / inscribed.max(1) + 1;
        let circumscribed = (128.0 / multiplier as f64 + 0.5) as u8;
        Self {
            width: size,
            height: size,
            resolution,
            origin_x: 0.0,
            origin_y: 0.0,
            cells: vec![costs::FREE; size * size],
            lethal_cost,
            inscribed_cost: inscribed,
            circumscribed_cost: circumscribed,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.origin_x, self.origin_y)
    }

    pub fn lethal_cost(&self) -> u8 {
        self.lethal_cost
    }

    pub fn inscribed_cost(&self) -> u8 {
        self.inscribed_cost
    }

    pub fn circumscribed_cost(&self) -> u8 {
        self.circumscribed_cost
    }

    #[inline]
    pub fn in_bounds(&self, coord: CellCoord) -> bool {
        coord.x >= 0
            && coord.y >= 0
            && (coord.x as usize) < self.width
            && (coord.y as usize) < self.height
    }

    #[inline]
    fn index(&self, coord: CellCoord) -> usize {
        coord.y as usize * self.width + coord.x as usize
    }

    /// Cost at a cell; out-of-bounds reads as lethal.
    #[inline]
    pub fn cost(&self, coord: CellCoord) -> u8 {
        if !self.in_bounds(coord) {
            return self.lethal_cost;
        }
        self.cells[self.index(coord)]
    }

    #[inline]
    pub fn set_cost(&mut self, coord: CellCoord, cost: u8) {
        if self.in_bounds(coord) {
            let idx = self.index(coord);
            self.cells[idx] = cost;
        }
    }

    #[inline]
    pub fn is_lethal(&self, coord: CellCoord) -> bool {
        self.cost(coord) >= self.lethal_cost
    }

    /// True when the robot center may occupy this cell.
    #[inline]
    pub fn is_traversable(&self, coord: CellCoord) -> bool {
        self.cost(coord) < self.inscribed_cost
    }

    #[inline]
    pub fn world_to_grid(&self, x: f64, y: f64) -> CellCoord {
        CellCoord::new(
            ((x - self.origin_x) / self.resolution).floor() as i32,
            ((y - self.origin_y) / self.resolution).floor() as i32,
        )
    }

    /// Cell center in world coordinates.
    #[inline]
    pub fn grid_to_world(&self, coord: CellCoord) -> (f64, f64) {
        (
            self.origin_x + (coord.x as f64 + 0.5) * self.resolution,
            self.origin_y + (coord.y as f64 + 0.5) * self.resolution,
        )
    }

    /// Stamp a lethal rectangle given in world coordinates. Test and
    /// simulation helper for obstacle insertion.
    pub fn stamp_lethal_rect(&mut self, x0: f64, y0: f64, x1: f64, y1: f64) {
        let lo = self.world_to_grid(x0.min(x1), y0.min(y1));
        let hi = self.world_to_grid(x0.max(x1), y0.max(y1));
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                self.set_cost(CellCoord::new(x, y), costs::LETHAL);
            }
        }
    }

    /// Clear every cell intersecting the given world rectangle back to free.
    pub fn clear_rect(&mut self, x0: f64, y0: f64, x1: f64, y1: f64) {
        let lo = self.world_to_grid(x0.min(x1), y0.min(y1));
        let hi = self.world_to_grid(x0.max(x1), y0.max(y1));
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                self.set_cost(CellCoord::new(x, y), costs::FREE);
            }
        }
    }

    /// Re-scale a raw world cost into this window's range.
    ///
    /// Lethal maps to `lethal_cost`, inscribed to one below, free and unknown
    /// to zero, inflated values scale down proportionally.
    pub fn transform_cost(&self, raw: u8) -> u8 {
        if raw == costs::LETHAL {
            self.lethal_cost
        } else if raw == costs::INSCRIBED {
            self.inscribed_cost
        } else if raw == costs::FREE || raw == costs::NO_INFORMATION {
            0
        } else {
            let multiplier = costs::INSCRIBED / self.inscribed_cost.max(1) + 1;
            (raw as f64 / multiplier as f64 + 0.5) as u8
        }
    }

    /// Refresh this window from the world costmap, with the window's lower
    /// left cell placed at `window_origin` in world cells. Returns the cells
    /// whose transformed cost changed.
    pub fn update_from_world(
        &mut self,
        world: &Costmap,
        window_origin: CellCoord,
    ) -> Vec<CellCoord> {
        let mut changed = Vec::new();
        for iy in 0..self.height as i32 {
            for ix in 0..self.width as i32 {
                let raw = world.cost(CellCoord::new(window_origin.x + ix, window_origin.y + iy));
                let new_cost = self.transform_cost(raw);
                let coord = CellCoord::new(ix, iy);
                if self.cost(coord) != new_cost {
                    self.set_cost(coord, new_cost);
                    changed.push(coord);
                }
            }
        }
        // window origin in world coordinates, so window-frame poses convert directly
        let (wx, wy) = world.grid_to_world(window_origin);
        self.origin_x = wx - world.resolution / 2.0;
        self.origin_y = wy - world.resolution / 2.0;
        changed
    }
}

/// Lower-left world cell of a `size`-cell window centered on `center`,
/// clamped so the window stays inside the world costmap.
pub fn window_origin(world: &Costmap, center: CellCoord, size: usize) -> CellCoord {
    let half = (size / 2) as i32;
    let clamp = |c: i32, world_len: usize| -> i32 {
        let world_len = world_len as i32;
        let size = size as i32;
        if world_len <= size {
            0
        } else {
            (c - half).clamp(0, world_len - size)
        }
    };
    CellCoord::new(
        clamp(center.x, world.width()),
        clamp(center.y, world.height()),
    )
}

/// Thread-safe shared costmap handle.
pub type SharedCostmap = Arc<RwLock<Costmap>>;
