//! Pre-computed motion primitives for the state lattice.
//!
//! Each heading bin gets seven templates: three straight moves of increasing
//! length, two shallow arcs changing heading by one bin, and two in-place
//! turns. Primitive costs are time-scaled integers (milliseconds at nominal
//! speed) multiplied by the configured class multiplier; the search later
//! multiplies by the worst cell cost along the primitive.

use std::collections::HashSet;

use crate::geometry::{CellCoord, bin_to_theta, normalize_angle};

/// One interpolated sample along a primitive, relative to the start pose.
#[derive(Clone, Copy, Debug)]
pub struct PrimitiveStep {
    pub dx: f64,
    pub dy: f64,
    pub theta: f64,
}

/// A short pre-computed trajectory template for one starting heading bin.
#[derive(Clone, Debug)]
pub struct MotionPrimitive {
    pub start_theta: u8,
    pub end_dx: i32,
    pub end_dy: i32,
    pub end_theta: u8,
    /// Time-scaled cost including the class multiplier
    pub base_cost: u32,
    /// Interpolated relative poses, start exclusive, end inclusive
    pub steps: Vec<PrimitiveStep>,
    /// Relative cells touched by the polyline (deduplicated)
    pub cells: Vec<CellCoord>,
    /// In-place rotation primitive (produces corner path points)
    pub turn_in_place: bool,
    /// -1, 0 or 1
    pub rotate_direction: i8,
    /// Turning radius annotation for path info (meters)
    pub radius: f64,
}

/// Parameters for primitive generation, mirroring the planner configuration.
#[derive(Clone, Debug)]
pub struct PrimitiveParams {
    pub num_angles: u8,
    pub resolution: f64,
    pub nominal_vel: f64,
    pub time_to_turn_45: f64,
    pub forward_cost_mult: u32,
    pub forward_and_turn_cost_mult: u32,
    pub turn_in_place_cost_mult: u32,
}

/// The full primitive table plus derived lookup structures.
#[derive(Clone, Debug)]
pub struct PrimitiveSet {
    num_angles: u8,
    /// Primitives grouped by starting heading bin
    per_angle: Vec<Vec<MotionPrimitive>>,
    /// (start_bin, index) pairs grouped by *ending* heading bin
    ending_at: Vec<Vec<(u8, usize)>>,
    /// (dx, dy, theta) state offsets whose outgoing primitives can cross a
    /// changed cell at the origin
    affected_offsets: Vec<(i32, i32, u8)>,
}

/// Snapped integer displacement vectors for the 16 canonical headings.
const BASE_VECTORS_16: [(i32, i32); 16] = [
    (1, 0),
    (2, 1),
    (1, 1),
    (1, 2),
    (0, 1),
    (-1, 2),
    (-1, 1),
    (-2, 1),
    (-1, 0),
    (-2, -1),
    (-1, -1),
    (-1, -2),
    (0, -1),
    (1, -2),
    (1, -1),
    (2, -1),
];

impl PrimitiveSet {
    pub fn generate(params: &PrimitiveParams) -> Self {
        assert_eq!(
            params.num_angles, 16,
            "primitive table is defined for 16 heading bins"
        );
        let n = params.num_angles;

        let mut per_angle = Vec::with_capacity(n as usize);
        for bin in 0..n {
            per_angle.push(Self::primitives_for_bin(bin, params));
        }

        let mut ending_at = vec![Vec::new(); n as usize];
        for (bin, prims) in per_angle.iter().enumerate() {
            for (idx, prim) in prims.iter().enumerate() {
                ending_at[prim.end_theta as usize].push((bin as u8, idx));
            }
        }

        // A change at cell c can invalidate any state s whose primitive
        // polyline crosses c: offsets are the negated covered cells tagged
        // with the primitive's start heading.
        let mut seen = HashSet::new();
        let mut affected_offsets = Vec::new();
        for prims in &per_angle {
            for prim in prims {
                for cell in &prim.cells {
                    let offset = (-cell.x, -cell.y, prim.start_theta);
                    if seen.insert(offset) {
                        affected_offsets.push(offset);
                    }
                }
            }
        }

        Self {
            num_angles: n,
            per_angle,
            ending_at,
            affected_offsets,
        }
    }

    fn primitives_for_bin(bin: u8, params: &PrimitiveParams) -> Vec<MotionPrimitive> {
        let n = params.num_angles;
        let (bx, by) = BASE_VECTORS_16[bin as usize];
        let left = (bin + 1) % n;
        let right = (bin + n - 1) % n;
        let (lx, ly) = BASE_VECTORS_16[left as usize];
        let (rx, ry) = BASE_VECTORS_16[right as usize];

        let mut prims = Vec::with_capacity(7);
        for len in [1, 3, 8] {
            prims.push(Self::straight(bin, bx * len, by * len, params));
        }
        prims.push(Self::arc(bin, left, bx + lx, by + ly, 1, params));
        prims.push(Self::arc(bin, right, bx + rx, by + ry, -1, params));
        prims.push(Self::turn(bin, left, 1, params));
        prims.push(Self::turn(bin, right, -1, params));
        prims
    }

    fn straight(bin: u8, dx: i32, dy: i32, params: &PrimitiveParams) -> MotionPrimitive {
        let theta = bin_to_theta(bin, params.num_angles);
        let dist = ((dx * dx + dy * dy) as f64).sqrt() * params.resolution;
        let base_cost =
            (dist / params.nominal_vel * 1000.0).round() as u32 * params.forward_cost_mult;

        let steps = interpolate(dx, dy, theta, theta, params.resolution);
        let cells = covered_cells(&steps, params.resolution);
        MotionPrimitive {
            start_theta: bin,
            end_dx: dx,
            end_dy: dy,
            end_theta: bin,
            base_cost: base_cost.max(1),
            steps,
            cells,
            turn_in_place: false,
            rotate_direction: 0,
            radius: 10.0,
        }
    }

    fn arc(
        bin: u8,
        end_bin: u8,
        dx: i32,
        dy: i32,
        rotate_direction: i8,
        params: &PrimitiveParams,
    ) -> MotionPrimitive {
        let theta0 = bin_to_theta(bin, params.num_angles);
        let theta1 = bin_to_theta(end_bin, params.num_angles);
        let dist = ((dx * dx + dy * dy) as f64).sqrt() * params.resolution;
        let dtheta = 2.0 * std::f64::consts::PI / params.num_angles as f64;

        let translate_time = dist / params.nominal_vel;
        let rotate_time = params.time_to_turn_45 * (dtheta.to_degrees() / 45.0);
        let base_cost = (translate_time.max(rotate_time) * 1000.0).round() as u32
            * params.forward_and_turn_cost_mult;

        let steps = interpolate(dx, dy, theta0, theta1, params.resolution);
        let cells = covered_cells(&steps, params.resolution);
        MotionPrimitive {
            start_theta: bin,
            end_dx: dx,
            end_dy: dy,
            end_theta: end_bin,
            base_cost: base_cost.max(1),
            steps,
            cells,
            turn_in_place: false,
            rotate_direction,
            radius: (dist / dtheta).max(0.1),
        }
    }

    fn turn(
        bin: u8,
        end_bin: u8,
        rotate_direction: i8,
        params: &PrimitiveParams,
    ) -> MotionPrimitive {
        let theta0 = bin_to_theta(bin, params.num_angles);
        let theta1 = bin_to_theta(end_bin, params.num_angles);
        let dtheta = 2.0 * std::f64::consts::PI / params.num_angles as f64;
        let base_cost = (params.time_to_turn_45 * (dtheta.to_degrees() / 45.0) * 1000.0).round()
            as u32
            * params.turn_in_place_cost_mult;

        // dense heading samples so turn runs read as real corners downstream,
        // ending exactly at the target bin
        const TURN_SAMPLES: usize = 8;
        let mut steps: Vec<PrimitiveStep> = (1..=TURN_SAMPLES)
            .map(|i| {
                let t = i as f64 / TURN_SAMPLES as f64;
                PrimitiveStep {
                    dx: 0.0,
                    dy: 0.0,
                    theta: normalize_angle(theta0 + rotate_direction as f64 * dtheta * t),
                }
            })
            .collect();
        if let Some(last) = steps.last_mut() {
            last.theta = normalize_angle(theta1);
        }

        MotionPrimitive {
            start_theta: bin,
            end_dx: 0,
            end_dy: 0,
            end_theta: end_bin,
            base_cost: base_cost.max(1),
            steps,
            cells: vec![CellCoord::new(0, 0)],
            turn_in_place: true,
            rotate_direction,
            radius: 0.0,
        }
    }

    pub fn num_angles(&self) -> u8 {
        self.num_angles
    }

    /// Primitives starting at the given heading bin.
    pub fn for_angle(&self, bin: u8) -> &[MotionPrimitive] {
        &self.per_angle[bin as usize]
    }

    /// (start_bin, index) of primitives ending at the given heading bin.
    pub fn ending_at(&self, bin: u8) -> &[(u8, usize)] {
        &self.ending_at[bin as usize]
    }

    pub fn get(&self, start_bin: u8, index: usize) -> &MotionPrimitive {
        &self.per_angle[start_bin as usize][index]
    }

    /// State offsets whose predecessor set a unit cell change can invalidate.
    pub fn affected_offsets(&self) -> &[(i32, i32, u8)] {
        &self.affected_offsets
    }
}

/// Sample a straight/arc displacement at roughly half-cell spacing.
fn interpolate(
    dx: i32,
    dy: i32,
    theta0: f64,
    theta1: f64,
    resolution: f64,
) -> Vec<PrimitiveStep> {
    let wx = dx as f64 * resolution;
    let wy = dy as f64 * resolution;
    let dist = wx.hypot(wy);
    let num = ((dist / (resolution * 0.5)).ceil() as usize).max(1);
    let dtheta = normalize_angle(theta1 - theta0);

    (1..=num)
        .map(|i| {
            let t = i as f64 / num as f64;
            PrimitiveStep {
                dx: wx * t,
                dy: wy * t,
                theta: normalize_angle(theta0 + dtheta * t),
            }
        })
        .collect()
}

/// Deduplicated relative cells under the sampled polyline.
///
/// Cell offsets are exact for any start cell because world positions are
/// taken from cell centers: offset = floor(d / r + 0.5).
fn covered_cells(steps: &[PrimitiveStep], resolution: f64) -> Vec<CellCoord> {
    let mut seen = HashSet::new();
    let mut cells = vec![CellCoord::new(0, 0)];
    seen.insert((0, 0));
    for s in steps {
        let cx = (s.dx / resolution + 0.5).floor() as i32;
        let cy = (s.dy / resolution + 0.5).floor() as i32;
        if seen.insert((cx, cy)) {
            cells.push(CellCoord::new(cx, cy));
        }
    }
    cells
}
