//! Typed navigation path: ordered points with per-point speed caps,
//! highlight distances and corner markers.
//!
//! The supervisor owns the installed path; the planner worker builds new
//! paths and splices them in through the mutators here. Every mutator leaves
//! corner propagation and velocity smoothing re-applied, so consumers can
//! always trust the invariants: corner runs are contiguous, and points near a
//! corner share its exit heading and rotation direction.

use crate::geometry::{Pose2D, shortest_angular_distance};

/// Corner influence window behind an explicit corner (meters).
pub const MIN_BEFORE_CORNER_LENGTH: f64 = 0.30;
/// Corner influence window past an explicit corner (meters). Lattice plans
/// curve away from corners quickly, so only a quarter of this is applied.
pub const MIN_AFTER_CORNER_LENGTH: f64 = 0.30;
/// Lattice corner runs shorter than this many points are treated as curve
/// artifacts and demoted to plain points.
pub const MIN_CORNER_RUN: usize = 27;

/// Speed cap while rotating through a corner (m/s).
const CORNER_MAX_VEL: f64 = 0.15;
/// Distance over which speed ramps back up after a corner (meters).
const CORNER_SLOWDOWN_DIS: f64 = 0.5;
/// Default turning radius annotation for straight segments.
const STRAIGHT_RADIUS: f64 = 10.0;

/// Corner annotation on a path point.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CornerInfo {
    /// Point is part of a corner run (explicit or propagated)
    pub is_corner: bool,
    /// Heading the robot must face before leaving the corner
    pub theta_out: f64,
    /// Preferred rotation direction: -1, 0 (free), or 1
    pub rotate_direction: i8,
    /// Marked by the planner rather than by propagation
    explicit: bool,
}

impl CornerInfo {
    pub fn explicit(theta_out: f64, rotate_direction: i8) -> Self {
        Self {
            is_corner: true,
            theta_out,
            rotate_direction,
            explicit: true,
        }
    }
}

/// One point of a navigation path.
#[derive(Clone, Debug)]
pub struct PathPoint {
    pub pose: Pose2D,
    /// Per-point translational speed cap (m/s)
    pub max_vel: f64,
    /// Distance over which the local controller weights path following (m)
    pub highlight: f64,
    /// Turning radius annotation from the planner (m)
    pub radius: f64,
    pub corner: CornerInfo,
}

impl PathPoint {
    pub fn new(pose: Pose2D) -> Self {
        Self {
            pose,
            max_vel: 0.0,
            highlight: 0.0,
            radius: STRAIGHT_RADIUS,
            corner: CornerInfo::default(),
        }
    }

    pub fn distance_to(&self, other: &PathPoint) -> f64 {
        self.pose.distance_to(&other.pose)
    }

    pub fn is_corner(&self) -> bool {
        self.corner.is_corner
    }
}

/// The navigation path installed for the local controller.
#[derive(Clone, Debug)]
pub struct NavPath {
    points: Vec<PathPoint>,
    /// Speed cap applied to straight stretches
    nominal_vel: f64,
    /// Lower bound for highlight distances
    min_highlight: f64,
}

impl NavPath {
    pub fn new(nominal_vel: f64, min_highlight: f64) -> Self {
        Self {
            points: Vec::new(),
            nominal_vel,
            min_highlight,
        }
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn front(&self) -> Option<&PathPoint> {
        self.points.first()
    }

    pub fn back(&self) -> Option<&PathPoint> {
        self.points.last()
    }

    /// Sum of Euclidean segment lengths.
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].distance_to(&w[1]))
            .sum()
    }

    /// Plain poses for visualization consumers.
    pub fn poses(&self) -> Vec<Pose2D> {
        self.points.iter().map(|p| p.pose).collect()
    }

    // ---- constructors ----

    /// Two-point path for very short goals.
    pub fn set_short_path(&mut self, start: Pose2D, goal: Pose2D) {
        let yaw = start.direction_to(&goal);
        let mut a = PathPoint::new(Pose2D::new(start.x, start.y, yaw));
        let b = PathPoint::new(Pose2D::new(goal.x, goal.y, goal.theta));
        a.radius = STRAIGHT_RADIUS;
        self.points = vec![a, b];
        self.finalize();
    }

    /// Install a lattice plan. Explicit corner markers are expected to be
    /// set by the caller (turn-in-place primitives).
    pub fn set_lattice_path(&mut self, points: Vec<PathPoint>) {
        self.points = points;
        self.finalize();
    }

    /// Install a sampled coarse grid plan.
    pub fn set_grid_path(&mut self, points: Vec<PathPoint>) {
        self.points = points;
        self.finalize();
    }

    /// Install a curve-generator plan.
    pub fn set_curve_path(&mut self, points: Vec<PathPoint>) {
        self.points = points;
        self.finalize();
    }

    // ---- mutators ----

    /// Prepend a connecting segment, dropping the overlapped head of the
    /// current path.
    pub fn insert_begin_path(&mut self, mut segment: Vec<PathPoint>) {
        if segment.is_empty() {
            return;
        }
        if let Some(last) = segment.last()
            && let Some(join) = self.closest_index(&last.pose, 0, self.points.len())
        {
            self.points.drain(..join);
        }
        segment.append(&mut self.points);
        self.points = segment;
        self.finalize();
    }

    /// Replace the tail of the path from the point nearest the segment start.
    pub fn insert_end_path(&mut self, segment: Vec<PathPoint>) {
        if segment.is_empty() {
            return;
        }
        if let Some(first) = segment.first()
            && let Some(join) = self.closest_index(&first.pose, 0, self.points.len())
        {
            self.points.truncate(join);
        }
        self.points.extend(segment);
        self.finalize();
    }

    /// Splice `segment` between the path points closest to `start` and
    /// `goal`, discarding the replaced interior. Fails when the anchors
    /// cannot be matched in order.
    pub fn insert_middle_path(
        &mut self,
        segment: Vec<PathPoint>,
        start: Pose2D,
        goal: Pose2D,
    ) -> bool {
        if segment.is_empty() {
            return false;
        }
        let Some(start_idx) = self.closest_index(&start, 0, self.points.len()) else {
            return false;
        };
        let Some(goal_idx) = self.closest_index(&goal, start_idx, self.points.len()) else {
            return false;
        };
        if goal_idx < start_idx {
            return false;
        }

        let tail: Vec<PathPoint> = self.points.split_off(goal_idx);
        self.points.truncate(start_idx);
        self.points.extend(segment);
        self.points.extend(tail);
        self.finalize();
        true
    }

    /// Append a tail, connecting at the point nearest the tail's start.
    pub fn extend_path(&mut self, tail: Vec<PathPoint>) {
        self.insert_end_path(tail);
    }

    /// Erase the head of the path up to the point closest to `pose`.
    /// Returns the number of points removed.
    pub fn erase_to_point(&mut self, pose: Pose2D) -> usize {
        match self.closest_index(&pose, 0, self.points.len()) {
            Some(idx) => {
                self.points.drain(..idx);
                idx
            }
            None => 0,
        }
    }

    /// Trim points behind the robot while keeping path topology.
    ///
    /// Scans a bounded window from the head for the point closest to
    /// `current_pose` that is within both tolerances, and drops everything
    /// before it. Fails (leaving the path untouched) when no point in the
    /// window qualifies. With `strict` unset the heading tolerance is
    /// ignored.
    pub fn prune(
        &mut self,
        current_pose: Pose2D,
        max_offroad_dis: f64,
        max_offroad_yaw: f64,
        strict: bool,
    ) -> bool {
        if self.points.is_empty() {
            return false;
        }

        // bounded search window: 2m of path or 40 points, whichever first
        let mut window_end = self.points.len().min(40);
        let mut acc = 0.0;
        for i in 1..window_end {
            acc += self.points[i - 1].distance_to(&self.points[i]);
            if acc > 2.0 {
                window_end = i + 1;
                break;
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, p) in self.points[..window_end].iter().enumerate() {
            let dis = p.pose.distance_to(&current_pose);
            if dis > max_offroad_dis {
                continue;
            }
            if strict {
                let yaw_diff = shortest_angular_distance(current_pose.theta, p.pose.theta).abs();
                // corner points rotate in place, heading mismatch is expected there
                if !p.is_corner() && yaw_diff > max_offroad_yaw {
                    continue;
                }
            }
            if best.is_none_or(|(_, d)| dis < d) {
                best = Some((i, dis));
            }
        }

        match best {
            Some((idx, _)) => {
                self.points.drain(..idx);
                true
            }
            None => false,
        }
    }

    /// Drop corner markers at the head once the rotation they demand has
    /// been satisfied. Returns true when markers were cleared.
    pub fn prune_corner_on_start(&mut self, current_pose: Pose2D, yaw_tolerance: f64) -> bool {
        let Some(front) = self.points.first() else {
            return false;
        };
        if !front.is_corner() {
            return false;
        }
        let diff = shortest_angular_distance(current_pose.theta, front.corner.theta_out);
        if diff.abs() > yaw_tolerance {
            return false;
        }
        let theta_out = front.corner.theta_out;
        for p in self.points.iter_mut() {
            if !p.is_corner() || (p.corner.theta_out - theta_out).abs() > 1e-9 {
                break;
            }
            p.corner = CornerInfo::default();
        }
        true
    }

    /// Terminate the path; the supervisor calls this on cancellation and
    /// completion.
    pub fn finish_path(&mut self) {
        self.points.clear();
    }

    // ---- invariants ----

    /// Re-derive propagated corner markers and speed caps. Applied after
    /// every constructor and mutator; idempotent.
    fn finalize(&mut self) {
        self.propagate_corners();
        self.update_velocity_and_highlight();
    }

    /// Mark all points within [`MIN_BEFORE_CORNER_LENGTH`] before and
    /// `0.25 ×` [`MIN_AFTER_CORNER_LENGTH`] after each explicit corner as
    /// corner points sharing its exit heading and rotation direction.
    fn propagate_corners(&mut self) {
        // reset propagated markers so repeated application cannot widen runs
        for p in self.points.iter_mut() {
            if p.corner.is_corner && !p.corner.explicit {
                p.corner = CornerInfo::default();
            }
        }

        let n = self.points.len();
        let mut i = 0;
        while i < n {
            if !self.points[i].corner.explicit {
                i += 1;
                continue;
            }
            // explicit corner run [i, run_end]
            let mut run_end = i;
            while run_end + 1 < n && self.points[run_end + 1].corner.explicit {
                run_end += 1;
            }
            let theta_out = self.points[run_end].corner.theta_out;
            let rotate_direction = self.points[run_end].corner.rotate_direction;

            let mut begin = i;
            let mut acc = 0.0;
            while begin > 0 && acc < MIN_BEFORE_CORNER_LENGTH {
                acc += self.points[begin].distance_to(&self.points[begin - 1]);
                begin -= 1;
            }
            let mut end = run_end;
            acc = 0.0;
            while end + 1 < n && acc < MIN_AFTER_CORNER_LENGTH * 0.25 {
                acc += self.points[end].distance_to(&self.points[end + 1]);
                end += 1;
            }

            for p in self.points[begin..=end].iter_mut() {
                p.corner.is_corner = true;
                p.corner.theta_out = theta_out;
                p.corner.rotate_direction = rotate_direction;
            }
            i = end + 1;
        }
    }

    /// Cap speeds through corners and ramp them back up afterwards; refresh
    /// highlight distances from the clearance to the next corner.
    fn update_velocity_and_highlight(&mut self) {
        let n = self.points.len();
        // distance from each point to the next corner ahead
        let mut dist_to_corner = vec![f64::MAX; n];
        let mut acc = f64::MAX;
        for i in (0..n).rev() {
            if self.points[i].is_corner() {
                acc = 0.0;
            } else if acc != f64::MAX && i + 1 < n {
                acc += self.points[i].distance_to(&self.points[i + 1]);
            }
            dist_to_corner[i] = acc;
        }

        for i in 0..n {
            let p = &mut self.points[i];
            if p.is_corner() {
                p.max_vel = CORNER_MAX_VEL;
                p.highlight = self.min_highlight;
                continue;
            }
            let d = dist_to_corner[i];
            p.max_vel = if d < CORNER_SLOWDOWN_DIS {
                CORNER_MAX_VEL + (self.nominal_vel - CORNER_MAX_VEL) * (d / CORNER_SLOWDOWN_DIS)
            } else {
                self.nominal_vel
            };
            p.highlight = d.min(2.0).max(self.min_highlight);
        }
    }

    /// Index of the point closest to `pose` within `[from, to)`.
    fn closest_index(&self, pose: &Pose2D, from: usize, to: usize) -> Option<usize> {
        let to = to.min(self.points.len());
        if from >= to {
            return None;
        }
        let mut best = from;
        let mut best_dis = f64::MAX;
        for (i, p) in self.points[from..to].iter().enumerate() {
            let dis = p.pose.distance_to(pose);
            if dis < best_dis {
                best_dis = dis;
                best = from + i;
            }
        }
        Some(best)
    }
}
