//! Local trajectory controller.
//!
//! Synchronous: one call per supervisor tick, never blocks, must return
//! within a control period. Two interchangeable backends share the goal
//! logic here: reaching the goal position latches the xy tolerance, the
//! robot stops under its acceleration limits, rotates in place to the goal
//! heading, and corners on the path trigger in-place rotation to the exit
//! heading before any translation.

pub mod lookahead;
pub mod trajectory;

use tracing::{debug, info};

use crate::config::LocalPlannerConfig;
use crate::costmap::Costmap;
use crate::geometry::{Pose2D, Twist, shortest_angular_distance, sign};
use crate::path::NavPath;

pub use lookahead::LookaheadPlanner;
pub use trajectory::TrajectoryPlanner;

/// Which backend computes the command this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannerKind {
    Trajectory,
    Lookahead,
}

pub struct LocalPlanner {
    cfg: LocalPlannerConfig,
    trajectory: TrajectoryPlanner,
    lookahead: LookaheadPlanner,
    sim_period: f64,

    // runtime-adjustable goal tolerances (tightened for charging goals)
    xy_goal_tolerance: f64,
    yaw_goal_tolerance: f64,

    xy_tolerance_latch: bool,
    rotating_to_goal: bool,
    rotating_to_goal_done: bool,
    reached_goal: bool,

    // rotation direction memory
    last_rotate_dir: i8,
    last_target_yaw: f64,
    try_rotate: u32,
}

impl LocalPlanner {
    pub fn new(cfg: LocalPlannerConfig, circle_centers: Vec<[f64; 2]>, sim_period: f64) -> Self {
        let trajectory = TrajectoryPlanner::new(cfg.clone(), circle_centers, sim_period);
        let lookahead = LookaheadPlanner::new(cfg.clone(), sim_period);
        Self {
            xy_goal_tolerance: cfg.xy_goal_tolerance,
            yaw_goal_tolerance: cfg.yaw_goal_tolerance,
            cfg,
            trajectory,
            lookahead,
            sim_period,
            xy_tolerance_latch: false,
            rotating_to_goal: false,
            rotating_to_goal_done: false,
            reached_goal: false,
            last_rotate_dir: 0,
            last_target_yaw: 0.0,
            try_rotate: 0,
        }
    }

    /// Clear every latch; called when a new plan is absorbed.
    pub fn reset(&mut self) {
        self.reached_goal = false;
        self.rotating_to_goal = false;
        self.rotating_to_goal_done = false;
        self.xy_tolerance_latch = false;
        self.last_target_yaw = 0.0;
        self.last_rotate_dir = 0;
        self.try_rotate = 0;
    }

    /// Override goal tolerances (charging goals tighten both).
    pub fn set_goal_tolerances(&mut self, xy: f64, yaw: f64) {
        self.xy_goal_tolerance = xy;
        self.yaw_goal_tolerance = yaw;
    }

    pub fn reset_goal_tolerances(&mut self) {
        self.xy_goal_tolerance = self.cfg.xy_goal_tolerance;
        self.yaw_goal_tolerance = self.cfg.yaw_goal_tolerance;
    }

    pub fn is_goal_reached(&self) -> bool {
        self.reached_goal
    }

    pub fn is_rotating_to_goal(&self) -> bool {
        self.rotating_to_goal
    }

    pub fn is_goal_xy_latched(&self) -> bool {
        self.xy_tolerance_latch
    }

    /// Compute a velocity command for the current tick.
    ///
    /// `cmd_vel_ratio` scales the selected command (reduced under low front
    /// clearance). Returns `None` when no valid command exists this tick.
    pub fn compute_velocity(
        &mut self,
        kind: PlannerKind,
        map: &Costmap,
        pose: &Pose2D,
        vel: &Twist,
        path: &NavPath,
        cmd_vel_ratio: f64,
    ) -> Option<Twist> {
        let points = path.points();
        let goal = points.last()?.pose;

        // goal position reached: stop, then rotate to the goal heading
        let goal_dis = pose.distance_to(&goal);
        if self.xy_tolerance_latch || (goal_dis <= self.xy_goal_tolerance && points.len() <= 100) {
            self.xy_tolerance_latch = true;

            let angle = shortest_angular_distance(pose.theta, goal.theta);
            debug!(
                "goal position held, yaw diff {:.3} (tolerance {:.3})",
                angle, self.yaw_goal_tolerance
            );
            if angle.abs() <= self.yaw_goal_tolerance {
                self.reached_goal = true;
                self.rotating_to_goal = false;
                self.rotating_to_goal_done = true;
                self.xy_tolerance_latch = false;
                info!("global goal reached");
                return Some(Twist::ZERO);
            }

            if !self.rotating_to_goal && !vel.is_stopped(0.1, 0.1) {
                return self.stop_with_acc_limits(map, pose, vel);
            }
            self.rotating_to_goal = true;
            self.rotating_to_goal_done = false;
            return self.rotate_to_goal(map, pose, vel, goal.theta, 0);
        }

        // corner at the path head: rotate in place to the exit heading first
        if let Some(front) = points.first()
            && front.is_corner()
        {
            let target_yaw = front.corner.theta_out;
            // target changed mid-rotation: forget the remembered direction
            if (target_yaw - self.last_target_yaw).abs() > 1e-6 {
                self.last_rotate_dir = 0;
                self.try_rotate = 0;
                self.last_target_yaw = target_yaw;
            }
            let angle = shortest_angular_distance(pose.theta, target_yaw);
            if angle.abs() > 0.1 {
                self.rotating_to_goal = true;
                self.rotating_to_goal_done = false;
                debug!("corner: rotating to exit heading {:.3}", target_yaw);
                return self.rotate_to_goal(map, pose, vel, target_yaw, front.corner.rotate_direction);
            }
            self.rotating_to_goal = false;
            self.rotating_to_goal_done = true;
        }

        self.last_target_yaw = 0.0;
        self.last_rotate_dir = 0;
        self.try_rotate = 0;

        let traj_vel = points.first().map(|p| p.max_vel).unwrap_or(self.cfg.max_vel_x);
        let highlight = points
            .first()
            .map(|p| p.highlight)
            .unwrap_or(self.cfg.min_highlight_dis);

        let mut twist = match kind {
            PlannerKind::Trajectory => self
                .trajectory
                .find_best(map, pose, vel, points, traj_vel, highlight)?,
            PlannerKind::Lookahead => self.lookahead.generate(
                map,
                &self.trajectory,
                pose,
                vel,
                points,
                traj_vel,
                highlight,
            )?,
        };

        // ratio under reduced front clearance, and again near the goal
        let mut ratio = cmd_vel_ratio.clamp(0.5, 1.0);
        if goal_dis < self.cfg.final_goal_dis_th {
            ratio *= self.cfg.final_vel_ratio;
        }
        twist.linear_x *= ratio;
        twist.linear_y *= ratio;
        Some(twist)
    }

    /// Decelerate toward zero under the acceleration limits, validating the
    /// decelerated command before issuing it.
    pub fn stop_with_acc_limits(
        &self,
        map: &Costmap,
        pose: &Pose2D,
        vel: &Twist,
    ) -> Option<Twist> {
        let vx = sign(vel.linear_x)
            * (vel.linear_x.abs() - self.cfg.acc_lim_x * self.sim_period).max(0.0);
        let vy = sign(vel.linear_y)
            * (vel.linear_y.abs() - self.cfg.acc_lim_y * self.sim_period).max(0.0);

        if !self.trajectory.check_trajectory(map, pose, vx, 0.0, 2.0) {
            debug!("stop command invalid, forcing zero velocity");
            return None;
        }
        debug!("slowing down, vx {:.3}", vx);
        Some(Twist::new(vx, vy, 0.0))
    }

    /// In-place rotation toward `goal_th`, honoring the remembered rotation
    /// direction, the acceleration limits and a square-root braking profile.
    pub fn rotate_to_goal(
        &mut self,
        map: &Costmap,
        pose: &Pose2D,
        vel: &Twist,
        goal_th: f64,
        rotate_direction: i8,
    ) -> Option<Twist> {
        let mut ang_diff = shortest_angular_distance(pose.theta, goal_th);

        // a requested direction that disagrees with the short way forces the
        // long way around, as does the remembered direction
        if rotate_direction != 0
            && (self.last_rotate_dir == 0 || self.last_rotate_dir as i32 * rotate_direction as i32 > 0)
            && ang_diff * (rotate_direction as f64) < 0.0
        {
            ang_diff += -sign(ang_diff) * 2.0 * std::f64::consts::PI;
        }
        if self.last_rotate_dir != 0 && ang_diff * (self.last_rotate_dir as f64) < 0.0 {
            ang_diff = sign(ang_diff) * (ang_diff.abs() - 2.0 * std::f64::consts::PI);
        }
        self.last_rotate_dir = if ang_diff < 0.0 { -1 } else { 1 };

        let k = self.cfg.rotate_to_goal_k;
        let mut v_theta = if ang_diff > 0.0 {
            (ang_diff * k)
                .max(self.cfg.min_in_place_rotational_vel)
                .min(self.cfg.max_vel_theta)
        } else {
            (ang_diff * k)
                .min(-self.cfg.min_in_place_rotational_vel)
                .max(self.cfg.min_vel_theta)
        };

        // acceleration window around the current angular speed
        let max_acc_vel = vel.angular_z.abs() + self.cfg.acc_lim_theta * self.sim_period;
        let min_acc_vel = vel.angular_z.abs() - self.cfg.acc_lim_theta * self.sim_period;
        v_theta = sign(v_theta) * v_theta.abs().clamp(min_acc_vel.max(0.0), max_acc_vel);

        // braking profile: never faster than what can stop at the target
        let max_speed_to_stop = (2.0 * self.cfg.acc_lim_theta * ang_diff.abs()).sqrt();
        v_theta = sign(v_theta) * max_speed_to_stop.min(v_theta.abs());

        // the in-place floor outranks the acceleration limits
        v_theta = if v_theta > 0.0 {
            v_theta
                .max(self.cfg.min_in_place_rotational_vel)
                .min(self.cfg.max_vel_theta)
        } else {
            v_theta
                .min(-self.cfg.min_in_place_rotational_vel)
                .max(self.cfg.min_vel_theta)
        };

        // ease off close to the target
        let plain_diff = shortest_angular_distance(pose.theta, goal_th).abs();
        if plain_diff < 0.15 {
            v_theta *= 0.30;
        } else if plain_diff < 0.35 {
            v_theta *= 0.45;
        }
        if v_theta.abs() < 0.1 {
            v_theta = sign(v_theta) * 0.1;
        }

        if self
            .trajectory
            .check_trajectory(map, pose, 0.0, v_theta, 1.0)
        {
            self.try_rotate = 0;
            return Some(Twist::new(0.0, 0.0, v_theta));
        }

        // blocked rotation: after enough failures try the other way round
        if self.try_rotate >= self.cfg.max_rotate_try_times {
            self.last_rotate_dir *= -1;
        }
        self.try_rotate += 1;
        debug!("rotate command blocked, try {}", self.try_rotate);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathPoint;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn planner() -> LocalPlanner {
        LocalPlanner::new(LocalPlannerConfig::default(), vec![[0.0, 0.0]], 0.1)
    }

    fn open_map() -> Costmap {
        Costmap::new_world(200, 200, 0.05, (0.0, 0.0))
    }

    fn straight_path(from_x: f64, n: usize) -> NavPath {
        let mut path = NavPath::new(0.5, 0.5);
        let points: Vec<PathPoint> = (0..n)
            .map(|i| PathPoint::new(Pose2D::new(from_x + i as f64 * 0.05, 5.0, 0.0)))
            .collect();
        path.set_grid_path(points);
        path
    }

    #[test]
    fn test_drives_forward_on_path() {
        let mut lp = planner();
        let map = open_map();
        let path = straight_path(2.0, 40);
        let pose = Pose2D::new(2.0, 5.0, 0.0);

        let twist = lp
            .compute_velocity(
                PlannerKind::Lookahead,
                &map,
                &pose,
                &Twist::new(0.2, 0.0, 0.0),
                &path,
                1.0,
            )
            .unwrap();
        assert!(twist.linear_x > 0.0);
        assert!(!lp.is_goal_reached());
    }

    #[test]
    fn test_goal_reached_after_rotation() {
        let mut lp = planner();
        let map = open_map();
        let path = straight_path(2.0, 4);
        let goal = path.back().unwrap().pose;

        // at goal position and heading while stopped: reached immediately
        let pose = Pose2D::new(goal.x, goal.y, goal.theta);
        let twist = lp
            .compute_velocity(PlannerKind::Trajectory, &map, &pose, &Twist::ZERO, &path, 1.0)
            .unwrap();
        assert_eq!(twist, Twist::ZERO);
        assert!(lp.is_goal_reached());
    }

    #[test]
    fn test_goal_position_rotates_to_heading() {
        let mut lp = planner();
        let map = open_map();
        let path = straight_path(2.0, 4);
        let goal = path.back().unwrap().pose;

        // at goal position but facing the wrong way, already stopped
        let pose = Pose2D::new(goal.x, goal.y, goal.theta + FRAC_PI_2);
        let twist = lp
            .compute_velocity(PlannerKind::Trajectory, &map, &pose, &Twist::ZERO, &path, 1.0)
            .unwrap();
        assert!(twist.linear_x.abs() < 1e-9);
        assert!(twist.angular_z.abs() > 0.0);
        assert!(lp.is_rotating_to_goal());
        assert!(lp.is_goal_xy_latched());
    }

    #[test]
    fn test_goal_position_stops_before_rotating() {
        let mut lp = planner();
        let map = open_map();
        let path = straight_path(2.0, 4);
        let goal = path.back().unwrap().pose;

        // arriving fast: decelerate first, do not rotate yet
        let pose = Pose2D::new(goal.x, goal.y, goal.theta + FRAC_PI_2);
        let twist = lp
            .compute_velocity(
                PlannerKind::Trajectory,
                &map,
                &pose,
                &Twist::new(0.5, 0.0, 0.0),
                &path,
                1.0,
            )
            .unwrap();
        assert!(twist.linear_x < 0.5);
        assert!(twist.angular_z.abs() < 1e-9);
        assert!(!lp.is_rotating_to_goal());
    }

    #[test]
    fn test_corner_rotates_before_translation() {
        let mut lp = planner();
        let map = open_map();

        let mut points: Vec<PathPoint> = (0..40)
            .map(|i| PathPoint::new(Pose2D::new(2.0, 5.0 + i as f64 * 0.05, FRAC_PI_2)))
            .collect();
        points[0].corner = crate::path::CornerInfo::explicit(FRAC_PI_2, 1);
        let mut path = NavPath::new(0.5, 0.5);
        path.set_lattice_path(points);

        // facing +x, must rotate to +y before moving
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let twist = lp
            .compute_velocity(PlannerKind::Trajectory, &map, &pose, &Twist::ZERO, &path, 1.0)
            .unwrap();
        assert!(twist.linear_x.abs() < 1e-9);
        assert!(twist.angular_z > 0.0, "corner demands left rotation");
    }

    #[test]
    fn test_rotate_direction_memory_survives_overshoot() {
        let mut lp = planner();
        let map = open_map();
        let pose = Pose2D::new(5.0, 5.0, 0.0);

        // start rotating left toward +pi/2
        let t = lp
            .rotate_to_goal(&map, &pose, &Twist::ZERO, FRAC_PI_2, 1)
            .unwrap();
        assert!(t.angular_z > 0.0);

        // slight overshoot: remembered direction keeps rotation left
        let over = Pose2D::new(5.0, 5.0, FRAC_PI_2 + 0.05);
        let t = lp.rotate_to_goal(&map, &over, &Twist::ZERO, FRAC_PI_2, 1);
        // near the target the command may ease off but must not reverse hard
        if let Some(t) = t {
            assert!(t.angular_z.abs() <= lp.cfg.max_vel_theta + 1e-9);
        }
    }

    #[test]
    fn test_forced_long_way_rotation() {
        let mut lp = planner();
        let map = open_map();
        let pose = Pose2D::new(5.0, 5.0, 0.0);

        // shortest way to -0.5 is clockwise; forcing direction +1 must go
        // counter-clockwise the long way
        let t = lp.rotate_to_goal(&map, &pose, &Twist::ZERO, -0.5, 1).unwrap();
        assert!(t.angular_z > 0.0);
    }

    #[test]
    fn test_cmd_vel_ratio_scales_linear() {
        let mut lp = planner();
        let map = open_map();
        let path = straight_path(2.0, 200);
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let vel = Twist::new(0.3, 0.0, 0.0);

        let full = lp
            .compute_velocity(PlannerKind::Lookahead, &map, &pose, &vel, &path, 1.0)
            .unwrap();
        lp.reset();
        let half = lp
            .compute_velocity(PlannerKind::Lookahead, &map, &pose, &vel, &path, 0.5)
            .unwrap();
        assert!(half.linear_x < full.linear_x);
    }

    #[test]
    fn test_stop_with_acc_limits_decelerates() {
        let lp = planner();
        let map = open_map();
        let pose = Pose2D::new(5.0, 5.0, 0.0);
        let vel = Twist::new(0.5, 0.0, 0.0);

        let t = lp.stop_with_acc_limits(&map, &pose, &vel).unwrap();
        assert!(t.linear_x < 0.5 && t.linear_x >= 0.0);
        assert!(t.angular_z.abs() < 1e-9);
    }

    #[test]
    fn test_rotation_wraps_half_turn() {
        let mut lp = planner();
        let map = open_map();
        // facing -x, goal heading +x: either direction is a half turn
        let pose = Pose2D::new(5.0, 5.0, PI);
        let t = lp.rotate_to_goal(&map, &pose, &Twist::ZERO, 0.0, 0).unwrap();
        assert!(t.angular_z.abs() > 0.0);
    }
}
