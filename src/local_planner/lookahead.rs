//! Lookahead backend: pure pursuit on the installed path.
//!
//! Cheaper than the rollout backend. Picks the plan point one highlight
//! distance ahead and commands the circular arc passing through it; forward
//! speed follows a cosine taper on the heading error so the robot slows
//! while the arc is sharp and commits once it faces down the path. Nearly
//! reversed headings degenerate the arc, so those spin in place instead.

use crate::config::LocalPlannerConfig;
use crate::costmap::Costmap;
use crate::geometry::{Pose2D, Twist, shortest_angular_distance, sign};
use crate::path::PathPoint;

use super::trajectory::{TrajectoryPlanner, local_goal_point};

/// Heading error beyond which the arc degenerates into an in-place spin.
const SPIN_THRESHOLD: f64 = 2.2;

pub struct LookaheadPlanner {
    cfg: LocalPlannerConfig,
    sim_period: f64,
}

impl LookaheadPlanner {
    pub fn new(cfg: LocalPlannerConfig, sim_period: f64) -> Self {
        Self { cfg, sim_period }
    }

    /// Velocity command tracking the arc to the lookahead point, or `None`
    /// when the command fails the collision check.
    pub fn generate(
        &self,
        map: &Costmap,
        checker: &TrajectoryPlanner,
        pose: &Pose2D,
        vel: &Twist,
        plan: &[PathPoint],
        traj_vel: f64,
        highlight: f64,
    ) -> Option<Twist> {
        if plan.is_empty() {
            return None;
        }
        let target = local_goal_point(plan, highlight.max(self.cfg.min_highlight_dis));
        let lookahead = pose.distance_to(&target).max(0.05);

        let alpha = shortest_angular_distance(pose.theta, pose.direction_to(&target));
        // chord geometry: the arc through the lookahead point
        let curvature = 2.0 * alpha.sin() / lookahead;

        // cosine taper on the heading error, cubed so sharp arcs crawl
        let heading_taper = (0.5 + 0.5 * alpha.cos()).powi(3);
        // approach term keeps a margin of speed even right at the target
        let approach = 0.6 * lookahead + 0.05;
        let mut linear = traj_vel.min(self.cfg.max_vel_x).min(approach) * heading_taper;

        // honor the acceleration window around the current speed
        let max_step = self.cfg.acc_lim_x * self.sim_period;
        linear = linear.clamp((vel.linear_x - max_step).max(0.0), vel.linear_x + max_step);

        let mut angular =
            (linear * curvature).clamp(self.cfg.min_vel_theta, self.cfg.max_vel_theta);

        if alpha.abs() > SPIN_THRESHOLD {
            // facing the wrong way: turn on the spot toward the target
            linear = linear.min(0.04);
            angular = sign(alpha)
                * (0.7 * alpha.abs())
                    .clamp(self.cfg.min_in_place_rotational_vel, self.cfg.max_vel_theta);
        }

        if !checker.check_trajectory(map, pose, linear, angular, self.cfg.sim_time.min(1.0)) {
            return None;
        }
        Some(Twist::new(linear, 0.0, angular))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Costmap, TrajectoryPlanner, LookaheadPlanner) {
        let cfg = LocalPlannerConfig::default();
        let checker = TrajectoryPlanner::new(cfg.clone(), vec![[0.0, 0.0]], 0.1);
        let planner = LookaheadPlanner::new(cfg, 0.1);
        (Costmap::new_world(200, 200, 0.05, (0.0, 0.0)), checker, planner)
    }

    fn plan_along_x() -> Vec<PathPoint> {
        (0..40)
            .map(|i| {
                let mut p = PathPoint::new(Pose2D::new(2.0 + i as f64 * 0.05, 5.0, 0.0));
                p.max_vel = 0.5;
                p.highlight = 1.0;
                p
            })
            .collect()
    }

    #[test]
    fn test_steers_toward_path() {
        let (map, checker, planner) = setup();
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let vel = Twist::new(0.2, 0.0, 0.0);

        let twist = planner
            .generate(&map, &checker, &pose, &vel, &plan_along_x(), 0.5, 1.0)
            .unwrap();
        assert!(twist.linear_x > 0.0);
        assert!(twist.angular_z.abs() < 0.1);
    }

    #[test]
    fn test_turns_when_facing_away() {
        let (map, checker, planner) = setup();
        // facing +y while the path runs along +x
        let pose = Pose2D::new(2.0, 5.0, std::f64::consts::FRAC_PI_2);
        let vel = Twist::ZERO;

        let twist = planner
            .generate(&map, &checker, &pose, &vel, &plan_along_x(), 0.5, 1.0)
            .unwrap();
        assert!(twist.angular_z < 0.0, "must turn right toward the path");
        assert!(twist.linear_x < 0.2, "sharp heading error slows translation");
    }

    #[test]
    fn test_reversed_heading_spins_in_place() {
        let (map, checker, planner) = setup();
        // facing away from the path entirely
        let pose = Pose2D::new(2.0, 5.0, std::f64::consts::PI - 0.1);
        let vel = Twist::ZERO;

        let twist = planner
            .generate(&map, &checker, &pose, &vel, &plan_along_x(), 0.5, 1.0)
            .unwrap();
        assert!(twist.linear_x <= 0.04 + 1e-9);
        assert!(
            twist.angular_z.abs() >= planner.cfg.min_in_place_rotational_vel,
            "spin branch must command a real rotation"
        );
    }

    #[test]
    fn test_arc_bends_harder_when_closer() {
        let (map, checker, planner) = setup();
        // same heading error at two lookahead distances: the nearer target
        // demands the tighter arc
        let vel = Twist::new(0.2, 0.0, 0.0);
        let off_path = Pose2D::new(2.0, 5.0, 0.4);

        let near = planner
            .generate(&map, &checker, &off_path, &vel, &plan_along_x(), 0.5, 0.3)
            .unwrap();
        let far = planner
            .generate(&map, &checker, &off_path, &vel, &plan_along_x(), 0.5, 1.8)
            .unwrap();
        assert!(
            near.angular_z.abs() > far.angular_z.abs(),
            "near {near:?} vs far {far:?}"
        );
    }

    #[test]
    fn test_blocked_command_fails() {
        let (mut map, checker, planner) = setup();
        map.stamp_lethal_rect(2.1, 4.7, 2.5, 5.3);
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let vel = Twist::new(0.3, 0.0, 0.0);

        let twist = planner.generate(&map, &checker, &pose, &vel, &plan_along_x(), 0.5, 1.0);
        assert!(twist.is_none());
    }
}
