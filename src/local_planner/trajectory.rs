//! Rollout trajectory backend.
//!
//! Samples a grid of (v, w) candidates reachable under the acceleration
//! limits, simulates each forward and scores the survivors by path
//! adherence, local-goal progress and obstacle proximity.

use crate::config::LocalPlannerConfig;
use crate::costmap::Costmap;
use crate::footprint::circle_center_cost;
use crate::geometry::{Pose2D, Twist};
use crate::path::PathPoint;

/// Number of linear velocity samples per cycle.
const VX_SAMPLES: usize = 5;

pub struct TrajectoryPlanner {
    cfg: LocalPlannerConfig,
    circle_centers: Vec<[f64; 2]>,
    sim_period: f64,
}

impl TrajectoryPlanner {
    pub fn new(cfg: LocalPlannerConfig, circle_centers: Vec<[f64; 2]>, sim_period: f64) -> Self {
        Self {
            cfg,
            circle_centers,
            sim_period,
        }
    }

    /// Best velocity command for following `plan`, or `None` when every
    /// candidate's footprint collides.
    pub fn find_best(
        &self,
        map: &Costmap,
        pose: &Pose2D,
        vel: &Twist,
        plan: &[PathPoint],
        traj_vel: f64,
        highlight: f64,
    ) -> Option<Twist> {
        if plan.is_empty() {
            return None;
        }
        let local_goal = local_goal_point(plan, highlight.max(self.cfg.min_highlight_dis));

        // achievable velocity windows under the acceleration limits
        let max_v = (vel.linear_x + self.cfg.acc_lim_x * self.sim_period)
            .min(self.cfg.max_vel_x)
            .min(traj_vel);
        let min_v = (vel.linear_x - self.cfg.acc_lim_x * self.sim_period).max(0.0);
        let max_w = (vel.angular_z + self.cfg.acc_lim_theta * self.sim_period)
            .min(self.cfg.max_vel_theta);
        let min_w = (vel.angular_z - self.cfg.acc_lim_theta * self.sim_period)
            .max(self.cfg.min_vel_theta);

        let mut best: Option<(f64, Twist)> = None;
        for iv in 0..VX_SAMPLES {
            let v = if VX_SAMPLES > 1 {
                min_v + (max_v - min_v) * iv as f64 / (VX_SAMPLES - 1) as f64
            } else {
                max_v
            };
            let w_samples = self.cfg.vtheta_samples.max(2);
            for iw in 0..w_samples {
                let w = min_w + (max_w - min_w) * iw as f64 / (w_samples - 1) as f64;
                let Some(score) = self.score_candidate(map, pose, v, w, plan, &local_goal) else {
                    continue;
                };
                if best.is_none_or(|(c, _)| score < c) {
                    best = Some((score, Twist::new(v, 0.0, w)));
                }
            }
        }
        best.map(|(_, twist)| twist)
    }

    /// Simulate one candidate; `None` when its footprint collides.
    fn score_candidate(
        &self,
        map: &Costmap,
        pose: &Pose2D,
        v: f64,
        w: f64,
        plan: &[PathPoint],
        local_goal: &Pose2D,
    ) -> Option<f64> {
        let steps = (self.cfg.sim_time / self.cfg.sim_granularity).ceil() as usize;
        let dt = self.cfg.sim_time / steps as f64;

        let mut sim = *pose;
        let mut max_occ = 0.0_f64;
        for _ in 0..steps {
            sim.x += v * sim.theta.cos() * dt;
            sim.y += v * sim.theta.sin() * dt;
            sim.theta += w * dt;

            let occ = circle_center_cost(map, &sim, &self.circle_centers);
            if occ < 0.0 {
                return None;
            }
            max_occ = max_occ.max(occ);
        }

        let pdist = plan
            .iter()
            .take(100)
            .map(|p| p.pose.distance_to(&sim))
            .fold(f64::MAX, f64::min);
        let gdist = sim.distance_to(local_goal);

        Some(
            self.cfg.pdist_scale * pdist
                + self.cfg.gdist_scale * gdist
                + self.cfg.occdist_scale * max_occ,
        )
    }

    /// Whether a command keeps the footprint collision-free over the
    /// simulation horizon.
    pub fn check_trajectory(
        &self,
        map: &Costmap,
        pose: &Pose2D,
        v: f64,
        w: f64,
        sim_time: f64,
    ) -> bool {
        let steps = ((sim_time / self.cfg.sim_granularity).ceil() as usize).max(1);
        let dt = sim_time / steps as f64;
        let mut sim = *pose;
        for _ in 0..steps {
            sim.x += v * sim.theta.cos() * dt;
            sim.y += v * sim.theta.sin() * dt;
            sim.theta += w * dt;
            if circle_center_cost(map, &sim, &self.circle_centers) < 0.0 {
                return false;
            }
        }
        true
    }
}

/// Plan point at `lookahead` distance along the path (or the last point).
pub fn local_goal_point(plan: &[PathPoint], lookahead: f64) -> Pose2D {
    let mut acc = 0.0;
    for pair in plan.windows(2) {
        acc += pair[0].distance_to(&pair[1]);
        if acc >= lookahead {
            return pair[1].pose;
        }
    }
    plan.last().map(|p| p.pose).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costmap::costs;

    fn planner() -> TrajectoryPlanner {
        TrajectoryPlanner::new(
            LocalPlannerConfig::default(),
            vec![[0.1, 0.0], [-0.1, 0.0]],
            0.1,
        )
    }

    fn open_map() -> Costmap {
        Costmap::new_world(200, 200, 0.05, (0.0, 0.0))
    }

    fn straight_plan() -> Vec<PathPoint> {
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
    fn test_drives_along_straight_plan() {
        let map = open_map();
        let p = planner();
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let vel = Twist::new(0.2, 0.0, 0.0);

        let twist = p
            .find_best(&map, &pose, &vel, &straight_plan(), 0.5, 1.0)
            .unwrap();
        assert!(twist.linear_x > 0.0, "should keep moving forward");
        assert!(twist.angular_z.abs() < 0.3, "should stay roughly straight");
    }

    #[test]
    fn test_all_candidates_blocked() {
        let mut map = open_map();
        // lethal wall wrapping right in front of the robot
        for y in 0..200 {
            for x in 41..46 {
                map.set_cost(crate::geometry::CellCoord::new(x, y), costs::LETHAL);
            }
        }
        let p = planner();
        let pose = Pose2D::new(2.0, 5.0, 0.0);
        let vel = Twist::new(0.4, 0.0, 0.0);

        // at 0.4 m/s with 2s sim time every forward rollout hits the wall
        let twist = p.find_best(&map, &pose, &vel, &straight_plan(), 0.5, 1.0);
        if let Some(t) = twist {
            // only near-stationary candidates may survive
            assert!(t.linear_x < 0.15, "fast candidate through a wall: {t:?}");
        }
    }

    #[test]
    fn test_check_trajectory() {
        let mut map = open_map();
        map.stamp_lethal_rect(2.4, 4.8, 2.6, 5.2);
        let p = planner();
        let pose = Pose2D::new(2.0, 5.0, 0.0);

        assert!(!p.check_trajectory(&map, &pose, 0.4, 0.0, 2.0));
        assert!(p.check_trajectory(&map, &pose, 0.0, 0.5, 2.0));
    }

    #[test]
    fn test_local_goal_point() {
        let plan = straight_plan();
        let g = local_goal_point(&plan, 1.0);
        assert!((g.x - 3.0).abs() < 0.1);
        // lookahead beyond the plan returns the last point
        let g = local_goal_point(&plan, 50.0);
        assert!((g.x - plan.last().unwrap().pose.x).abs() < 1e-9);
    }
}
