//! Planner worker thread.
//!
//! Sleeps on the plan cell's condition variable; each wake snapshots the
//! goal under the lock, releases it, runs one global planning cycle and
//! installs the result back through the cell. The variant is picked by
//! distance: trivial two-point paths for adjacent goals, the curve seam for
//! short hops, the lattice search inside its window, and the coarse grid
//! planner beyond it. The worker never publishes velocities.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::NavConfig;
use crate::costmap::window_origin;
use crate::footprint::circle_center_cost;
use crate::geometry::{Pose2D, shortest_angular_distance};
use crate::interfaces::{NavContext, NavEvent, NavStatus};
use crate::lattice::environment::{EnvironmentParams, LatticeEnvironment, LatticePoint};
use crate::lattice::primitives::PrimitiveParams;
use crate::lattice::search::RepairingSearch;
use crate::path::{CornerInfo, MIN_CORNER_RUN, NavPath, PathPoint};
use crate::planning::{GridPlanner, GridPlannerConfig};
use crate::shared::{PlanCell, PlanningState};

/// Consecutive failures tolerated before declaring the goal unreachable
/// while no initial plan exists.
const MAX_INITIAL_FAILURES: u32 = 4;

/// Distance below which the plan is just start and goal (meters).
const SHORT_PLAN_DIS: f64 = 0.25;
/// Distance below which the curve seam is preferred (meters).
const CURVE_PLAN_DIS: f64 = 2.0;

pub struct PlannerWorker {
    cfg: NavConfig,
    ctx: NavContext,
    cell: Arc<PlanCell>,

    env: LatticeEnvironment,
    search: RepairingSearch,
    grid_planner: GridPlanner,

    /// An initial plan for the current goal exists
    got_init_plan: bool,
    /// The previous short-range attempt used the curve seam
    last_used_curve: bool,
    consecutive_failures: u32,
    /// Plan against the static overlay (first attempt of a goal)
    using_static_costmap: bool,
    /// Goal of the previous cycle; a new goal resets the per-goal latches
    last_goal: Option<Pose2D>,
}

impl PlannerWorker {
    /// Spawn the worker thread.
    pub fn spawn(cfg: NavConfig, ctx: NavContext, cell: Arc<PlanCell>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("planner".into())
            .spawn(move || {
                let mut worker = PlannerWorker::new(cfg, ctx, cell);
                worker.run();
            })
            .expect("Failed to spawn planner thread")
    }

    fn new(cfg: NavConfig, ctx: NavContext, cell: Arc<PlanCell>) -> Self {
        let env = LatticeEnvironment::new(EnvironmentParams {
            map_size: cfg.planner.map_size,
            resolution: ctx.costmap.read().resolution(),
            lethal_cost: cfg.planner.lethal_cost,
            nominal_vel: cfg.planner.nominalvel_mpersecs,
            footprint: crate::footprint::padded_polygon(
                &cfg.footprint.footprint,
                cfg.planner.sbpl_footprint_padding,
            ),
            circle_centers: cfg.footprint.circle_center.clone(),
            primitives: PrimitiveParams {
                num_angles: 16,
                resolution: ctx.costmap.read().resolution(),
                nominal_vel: cfg.planner.nominalvel_mpersecs,
                time_to_turn_45: cfg.planner.timetoturn45degsinplace_secs,
                forward_cost_mult: cfg.planner.forward_cost_mult,
                forward_and_turn_cost_mult: cfg.planner.forward_and_turn_cost_mult,
                turn_in_place_cost_mult: cfg.planner.turn_in_place_cost_mult,
            },
        });
        let search = RepairingSearch::new(
            cfg.planner.initial_epsilon,
            cfg.planner.allocated_time,
            cfg.planner.force_scratch_limit,
        );
        let grid_planner = GridPlanner::new(GridPlannerConfig {
            sample_dis: cfg.planner.init_path_sample_dis,
            ..Default::default()
        });
        Self {
            cfg,
            ctx,
            cell,
            env,
            search,
            grid_planner,
            got_init_plan: false,
            last_used_curve: false,
            consecutive_failures: 0,
            using_static_costmap: false,
            last_goal: None,
        }
    }

    fn run(&mut self) {
        info!("planner thread started");
        loop {
            let (goal, planning_state, planner_start) = {
                let cell = Arc::clone(&self.cell);
                let mut guard = cell.lock();
                self.cell.wait_for_work(&mut guard);
                if guard.shutdown {
                    break;
                }
                (guard.goal, guard.planning_state, guard.planner_start.take())
            };

            let Some(goal) = goal else {
                self.cell.pause_planner();
                continue;
            };

            let cycle_start = Instant::now();
            self.plan_cycle(goal, planning_state, planner_start);

            // rate limit, yielding early on shutdown
            if self.cfg.controller.planner_frequency > 0.0 {
                let period = Duration::from_secs_f64(1.0 / self.cfg.controller.planner_frequency);
                while cycle_start.elapsed() < period {
                    if self.cell.lock().shutdown {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
        info!("planner thread exited");
    }

    fn plan_cycle(
        &mut self,
        goal: Pose2D,
        planning_state: PlanningState,
        planner_start: Option<Pose2D>,
    ) {
        // a new goal resets the per-goal latches
        if self
            .last_goal
            .is_none_or(|g| g.distance_to(&goal) > 1e-6 || (g.theta - goal.theta).abs() > 1e-6)
        {
            self.got_init_plan = false;
            self.consecutive_failures = 0;
            self.last_used_curve = false;
            self.last_goal = Some(goal);
        }

        // first attempt of a goal plans against the static map only
        self.using_static_costmap = !self.got_init_plan && self.consecutive_failures < 1;

        let Some(robot_pose) = self.ctx.pose_source.pose() else {
            error!("unable to get robot pose, cannot plan");
            self.record_failure();
            return;
        };

        let (start, planning_state) = match planning_state {
            PlanningState::InsertingMiddle => match planner_start {
                Some(anchor) => (anchor, planning_state),
                None => {
                    warn!("no downstream anchor for mid-path replan, splicing at the robot");
                    (robot_pose, PlanningState::InsertingBegin)
                }
            },
            _ => (robot_pose, planning_state),
        };

        if planning_state == PlanningState::InsertingNone {
            self.ctx.emit_status(NavStatus::GoalPlanning);
        }

        debug!(
            "planning cycle: start ({:.2}, {:.2}), goal ({:.2}, {:.2}), dis {:.2}",
            start.x,
            start.y,
            goal.x,
            goal.y,
            start.distance_to(&goal)
        );

        let mut result = self.make_plan(&start, &goal);
        if result.is_none() && self.last_used_curve {
            // curve attempt failed; replan directly with the next variant
            debug!("curve planner failed, replanning directly");
            result = self.make_plan(&start, &goal);
        }

        match result {
            Some(points) if !points.is_empty() => {
                self.got_init_plan = true;
                self.consecutive_failures = 0;
                self.install(points, &start, &goal, planning_state);
            }
            _ => {
                warn!("planning cycle failed");
                self.record_failure();
            }
        }
    }

    /// One planner-variant attempt. `None` means this attempt failed; the
    /// curve latch decides whether the caller retries with another variant.
    fn make_plan(&mut self, start: &Pose2D, goal: &Pose2D) -> Option<Vec<PathPoint>> {
        let dis = start.distance_to(goal);

        if dis <= SHORT_PLAN_DIS {
            self.last_used_curve = false;
            info!("goal {:.2}m away, taking start and goal as the plan", dis);
            let mut path = self.new_path();
            path.set_short_path(*start, *goal);
            return Some(path.points().to_vec());
        }

        if dis <= CURVE_PLAN_DIS && !self.last_used_curve {
            if let Some(generator) = self.ctx.curve_generator.clone() {
                info!("goal {:.2}m away, using the curve planner", dis);
                self.last_used_curve = true;
                let poses = generator.make_curve(start, goal)?;
                if poses.is_empty() {
                    return None;
                }
                let points: Vec<PathPoint> = poses.into_iter().map(PathPoint::new).collect();
                if !self.is_path_safe(&points) {
                    info!("curve path not safe, replanning directly");
                    return None;
                }
                return Some(points);
            }
        }

        if dis <= self.cfg.planner.sbpl_max_distance {
            self.last_used_curve = false;
            info!("goal {:.2}m away, using the lattice search", dis);
            return self.lattice_plan(start, goal);
        }

        if !self.cfg.planner.use_farther_planner {
            warn!("goal beyond lattice range and the far planner is disabled");
            return None;
        }
        self.last_used_curve = false;
        info!("goal {:.2}m away, using the coarse grid planner", dis);
        self.grid_plan(start, goal)
    }

    /// Run the lattice search inside a robot-centered window.
    fn lattice_plan(&mut self, start: &Pose2D, goal: &Pose2D) -> Option<Vec<PathPoint>> {
        let world = if self.using_static_costmap {
            Arc::clone(&self.ctx.static_costmap)
        } else {
            Arc::clone(&self.ctx.costmap)
        };

        let changed = {
            let world = world.read();
            let center = world.world_to_grid(start.x, start.y);
            let origin = window_origin(&world, center, self.cfg.planner.map_size);
            self.env.refresh_costs(&world, origin)
        };

        let (ox, oy) = self.env.grid().origin();
        let w_start = Pose2D::new(start.x - ox, start.y - oy, start.theta);
        let w_goal = Pose2D::new(goal.x - ox, goal.y - oy, goal.theta);

        let broader = self.consecutive_failures >= 2;
        match self.search.plan(&mut self.env, &w_start, &w_goal, broader, &changed) {
            Ok(points) => {
                let mut path = self.assemble_lattice_path(&points, (ox, oy));
                path.push(PathPoint::new(*goal));
                Some(path)
            }
            Err(e) => {
                error!("lattice search failed to find a plan: {}", e);
                None
            }
        }
    }

    /// Convert window-frame lattice points into world-frame path points,
    /// demoting corner runs too short to be real in-place turns.
    fn assemble_lattice_path(
        &self,
        points: &[LatticePoint],
        origin: (f64, f64),
    ) -> Vec<PathPoint> {
        let mut out: Vec<PathPoint> = Vec::with_capacity(points.len());
        let mut i = 0;
        while i < points.len() {
            if !points[i].is_corner {
                let mut p = PathPoint::new(Pose2D::new(
                    points[i].pose.x + origin.0,
                    points[i].pose.y + origin.1,
                    points[i].pose.theta,
                ));
                p.radius = points[i].radius;
                out.push(p);
                i += 1;
                continue;
            }

            // contiguous corner run
            let run_start = i;
            while i < points.len() && points[i].is_corner {
                i += 1;
            }
            let run = &points[run_start..i];
            let keep_corner = run.len() >= MIN_CORNER_RUN;
            let last = run.last().unwrap();
            for lp in run {
                let mut p = PathPoint::new(Pose2D::new(
                    lp.pose.x + origin.0,
                    lp.pose.y + origin.1,
                    lp.pose.theta,
                ));
                p.radius = lp.radius;
                if keep_corner {
                    p.corner = CornerInfo::explicit(last.theta_out, last.rotate_direction);
                }
                out.push(p);
            }
        }
        out
    }

    /// Coarse grid plan sampled into a fix path with headings.
    fn grid_plan(&mut self, start: &Pose2D, goal: &Pose2D) -> Option<Vec<PathPoint>> {
        let world = if self.using_static_costmap {
            Arc::clone(&self.ctx.static_costmap)
        } else {
            Arc::clone(&self.ctx.costmap)
        };
        let world = world.read();

        match self.grid_planner.plan(&world, *start, *goal) {
            Some(poses) => {
                let mut points: Vec<PathPoint> = poses.into_iter().map(PathPoint::new).collect();
                // sharp heading changes between samples become corners
                for i in 1..points.len() {
                    let diff = shortest_angular_distance(
                        points[i - 1].pose.theta,
                        points[i].pose.theta,
                    );
                    if diff.abs() > self.cfg.planner.init_path_sample_yaw * std::f64::consts::PI {
                        points[i].corner = CornerInfo::explicit(
                            points[i].pose.theta,
                            if diff > 0.0 { 1 } else { -1 },
                        );
                    }
                }
                Some(points)
            }
            None => {
                if let Some((ex, ey)) = self.grid_planner.extend_point() {
                    warn!(
                        "grid planner failed, closest approach ({:.2}, {:.2})",
                        ex, ey
                    );
                }
                None
            }
        }
    }

    /// Circle-center safety sweep over the head of a candidate path, with
    /// the centers widened laterally for fresh paths.
    fn is_path_safe(&self, points: &[PathPoint]) -> bool {
        let centers = crate::footprint::extended_centers(
            &self.cfg.footprint.circle_center,
            0.0,
            self.cfg.planner.init_path_circle_center_extend_y,
        );
        let world = self.ctx.costmap.read();
        let mut acc = 0.0;
        for pair in points.windows(2) {
            if circle_center_cost(&world, &pair[0].pose, &centers) < 0.0 {
                return false;
            }
            acc += pair[0].distance_to(&pair[1]);
            if acc > self.cfg.safety.front_safe_check_dis {
                break;
            }
        }
        true
    }

    /// Splice the fresh plan into the installed path under the lock.
    fn install(
        &mut self,
        points: Vec<PathPoint>,
        start: &Pose2D,
        goal: &Pose2D,
        planning_state: PlanningState,
    ) {
        let poses: Vec<Pose2D> = points.iter().map(|p| p.pose).collect();

        let mut guard = self.cell.lock();
        let spliced = match planning_state {
            PlanningState::InsertingNone => {
                let mut path = self.new_path();
                path.set_lattice_path(points);
                guard.path = path;
                true
            }
            PlanningState::InsertingBegin | PlanningState::InsertingLattice => {
                guard.path.insert_begin_path(points);
                true
            }
            PlanningState::InsertingEnd => {
                guard.path.insert_end_path(points);
                true
            }
            PlanningState::InsertingMiddle => guard.path.insert_middle_path(points, *start, *goal),
        };
        if !spliced {
            drop(guard);
            warn!("mid-path splice failed, keeping the installed path");
            self.record_failure();
            return;
        }
        guard.new_plan_ready = true;
        // one cycle per request; the supervisor re-arms when it needs more
        guard.run_planner = false;
        let installed_len = guard.path.len();
        drop(guard);

        info!("got plan with {} points installed", installed_len);
        self.ctx.emit(NavEvent::PlannedPath(poses));
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if !self.got_init_plan && self.consecutive_failures > MAX_INITIAL_FAILURES {
            error!(
                "no initial plan after {} attempts, goal unreachable",
                self.consecutive_failures
            );
            self.ctx.emit_status(NavStatus::GoalUnreachable);
            self.cell.set_run_flag(false);
            self.cell.pause_planner();
        }
    }

    fn new_path(&self) -> NavPath {
        NavPath::new(
            self.cfg.local_planner.max_vel_x,
            self.cfg.local_planner.min_highlight_dis,
        )
    }
}
