//! Navigation supervisor: a single-threaded state machine clocked at the
//! controller frequency.
//!
//! Owns the goal lifecycle: wakes the planner worker, installs its paths,
//! runs the per-tick safety pipeline and the local controller, and walks the
//! recovery hierarchy when anything goes wrong. The supervisor is the sole
//! publisher of velocity commands.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::NavConfig;
use crate::footprint::{FootprintChecker, circle_center_cost, extended_centers, padded_polygon};
use crate::geometry::{Pose2D, Twist, shortest_angular_distance, sign};
use crate::interfaces::{GoalKind, NavContext, NavEvent, NavGoal, NavStatus};
use crate::local_planner::{LocalPlanner, PlannerKind};
use crate::path::NavPath;
use crate::shared::{PlanCell, PlanningState};
use crate::worker::PlannerWorker;

/// Supervisor states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NavState {
    /// Waiting for the worker to produce a path
    Planning,
    /// Driving the installed path
    Controlling,
    /// Dispatching a recovery behavior
    Clearing,
}

/// Which recovery the clearing state dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryTrigger {
    /// Planner starvation while waiting for a path
    PlannerTimeout,
    /// Back away from a close obstacle
    Backward,
    /// Local controller failed for too long
    LocalPlanner,
    /// Global planner needs room to succeed
    GlobalPlanner,
    /// No displacement for too long
    Oscillation,
    /// Localization reported invalid
    Location,
    /// Pick a fresh intermediate goal and replan
    GetNewGoal,
}

/// Terminal result of a goal execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavOutcome {
    Reached,
    Unreached,
    Unreachable,
    LocationInvalid,
    Cancelled,
}

/// Handle for cancelling an executing goal from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    cell: Arc<PlanCell>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cell.set_run_flag(false);
        self.cell.notify();
    }
}

pub struct NavSupervisor {
    cfg: NavConfig,
    ctx: NavContext,
    cell: Arc<PlanCell>,
    worker: Option<JoinHandle<()>>,
    checker: FootprintChecker,
    local_planner: LocalPlanner,
    planner_kind: PlannerKind,

    state: NavState,
    recovery_trigger: RecoveryTrigger,
    outcome: Option<NavOutcome>,

    global_goal: Pose2D,

    // timing
    last_valid_plan: Instant,
    last_valid_control: Instant,
    last_oscillation_reset: Instant,
    oscillation_pose: Pose2D,
    front_stop_since: Option<Instant>,

    // counters driving the recovery caps
    planner_timeout_count: u32,
    local_planner_error_count: u32,
    local_planner_timeout_count: u32,
    rotate_failure_times: u32,
    try_recovery_times: u32,
    front_slowdown_ticks: u32,
    front_safe_resume_count: u32,
    origin_path_safe_count: u32,

    cmd_vel_ratio: f64,
    last_valid_cmd_vel: Twist,
    /// Skip pruning on the first tick after a path install
    first_control_tick: bool,
}

impl NavSupervisor {
    /// Build the supervisor and spawn its planner worker.
    pub fn new(cfg: NavConfig, ctx: NavContext) -> Self {
        let cell = Arc::new(PlanCell::new(
            cfg.local_planner.max_vel_x,
            cfg.local_planner.min_highlight_dis,
        ));
        let worker = PlannerWorker::spawn(cfg.clone(), ctx.clone(), Arc::clone(&cell));
        let checker = FootprintChecker::with_static_map(
            Arc::clone(&ctx.costmap),
            Arc::clone(&ctx.static_costmap),
        );
        let local_planner = LocalPlanner::new(
            cfg.local_planner.clone(),
            cfg.footprint.circle_center.clone(),
            cfg.control_period(),
        );
        let now = Instant::now();
        Self {
            cell,
            worker: Some(worker),
            checker,
            local_planner,
            planner_kind: PlannerKind::Trajectory,
            state: NavState::Planning,
            recovery_trigger: RecoveryTrigger::PlannerTimeout,
            outcome: None,
            global_goal: Pose2D::default(),
            last_valid_plan: now,
            last_valid_control: now,
            last_oscillation_reset: now,
            oscillation_pose: Pose2D::default(),
            front_stop_since: None,
            planner_timeout_count: 0,
            local_planner_error_count: 0,
            local_planner_timeout_count: 0,
            rotate_failure_times: 0,
            try_recovery_times: 0,
            front_slowdown_ticks: 0,
            front_safe_resume_count: 0,
            origin_path_safe_count: 0,
            cmd_vel_ratio: 1.0,
            last_valid_cmd_vel: Twist::ZERO,
            first_control_tick: true,
            cfg,
            ctx,
        }
    }

    /// Select the local planner backend.
    pub fn set_planner_kind(&mut self, kind: PlannerKind) {
        self.planner_kind = kind;
    }

    /// Handle for cancelling `execute` from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Stop the worker thread and drop the supervisor.
    pub fn shutdown(mut self) {
        self.cell.set_run_flag(false);
        self.cell.shutdown();
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            error!("planner thread panicked");
        }
    }

    /// True when the goal footprint is already in collision; such goals are
    /// rejected before any planning.
    pub fn is_goal_unreachable(&self, goal: &Pose2D) -> bool {
        let polygon = padded_polygon(
            &self.cfg.footprint.footprint,
            self.cfg.planner.fixpattern_footprint_padding,
        );
        self.checker.footprint_cost(goal, &polygon, false) < 0.0
    }

    /// Drive the robot to `goal`, blocking until a terminal outcome.
    pub fn execute(&mut self, goal: NavGoal) -> NavOutcome {
        let effective_goal = self.effective_goal(&goal);

        if self.is_goal_unreachable(&effective_goal) {
            warn!("goal footprint in collision, rejecting before planning");
            self.ctx.emit_status(NavStatus::GoalUnreachable);
            return NavOutcome::Unreachable;
        }

        self.reset_for_goal(effective_goal);
        self.cell
            .request_plan(effective_goal, PlanningState::InsertingNone);

        let period = Duration::from_secs_f64(self.cfg.control_period());
        loop {
            let tick_start = Instant::now();

            if !self.cell.run_flag() {
                return self.cancel();
            }

            match self.state {
                NavState::Planning => self.planning_tick(),
                NavState::Controlling => self.control_tick(),
                NavState::Clearing => self.clearing_tick(),
            }

            if let Some(outcome) = self.outcome {
                self.publish_zero_velocity();
                self.cell.lock().path.finish_path();
                self.cell.pause_planner();
                return outcome;
            }

            let elapsed = tick_start.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
        }
    }

    /// Charging goals shift the target along the goal heading and tighten
    /// both tolerances.
    fn effective_goal(&mut self, goal: &NavGoal) -> Pose2D {
        match goal.kind {
            GoalKind::Charging => {
                let inscribed = self.cfg.footprint.inscribed_radius();
                self.local_planner.set_goal_tolerances(0.05, 0.05);
                goal.pose.advanced(inscribed, goal.pose.theta)
            }
            _ => {
                self.local_planner.reset_goal_tolerances();
                goal.pose
            }
        }
    }

    fn reset_for_goal(&mut self, goal: Pose2D) {
        let now = Instant::now();
        self.global_goal = goal;
        self.state = NavState::Planning;
        self.recovery_trigger = RecoveryTrigger::PlannerTimeout;
        self.outcome = None;
        self.last_valid_plan = now;
        self.last_valid_control = now;
        self.last_oscillation_reset = now;
        self.oscillation_pose = self.ctx.pose_source.pose().unwrap_or_default();
        self.front_stop_since = None;
        self.planner_timeout_count = 0;
        self.local_planner_error_count = 0;
        self.local_planner_timeout_count = 0;
        self.rotate_failure_times = 0;
        self.try_recovery_times = 0;
        self.front_slowdown_ticks = 0;
        self.front_safe_resume_count = 0;
        self.origin_path_safe_count = 0;
        self.cmd_vel_ratio = 1.0;
        self.first_control_tick = true;
        self.local_planner.reset();
        self.cell.set_run_flag(true);
        {
            let mut guard = self.cell.lock();
            guard.path.finish_path();
            guard.switch_path = None;
            guard.planner_start = None;
            guard.new_plan_ready = false;
            guard.taken_global_goal = true;
        }
    }

    fn cancel(&mut self) -> NavOutcome {
        info!("navigation cancelled");
        self.publish_zero_velocity();
        {
            let mut guard = self.cell.lock();
            guard.path.finish_path();
            guard.run_planner = false;
        }
        self.cell.notify();
        NavOutcome::Cancelled
    }

    // ---- planning state ----

    fn planning_tick(&mut self) {
        if self.cell.take_new_plan_flag() {
            debug!("plan ready, switching to controlling");
            self.absorb_new_plan();
            return;
        }

        if self.last_valid_plan.elapsed().as_secs_f64() > self.cfg.controller.planner_patience {
            warn!("planner patience exceeded");
            self.planner_timeout_count += 1;
            self.publish_zero_velocity();
            self.state = NavState::Clearing;
            self.recovery_trigger = RecoveryTrigger::PlannerTimeout;
        }
    }

    fn absorb_new_plan(&mut self) {
        self.state = NavState::Controlling;
        self.local_planner.reset();
        self.first_control_tick = true;
        self.last_valid_plan = Instant::now();
        self.last_valid_control = Instant::now();
        self.cell.pause_planner();
    }

    // ---- controlling state ----

    fn control_tick(&mut self) {
        // 1. refresh pose, reset the oscillation window on real displacement
        let Some(pose) = self.ctx.pose_source.pose() else {
            warn!("no pose this tick");
            self.publish_zero_velocity();
            return;
        };
        if pose.distance_to(&self.oscillation_pose) >= self.cfg.controller.oscillation_distance {
            self.oscillation_pose = pose;
            self.last_oscillation_reset = Instant::now();
        }

        // 2. stale costmap: hold still and retry
        if !self.ctx.costmap_current.load(Ordering::Acquire) {
            warn!("costmap stale, holding");
            self.publish_zero_velocity();
            return;
        }

        // 3. absorb a freshly delivered plan
        if self.cell.take_new_plan_flag() {
            debug!("absorbing replanned path");
            self.local_planner.reset();
            self.first_control_tick = true;
            self.last_valid_plan = Instant::now();
            self.last_valid_control = Instant::now();
        }

        // 4. localization
        if !self.ctx.localization.is_valid() {
            warn!("localization invalid");
            self.publish_zero_velocity();
            self.state = NavState::Clearing;
            self.recovery_trigger = RecoveryTrigger::Location;
            return;
        }

        // 5. goal reached; an intermediate recovery goal hands back to the
        // global one instead of terminating
        if self.local_planner.is_goal_reached() {
            let took_global = self.cell.lock().taken_global_goal;
            if took_global {
                info!("goal reached at ({:.2}, {:.2})", pose.x, pose.y);
                self.ctx.emit_status(NavStatus::GoalReached);
                self.ctx.emit(NavEvent::GoalReachedPose(pose));
                self.outcome = Some(NavOutcome::Reached);
                return;
            }
            info!("intermediate goal reached, continuing toward the global goal");
            self.local_planner.reset();
            self.request_replan(PlanningState::InsertingNone, None);
            return;
        }

        // 6. adopt a stashed front path when it is clearly better
        self.maybe_switch_path(&pose);

        // 7. prune the path head to the robot
        if self.first_control_tick {
            self.first_control_tick = false;
        } else if !self.prune_installed_path(&pose) {
            warn!("robot off the installed path, replanning from the robot");
            self.publish_zero_velocity();
            self.request_replan(PlanningState::InsertingBegin, None);
            return;
        }

        // 8. oscillation
        if self.last_oscillation_reset.elapsed().as_secs_f64()
            > self.cfg.controller.oscillation_timeout
        {
            warn!("oscillation detected");
            self.publish_zero_velocity();
            self.last_oscillation_reset = Instant::now();
            self.state = NavState::Clearing;
            self.recovery_trigger = RecoveryTrigger::Oscillation;
            return;
        }

        // 9. protector
        if self.front_protector_tripped() {
            warn!("front protector tripped, backing up and replanning");
            self.publish_zero_velocity();
            self.backward_maneuver(&pose);
            self.request_replan(PlanningState::InsertingBegin, None);
            return;
        }

        // 10. front clearance ladder
        if !self.front_safety_ladder(&pose) {
            return;
        }

        // 11. local controller
        let twist = {
            let map = self.ctx.costmap.read();
            let guard = self.cell.lock();
            let path = guard.path.clone();
            drop(guard);
            let vel = self.ctx.pose_source.velocity();
            self.local_planner.compute_velocity(
                self.planner_kind,
                &map,
                &pose,
                &vel,
                &path,
                self.cmd_vel_ratio,
            )
        };

        match twist {
            Some(twist) => {
                self.local_planner_error_count = 0;
                self.last_valid_control = Instant::now();
                // 12. publish
                self.publish_velocity(twist);
                self.ctx.emit_status(NavStatus::GoalHeading);
            }
            None => {
                self.local_planner_error_count += 1;
                debug!(
                    "local controller failed ({} consecutive)",
                    self.local_planner_error_count
                );
                if self.local_planner_error_count > 3 {
                    self.decelerate_once();
                }
                if self.last_valid_control.elapsed().as_secs_f64()
                    > self.cfg.controller.controller_patience
                {
                    warn!("controller patience exceeded");
                    self.local_planner_timeout_count += 1;
                    self.publish_zero_velocity();
                    self.state = NavState::Clearing;
                    // backing away comes first; it escalates on its own
                    self.recovery_trigger = RecoveryTrigger::Backward;
                }
            }
        }
    }

    /// Adopt the staged switch path when it is shorter, safe, and consistent
    /// with the current heading.
    fn maybe_switch_path(&mut self, pose: &Pose2D) {
        let candidate = {
            let guard = self.cell.lock();
            guard.switch_path.clone()
        };
        let Some(candidate) = candidate else {
            return;
        };

        // bring the stashed path's head up to the robot before comparing
        let mut candidate = candidate;
        if !candidate.prune(
            *pose,
            self.cfg.safety.max_offroad_dis,
            self.cfg.safety.max_offroad_yaw,
            false,
        ) {
            return;
        }

        let installed_len = self.cell.lock().path.length();
        // safe margin: only switch for a clear win
        if candidate.length() >= installed_len - 0.30 {
            return;
        }
        let Some(front) = candidate.front() else {
            return;
        };
        let (dis_th, yaw_th) = if front.is_corner() {
            (
                self.cfg.planner.switch_corner_dis_diff,
                self.cfg.planner.switch_corner_yaw_diff,
            )
        } else {
            (
                self.cfg.planner.switch_normal_dis_diff,
                self.cfg.planner.switch_normal_yaw_diff,
            )
        };
        if pose.distance_to(&front.pose) > dis_th
            || shortest_angular_distance(pose.theta, front.pose.theta).abs() > yaw_th
        {
            return;
        }
        if !self.path_front_safe(&candidate, self.cfg.safety.front_safe_check_dis) {
            self.origin_path_safe_count = 0;
            return;
        }
        // hysteresis: require the candidate safe on consecutive ticks
        self.origin_path_safe_count += 1;
        if self.origin_path_safe_count < 2 {
            return;
        }

        info!(
            "switching to staged path ({:.2}m vs {:.2}m)",
            candidate.length(),
            installed_len
        );
        let mut guard = self.cell.lock();
        guard.path = candidate;
        guard.switch_path = None;
        drop(guard);
        self.origin_path_safe_count = 0;
        self.local_planner.reset();
        self.first_control_tick = true;
    }

    fn prune_installed_path(&mut self, pose: &Pose2D) -> bool {
        let mut guard = self.cell.lock();
        guard
            .path
            .prune_corner_on_start(*pose, self.cfg.local_planner.yaw_goal_tolerance.max(0.1));
        guard.path.prune(
            *pose,
            self.cfg.safety.max_offroad_dis,
            self.cfg.safety.max_offroad_yaw,
            true,
        )
    }

    fn front_protector_tripped(&self) -> bool {
        let status = self.ctx.protector.status();
        self.cfg
            .safety
            .front_protector_list
            .iter()
            .any(|bit| status & (1 << bit) != 0)
    }

    /// Clearance ladder along the installed path. Returns false when the
    /// tick is consumed by a safety action.
    fn front_safety_ladder(&mut self, pose: &Pose2D) -> bool {
        let (path, goal_dis) = {
            let guard = self.cell.lock();
            (guard.path.clone(), pose.distance_to(&self.global_goal))
        };
        let clear = self.front_clear_distance(&path);

        // already stopped for clearance: resume only after two consecutive
        // clear checks
        if self.front_stop_since.is_some() {
            if clear > 0.6 {
                self.front_safe_resume_count += 1;
                if self.front_safe_resume_count < 2 {
                    self.publish_zero_velocity();
                    return false;
                }
                debug!("front clearance restored, resuming");
                self.front_stop_since = None;
                self.front_safe_resume_count = 0;
            } else {
                self.front_safe_resume_count = 0;
                self.publish_zero_velocity();
                let since = self.front_stop_since.unwrap();
                if since.elapsed().as_secs_f64() > self.cfg.controller.stop_duration {
                    warn!("path still blocked after stop, replanning around");
                    self.front_stop_since = None;
                    self.trigger_middle_replan(pose);
                }
                return false;
            }
        }

        if clear >= self.cfg.safety.front_safe_check_dis {
            self.cmd_vel_ratio = 1.0;
            self.front_slowdown_ticks = 0;
            return true;
        }

        if clear < 0.35 && goal_dis <= self.cfg.safety.goal_safe_check_dis + 0.35 {
            // obstruction sits on the goal itself: wait, then give up
            warn!("goal blocked at {:.2}m, re-checking", clear);
            self.ctx.emit_status(NavStatus::GoalNotSafe);
            self.publish_vel_with_acc(self.cfg.controller.stop_to_zero_acc);
            if self.wait_goal_safe() {
                return true;
            }
            self.ctx.emit_status(NavStatus::GoalUnreached);
            self.outcome = Some(NavOutcome::Unreached);
            return false;
        }

        if clear <= 0.6 {
            self.ctx.emit_status(NavStatus::PathNotSafe);
            self.publish_zero_velocity();
            self.front_stop_since = Some(Instant::now());
            self.front_safe_resume_count = 0;
            return false;
        }

        if clear <= 1.0 {
            self.cmd_vel_ratio = 0.5;
        } else if clear <= 1.7 {
            self.cmd_vel_ratio = 0.7;
            self.front_slowdown_ticks += 1;
            if self.front_slowdown_ticks >= 10 && clear < 1.5 {
                debug!("persistent slowdown, replanning mid-path");
                self.front_slowdown_ticks = 0;
                self.trigger_middle_replan(pose);
            }
        }
        true
    }

    /// Clear distance along the path before the first unsafe point.
    fn front_clear_distance(&self, path: &NavPath) -> f64 {
        let centers = extended_centers(
            &self.cfg.footprint.circle_center,
            self.cfg.planner.recovery_footprint_extend_x,
            self.cfg.planner.recovery_footprint_extend_y,
        );
        let map = self.ctx.costmap.read();
        let mut acc = 0.0;
        let points = path.points();
        for pair in points.windows(2) {
            if circle_center_cost(&map, &pair[0].pose, &centers) < 0.0 {
                return acc;
            }
            acc += pair[0].distance_to(&pair[1]);
            if acc >= self.cfg.safety.front_safe_check_dis {
                break;
            }
        }
        self.cfg.safety.front_safe_check_dis
    }

    fn path_front_safe(&self, path: &NavPath, check_dis: f64) -> bool {
        self.front_clear_distance(path) >= check_dis.min(self.cfg.safety.front_safe_check_dis)
    }

    /// Bounded wait re-checking the goal footprint.
    fn wait_goal_safe(&self) -> bool {
        let polygon = padded_polygon(
            &self.cfg.footprint.footprint,
            self.cfg.planner.fixpattern_footprint_padding,
        );
        let deadline = Instant::now()
            + Duration::from_secs_f64(self.cfg.controller.goal_safe_check_duration);
        while Instant::now() < deadline && self.cell.run_flag() {
            if self
                .checker
                .footprint_cost(&self.global_goal, &polygon, false)
                >= 0.0
            {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        false
    }

    /// Ask the worker for a detour spliced into the middle of the path,
    /// stashing the obstructed original so it can be switched back to.
    fn trigger_middle_replan(&mut self, pose: &Pose2D) {
        let anchor = self.get_safe_goal(pose, 0.0, 0.0, 0);
        let mut guard = self.cell.lock();
        if guard.switch_path.is_none() {
            guard.switch_path = Some(guard.path.clone());
        }
        guard.planner_start = Some(*pose);
        guard.planning_state = PlanningState::InsertingMiddle;
        // the spliced path still ends at the global goal
        guard.goal = anchor.or(Some(self.global_goal));
        guard.run_planner = true;
        drop(guard);
        self.cell.notify();
    }

    fn request_replan(&mut self, planning_state: PlanningState, goal: Option<Pose2D>) {
        let goal = goal.unwrap_or(self.global_goal);
        {
            let mut guard = self.cell.lock();
            guard.goal = Some(goal);
            guard.planning_state = planning_state;
            guard.taken_global_goal = goal.distance_to(&self.global_goal) < 1e-6;
            guard.run_planner = true;
        }
        self.cell.notify();
        self.state = NavState::Planning;
        self.last_valid_plan = Instant::now();
    }

    // ---- clearing state ----

    fn clearing_tick(&mut self) {
        debug!("clearing with trigger {:?}", self.recovery_trigger);
        match self.recovery_trigger {
            RecoveryTrigger::Location => self.location_recovery(),
            RecoveryTrigger::Oscillation => self.oscillation_recovery(),
            RecoveryTrigger::Backward => self.backward_recovery(),
            RecoveryTrigger::LocalPlanner => self.local_planner_recovery(),
            RecoveryTrigger::PlannerTimeout | RecoveryTrigger::GlobalPlanner => {
                self.global_planner_recovery()
            }
            RecoveryTrigger::GetNewGoal => self.get_new_goal_recovery(),
        }
    }

    /// Rotate in place via the hardware service until localization returns.
    fn location_recovery(&mut self) {
        self.publish_zero_velocity();
        self.ctx.rotate_service.start_rotate();
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.cfg.controller.localization_duration);
        while Instant::now() < deadline && self.cell.run_flag() {
            if self.ctx.rotate_service.rotate_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        self.ctx.rotate_service.stop_rotate();

        if self.ctx.localization.is_valid() {
            info!("localization restored, picking a fresh goal");
            self.rotate_failure_times = 0;
            self.recovery_trigger = RecoveryTrigger::GetNewGoal;
            return;
        }
        self.rotate_failure_times += 1;
        if self.rotate_failure_times >= 3 {
            error!("localization never recovered");
            self.ctx.emit_status(NavStatus::LocationInvalid);
            self.outcome = Some(NavOutcome::LocationInvalid);
        }
    }

    fn oscillation_recovery(&mut self) {
        self.try_recovery_times += 1;
        self.publish_zero_velocity();
        if let Some(pose) = self.ctx.pose_source.pose() {
            self.oscillation_pose = pose;
        }
        self.last_oscillation_reset = Instant::now();
        self.recovery_trigger = RecoveryTrigger::GetNewGoal;
    }

    /// Back away when there is room, otherwise escalate.
    fn backward_recovery(&mut self) {
        let Some(pose) = self.ctx.pose_source.pose() else {
            return;
        };
        if self.backward_safe(&pose) {
            self.backward_maneuver(&pose);
            self.request_replan(PlanningState::InsertingBegin, None);
        } else {
            warn!("no room to back up");
            self.recovery_trigger = RecoveryTrigger::LocalPlanner;
        }
    }

    fn local_planner_recovery(&mut self) {
        if self.local_planner_timeout_count > 10 {
            error!("local controller starved beyond the cap");
            self.ctx.emit_status(NavStatus::GoalUnreachable);
            self.outcome = Some(NavOutcome::Unreachable);
            return;
        }
        if self.local_planner_timeout_count > 5 || self.local_planner_error_count > 7 {
            // the robot footprint is probably painted with stale obstacles
            if let Some(pose) = self.ctx.pose_source.pose() {
                let reach = self.cfg.footprint.circumscribed_radius()
                    + self.cfg.planner.fixpattern_footprint_padding;
                info!("clearing costmap under the footprint");
                let mut map = self.ctx.costmap.write();
                map.clear_rect(pose.x - reach, pose.y - reach, pose.x + reach, pose.y + reach);
            }
            self.local_planner_error_count = 0;
            self.state = NavState::Controlling;
            self.last_valid_control = Instant::now();
            return;
        }
        self.recovery_trigger = RecoveryTrigger::GlobalPlanner;
    }

    fn global_planner_recovery(&mut self) {
        if self.planner_timeout_count > 12 || self.try_recovery_times > 8 {
            error!("recovery attempts exhausted");
            self.ctx.emit_status(NavStatus::GoalUnreachable);
            self.outcome = Some(NavOutcome::Unreachable);
            return;
        }
        self.try_recovery_times += 1;

        let Some(pose) = self.ctx.pose_source.pose() else {
            return;
        };
        let footprint_cost = self.checker.circle_center_cost(
            &pose,
            &self.cfg.footprint.footprint_center_points,
            false,
        );
        if footprint_cost < 0.0 {
            if self.backward_safe(&pose) {
                info!("unsafe footprint, backing away");
                self.backward_maneuver(&pose);
            } else if let Some((yaw, escape_goal)) = self.checker.recovery_circle_cost(
                &pose,
                &self.cfg.footprint.footprint_center_points,
                self.cfg.safety.backward_check_dis,
            ) {
                info!("escaping toward free heading {:.2}", yaw);
                self.escape_maneuver(&pose, yaw, &escape_goal);
            } else {
                warn!("no escape heading found, retrying");
            }
        }

        self.recovery_trigger = RecoveryTrigger::GetNewGoal;
    }

    /// Select a safe intermediate goal on the path and replan toward it.
    fn get_new_goal_recovery(&mut self) {
        if self.try_recovery_times > 8 || self.planner_timeout_count > 12 {
            error!("recovery attempts exhausted");
            self.ctx.emit_status(NavStatus::GoalUnreachable);
            self.outcome = Some(NavOutcome::Unreachable);
            return;
        }
        let Some(pose) = self.ctx.pose_source.pose() else {
            return;
        };
        let goal = self.get_safe_goal(
            &pose,
            self.cfg.planner.recovery_footprint_extend_x,
            self.cfg.planner.recovery_footprint_extend_y,
            0,
        );
        match goal {
            Some(goal) => {
                info!("replanning toward safe goal ({:.2}, {:.2})", goal.x, goal.y);
                self.request_replan(PlanningState::InsertingNone, Some(goal));
            }
            None => {
                debug!("no safe goal found yet, retrying");
                self.try_recovery_times += 1;
                if self.try_recovery_times > 8 {
                    self.ctx.emit_status(NavStatus::GoalUnreachable);
                    self.outcome = Some(NavOutcome::Unreachable);
                }
            }
        }
    }

    /// Scan the installed path for the first point that is footprint-safe
    /// with clear space around it; up to four rounds with a shrinking
    /// forward-clearance requirement, falling back to the global goal.
    fn get_safe_goal(
        &self,
        pose: &Pose2D,
        extend_x: f64,
        extend_y: f64,
        begin_index: usize,
    ) -> Option<Pose2D> {
        let path = self.cell.lock().path.clone();
        let points = path.points();
        let centers = extended_centers(&self.cfg.footprint.circle_center, extend_x, extend_y);
        let map = self.ctx.costmap.read();

        for round in 0..4 {
            let dis_a = (self.cfg.safety.goal_safe_dis_a - 0.1 * round as f64).max(0.1);
            let dis_b = self.cfg.safety.goal_safe_dis_b;

            for (i, p) in points.iter().enumerate().skip(begin_index) {
                if p.pose.distance_to(pose) <= dis_a {
                    continue;
                }
                if circle_center_cost(&map, &p.pose, &centers) < 0.0 {
                    continue;
                }
                // clearance ahead and behind the candidate along the path
                let mut clear = true;
                let mut acc = 0.0;
                for pair in points[i..].windows(2) {
                    if acc > dis_a {
                        break;
                    }
                    if circle_center_cost(&map, &pair[0].pose, &centers) < 0.0 {
                        clear = false;
                        break;
                    }
                    acc += pair[0].distance_to(&pair[1]);
                }
                acc = 0.0;
                for j in (begin_index..i).rev() {
                    if !clear || acc > dis_b {
                        break;
                    }
                    if circle_center_cost(&map, &points[j].pose, &centers) < 0.0 {
                        clear = false;
                    }
                    acc += points[j].distance_to(&points[j + 1]);
                }
                if clear {
                    return Some(p.pose);
                }
            }
        }

        // last resort: the global goal itself when its footprint is free
        let polygon = padded_polygon(
            &self.cfg.footprint.footprint,
            self.cfg.planner.fixpattern_footprint_padding,
        );
        if crate::footprint::polygon_cost(&map, &self.global_goal, &polygon) >= 0.0 {
            return Some(self.global_goal);
        }
        None
    }

    // ---- maneuvers ----

    fn backward_safe(&self, pose: &Pose2D) -> bool {
        self.checker.circle_center_cost(
            pose,
            &self.cfg.footprint.backward_center_points,
            false,
        ) >= 0.0
    }

    /// Back up `backward_check_dis`, bounded, yielding to cancellation.
    fn backward_maneuver(&mut self, start: &Pose2D) {
        let target = self.cfg.safety.backward_check_dis;
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.cell.run_flag() && Instant::now() < deadline {
            let Some(pose) = self.ctx.pose_source.pose() else {
                break;
            };
            if pose.distance_to(start) >= target || !self.backward_safe(&pose) {
                break;
            }
            self.publish_velocity(Twist::new(-0.1, 0.0, 0.0));
            std::thread::sleep(Duration::from_millis(100));
        }
        self.publish_zero_velocity();
    }

    /// Rotate to a free heading, then translate toward the escape goal.
    fn escape_maneuver(&mut self, _start: &Pose2D, yaw: f64, escape_goal: &Pose2D) {
        let deadline = Instant::now() + Duration::from_secs(8);
        while self.cell.run_flag() && Instant::now() < deadline {
            let Some(pose) = self.ctx.pose_source.pose() else {
                break;
            };
            let diff = shortest_angular_distance(pose.theta, yaw);
            if diff.abs() <= 0.1 {
                break;
            }
            let speed = (diff.abs() * self.cfg.local_planner.rotate_to_goal_k)
                .clamp(
                    self.cfg.local_planner.min_in_place_rotational_vel,
                    self.cfg.local_planner.max_vel_theta,
                );
            self.publish_velocity(Twist::new(0.0, 0.0, sign(diff) * speed));
            std::thread::sleep(Duration::from_millis(100));
        }
        while self.cell.run_flag() && Instant::now() < deadline {
            let Some(pose) = self.ctx.pose_source.pose() else {
                break;
            };
            let ahead_clear = self.checker.circle_center_cost(
                &pose,
                &self.cfg.footprint.footprint_center_points,
                false,
            ) >= 0.0;
            if pose.distance_to(escape_goal) <= 0.05 || !ahead_clear {
                break;
            }
            self.publish_velocity(Twist::new(0.1, 0.0, 0.0));
            std::thread::sleep(Duration::from_millis(100));
        }
        self.publish_zero_velocity();
    }

    // ---- publishing ----

    fn publish_velocity(&mut self, twist: Twist) {
        self.ctx.vel_sink.publish(twist);
        self.last_valid_cmd_vel = twist;
    }

    fn publish_zero_velocity(&mut self) {
        if self.last_valid_cmd_vel.linear_x.abs() > 0.001
            || self.last_valid_cmd_vel.angular_z.abs() > 0.001
        {
            debug!("publishing zero velocity");
        }
        self.cmd_vel_ratio = 1.0;
        self.ctx.vel_sink.publish(Twist::ZERO);
        self.last_valid_cmd_vel = Twist::ZERO;
    }

    /// One deceleration step toward zero.
    fn decelerate_once(&mut self) {
        let v = self.last_valid_cmd_vel.linear_x;
        let next = if v.abs() <= self.cfg.controller.stop_to_zero_acc {
            0.0
        } else {
            v - sign(v) * self.cfg.controller.stop_to_zero_acc
        };
        self.publish_velocity(Twist::new(next, 0.0, 0.0));
    }

    /// Blocking deceleration to zero at 10 Hz, yielding to cancellation.
    fn publish_vel_with_acc(&mut self, vel_acc: f64) {
        let mut v = self.last_valid_cmd_vel.linear_x;
        while v.abs() > 0.001 && self.cell.run_flag() {
            v = if v.abs() - vel_acc < 0.05 {
                0.0
            } else {
                v - sign(v) * vel_acc
            };
            self.publish_velocity(Twist::new(v, 0.0, 0.0));
            std::thread::sleep(Duration::from_millis(100));
        }
        self.publish_zero_velocity();
    }
}
