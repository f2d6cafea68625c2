//! End-to-End Navigation Scenarios
//!
//! Synthetic-world tests: a simulated robot integrates every published
//! twist into its pose, the costmap is a plain in-memory grid, and all
//! hardware seams are stubbed. Each scenario drives the full stack
//! (supervisor + planner worker + local controller) to a terminal outcome.
//!
//! Run with: `cargo test --test navigation`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::{Mutex, RwLock};

use marga_nav::config::NavConfig;
use marga_nav::costmap::Costmap;
use marga_nav::geometry::{Pose2D, Twist};
use marga_nav::interfaces::{
    LocalizationSource, NavContext, NavEvent, NavGoal, NavStatus, PoseSource, ProtectorSource,
    RotateService, VelocitySink,
};
use marga_nav::supervisor::{NavOutcome, NavSupervisor};

// ============================================================================
// Harness
// ============================================================================

struct SimState {
    pose: Pose2D,
    vel: Twist,
    /// Wheels slip: commands are accepted but the pose never moves
    frozen: bool,
}

/// Simulated robot: pose source + velocity sink in one.
struct SimRobot {
    state: Mutex<SimState>,
    /// Integration step per published command (seconds)
    dt: f64,
}

impl SimRobot {
    fn new(start: Pose2D, dt: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                pose: start,
                vel: Twist::ZERO,
                frozen: false,
            }),
            dt,
        })
    }

    fn current_pose(&self) -> Pose2D {
        self.state.lock().pose
    }

    fn freeze(&self) {
        self.state.lock().frozen = true;
    }
}

impl PoseSource for SimRobot {
    fn pose(&self) -> Option<Pose2D> {
        Some(self.state.lock().pose)
    }

    fn velocity(&self) -> Twist {
        self.state.lock().vel
    }
}

impl VelocitySink for SimRobot {
    fn publish(&self, twist: Twist) {
        let mut state = self.state.lock();
        state.vel = twist;
        if state.frozen {
            return;
        }
        let theta = state.pose.theta;
        state.pose.x += twist.linear_x * theta.cos() * self.dt;
        state.pose.y += twist.linear_x * theta.sin() * self.dt;
        state.pose.theta =
            marga_nav::geometry::normalize_angle(theta + twist.angular_z * self.dt);
    }
}

struct SimLocalization(AtomicBool);

impl LocalizationSource for SimLocalization {
    fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct SimProtector(AtomicU32);

impl ProtectorSource for SimProtector {
    fn status(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Rotation service that reports finishing instantly.
struct SimRotate;

impl RotateService for SimRotate {
    fn start_rotate(&self) {}
    fn stop_rotate(&self) {}
    fn rotate_finished(&self) -> bool {
        true
    }
}

struct World {
    robot: Arc<SimRobot>,
    localization: Arc<SimLocalization>,
    #[allow(dead_code)]
    protector: Arc<SimProtector>,
    costmap: Arc<RwLock<Costmap>>,
    events: Receiver<NavEvent>,
    ctx: NavContext,
    cfg: NavConfig,
}

/// 10m x 10m free world at 0.05m resolution with a fast supervisor clock.
fn build_world(start: Pose2D) -> World {
    let cfg = test_config();
    let robot = SimRobot::new(start, cfg.control_period());
    let localization = Arc::new(SimLocalization(AtomicBool::new(true)));
    let protector = Arc::new(SimProtector(AtomicU32::new(0)));

    let costmap = Arc::new(RwLock::new(Costmap::new_world(200, 200, 0.05, (0.0, 0.0))));
    let static_costmap = Arc::new(RwLock::new(Costmap::new_world(200, 200, 0.05, (0.0, 0.0))));

    let (tx, rx) = unbounded();
    let ctx = NavContext {
        pose_source: robot.clone(),
        vel_sink: robot.clone(),
        localization: localization.clone(),
        protector: protector.clone(),
        rotate_service: Arc::new(SimRotate),
        curve_generator: None,
        costmap: costmap.clone(),
        static_costmap,
        costmap_current: Arc::new(AtomicBool::new(true)),
        events: tx,
    };

    World {
        robot,
        localization,
        protector,
        costmap,
        events: rx,
        ctx,
        cfg,
    }
}

fn test_config() -> NavConfig {
    let toml_str = r#"
        [controller]
        controller_frequency = 20.0
        planner_frequency = 0.0
        planner_patience = 3.0
        controller_patience = 3.0
        oscillation_timeout = 10.0
        oscillation_distance = 0.3
        stop_duration = 0.5
        localization_duration = 0.3
        goal_safe_check_duration = 0.5

        [planner]
        allocated_time = 1.0
        initial_epsilon = 3.0
        map_size = 120
        sbpl_max_distance = 4.5
        fixpattern_footprint_padding = 0.0

        [safety]
        front_safe_check_dis = 2.0

        [local_planner]
        max_vel_x = 0.5
        sim_time = 1.5
        xy_goal_tolerance = 0.15
        yaw_goal_tolerance = 0.15

        [footprint]
        footprint = [[0.1, 0.08], [0.1, -0.08], [-0.08, -0.08], [-0.08, 0.08]]
        circle_center = [[0.0, 0.0]]
        backward_center_points = [[-0.1, 0.0], [-0.25, 0.0]]
        footprint_center_points = [[0.0, 0.0], [0.1, 0.0]]
    "#;
    let cfg: NavConfig = toml::from_str(toml_str).unwrap();
    cfg.validate().unwrap();
    cfg
}

/// Run a goal to completion on a background thread with a wall-clock bound.
fn run_goal(world: &World, goal: NavGoal, timeout: Duration) -> NavOutcome {
    let mut supervisor = NavSupervisor::new(world.cfg.clone(), world.ctx.clone());
    let cancel = supervisor.cancel_handle();

    let (done_tx, done_rx) = unbounded();
    let handle = std::thread::spawn(move || {
        let outcome = supervisor.execute(goal);
        let _ = done_tx.send(outcome);
        supervisor.shutdown();
        outcome
    });

    match done_rx.recv_timeout(timeout) {
        Ok(outcome) => {
            let _ = handle.join();
            outcome
        }
        Err(_) => {
            cancel.cancel();
            let _ = handle.join();
            panic!("navigation did not terminate within {timeout:?}");
        }
    }
}

fn drain_statuses(events: &Receiver<NavEvent>) -> Vec<NavStatus> {
    events
        .try_iter()
        .filter_map(|e| match e {
            NavEvent::Status(s) => Some(s),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_straight_line_short_goal() {
    let world = build_world(Pose2D::new(2.0, 2.0, 0.0));
    let goal = NavGoal::new(Pose2D::new(2.2, 2.0, 0.0));

    let outcome = run_goal(&world, goal, Duration::from_secs(30));
    assert_eq!(outcome, NavOutcome::Reached);

    let pose = world.robot.current_pose();
    assert!(
        pose.distance_to(&goal.pose) < 0.25,
        "robot ended at ({:.2}, {:.2})",
        pose.x,
        pose.y
    );

    let statuses = drain_statuses(&world.events);
    assert!(statuses.contains(&NavStatus::GoalReached));
}

#[test]
fn test_medium_goal_reaches() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    let goal = NavGoal::new(Pose2D::new(4.0, 2.0, 0.0));

    let outcome = run_goal(&world, goal, Duration::from_secs(90));
    assert_eq!(outcome, NavOutcome::Reached);

    let statuses = drain_statuses(&world.events);
    assert!(statuses.contains(&NavStatus::GoalPlanning));
    assert!(statuses.contains(&NavStatus::GoalHeading));
    assert!(statuses.contains(&NavStatus::GoalReached));
}

#[test]
fn test_obstacle_inserted_mid_path() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    let goal = NavGoal::new(Pose2D::new(4.5, 2.0, 0.0));

    // stamp a lethal block across the corridor once the robot is underway
    let costmap = world.costmap.clone();
    let robot = world.robot.clone();
    let stamped = Arc::new(AtomicBool::new(false));
    let stamped_flag = stamped.clone();
    std::thread::spawn(move || {
        loop {
            std::thread::sleep(Duration::from_millis(50));
            if robot.current_pose().x > 1.8 {
                costmap.write().stamp_lethal_rect(2.9, 1.6, 3.3, 2.4);
                stamped_flag.store(true, Ordering::Release);
                break;
            }
        }
    });

    let outcome = run_goal(&world, goal, Duration::from_secs(120));
    assert!(stamped.load(Ordering::Acquire), "obstacle was never stamped");
    assert_eq!(outcome, NavOutcome::Reached);

    // the detour must have left the original straight line
    let pose = world.robot.current_pose();
    assert!(pose.distance_to(&goal.pose) < 0.3);
}

#[test]
fn test_unreachable_goal_rejected_before_planning() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    // wall the goal in on both maps
    world.costmap.write().stamp_lethal_rect(4.3, 1.8, 4.8, 2.3);
    world
        .ctx
        .static_costmap
        .write()
        .stamp_lethal_rect(4.3, 1.8, 4.8, 2.3);

    let goal = NavGoal::new(Pose2D::new(4.5, 2.0, 0.0));
    let outcome = run_goal(&world, goal, Duration::from_secs(10));
    assert_eq!(outcome, NavOutcome::Unreachable);

    let statuses = drain_statuses(&world.events);
    assert!(statuses.contains(&NavStatus::GoalUnreachable));
    // rejection happens before any plan is produced
    assert!(!statuses.contains(&NavStatus::GoalHeading));
}

#[test]
fn test_lost_localization_terminates() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    let goal = NavGoal::new(Pose2D::new(4.0, 2.0, 0.0));

    // localization drops out shortly after the drive starts and never
    // returns; three recovery rotations then a terminal status
    let localization = world.localization.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(800));
        localization.0.store(false, Ordering::Release);
    });

    let outcome = run_goal(&world, goal, Duration::from_secs(60));
    assert_eq!(outcome, NavOutcome::LocationInvalid);

    let statuses = drain_statuses(&world.events);
    assert!(statuses.contains(&NavStatus::LocationInvalid));

    // velocity must be zeroed after the failure
    let vel = world.robot.state.lock().vel;
    assert!(vel.linear_x.abs() < 1e-9 && vel.angular_z.abs() < 1e-9);
}

#[test]
fn test_stuck_robot_escalates_to_unreachable() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    // wheels slip from the start: commands flow, pose never changes
    world.robot.freeze();

    // short oscillation window so the escalation chain runs quickly
    let mut cfg = world.cfg.clone();
    cfg.controller.oscillation_timeout = 0.5;
    let mut supervisor = NavSupervisor::new(cfg, world.ctx.clone());

    let goal = NavGoal::new(Pose2D::new(4.0, 2.0, 0.0));
    let (done_tx, done_rx) = unbounded();
    let cancel = supervisor.cancel_handle();
    std::thread::spawn(move || {
        let outcome = supervisor.execute(goal);
        let _ = done_tx.send(outcome);
        supervisor.shutdown();
    });

    match done_rx.recv_timeout(Duration::from_secs(90)) {
        Ok(outcome) => {
            assert_eq!(outcome, NavOutcome::Unreachable);
            let statuses = drain_statuses(&world.events);
            assert!(statuses.contains(&NavStatus::GoalUnreachable));
        }
        Err(_) => {
            cancel.cancel();
            panic!("stuck robot never escalated to a terminal status");
        }
    }
}

#[test]
fn test_corner_goal_rotates_in_place() {
    let world = build_world(Pose2D::new(2.2, 2.0, 0.0));
    // dead-end corridor: walls above, below and ahead leave no room for
    // arc primitives, so reversing course demands an in-place turn
    for map in [&world.costmap, &world.ctx.static_costmap] {
        let mut map = map.write();
        map.stamp_lethal_rect(0.8, 1.86, 2.7, 1.89);
        map.stamp_lethal_rect(0.8, 2.11, 2.7, 2.14);
        map.stamp_lethal_rect(2.55, 1.86, 2.65, 2.14);
    }
    let goal = NavGoal::new(Pose2D::new(1.2, 2.0, std::f64::consts::PI));

    // record whether a pure rotation was ever commanded
    let robot = world.robot.clone();
    let saw_pure_rotation = Arc::new(AtomicBool::new(false));
    let flag = saw_pure_rotation.clone();
    let watcher_done = Arc::new(AtomicBool::new(false));
    let done = watcher_done.clone();
    std::thread::spawn(move || {
        while !done.load(Ordering::Acquire) {
            let vel = robot.state.lock().vel;
            if vel.linear_x.abs() < 1e-6 && vel.angular_z.abs() > 0.05 {
                flag.store(true, Ordering::Release);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let outcome = run_goal(&world, goal, Duration::from_secs(120));
    watcher_done.store(true, Ordering::Release);

    assert_eq!(outcome, NavOutcome::Reached);
    assert!(
        saw_pure_rotation.load(Ordering::Acquire),
        "turning 90 degrees must involve in-place rotation"
    );

    let pose = world.robot.current_pose();
    assert!(
        marga_nav::geometry::shortest_angular_distance(pose.theta, goal.pose.theta).abs() < 0.3,
        "final heading {:.2}",
        pose.theta
    );
}

#[test]
fn test_cancellation_stops_quickly() {
    let world = build_world(Pose2D::new(1.0, 2.0, 0.0));
    let goal = NavGoal::new(Pose2D::new(4.0, 2.0, 0.0));

    let mut supervisor = NavSupervisor::new(world.cfg.clone(), world.ctx.clone());
    let cancel = supervisor.cancel_handle();

    let (done_tx, done_rx) = unbounded();
    std::thread::spawn(move || {
        let outcome = supervisor.execute(goal);
        let _ = done_tx.send(outcome);
        supervisor.shutdown();
    });

    std::thread::sleep(Duration::from_millis(500));
    cancel.cancel();

    let outcome = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cancellation must terminate execute promptly");
    assert_eq!(outcome, NavOutcome::Cancelled);

    // the final command is a full stop
    let vel = world.robot.state.lock().vel;
    assert!(vel.linear_x.abs() < 1e-9 && vel.angular_z.abs() < 1e-9);
}
