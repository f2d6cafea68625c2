//! The plan cell: all state shared between the supervisor and the planner
//! worker, guarded by a single mutex paired with one condition variable.
//!
//! Rule: hold the lock only to read or write these fields. Never hold it
//! across the lattice search, the local controller, or velocity publishing.
//! The cancellation flag lives beside the cell as an atomic so hot loops can
//! poll it without the lock.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::geometry::Pose2D;
use crate::path::NavPath;

/// How the worker splices its next result into the installed path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlanningState {
    /// Replace the installed path
    #[default]
    InsertingNone,
    /// Prepend a connecting segment at the robot
    InsertingBegin,
    /// Replace the tail toward a new goal
    InsertingEnd,
    /// Splice a detour between two anchors on the installed path
    InsertingMiddle,
    /// Lattice refinement pass over a coarse fix path
    InsertingLattice,
}

/// Fields guarded by the plan mutex.
#[derive(Debug)]
pub struct PlanInput {
    /// Worker should run a planning cycle
    pub run_planner: bool,
    /// Worker should exit
    pub shutdown: bool,
    /// Goal the worker plans toward
    pub goal: Option<Pose2D>,
    /// The last plan targeted the true global goal (not an intermediate)
    pub taken_global_goal: bool,
    pub planning_state: PlanningState,
    /// Set by the worker after installing a path; cleared by the supervisor
    pub new_plan_ready: bool,
    /// The installed path buffer
    pub path: NavPath,
    /// Staged alternative path considered for switching
    pub switch_path: Option<NavPath>,
    /// Downstream anchor for mid-path replans
    pub planner_start: Option<Pose2D>,
}

/// The single shared cell between supervisor and worker.
pub struct PlanCell {
    state: Mutex<PlanInput>,
    cond: Condvar,
    /// Global cancellation flag; false aborts every bounded wait
    run_flag: AtomicBool,
}

impl PlanCell {
    pub fn new(nominal_vel: f64, min_highlight: f64) -> Self {
        Self {
            state: Mutex::new(PlanInput {
                run_planner: false,
                shutdown: false,
                goal: None,
                taken_global_goal: false,
                planning_state: PlanningState::InsertingNone,
                new_plan_ready: false,
                path: NavPath::new(nominal_vel, min_highlight),
                switch_path: None,
                planner_start: None,
            }),
            cond: Condvar::new(),
            run_flag: AtomicBool::new(true),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PlanInput> {
        self.state.lock()
    }

    /// Block the worker until there is work or shutdown.
    pub fn wait_for_work(&self, guard: &mut MutexGuard<'_, PlanInput>) {
        while !guard.run_planner && !guard.shutdown {
            self.cond.wait(guard);
        }
    }

    pub fn notify(&self) {
        self.cond.notify_one();
    }

    /// Ask the worker for a planning cycle toward `goal`.
    pub fn request_plan(&self, goal: Pose2D, planning_state: PlanningState) {
        let mut guard = self.lock();
        guard.goal = Some(goal);
        guard.planning_state = planning_state;
        guard.run_planner = true;
        drop(guard);
        self.notify();
    }

    /// Stop asking for plans (does not cancel a cycle in flight).
    pub fn pause_planner(&self) {
        self.lock().run_planner = false;
    }

    /// Tell the worker to exit and wake it.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        guard.shutdown = true;
        guard.run_planner = true;
        drop(guard);
        self.cond.notify_all();
    }

    pub fn run_flag(&self) -> bool {
        self.run_flag.load(Ordering::Acquire)
    }

    /// Cancellation: every bounded wait polls this each iteration.
    pub fn set_run_flag(&self, value: bool) {
        self.run_flag.store(value, Ordering::Release);
    }

    /// Take the freshly planned path flag; returns whether a new plan was
    /// pending.
    pub fn take_new_plan_flag(&self) -> bool {
        let mut guard = self.lock();
        let was = guard.new_plan_ready;
        guard.new_plan_ready = false;
        was
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_request_plan_wakes_worker() {
        let cell = Arc::new(PlanCell::new(0.5, 0.5));
        let worker_cell = Arc::clone(&cell);

        let handle = std::thread::spawn(move || {
            let mut guard = worker_cell.lock();
            worker_cell.wait_for_work(&mut guard);
            guard.goal
        });

        std::thread::sleep(Duration::from_millis(20));
        cell.request_plan(crate::geometry::Pose2D::new(1.0, 2.0, 0.0), PlanningState::InsertingNone);

        let goal = handle.join().unwrap();
        assert!(goal.is_some());
        assert!((goal.unwrap().x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_shutdown_wakes_worker() {
        let cell = Arc::new(PlanCell::new(0.5, 0.5));
        let worker_cell = Arc::clone(&cell);

        let handle = std::thread::spawn(move || {
            let mut guard = worker_cell.lock();
            worker_cell.wait_for_work(&mut guard);
            guard.shutdown
        });

        std::thread::sleep(Duration::from_millis(20));
        cell.shutdown();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_run_flag_roundtrip() {
        let cell = PlanCell::new(0.5, 0.5);
        assert!(cell.run_flag());
        cell.set_run_flag(false);
        assert!(!cell.run_flag());
    }

    #[test]
    fn test_take_new_plan_flag_clears() {
        let cell = PlanCell::new(0.5, 0.5);
        cell.lock().new_plan_ready = true;
        assert!(cell.take_new_plan_flag());
        assert!(!cell.take_new_plan_flag());
    }
}
