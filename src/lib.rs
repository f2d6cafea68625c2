//! MargaNav - Navigation control core for a service robot
//!
//! Couples an anytime lattice global planner with a supervising controller
//! that drives the robot along planned paths, watches clearance and
//! localization, and recovers from failures.
//!
//! ## Two-Thread Architecture
//!
//! - **Supervisor thread** (caller of [`NavSupervisor::execute`], ~10Hz):
//!   runs the state machine, the per-tick safety pipeline and the local
//!   controller; sole publisher of velocity commands
//! - **Planner worker thread**: sleeps on the plan cell's condition
//!   variable, runs one global planning cycle per wake and installs the
//!   result through the shared path buffer
//!
//! Everything the core consumes from the platform (pose, costmaps,
//! protectors, the velocity publisher) is injected through
//! [`interfaces::NavContext`].

pub mod config;
pub mod costmap;
pub mod error;
pub mod footprint;
pub mod geometry;
pub mod interfaces;
pub mod lattice;
pub mod local_planner;
pub mod path;
pub mod planning;
pub mod shared;
pub mod supervisor;
pub mod worker;

pub use config::NavConfig;
pub use costmap::{Costmap, SharedCostmap};
pub use error::{NavError, Result};
pub use geometry::{Pose2D, Twist};
pub use interfaces::{NavContext, NavEvent, NavGoal, NavStatus};
pub use path::{NavPath, PathPoint};
pub use supervisor::{CancelHandle, NavOutcome, NavSupervisor};
