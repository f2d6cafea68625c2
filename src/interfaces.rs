//! External seams of the navigation core.
//!
//! Everything the core consumes from the robot platform arrives through
//! these traits, injected at construction time. No process-wide mutable
//! state: the supervisor and worker only see what the context hands them.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::Sender;

use crate::costmap::SharedCostmap;
use crate::geometry::{Pose2D, Twist};

/// Current robot pose and velocity in the global frame.
pub trait PoseSource: Send + Sync {
    /// `None` when no pose estimate is available this tick.
    fn pose(&self) -> Option<Pose2D>;
    fn velocity(&self) -> Twist;
}

/// The low-level velocity command publisher.
pub trait VelocitySink: Send + Sync {
    fn publish(&self, twist: Twist);
}

/// Localization validity flag stream.
pub trait LocalizationSource: Send + Sync {
    fn is_valid(&self) -> bool;
}

/// Protector (bumper / safety bar) bitmask service.
pub trait ProtectorSource: Send + Sync {
    fn status(&self) -> u32;
}

/// Hardware in-place rotation service used by localization recovery.
pub trait RotateService: Send + Sync {
    fn start_rotate(&self);
    fn stop_rotate(&self);
    fn rotate_finished(&self) -> bool;
}

/// Curve (Bézier) path generator seam for short-range goals.
pub trait CurveGenerator: Send + Sync {
    /// Sampled curve poses from start to goal, or `None` when no acceptable
    /// curve exists.
    fn make_curve(&self, start: &Pose2D, goal: &Pose2D) -> Option<Vec<Pose2D>>;
}

/// Terminal and progress status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavStatus {
    GoalPlanning,
    GoalHeading,
    GoalReached,
    GoalUnreached,
    GoalUnreachable,
    PathNotSafe,
    GoalNotSafe,
    LocationInvalid,
}

/// Events emitted by the supervisor and worker.
#[derive(Clone, Debug)]
pub enum NavEvent {
    Status(NavStatus),
    /// Pose at which the goal was declared reached
    GoalReachedPose(Pose2D),
    /// Freshly installed global plan, for visualization
    PlannedPath(Vec<Pose2D>),
}

/// Goal flavors; charging goals shift the target and tighten tolerances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GoalKind {
    #[default]
    Normal,
    Origin,
    Charging,
}

/// A navigation goal request.
#[derive(Clone, Copy, Debug)]
pub struct NavGoal {
    pub pose: Pose2D,
    pub kind: GoalKind,
}

impl NavGoal {
    pub fn new(pose: Pose2D) -> Self {
        Self {
            pose,
            kind: GoalKind::Normal,
        }
    }
}

/// Construction-time injected context: every external collaborator the
/// navigation core talks to.
#[derive(Clone)]
pub struct NavContext {
    pub pose_source: Arc<dyn PoseSource>,
    pub vel_sink: Arc<dyn VelocitySink>,
    pub localization: Arc<dyn LocalizationSource>,
    pub protector: Arc<dyn ProtectorSource>,
    pub rotate_service: Arc<dyn RotateService>,
    pub curve_generator: Option<Arc<dyn CurveGenerator>>,
    /// Live combined costmap, refreshed by the external costmap layer
    pub costmap: SharedCostmap,
    /// Static map-only overlay (ignores dynamic obstacles)
    pub static_costmap: SharedCostmap,
    /// Cleared by the external layer when the costmap goes stale
    pub costmap_current: Arc<AtomicBool>,
    pub events: Sender<NavEvent>,
}

impl NavContext {
    /// Emit an event, dropping it when no receiver is connected.
    pub fn emit(&self, event: NavEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_status(&self, status: NavStatus) {
        self.emit(NavEvent::Status(status));
    }
}
