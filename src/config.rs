//! Configuration loading for marga-nav

use crate::error::{NavError, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Clone, Debug, Deserialize, Default)]
pub struct NavConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub local_planner: LocalPlannerConfig,
    #[serde(default)]
    pub footprint: FootprintConfig,
}

/// Supervisor loop and timeout settings
#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    /// Supervisor tick rate (Hz)
    #[serde(default = "default_controller_frequency")]
    pub controller_frequency: f64,

    /// Planner worker rate limit (Hz), 0 disables rate limiting
    #[serde(default = "default_planner_frequency")]
    pub planner_frequency: f64,

    /// Max time to wait for a global plan (seconds)
    #[serde(default = "default_planner_patience")]
    pub planner_patience: f64,

    /// Max time to wait for a valid local command (seconds)
    #[serde(default = "default_controller_patience")]
    pub controller_patience: f64,

    /// Time without sufficient displacement before oscillation recovery (seconds)
    #[serde(default = "default_oscillation_timeout")]
    pub oscillation_timeout: f64,

    /// Displacement that resets the oscillation timer (meters)
    #[serde(default = "default_oscillation_distance")]
    pub oscillation_distance: f64,

    /// How long to hold a front-safety stop before escalating (seconds)
    #[serde(default = "default_stop_duration")]
    pub stop_duration: f64,

    /// Deceleration applied per step when stopping to zero (m/s per step)
    #[serde(default = "default_stop_to_zero_acc")]
    pub stop_to_zero_acc: f64,

    /// Max duration of one localization recovery rotation (seconds)
    #[serde(default = "default_localization_duration")]
    pub localization_duration: f64,

    /// How long to re-check an unsafe goal before giving up (seconds)
    #[serde(default = "default_goal_safe_check_duration")]
    pub goal_safe_check_duration: f64,
}

/// Clearance and footprint safety settings
#[derive(Clone, Debug, Deserialize)]
pub struct SafetyConfig {
    /// Max lateral deviation from the path before prune fails (meters)
    #[serde(default = "default_max_offroad_dis")]
    pub max_offroad_dis: f64,

    /// Max heading deviation from the path before prune fails (radians)
    #[serde(default = "default_max_offroad_yaw")]
    pub max_offroad_yaw: f64,

    /// Distance ahead along the path checked for clearance each tick (meters)
    #[serde(default = "default_front_safe_check_dis")]
    pub front_safe_check_dis: f64,

    /// Distance from goal within which goal-safety checks apply (meters)
    #[serde(default = "default_goal_safe_check_dis")]
    pub goal_safe_check_dis: f64,

    /// Forward clearance required around a selected safe goal (meters)
    #[serde(default = "default_goal_safe_dis_a")]
    pub goal_safe_dis_a: f64,

    /// Backward clearance required around a selected safe goal (meters)
    #[serde(default = "default_goal_safe_dis_b")]
    pub goal_safe_dis_b: f64,

    /// Distance backed up during backward recovery (meters)
    #[serde(default = "default_backward_check_dis")]
    pub backward_check_dis: f64,

    /// Protector bitmask bits treated as front-facing
    #[serde(default = "default_front_protector_list")]
    pub front_protector_list: Vec<u32>,
}

/// Global planner settings
#[derive(Clone, Debug, Deserialize)]
pub struct PlannerConfig {
    /// Time budget for one anytime search call (seconds)
    #[serde(default = "default_allocated_time")]
    pub allocated_time: f64,

    /// Starting heuristic inflation for the anytime search
    #[serde(default = "default_initial_epsilon")]
    pub initial_epsilon: f64,

    /// Affected-entry count above which the search restarts from scratch
    #[serde(default = "default_force_scratch_limit")]
    pub force_scratch_limit: usize,

    /// Nominal translation speed used in primitive costs (m/s)
    #[serde(default = "default_nominalvel_mpersecs")]
    pub nominalvel_mpersecs: f64,

    /// Time to rotate 45 degrees in place (seconds)
    #[serde(default = "default_timetoturn45degsinplace_secs")]
    pub timetoturn45degsinplace_secs: f64,

    /// Transformed cost value treated as lethal inside the lattice window
    #[serde(default = "default_lethal_cost")]
    pub lethal_cost: u8,

    /// Lattice window side length (cells)
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    /// Cost multiplier for straight primitives
    #[serde(default = "default_forward_cost_mult")]
    pub forward_cost_mult: u32,

    /// Cost multiplier for arc primitives
    #[serde(default = "default_forward_and_turn_cost_mult")]
    pub forward_and_turn_cost_mult: u32,

    /// Cost multiplier for in-place turn primitives
    #[serde(default = "default_turn_in_place_cost_mult")]
    pub turn_in_place_cost_mult: u32,

    /// Max start-goal distance served by the lattice search directly (meters)
    #[serde(default = "default_sbpl_max_distance")]
    pub sbpl_max_distance: f64,

    /// Footprint padding used while checking lattice plans (meters)
    #[serde(default = "default_sbpl_footprint_padding")]
    pub sbpl_footprint_padding: f64,

    /// Footprint padding used while checking installed paths (meters)
    #[serde(default = "default_fixpattern_footprint_padding")]
    pub fixpattern_footprint_padding: f64,

    /// Extra footprint extension during recovery checks (meters)
    #[serde(default = "default_recovery_footprint_extend_x")]
    pub recovery_footprint_extend_x: f64,

    #[serde(default = "default_recovery_footprint_extend_y")]
    pub recovery_footprint_extend_y: f64,

    /// Lateral circle-center extension while validating initial paths (meters)
    #[serde(default = "default_init_path_circle_center_extend_y")]
    pub init_path_circle_center_extend_y: f64,

    /// Waypoint spacing when sampling coarse grid plans (meters)
    #[serde(default = "default_init_path_sample_dis")]
    pub init_path_sample_dis: f64,

    /// Heading change that forces an extra sample on coarse plans (radians)
    #[serde(default = "default_init_path_sample_yaw")]
    pub init_path_sample_yaw: f64,

    /// Max length difference tolerated when switching to a stashed path (meters)
    #[serde(default = "default_max_path_length_diff")]
    pub max_path_length_diff: f64,

    /// Switch-path position tolerance near corners (meters)
    #[serde(default = "default_switch_corner_dis_diff")]
    pub switch_corner_dis_diff: f64,

    /// Switch-path heading tolerance near corners (radians)
    #[serde(default = "default_switch_corner_yaw_diff")]
    pub switch_corner_yaw_diff: f64,

    /// Switch-path position tolerance elsewhere (meters)
    #[serde(default = "default_switch_normal_dis_diff")]
    pub switch_normal_dis_diff: f64,

    /// Switch-path heading tolerance elsewhere (radians)
    #[serde(default = "default_switch_normal_yaw_diff")]
    pub switch_normal_yaw_diff: f64,

    /// Allow the coarse grid planner for beyond-lattice-range goals
    #[serde(default = "default_use_farther_planner")]
    pub use_farther_planner: bool,
}

/// Local trajectory controller settings
#[derive(Clone, Debug, Deserialize)]
pub struct LocalPlannerConfig {
    #[serde(default = "default_max_vel_x")]
    pub max_vel_x: f64,

    #[serde(default = "default_min_vel_x")]
    pub min_vel_x: f64,

    #[serde(default = "default_max_vel_theta")]
    pub max_vel_theta: f64,

    #[serde(default = "default_min_vel_theta")]
    pub min_vel_theta: f64,

    /// Lower bound on in-place rotation speed (rad/s)
    #[serde(default = "default_min_in_place_rotational_vel")]
    pub min_in_place_rotational_vel: f64,

    #[serde(default = "default_acc_lim_x")]
    pub acc_lim_x: f64,

    #[serde(default = "default_acc_lim_y")]
    pub acc_lim_y: f64,

    #[serde(default = "default_acc_lim_theta")]
    pub acc_lim_theta: f64,

    #[serde(default = "default_xy_goal_tolerance")]
    pub xy_goal_tolerance: f64,

    #[serde(default = "default_yaw_goal_tolerance")]
    pub yaw_goal_tolerance: f64,

    /// Forward simulation horizon for candidate trajectories (seconds)
    #[serde(default = "default_sim_time")]
    pub sim_time: f64,

    /// Forward simulation step (seconds)
    #[serde(default = "default_sim_granularity")]
    pub sim_granularity: f64,

    /// Number of angular velocity samples per cycle
    #[serde(default = "default_vtheta_samples")]
    pub vtheta_samples: usize,

    /// Path-following weight in trajectory scoring
    #[serde(default = "default_pdist_scale")]
    pub pdist_scale: f64,

    /// Local-goal weight in trajectory scoring
    #[serde(default = "default_gdist_scale")]
    pub gdist_scale: f64,

    /// Obstacle-proximity weight in trajectory scoring
    #[serde(default = "default_occdist_scale")]
    pub occdist_scale: f64,

    /// Proportional gain for rotate-to-goal
    #[serde(default = "default_rotate_to_goal_k")]
    pub rotate_to_goal_k: f64,

    /// Invalid rotation commands tolerated before flipping direction
    #[serde(default = "default_max_rotate_try_times")]
    pub max_rotate_try_times: u32,

    /// Minimum lookahead / highlight distance (meters)
    #[serde(default = "default_min_highlight_dis")]
    pub min_highlight_dis: f64,

    /// Velocity ratio applied near the final goal
    #[serde(default = "default_final_vel_ratio")]
    pub final_vel_ratio: f64,

    /// Distance from goal at which the final ratio applies; plans shorter
    /// than this are extended straight past the goal (meters)
    #[serde(default = "default_final_goal_dis_th")]
    pub final_goal_dis_th: f64,
}

/// Robot footprint geometry
#[derive(Clone, Debug, Deserialize)]
pub struct FootprintConfig {
    /// Footprint polygon vertices in the base frame, counter-clockwise
    #[serde(default = "default_footprint")]
    pub footprint: Vec<[f64; 2]>,

    /// Disk centers approximating the footprint for fast checks
    #[serde(default = "default_circle_center")]
    pub circle_center: Vec<[f64; 2]>,

    /// Disk centers checked while backing up
    #[serde(default = "default_backward_center_points")]
    pub backward_center_points: Vec<[f64; 2]>,

    /// Disk centers checked during recovery yaw search
    #[serde(default = "default_footprint_center_points")]
    pub footprint_center_points: Vec<[f64; 2]>,
}

impl FootprintConfig {
    /// Inscribed radius of the footprint polygon (distance to nearest edge).
    pub fn inscribed_radius(&self) -> f64 {
        let mut min_dist = f64::MAX;
        let n = self.footprint.len();
        for i in 0..n {
            let [x1, y1] = self.footprint[i];
            let [x2, y2] = self.footprint[(i + 1) % n];
            let (ex, ey) = (x2 - x1, y2 - y1);
            let len = ex.hypot(ey);
            if len < 1e-9 {
                continue;
            }
            // distance from origin to edge line
            let dist = (ex * y1 - ey * x1).abs() / len;
            min_dist = min_dist.min(dist);
        }
        if min_dist == f64::MAX { 0.0 } else { min_dist }
    }

    /// Circumscribed radius of the footprint polygon.
    pub fn circumscribed_radius(&self) -> f64 {
        self.footprint
            .iter()
            .map(|[x, y]| x.hypot(*y))
            .fold(0.0, f64::max)
    }
}

// Default value functions
fn default_controller_frequency() -> f64 {
    10.0
}
fn default_planner_frequency() -> f64 {
    2.0
}
fn default_planner_patience() -> f64 {
    10.0
}
fn default_controller_patience() -> f64 {
    15.0
}
fn default_oscillation_timeout() -> f64 {
    10.0
}
fn default_oscillation_distance() -> f64 {
    0.3
}
fn default_stop_duration() -> f64 {
    3.0
}
fn default_stop_to_zero_acc() -> f64 {
    0.05
}
fn default_localization_duration() -> f64 {
    6.0
}
fn default_goal_safe_check_duration() -> f64 {
    5.0
}

// Safety defaults
fn default_max_offroad_dis() -> f64 {
    0.7
}
fn default_max_offroad_yaw() -> f64 {
    0.7
}
fn default_front_safe_check_dis() -> f64 {
    2.5
}
fn default_goal_safe_check_dis() -> f64 {
    0.5
}
fn default_goal_safe_dis_a() -> f64 {
    0.5
}
fn default_goal_safe_dis_b() -> f64 {
    0.3
}
fn default_backward_check_dis() -> f64 {
    0.35
}
fn default_front_protector_list() -> Vec<u32> {
    vec![0, 1]
}

// Planner defaults
fn default_allocated_time() -> f64 {
    4.0
}
fn default_initial_epsilon() -> f64 {
    3.0
}
fn default_force_scratch_limit() -> usize {
    500
}
fn default_nominalvel_mpersecs() -> f64 {
    0.4
}
fn default_timetoturn45degsinplace_secs() -> f64 {
    0.6
}
fn default_lethal_cost() -> u8 {
    20
}
fn default_map_size() -> usize {
    400
}
fn default_forward_cost_mult() -> u32 {
    1
}
fn default_forward_and_turn_cost_mult() -> u32 {
    2
}
fn default_turn_in_place_cost_mult() -> u32 {
    50
}
fn default_sbpl_max_distance() -> f64 {
    5.0
}
fn default_sbpl_footprint_padding() -> f64 {
    0.05
}
fn default_fixpattern_footprint_padding() -> f64 {
    0.10
}
fn default_recovery_footprint_extend_x() -> f64 {
    0.05
}
fn default_recovery_footprint_extend_y() -> f64 {
    0.05
}
fn default_init_path_circle_center_extend_y() -> f64 {
    0.10
}
fn default_init_path_sample_dis() -> f64 {
    0.10
}
fn default_init_path_sample_yaw() -> f64 {
    0.10
}
fn default_max_path_length_diff() -> f64 {
    1.0
}
fn default_switch_corner_dis_diff() -> f64 {
    0.10
}
fn default_switch_corner_yaw_diff() -> f64 {
    0.10
}
fn default_switch_normal_dis_diff() -> f64 {
    0.20
}
fn default_switch_normal_yaw_diff() -> f64 {
    0.30
}
fn default_use_farther_planner() -> bool {
    true
}

// Local planner defaults
fn default_max_vel_x() -> f64 {
    0.5
}
fn default_min_vel_x() -> f64 {
    0.08
}
fn default_max_vel_theta() -> f64 {
    0.6
}
fn default_min_vel_theta() -> f64 {
    -0.6
}
fn default_min_in_place_rotational_vel() -> f64 {
    0.1
}
fn default_acc_lim_x() -> f64 {
    2.5
}
fn default_acc_lim_y() -> f64 {
    2.5
}
fn default_acc_lim_theta() -> f64 {
    3.2
}
fn default_xy_goal_tolerance() -> f64 {
    0.15
}
fn default_yaw_goal_tolerance() -> f64 {
    0.10
}
fn default_sim_time() -> f64 {
    2.0
}
fn default_sim_granularity() -> f64 {
    0.025
}
fn default_vtheta_samples() -> usize {
    20
}
fn default_pdist_scale() -> f64 {
    0.6
}
fn default_gdist_scale() -> f64 {
    0.8
}
fn default_occdist_scale() -> f64 {
    0.01
}
fn default_rotate_to_goal_k() -> f64 {
    0.9
}
fn default_max_rotate_try_times() -> u32 {
    1
}
fn default_min_highlight_dis() -> f64 {
    0.5
}
fn default_final_vel_ratio() -> f64 {
    1.0
}
fn default_final_goal_dis_th() -> f64 {
    1.0
}

// Footprint defaults: a 0.4m x 0.4m square robot with two covering disks
fn default_footprint() -> Vec<[f64; 2]> {
    vec![[0.25, 0.2], [0.25, -0.2], [-0.2, -0.2], [-0.2, 0.2]]
}
fn default_circle_center() -> Vec<[f64; 2]> {
    vec![[0.1, 0.0], [-0.05, 0.0]]
}
fn default_backward_center_points() -> Vec<[f64; 2]> {
    vec![[-0.2, 0.0], [-0.35, 0.0]]
}
fn default_footprint_center_points() -> Vec<[f64; 2]> {
    vec![[0.1, 0.0], [-0.05, 0.0], [0.25, 0.0]]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_frequency: default_controller_frequency(),
            planner_frequency: default_planner_frequency(),
            planner_patience: default_planner_patience(),
            controller_patience: default_controller_patience(),
            oscillation_timeout: default_oscillation_timeout(),
            oscillation_distance: default_oscillation_distance(),
            stop_duration: default_stop_duration(),
            stop_to_zero_acc: default_stop_to_zero_acc(),
            localization_duration: default_localization_duration(),
            goal_safe_check_duration: default_goal_safe_check_duration(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_offroad_dis: default_max_offroad_dis(),
            max_offroad_yaw: default_max_offroad_yaw(),
            front_safe_check_dis: default_front_safe_check_dis(),
            goal_safe_check_dis: default_goal_safe_check_dis(),
            goal_safe_dis_a: default_goal_safe_dis_a(),
            goal_safe_dis_b: default_goal_safe_dis_b(),
            backward_check_dis: default_backward_check_dis(),
            front_protector_list: default_front_protector_list(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            allocated_time: default_allocated_time(),
            initial_epsilon: default_initial_epsilon(),
            force_scratch_limit: default_force_scratch_limit(),
            nominalvel_mpersecs: default_nominalvel_mpersecs(),
            timetoturn45degsinplace_secs: default_timetoturn45degsinplace_secs(),
            lethal_cost: default_lethal_cost(),
            map_size: default_map_size(),
            forward_cost_mult: default_forward_cost_mult(),
            forward_and_turn_cost_mult: default_forward_and_turn_cost_mult(),
            turn_in_place_cost_mult: default_turn_in_place_cost_mult(),
            sbpl_max_distance: default_sbpl_max_distance(),
            sbpl_footprint_padding: default_sbpl_footprint_padding(),
            fixpattern_footprint_padding: default_fixpattern_footprint_padding(),
            recovery_footprint_extend_x: default_recovery_footprint_extend_x(),
            recovery_footprint_extend_y: default_recovery_footprint_extend_y(),
            init_path_circle_center_extend_y: default_init_path_circle_center_extend_y(),
            init_path_sample_dis: default_init_path_sample_dis(),
            init_path_sample_yaw: default_init_path_sample_yaw(),
            max_path_length_diff: default_max_path_length_diff(),
            switch_corner_dis_diff: default_switch_corner_dis_diff(),
            switch_corner_yaw_diff: default_switch_corner_yaw_diff(),
            switch_normal_dis_diff: default_switch_normal_dis_diff(),
            switch_normal_yaw_diff: default_switch_normal_yaw_diff(),
            use_farther_planner: default_use_farther_planner(),
        }
    }
}

impl Default for LocalPlannerConfig {
    fn default() -> Self {
        Self {
            max_vel_x: default_max_vel_x(),
            min_vel_x: default_min_vel_x(),
            max_vel_theta: default_max_vel_theta(),
            min_vel_theta: default_min_vel_theta(),
            min_in_place_rotational_vel: default_min_in_place_rotational_vel(),
            acc_lim_x: default_acc_lim_x(),
            acc_lim_y: default_acc_lim_y(),
            acc_lim_theta: default_acc_lim_theta(),
            xy_goal_tolerance: default_xy_goal_tolerance(),
            yaw_goal_tolerance: default_yaw_goal_tolerance(),
            sim_time: default_sim_time(),
            sim_granularity: default_sim_granularity(),
            vtheta_samples: default_vtheta_samples(),
            pdist_scale: default_pdist_scale(),
            gdist_scale: default_gdist_scale(),
            occdist_scale: default_occdist_scale(),
            rotate_to_goal_k: default_rotate_to_goal_k(),
            max_rotate_try_times: default_max_rotate_try_times(),
            min_highlight_dis: default_min_highlight_dis(),
            final_vel_ratio: default_final_vel_ratio(),
            final_goal_dis_th: default_final_goal_dis_th(),
        }
    }
}

impl Default for FootprintConfig {
    fn default() -> Self {
        Self {
            footprint: default_footprint(),
            circle_center: default_circle_center(),
            backward_center_points: default_backward_center_points(),
            footprint_center_points: default_footprint_center_points(),
        }
    }
}

impl NavConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NavError::Config(format!("Failed to read config file: {}", e)))?;
        let config: NavConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.controller.controller_frequency <= 0.0 {
            return Err(NavError::Config(
                "controller_frequency must be positive".to_string(),
            ));
        }
        if self.planner.initial_epsilon < 1.0 {
            return Err(NavError::Config(
                "initial_epsilon must be >= 1.0".to_string(),
            ));
        }
        if self.footprint.footprint.len() < 3 {
            return Err(NavError::Config(
                "footprint polygon needs at least 3 vertices".to_string(),
            ));
        }
        if self.local_planner.min_vel_x > self.local_planner.max_vel_x {
            return Err(NavError::Config(
                "min_vel_x must not exceed max_vel_x".to_string(),
            ));
        }
        Ok(())
    }

    /// Supervisor tick period (seconds).
    pub fn control_period(&self) -> f64 {
        1.0 / self.controller.controller_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = NavConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.controller.controller_frequency > 0.0);
        assert_eq!(config.planner.map_size, 400);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [planner]
            allocated_time = 2.0
            map_size = 200

            [local_planner]
            max_vel_x = 0.8
        "#;
        let config: NavConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.planner.map_size, 200);
        assert!((config.planner.allocated_time - 2.0).abs() < 1e-9);
        assert!((config.local_planner.max_vel_x - 0.8).abs() < 1e-9);
        // untouched groups keep defaults
        assert!((config.controller.controller_frequency - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_inscribed_radius_square() {
        let fp = FootprintConfig {
            footprint: vec![[0.2, 0.2], [0.2, -0.2], [-0.2, -0.2], [-0.2, 0.2]],
            ..Default::default()
        };
        assert!((fp.inscribed_radius() - 0.2).abs() < 1e-6);
        assert!((fp.circumscribed_radius() - 0.2 * 2.0_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_epsilon_rejected() {
        let mut config = NavConfig::default();
        config.planner.initial_epsilon = 0.5;
        assert!(config.validate().is_err());
    }
}
