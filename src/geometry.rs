//! Core geometric types: poses, twists, angles, lattice discretization.

use std::f64::consts::PI;

/// A 2D pose in the global frame (meters, radians).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    /// Euclidean distance to another pose, ignoring heading.
    pub fn distance_to(&self, other: &Pose2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Heading from this pose toward another pose.
    pub fn direction_to(&self, other: &Pose2D) -> f64 {
        (other.y - self.y).atan2(other.x - self.x)
    }

    /// Pose translated by `dist` along `yaw`, keeping `yaw` as the heading.
    pub fn advanced(&self, dist: f64, yaw: f64) -> Pose2D {
        Pose2D::new(self.x + dist * yaw.cos(), self.y + dist * yaw.sin(), yaw)
    }
}

/// A velocity command (m/s, rad/s).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Twist {
    pub linear_x: f64,
    pub linear_y: f64,
    pub angular_z: f64,
}

impl Twist {
    pub const ZERO: Twist = Twist {
        linear_x: 0.0,
        linear_y: 0.0,
        angular_z: 0.0,
    };

    pub fn new(linear_x: f64, linear_y: f64, angular_z: f64) -> Self {
        Self {
            linear_x,
            linear_y,
            angular_z,
        }
    }

    pub fn is_stopped(&self, trans_eps: f64, rot_eps: f64) -> bool {
        self.linear_x.abs() < trans_eps
            && self.linear_y.abs() < trans_eps
            && self.angular_z.abs() < rot_eps
    }
}

/// Normalize an angle to [-pi, pi].
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Shortest signed angular distance from `from` to `to`, in [-pi, pi].
pub fn shortest_angular_distance(from: f64, to: f64) -> f64 {
    normalize_angle(to - from)
}

pub fn sign(x: f64) -> f64 {
    if x < 0.0 { -1.0 } else { 1.0 }
}

/// Integer cell coordinate on a 2D grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Discretized (x, y, heading-bin) lattice coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LatticeCoord {
    pub x: i32,
    pub y: i32,
    pub theta: u8,
}

impl LatticeCoord {
    pub fn new(x: i32, y: i32, theta: u8) -> Self {
        Self { x, y, theta }
    }
}

/// Continuous coordinate to cell index (floor convention).
pub fn cont_to_disc(v: f64, resolution: f64) -> i32 {
    (v / resolution).floor() as i32
}

/// Cell index to continuous coordinate (cell center convention).
pub fn disc_to_cont(c: i32, resolution: f64) -> f64 {
    c as f64 * resolution + resolution / 2.0
}

/// Continuous heading to angular bin out of `num_angles`.
pub fn theta_to_bin(theta: f64, num_angles: u8) -> u8 {
    let two_pi = 2.0 * PI;
    let mut t = theta % two_pi;
    if t < 0.0 {
        t += two_pi;
    }
    let bin = (t / (two_pi / num_angles as f64)).round() as u32;
    (bin % num_angles as u32) as u8
}

/// Angular bin to continuous heading.
pub fn bin_to_theta(bin: u8, num_angles: u8) -> f64 {
    bin as f64 * (2.0 * PI / num_angles as f64)
}

/// Discretize a continuous pose onto the lattice.
pub fn discretize_pose(pose: &Pose2D, resolution: f64, num_angles: u8) -> LatticeCoord {
    LatticeCoord::new(
        cont_to_disc(pose.x, resolution),
        cont_to_disc(pose.y, resolution),
        theta_to_bin(pose.theta, num_angles),
    )
}

/// Continuize a lattice coordinate back to a pose at the cell center.
pub fn continuize_pose(coord: &LatticeCoord, resolution: f64, num_angles: u8) -> Pose2D {
    Pose2D::new(
        disc_to_cont(coord.x, resolution),
        disc_to_cont(coord.y, resolution),
        bin_to_theta(coord.theta, num_angles),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_angle_wraparound() {
        assert_relative_eq!(normalize_angle(3.0 * PI), PI, epsilon = 1e-9);
        assert_relative_eq!(normalize_angle(-3.0 * PI), PI, epsilon = 1e-9);
        assert_relative_eq!(normalize_angle(0.5), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_shortest_angular_distance() {
        // -179 deg to +179 deg is a 2 deg move, not 358
        let a = -179.0_f64.to_radians();
        let b = 179.0_f64.to_radians();
        assert!(shortest_angular_distance(a, b).abs() < 0.1);
    }

    #[test]
    fn test_discretize_round_trip() {
        let resolution = 0.05;
        let num_angles = 16;
        for &(x, y, theta) in &[
            (0.0, 0.0, 0.0),
            (1.234, -0.87, 1.1),
            (-2.0, 3.99, -3.0),
            (0.024, 0.026, 6.2),
        ] {
            let p = Pose2D::new(x, y, theta);
            let d = discretize_pose(&p, resolution, num_angles);
            let c = continuize_pose(&d, resolution, num_angles);
            let d2 = discretize_pose(&c, resolution, num_angles);
            assert_eq!(d, d2, "round trip failed for {:?}", p);
        }
    }

    #[test]
    fn test_theta_bins() {
        assert_eq!(theta_to_bin(0.0, 16), 0);
        assert_eq!(theta_to_bin(PI / 2.0, 16), 4);
        assert_eq!(theta_to_bin(-PI / 2.0, 16), 12);
        // just under a full turn rounds back to bin 0
        assert_eq!(theta_to_bin(2.0 * PI - 0.01, 16), 0);
    }
}
