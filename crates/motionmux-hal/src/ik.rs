//! Inverse-kinematics interface.
//!
//! Producers that track a Cartesian goal (the goal tracker, the gait walker)
//! hold a [`KinematicChain`] describing the joints they drive and ask an
//! [`IkSolver`] to fill in joint angles for a target point.  The numeric
//! solver of a full robot model lives outside this crate; two closed-form
//! solvers are provided for small chains:
//!
//! * [`PlanarTwoLink`] – two revolute joints in the x-y plane (legs, arms);
//! * [`PanTilt`] – yaw then pitch, pointing the chain's axis at the target
//!   (heads, cameras).
//!
//! # Example
//!
//! ```rust
//! use motionmux_hal::ik::{IkSolver, KinematicChain, PlanarTwoLink, Vec3};
//!
//! let mut leg = KinematicChain::new(vec![0, 1], vec![1.0, 1.0]);
//! let reached = PlanarTwoLink.solve(&Vec3::new(1.0, 1.0, 0.0), &mut leg);
//! assert!(reached);
//!
//! let tip = PlanarTwoLink::forward(&leg).unwrap();
//! assert!((tip.x - 1.0).abs() < 1e-4 && (tip.y - 1.0).abs() < 1e-4);
//! ```

use std::f32::consts::PI;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D point or direction, in the chain's base frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn norm(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KinematicChain
// ────────────────────────────────────────────────────────────────────────────

/// Serial chain of revolute joints, each bound to one output slot.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicChain {
    slots: Vec<usize>,
    angles: Vec<f32>,
    links: Vec<f32>,
    limits: Vec<(f32, f32)>,
}

impl KinematicChain {
    /// A chain whose joint `i` drives output slot `slots[i]` and is followed
    /// by a link of length `links[i]`.  Joint limits default to `[-π, π]`.
    pub fn new(slots: Vec<usize>, links: Vec<f32>) -> Self {
        let n = slots.len();
        Self {
            slots,
            angles: vec![0.0; n],
            links,
            limits: vec![(-PI, PI); n],
        }
    }

    /// Override the joint limits, one `(min, max)` pair per joint.
    pub fn with_limits(mut self, limits: Vec<(f32, f32)>) -> Self {
        self.limits = limits;
        self
    }

    pub fn joint_count(&self) -> usize {
        self.slots.len()
    }

    /// Output slot of every joint.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Current joint angles.
    pub fn angles(&self) -> &[f32] {
        &self.angles
    }

    pub fn links(&self) -> &[f32] {
        &self.links
    }

    /// Set joint `joint` to `angle`, clamped to its limits.  Returns `false`
    /// when clamping was needed or the joint does not exist.
    pub fn set_angle(&mut self, joint: usize, angle: f32) -> bool {
        let Some(slot) = self.angles.get_mut(joint) else {
            return false;
        };
        let (lo, hi) = self.limits.get(joint).copied().unwrap_or((-PI, PI));
        let clamped = angle.clamp(lo, hi);
        *slot = clamped;
        (clamped - angle).abs() < 1e-6
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Solvers
// ────────────────────────────────────────────────────────────────────────────

/// Fills joint angles of a chain so that its end effector reaches a target.
pub trait IkSolver: Send + Sync {
    /// Solve for `target` in the chain's base frame, writing the best
    /// achievable angles into `chain`.  Returns `true` when the target was
    /// reached within joint limits.
    fn solve(&self, target: &Vec3, chain: &mut KinematicChain) -> bool;
}

/// Closed-form solver for a two-link planar chain (elbow-down branch).
/// The target's `z` is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarTwoLink;

impl PlanarTwoLink {
    /// End-effector position of a two-link chain.
    pub fn forward(chain: &KinematicChain) -> Option<Vec3> {
        let (&[q1, q2], &[l1, l2]) = (chain.angles(), chain.links()) else {
            return None;
        };
        Some(Vec3::new(
            l1 * q1.cos() + l2 * (q1 + q2).cos(),
            l1 * q1.sin() + l2 * (q1 + q2).sin(),
            0.0,
        ))
    }
}

impl IkSolver for PlanarTwoLink {
    fn solve(&self, target: &Vec3, chain: &mut KinematicChain) -> bool {
        let &[l1, l2] = chain.links() else {
            tracing::warn!(joints = chain.joint_count(), "planar solver needs two links");
            return false;
        };
        if chain.joint_count() != 2 || l1 <= 0.0 || l2 <= 0.0 {
            return false;
        }

        let d2 = target.x * target.x + target.y * target.y;
        let cos_q2 = (d2 - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        // Outside the annulus: stretch toward the target as far as possible.
        let reachable = (-1.0..=1.0).contains(&cos_q2);
        let q2 = cos_q2.clamp(-1.0, 1.0).acos();
        let q1 = target.y.atan2(target.x) - (l2 * q2.sin()).atan2(l1 + l2 * q2.cos());

        let within_1 = chain.set_angle(0, q1);
        let within_2 = chain.set_angle(1, q2);
        reachable && within_1 && within_2
    }
}

/// Points a pan/tilt pair at the target: joint 0 yaws about z, joint 1
/// pitches up from the x-y plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanTilt;

impl IkSolver for PanTilt {
    fn solve(&self, target: &Vec3, chain: &mut KinematicChain) -> bool {
        if chain.joint_count() != 2 || target.norm() < f32::EPSILON {
            return false;
        }
        let pan = target.y.atan2(target.x);
        let tilt = target.z.atan2(target.x.hypot(target.y));
        let within_pan = chain.set_angle(0, pan);
        let within_tilt = chain.set_angle(1, tilt);
        within_pan && within_tilt
    }
}
