//! `motionmux-motions` – Reference motion producers
//!
//! Ready-made [`MotionCommand`](motionmux_kernel::MotionCommand)
//! implementations built on the kernel's contract.
//!
//! - [`interpolate`] – speed-limited stepping shared by the target seekers.
//! - [`posture`] – [`PostureMotion`]: per-slot targets and speed limits.
//! - [`emergency_stop`] – [`EmergencyStop`]: freeze everything, fade back.
//! - [`goal_tracker`] – [`GoalTracker`]: aim a kinematic chain via IK.
//! - [`walker`] – [`GaitWalker`]: follow a footstep path.
//! - [`led`] – [`LedEngine`] effects and the [`LedMotion`] that plays them.

pub mod emergency_stop;
pub mod goal_tracker;
pub mod interpolate;
pub mod led;
pub mod posture;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use emergency_stop::{EmergencyStop, EstopSettings};
pub use goal_tracker::GoalTracker;
pub use led::{LedEngine, LedMotion};
pub use posture::PostureMotion;
pub use walker::{Footstep, GaitSettings, GaitWalker, Leg, Pose2D};
