//! `motionmux-hal` – Hardware boundary
//!
//! Everything below the arbitration engine: the drivers that receive
//! committed outputs, the bank that maps output slots onto them, and the
//! kinematics interface producers use to turn Cartesian goals into joint
//! targets.
//!
//! # Modules
//!
//! - [`actuator`] – [`Actuator`][actuator::Actuator]: one output channel
//!   (servo, LED, wheel).
//! - [`bank`] – [`ActuatorBank`][bank::ActuatorBank]: slot-indexed driver
//!   bank implementing the [`OutputSink`][bank::OutputSink] and
//!   [`SensorSource`][bank::SensorSource] seams, applying calibration.
//! - [`sim_bank`] – [`SimBank`][sim_bank::SimBank]: builder for a bank of
//!   stub drivers, for CI and demos.
//! - [`ik`] – [`IkSolver`][ik::IkSolver] and
//!   [`KinematicChain`][ik::KinematicChain], with closed-form planar and
//!   pan/tilt solvers.

pub mod actuator;
pub mod bank;
pub mod ik;
pub mod sim_bank;

pub use actuator::Actuator;
pub use bank::{ActuatorBank, OutputSink, SensorSource};
pub use ik::{IkSolver, KinematicChain, PanTilt, PlanarTwoLink, Vec3};
pub use sim_bank::SimBank;
