//! Generic `Actuator` trait for servos, LEDs, wheels and any other output
//! channel driven by the motion engine.
//!
//! Drivers implement this trait and are bound to an output slot of an
//! [`ActuatorBank`][crate::bank::ActuatorBank].  The engine never talks to a
//! driver directly: committed sub-frames reach the hardware only through the
//! bank's [`OutputSink`][crate::bank::OutputSink] implementation.

use motionmux_types::MuxError;

/// A single hardware output channel (joint servo, LED, wheel, …).
///
/// Values are already calibrated when they arrive here: joints in radians,
/// LEDs as intensity, wheels as velocity.
pub trait Actuator: Send + Sync {
    /// Stable identifier for this actuator, e.g. `"neck_tilt"` or
    /// `"left_wheel"`.
    fn id(&self) -> &str;

    /// Command the actuator to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::HardwareFault`] if the command cannot be applied
    /// (e.g. the actuator is in a fault state).
    fn set_value(&mut self, value: f32) -> Result<(), MuxError>;

    /// Most recently known value (sensed position for servos, last command
    /// for open-loop channels).
    fn value(&self) -> f32;

    /// Servo duty cycle in `[-1, 1]`.  Open-loop channels report zero.
    fn duty(&self) -> f32 {
        0.0
    }
}
