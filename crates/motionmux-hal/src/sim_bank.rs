//! [`SimBank`] – in-process simulated hardware for CI and demos.
//!
//! Constructs an [`ActuatorBank`] whose every slot is backed by a stub driver
//! that records commands without touching real hardware.  This allows the
//! engine, the control loop and the CLI to run without a physical robot.
//!
//! # Stub behaviour
//!
//! | Slot kind | Stub behaviour |
//! |---|---|
//! | Joint | Stores the last command; `value()` returns it as the sensed position. |
//! | Led   | Stores the last command clamped to `[0, 1]`. |
//! | Wheel | Stores the last command; `value()` returns it as the sensed velocity. |
//!
//! # Example
//!
//! ```rust
//! use motionmux_hal::sim_bank::SimBank;
//! use motionmux_types::SlotKind;
//!
//! let bank = SimBank::builder()
//!     .with_joint("neck_pan")
//!     .with_joint("neck_tilt")
//!     .with_led("face")
//!     .build();
//!
//! assert_eq!(bank.len(), 3);
//! assert_eq!(bank.layout().kind(2), Some(SlotKind::Led));
//! ```

use motionmux_types::{CalibrationTable, MuxError, SlotKind};

use crate::actuator::Actuator;
use crate::bank::ActuatorBank;

// ─────────────────────────────────────────────────────────────────────────────
// Stub driver
// ─────────────────────────────────────────────────────────────────────────────

struct StubActuator {
    id: String,
    kind: SlotKind,
    value: f32,
}

impl Actuator for StubActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_value(&mut self, value: f32) -> Result<(), MuxError> {
        self.value = match self.kind {
            SlotKind::Led => value.clamp(0.0, 1.0),
            SlotKind::Joint | SlotKind::Wheel => value,
        };
        Ok(())
    }

    fn value(&self) -> f32 {
        self.value
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimBank builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder that constructs an [`ActuatorBank`] populated with stub drivers.
#[derive(Default)]
pub struct SimBank {
    slots: Vec<(SlotKind, String)>,
    calibration: CalibrationTable,
}

impl SimBank {
    /// Create a new builder with no slots.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Append a stub joint servo.
    pub fn with_joint(self, id: impl Into<String>) -> Self {
        self.with_slot(SlotKind::Joint, id)
    }

    /// Append a stub LED.
    pub fn with_led(self, id: impl Into<String>) -> Self {
        self.with_slot(SlotKind::Led, id)
    }

    /// Append a stub wheel.
    pub fn with_wheel(self, id: impl Into<String>) -> Self {
        self.with_slot(SlotKind::Wheel, id)
    }

    /// Append a stub of any kind.
    pub fn with_slot(mut self, kind: SlotKind, id: impl Into<String>) -> Self {
        self.slots.push((kind, id.into()));
        self
    }

    /// Calibration the built bank applies.
    pub fn with_calibration(mut self, calibration: CalibrationTable) -> Self {
        self.calibration = calibration;
        self
    }

    /// Consume the builder and return a fully populated [`ActuatorBank`].
    pub fn build(self) -> ActuatorBank {
        let mut bank = ActuatorBank::new();
        for (kind, id) in self.slots {
            bank.register(
                kind,
                Box::new(StubActuator {
                    id,
                    kind,
                    value: 0.0,
                }),
            );
        }
        bank.set_calibration(self.calibration);
        bank
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
