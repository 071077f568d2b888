//! [`ActuatorBank`] – maps output slots to hardware drivers.
//!
//! The bank owns one [`Actuator`] per slot, in slot order, together with the
//! [`SlotLayout`] it implies and the model's [`CalibrationTable`].  It is the
//! downstream end of the arbitration engine:
//!
//! * as an [`OutputSink`] it plays every committed sub-frame out to the
//!   drivers, applying calibration on the way;
//! * as a [`SensorSource`] it samples the drivers and hands back raw readings,
//!   which the control loop calibrates before the engine sees them.
//!
//! # Example
//!
//! ```rust
//! use motionmux_hal::bank::{OutputSink, SensorSource};
//! use motionmux_hal::sim_bank::SimBank;
//! use motionmux_types::{OutputCmd, OutputFrame};
//!
//! let mut bank = SimBank::builder().with_joint("neck_tilt").build();
//!
//! let mut frame = OutputFrame::new(4, 1);
//! frame.fill(OutputCmd::full(0.3));
//! bank.commit(&frame).unwrap();
//!
//! assert!((bank.read().positions[0] - 0.3).abs() < f32::EPSILON);
//! ```

use motionmux_types::{
    CalibrationTable, MuxError, OutputFrame, SensorSnapshot, SlotKind, SlotLayout,
};

use crate::actuator::Actuator;

/// Downstream consumer of committed output frames.
pub trait OutputSink: Send {
    /// Deliver one tick worth of committed outputs.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::HardwareFault`] when a driver rejects a command and
    /// [`MuxError::SlotOutOfRange`] when the frame does not match the model.
    fn commit(&mut self, frame: &OutputFrame) -> Result<(), MuxError>;
}

/// Upstream provider of raw (uncalibrated) sensor readings.
pub trait SensorSource: Send {
    fn read(&mut self) -> SensorSnapshot;
}

/// Slot-indexed hardware driver bank.
///
/// Construct with [`ActuatorBank::new`], register drivers in slot order, then
/// pass the bank to the control loop.
#[derive(Default)]
pub struct ActuatorBank {
    drivers: Vec<Box<dyn Actuator>>,
    kinds: Vec<SlotKind>,
    calibration: CalibrationTable,
}

impl ActuatorBank {
    /// Create an empty bank with identity calibration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `driver` to the next free slot and return its index.
    pub fn register(&mut self, kind: SlotKind, driver: Box<dyn Actuator>) -> usize {
        let slot = self.drivers.len();
        tracing::debug!(slot, id = driver.id(), ?kind, "actuator registered");
        self.drivers.push(driver);
        self.kinds.push(kind);
        slot
    }

    /// Replace the calibration table.
    pub fn set_calibration(&mut self, calibration: CalibrationTable) {
        self.calibration = calibration;
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// Slot layout implied by the registered drivers.
    pub fn layout(&self) -> SlotLayout {
        SlotLayout::new(self.kinds.clone())
    }

    /// Number of bound slots.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Slot index of the driver named `id`.
    pub fn slot_of(&self, id: &str) -> Option<usize> {
        self.drivers.iter().position(|d| d.id() == id)
    }

    /// Read access to the driver bound to `slot`.
    pub fn driver(&self, slot: usize) -> Option<&dyn Actuator> {
        self.drivers.get(slot).map(|d| d.as_ref())
    }
}

impl OutputSink for ActuatorBank {
    fn commit(&mut self, frame: &OutputFrame) -> Result<(), MuxError> {
        if frame.num_slots() > self.drivers.len() {
            return Err(MuxError::SlotOutOfRange {
                slot: frame.num_slots() - 1,
                num_slots: self.drivers.len(),
            });
        }
        for sub_frame in frame.iter() {
            for (slot, cmd) in sub_frame.iter().enumerate() {
                let value = self.calibration.apply_output(slot, cmd.value);
                self.drivers[slot].set_value(value)?;
            }
        }
        Ok(())
    }
}

impl SensorSource for ActuatorBank {
    fn read(&mut self) -> SensorSnapshot {
        SensorSnapshot {
            positions: self.drivers.iter().map(|d| d.value()).collect(),
            duties: self.drivers.iter().map(|d| d.duty()).collect(),
        }
    }
}
