//! `motionmux-types` – shared vocabulary of the motion arbitration stack.
//!
//! Everything that crosses a crate boundary lives here: producer handles,
//! priority ranks, per-slot output commands, sensor snapshots, calibration,
//! motion events and the global [`MuxError`] type.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Handles & priorities
// ────────────────────────────────────────────────────────────────────────────

/// Opaque handle to a producer registered with the engine.
///
/// Handles are issued monotonically and never reused, so a stale handle can
/// never alias a newer producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MotionId(u64);

impl MotionId {
    /// Sentinel for "not registered".
    pub const INVALID: MotionId = MotionId(0);

    /// Wrap a raw handle value.  Only the engine should mint handles.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// `true` unless this is [`MotionId::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Default for MotionId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for MotionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "mc#{}", self.0)
        } else {
            write!(f, "mc#invalid")
        }
    }
}

/// Compositing rank of a producer.  Higher ranks are folded later and
/// therefore have the final say on a slot.
///
/// Only the named tiers and [`Priority::one_above`] are exposed; there is no
/// general arithmetic on ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(i32);

impl Priority {
    /// Never expressed; handy to park a producer without removing it.
    pub const IGNORED: Priority = Priority(-1);
    /// Only visible where nothing else drives the slot.
    pub const BACKGROUND: Priority = Priority(0);
    /// Below everyday commands.
    pub const LOW: Priority = Priority(5);
    /// Everyday commands.
    pub const STANDARD: Priority = Priority(10);
    /// Overrides standard commands.
    pub const HIGH: Priority = Priority(50);
    /// Emergency overrides such as the emergency stop.
    pub const EMERGENCY: Priority = Priority(100);

    /// The rank immediately above `self`.
    pub const fn one_above(self) -> Priority {
        Priority(self.0.saturating_add(1))
    }

    /// The raw rank, for diagnostics only.
    pub const fn rank(self) -> i32 {
        self.0
    }

    /// `true` when producers at this rank should be evaluated at all.
    pub fn is_expressed(self) -> bool {
        self >= Priority::BACKGROUND
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::STANDARD
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Priority::IGNORED => "ignored",
            Priority::BACKGROUND => "background",
            Priority::LOW => "low",
            Priority::STANDARD => "standard",
            Priority::HIGH => "high",
            Priority::EMERGENCY => "emergency",
            Priority(rank) => return write!(f, "rank {rank}"),
        };
        f.write_str(name)
    }
}

/// Whether the engine removes a producer on its own once it is no longer
/// alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    /// Removed only through an explicit `remove`.
    Persistent,
    /// Removed automatically after a tick in which `is_alive()` was false.
    Prunable,
}

// ────────────────────────────────────────────────────────────────────────────
// Output commands & slots
// ────────────────────────────────────────────────────────────────────────────

/// A value offered for one slot together with its blending authority.
///
/// `weight == 0` means "no opinion", `weight == 1` a full override.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputCmd {
    pub value: f32,
    pub weight: f32,
}

impl OutputCmd {
    /// A contribution with full authority.
    pub const fn full(value: f32) -> Self {
        Self { value, weight: 1.0 }
    }

    /// A contribution with explicit authority.
    pub const fn new(value: f32, weight: f32) -> Self {
        Self { value, weight }
    }

    /// The "no opinion" contribution.
    pub const fn unset() -> Self {
        Self { value: 0.0, weight: 0.0 }
    }

    /// `true` when the weight carries any authority.
    pub fn is_set(&self) -> bool {
        self.weight > 0.0
    }
}

/// Physical nature of an output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// Position-controlled joint, radians.
    Joint,
    /// Indicator LED, intensity in `[0, 1]`.
    Led,
    /// Velocity-controlled wheel, mm/s.
    Wheel,
}

/// Describes every output slot of the current hardware model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    kinds: Vec<SlotKind>,
}

impl SlotLayout {
    /// Build a layout from explicit slot kinds, index order.
    pub fn new(kinds: Vec<SlotKind>) -> Self {
        Self { kinds }
    }

    /// A layout of `n` joints.
    pub fn joints(n: usize) -> Self {
        Self::new(vec![SlotKind::Joint; n])
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// `true` for a layout without slots.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Kind of `slot`, `None` when absent on this model.
    pub fn kind(&self, slot: usize) -> Option<SlotKind> {
        self.kinds.get(slot).copied()
    }

    /// Indices of every slot of the given kind.
    pub fn slots_of(&self, kind: SlotKind) -> impl Iterator<Item = usize> + '_ {
        self.kinds
            .iter()
            .enumerate()
            .filter(move |(_, k)| **k == kind)
            .map(|(i, _)| i)
    }
}

/// One tick worth of committed outputs: `sub_frames` frames, each holding one
/// [`OutputCmd`] per slot.  Frame 0 is the earliest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputFrame {
    frames: Vec<Vec<OutputCmd>>,
}

impl OutputFrame {
    /// A frame buffer with every slot unset.
    pub fn new(sub_frames: usize, num_slots: usize) -> Self {
        Self {
            frames: vec![vec![OutputCmd::unset(); num_slots]; sub_frames],
        }
    }

    pub fn sub_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_slots(&self) -> usize {
        self.frames.first().map_or(0, Vec::len)
    }

    /// Command for `slot` in sub-frame `frame`.
    pub fn get(&self, frame: usize, slot: usize) -> Option<OutputCmd> {
        self.frames.get(frame).and_then(|f| f.get(slot)).copied()
    }

    /// Mutable access to one command.
    pub fn get_mut(&mut self, frame: usize, slot: usize) -> Option<&mut OutputCmd> {
        self.frames.get_mut(frame).and_then(|f| f.get_mut(slot))
    }

    /// Command for `slot` in the last sub-frame, i.e. the value the hardware
    /// holds once the tick has played out.
    pub fn last(&self, slot: usize) -> Option<OutputCmd> {
        self.frames.last().and_then(|f| f.get(slot)).copied()
    }

    /// Iterate over sub-frames in playback order.
    pub fn iter(&self) -> impl Iterator<Item = &[OutputCmd]> {
        self.frames.iter().map(Vec::as_slice)
    }

    /// Overwrite every sub-frame of every slot with `cmd`.
    pub fn fill(&mut self, cmd: OutputCmd) {
        for frame in &mut self.frames {
            frame.fill(cmd);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors & calibration
// ────────────────────────────────────────────────────────────────────────────

/// Sensor readings made available to producers for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Sensed value of each slot, same units as the outputs.
    pub positions: Vec<f32>,
    /// Servo duty cycle per slot in `[-1, 1]`; sustained non-zero duty means
    /// an external force is pushing against the commanded position.
    pub duties: Vec<f32>,
}

impl SensorSnapshot {
    /// A snapshot of `n` slots, all zero.
    pub fn zeroed(n: usize) -> Self {
        Self {
            positions: vec![0.0; n],
            duties: vec![0.0; n],
        }
    }

    /// Sensed value of `slot`, `0.0` when absent.
    pub fn position(&self, slot: usize) -> f32 {
        self.positions.get(slot).copied().unwrap_or(0.0)
    }

    /// Duty cycle of `slot`, `0.0` when absent.
    pub fn duty(&self, slot: usize) -> f32 {
        self.duties.get(slot).copied().unwrap_or(0.0)
    }
}

/// Per-slot scale/offset correcting the mismatch between commanded and
/// physical joint positions.
///
/// Outputs leave as `(value + offset) * scale`; raw readings come back through
/// the inverse so producers always reason in model units.  Slots beyond the
/// table pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    #[serde(default)]
    pub scale: Vec<f32>,
    #[serde(default)]
    pub offset: Vec<f32>,
}

impl CalibrationTable {
    /// Identity calibration.
    pub fn identity() -> Self {
        Self::default()
    }

    fn params(&self, slot: usize) -> (f32, f32) {
        let scale = self.scale.get(slot).copied().unwrap_or(1.0);
        let offset = self.offset.get(slot).copied().unwrap_or(0.0);
        (scale, offset)
    }

    /// Map a model-unit output to the value sent to hardware.
    pub fn apply_output(&self, slot: usize, value: f32) -> f32 {
        let (scale, offset) = self.params(slot);
        (value + offset) * scale
    }

    /// Map a raw hardware reading back into model units.
    pub fn apply_sensor(&self, slot: usize, raw: f32) -> f32 {
        let (scale, offset) = self.params(slot);
        if scale.abs() < f32::EPSILON {
            return raw;
        }
        raw / scale - offset
    }

    /// Calibrate every position of a raw snapshot in place.
    pub fn calibrate_snapshot(&self, snapshot: &mut SensorSnapshot) {
        for (slot, pos) in snapshot.positions.iter_mut().enumerate() {
            *pos = self.apply_sensor(slot, *pos);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Family of a motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Producer lifecycle and "target reached" notifications.
    Motion,
    /// Emergency stop freeze/release.
    EmergencyStop,
    /// Gait walker start/finish.
    Walk,
}

/// What happened to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Activate,
    Status,
    Deactivate,
}

/// Notification posted by the engine or by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Engine time of the tick that produced the event.
    pub engine_time: Duration,
    pub kind: EventKind,
    pub source: MotionId,
    pub transition: Transition,
    /// Transition-specific duration (time to settle, time paused, …).
    pub duration: Duration,
}

impl MotionEvent {
    /// Stamp a new event with a fresh id and the current wall-clock time.
    pub fn new(
        kind: EventKind,
        source: MotionId,
        transition: Transition,
        engine_time: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            engine_time,
            kind,
            source,
            transition,
            duration,
        }
    }
}

/// Event delivery collaborator.  Implementations must not block: the engine
/// posts from inside the control tick.
pub trait EventSink: Send + Sync {
    fn post_event(&self, event: MotionEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn post_event(&self, _event: MotionEvent) {}
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for the arbitration stack.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MuxError {
    #[error("Unknown motion: {0}")]
    UnknownMotion(MotionId),

    #[error("Motion {0} is already checked out")]
    AlreadyCheckedOut(MotionId),

    #[error("Motion {0} is held exclusively")]
    MotionBusy(MotionId),

    #[error("Motion {id} is not a {expected}")]
    TypeMismatch { id: MotionId, expected: String },

    #[error("Slot {slot} out of range (model has {num_slots} slots)")]
    SlotOutOfRange { slot: usize, num_slots: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Event channel error: {0}")]
    Channel(String),
}
