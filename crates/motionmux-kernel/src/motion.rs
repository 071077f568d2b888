//! The [`MotionCommand`] contract and the contexts handed to producers.
//!
//! A motion producer is any type that, once per tick, proposes values for
//! some output slots.  The engine calls [`MotionCommand::update_outputs`]
//! with a [`MotionContext`] through which the producer reads the sensor
//! snapshot and the last committed outputs, and stages its own
//! contributions.
//!
//! # Example
//!
//! ```rust
//! use motionmux_kernel::motion::{MotionCommand, MotionContext};
//! use motionmux_types::{MotionId, OutputCmd};
//!
//! /// Holds slot 0 at a fixed value forever.
//! struct Hold {
//!     id: MotionId,
//!     value: f32,
//! }
//!
//! impl MotionCommand for Hold {
//!     fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
//!         ctx.set_output(0, OutputCmd::full(self.value));
//!         1
//!     }
//!     fn is_dirty(&self) -> bool { false }
//!     fn is_alive(&self) -> bool { true }
//!     fn id(&self) -> MotionId { self.id }
//!     fn set_id(&mut self, id: MotionId) { self.id = id; }
//!     fn name(&self) -> &str { "Hold" }
//! }
//! ```

use std::any::Any;
use std::time::Duration;

use motionmux_types::{
    EventKind, EventSink, MotionEvent, MotionId, OutputCmd, OutputFrame, Priority,
    SensorSnapshot, SlotLayout, Transition,
};

use crate::compositor::StagingBuffer;

// ────────────────────────────────────────────────────────────────────────────
// Downcasting support
// ────────────────────────────────────────────────────────────────────────────

/// Object-safe access to [`Any`], so a `dyn MotionCommand` can be downcast to
/// its concrete type under a typed checkout.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MotionCommand
// ────────────────────────────────────────────────────────────────────────────

/// A motion producer.
///
/// Implementations compute only from their own state, the context's sensor
/// snapshot and the last committed outputs.  They must not block.
pub trait MotionCommand: AsAny + Send + Sync {
    /// Stage this tick's contributions through `ctx`.  Returns the number of
    /// slots touched, for diagnostics only.
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize;

    /// `true` when the producer has been given a new target it has not yet
    /// started working toward.
    fn is_dirty(&self) -> bool;

    /// `false` once the producer has nothing left to do.  Prunable producers
    /// are removed after a tick in which this returns `false`.
    fn is_alive(&self) -> bool;

    /// Handle assigned on registration ([`MotionId::INVALID`] before).
    fn id(&self) -> MotionId;

    fn set_id(&mut self, id: MotionId);

    /// Whether the engine may prune this producer when it stops being alive.
    fn auto_prune(&self) -> bool {
        true
    }

    fn set_auto_prune(&mut self, _auto_prune: bool) {}

    /// Runs once, at the safe point where the registration takes effect.
    fn on_start(&mut self, _ctx: &StartContext<'_>) {}

    /// Runs once, at the safe point where the removal takes effect.
    fn on_stop(&mut self) {}

    /// Human-readable name used in diagnostics.
    fn name(&self) -> &str;
}

// ────────────────────────────────────────────────────────────────────────────
// StartContext
// ────────────────────────────────────────────────────────────────────────────

/// What a producer can see when it is started.
pub struct StartContext<'a> {
    pub(crate) id: MotionId,
    pub(crate) now: Duration,
    pub(crate) layout: &'a SlotLayout,
    pub(crate) committed: &'a OutputFrame,
}

impl<'a> StartContext<'a> {
    pub fn new(
        id: MotionId,
        now: Duration,
        layout: &'a SlotLayout,
        committed: &'a OutputFrame,
    ) -> Self {
        Self {
            id,
            now,
            layout,
            committed,
        }
    }

    pub fn id(&self) -> MotionId {
        self.id
    }

    /// Engine time at which the producer starts.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn layout(&self) -> &SlotLayout {
        self.layout
    }

    /// Last committed command for `slot` (unset when absent).
    pub fn get_output(&self, slot: usize) -> OutputCmd {
        self.committed.last(slot).unwrap_or_default()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MotionContext
// ────────────────────────────────────────────────────────────────────────────

/// Per-call view of the engine given to [`MotionCommand::update_outputs`].
pub struct MotionContext<'a> {
    id: MotionId,
    now: Duration,
    frame_time: Duration,
    layout: &'a SlotLayout,
    sensors: &'a SensorSnapshot,
    committed: &'a OutputFrame,
    staging: &'a mut StagingBuffer,
    sink: &'a dyn EventSink,
    priority_request: Option<Priority>,
}

impl<'a> MotionContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MotionId,
        now: Duration,
        frame_time: Duration,
        layout: &'a SlotLayout,
        sensors: &'a SensorSnapshot,
        committed: &'a OutputFrame,
        staging: &'a mut StagingBuffer,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            id,
            now,
            frame_time,
            layout,
            sensors,
            committed,
            staging,
            sink,
            priority_request: None,
        }
    }

    /// Handle of the producer being updated.
    pub fn id(&self) -> MotionId {
        self.id
    }

    /// Engine time at the start of this tick; sub-frame `i` plays out at
    /// `now() + i * frame_time()`.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn frame_time(&self) -> Duration {
        self.frame_time
    }

    pub fn sub_frames(&self) -> usize {
        self.staging.sub_frames()
    }

    pub fn num_slots(&self) -> usize {
        self.staging.num_slots()
    }

    pub fn layout(&self) -> &SlotLayout {
        self.layout
    }

    /// Calibrated sensor readings for this tick.
    pub fn sensors(&self) -> &SensorSnapshot {
        self.sensors
    }

    /// Command committed for `slot` at the end of the previous tick.
    pub fn get_output(&self, slot: usize) -> OutputCmd {
        self.committed.last(slot).unwrap_or_default()
    }

    /// Contribute `cmd` to every sub-frame of `slot`.
    pub fn set_output(&mut self, slot: usize, cmd: OutputCmd) {
        for frame in 0..self.staging.sub_frames() {
            self.staging.stage(self.id, slot, frame, cmd);
        }
    }

    /// Contribute `cmd` to a single sub-frame of `slot`.
    pub fn set_output_frame(&mut self, slot: usize, frame: usize, cmd: OutputCmd) {
        self.staging.stage(self.id, slot, frame, cmd);
    }

    /// Contribute one command per sub-frame.  A shorter slice repeats its
    /// last command over the remaining sub-frames; a longer one is rejected
    /// as a configuration error.
    pub fn set_output_frames(&mut self, slot: usize, cmds: &[OutputCmd]) {
        let n = self.staging.sub_frames();
        let Some(&last) = cmds.last() else {
            return;
        };
        if cmds.len() > n {
            self.staging.warn_bad_address(self.id, slot, cmds.len() - 1);
            return;
        }
        for frame in 0..n {
            let cmd = cmds.get(frame).copied().unwrap_or(last);
            self.staging.stage(self.id, slot, frame, cmd);
        }
    }

    /// Post an event attributed to this producer, stamped with the tick time.
    pub fn post_event(&self, kind: EventKind, transition: Transition, duration: Duration) {
        self.sink.post_event(MotionEvent::new(
            kind,
            self.id,
            transition,
            self.now,
            duration,
        ));
    }

    /// Ask the engine to move this producer to `priority` from the next
    /// tick on.
    pub fn request_priority(&mut self, priority: Priority) {
        self.priority_request = Some(priority);
    }

    pub(crate) fn take_priority_request(&mut self) -> Option<Priority> {
        self.priority_request.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motionmux_types::NullSink;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<MotionEvent>>,
    }

    impl EventSink for RecordingSink {
        fn post_event(&self, event: MotionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        layout: SlotLayout,
        sensors: SensorSnapshot,
        committed: OutputFrame,
        staging: StagingBuffer,
    }

    impl Fixture {
        fn new() -> Self {
            let mut committed = OutputFrame::new(4, 2);
            *committed.get_mut(3, 1).unwrap() = OutputCmd::full(0.25);
            Self {
                layout: SlotLayout::joints(2),
                sensors: SensorSnapshot::zeroed(2),
                committed,
                staging: StagingBuffer::new(4, 2),
            }
        }

        fn ctx<'a>(&'a mut self, sink: &'a dyn EventSink) -> MotionContext<'a> {
            MotionContext::new(
                MotionId::from_raw(9),
                Duration::from_millis(96),
                Duration::from_millis(8),
                &self.layout,
                &self.sensors,
                &self.committed,
                &mut self.staging,
                sink,
            )
        }
    }

    #[test]
    fn set_output_stages_every_sub_frame() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx(&NullSink);
        ctx.set_output(0, OutputCmd::full(1.0));
        assert_eq!(ctx.sub_frames(), 4);
        assert_eq!(fx.staging.iter().count(), 4);
    }

    #[test]
    fn set_output_frames_repeats_last_command() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx(&NullSink);
        ctx.set_output_frames(1, &[OutputCmd::full(0.1), OutputCmd::full(0.2)]);
        let staged: Vec<_> = fx.staging.iter().map(|(f, _, c)| (f, c.value)).collect();
        assert_eq!(staged, vec![(0, 0.1), (1, 0.2), (2, 0.2), (3, 0.2)]);
    }

    #[test]
    fn set_output_frames_rejects_too_many_frames() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx(&NullSink);
        ctx.set_output_frames(0, &[OutputCmd::full(0.1); 5]);
        assert!(fx.staging.is_empty());
    }

    #[test]
    fn get_output_reads_last_committed_sub_frame() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx(&NullSink);
        assert_eq!(ctx.get_output(1), OutputCmd::full(0.25));
        assert_eq!(ctx.get_output(7), OutputCmd::unset());
    }

    #[test]
    fn post_event_is_stamped_with_tick_time() {
        let sink = RecordingSink::default();
        let mut fx = Fixture::new();
        let ctx = fx.ctx(&sink);
        ctx.post_event(EventKind::Motion, Transition::Status, Duration::from_millis(40));

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, MotionId::from_raw(9));
        assert_eq!(events[0].engine_time, Duration::from_millis(96));
    }

    #[test]
    fn priority_request_is_taken_once() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx(&NullSink);
        ctx.request_priority(Priority::EMERGENCY.one_above());
        assert_eq!(ctx.take_priority_request(), Some(Priority::EMERGENCY.one_above()));
        assert_eq!(ctx.take_priority_request(), None);
    }
}
