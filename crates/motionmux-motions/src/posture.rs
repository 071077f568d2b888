//! [`PostureMotion`] – drive a whole set of slots to a target posture.
//!
//! Each slot carries its own target command (weight 0 leaves the slot alone)
//! and its own speed limit.  When a new target is set the producer picks up
//! from whatever was last committed, not from the sensors, so blending in
//! never jumps.
//!
//! # Example
//!
//! ```rust
//! use motionmux_motions::posture::PostureMotion;
//! use motionmux_types::OutputCmd;
//!
//! let mut stand = PostureMotion::new(3).with_hold(false);
//! stand.set_value(0, 0.4);
//! stand.set_target(2, OutputCmd::new(-0.2, 0.5));
//! stand.set_max_speed_all(0.05);
//! assert!(stand.target(1).is_none());
//! ```

use std::time::Duration;

use motionmux_kernel::{MotionCommand, MotionContext, SettleTracker};
use motionmux_types::{MotionId, OutputCmd};

use crate::interpolate::interpolate_frames;

/// Speed-limited full-vector posture producer.
#[derive(Debug)]
pub struct PostureMotion {
    id: MotionId,
    auto_prune: bool,
    targets: Vec<OutputCmd>,
    max_steps: Vec<f32>,
    current: Vec<f32>,
    resync: bool,
    tracker: SettleTracker,
    scratch: Vec<f32>,
}

impl PostureMotion {
    /// A posture over `num_slots` slots with no targets, no speed limit and
    /// `hold` on.
    pub fn new(num_slots: usize) -> Self {
        Self {
            id: MotionId::INVALID,
            auto_prune: true,
            targets: vec![OutputCmd::unset(); num_slots],
            max_steps: vec![0.0; num_slots],
            current: vec![0.0; num_slots],
            resync: false,
            tracker: SettleTracker::new(true, None),
            scratch: Vec::new(),
        }
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.tracker.set_hold(hold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tracker.set_timeout(Some(timeout));
        self
    }

    pub fn num_slots(&self) -> usize {
        self.targets.len()
    }

    /// Set the command for `slot`.  Slots beyond the posture are ignored.
    pub fn set_target(&mut self, slot: usize, cmd: OutputCmd) {
        if let Some(target) = self.targets.get_mut(slot) {
            *target = cmd;
            self.resync = true;
            self.tracker.mark_dirty();
        }
    }

    /// Move the target of `slot` but keep interpolating from where the
    /// posture currently is.
    pub fn retarget(&mut self, slot: usize, cmd: OutputCmd) {
        if let Some(target) = self.targets.get_mut(slot) {
            *target = cmd;
            self.tracker.mark_dirty();
        }
    }

    /// Jump straight to `cmd`: target and interpolation origin both move.
    pub fn snap(&mut self, slot: usize, cmd: OutputCmd) {
        if let (Some(target), Some(current)) = (self.targets.get_mut(slot), self.current.get_mut(slot)) {
            *target = cmd;
            *current = cmd.value;
            self.tracker.mark_dirty();
        }
    }

    /// Full-weight target for `slot`.
    pub fn set_value(&mut self, slot: usize, value: f32) {
        self.set_target(slot, OutputCmd::full(value));
    }

    /// Replace every target at once; missing entries become unset.
    pub fn set_targets(&mut self, cmds: &[OutputCmd]) {
        for (slot, target) in self.targets.iter_mut().enumerate() {
            *target = cmds.get(slot).copied().unwrap_or_default();
        }
        self.resync = true;
        self.tracker.mark_dirty();
    }

    /// Target of `slot`, `None` when the slot is left alone.
    pub fn target(&self, slot: usize) -> Option<OutputCmd> {
        self.targets.get(slot).copied().filter(OutputCmd::is_set)
    }

    pub fn targets(&self) -> &[OutputCmd] {
        &self.targets
    }

    /// Stop driving every slot.
    pub fn clear(&mut self) {
        self.targets.fill(OutputCmd::unset());
        self.tracker.mark_dirty();
    }

    /// Units per sub-frame; `<= 0` means unlimited.
    pub fn set_max_speed(&mut self, slot: usize, max_step: f32) {
        if let Some(step) = self.max_steps.get_mut(slot) {
            *step = max_step;
        }
    }

    pub fn set_max_speed_all(&mut self, max_step: f32) {
        self.max_steps.fill(max_step);
    }

    pub fn max_speed(&self, slot: usize) -> f32 {
        self.max_steps.get(slot).copied().unwrap_or(0.0)
    }

    /// Where interpolation currently stands for `slot`.
    pub fn current(&self, slot: usize) -> f32 {
        self.current.get(slot).copied().unwrap_or(0.0)
    }

    /// Overwrite the interpolation origin of `slot` without re-targeting.
    pub fn set_current(&mut self, slot: usize, value: f32) {
        if let Some(current) = self.current.get_mut(slot) {
            *current = value;
        }
    }

    pub fn tracker(&self) -> &SettleTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SettleTracker {
        &mut self.tracker
    }

    /// Play one tick into `ctx` with the weights of sub-frame `f` multiplied
    /// by `scale(f)`.  Returns the number of slots driven and whether every driven slot
    /// sits on its target.
    pub(crate) fn play(&mut self, ctx: &mut MotionContext<'_>, scale: impl Fn(usize) -> f32) -> (usize, bool) {
        if self.tracker.begin(ctx.now()) && std::mem::take(&mut self.resync) {
            for (slot, current) in self.current.iter_mut().enumerate() {
                *current = ctx.get_output(slot).value;
            }
        }

        let frames = ctx.sub_frames();
        self.scratch.resize(frames, 0.0);
        let mut driven = 0;
        let mut reached = true;
        for slot in 0..self.targets.len() {
            let target = self.targets[slot];
            if !target.is_set() {
                continue;
            }
            let max_step = self.max_steps.get(slot).copied().unwrap_or(0.0);
            reached &= interpolate_frames(self.current[slot], target.value, max_step, &mut self.scratch);
            for (frame, &value) in self.scratch.iter().enumerate() {
                ctx.set_output_frame(slot, frame, OutputCmd::new(value, target.weight * scale(frame)));
            }
            if let Some(&last) = self.scratch.last() {
                self.current[slot] = last;
            }
            driven += 1;
        }
        (driven, reached)
    }
}

impl MotionCommand for PostureMotion {
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
        let (driven, reached) = self.play(ctx, |_| 1.0);
        if reached {
            self.tracker.settle(ctx);
        }
        driven
    }

    fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    fn is_alive(&self) -> bool {
        self.tracker.is_alive(self.name())
    }

    fn id(&self) -> MotionId {
        self.id
    }

    fn set_id(&mut self, id: MotionId) {
        self.id = id;
    }

    fn auto_prune(&self) -> bool {
        self.auto_prune
    }

    fn set_auto_prune(&mut self, auto_prune: bool) {
        self.auto_prune = auto_prune;
    }

    fn name(&self) -> &str {
        "PostureMotion"
    }
}
