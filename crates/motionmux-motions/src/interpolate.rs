//! Speed-limited interpolation shared by the target-seeking producers.
//!
//! Every sub-frame the value moves toward its target by at most `max_step`.
//! Once the remaining distance fits in one step the value snaps to the
//! target and the rest of the tick is filled with it.  A `max_step` of zero
//! or less means "no limit": the target is reached on the first sub-frame.
//!
//! # Example
//!
//! ```rust
//! use motionmux_motions::interpolate::{frames_to_reach, interpolate_frames};
//!
//! let mut frames = [0.0; 4];
//! let reached = interpolate_frames(0.0, 1.0, 0.25, &mut frames);
//! assert!(reached);
//! assert_eq!(frames, [0.25, 0.5, 0.75, 1.0]);
//! assert_eq!(frames_to_reach(0.0, 1.0, 0.25), 4);
//! ```

/// One sub-frame step from `current` toward `target`.
pub fn step_toward(current: f32, target: f32, max_step: f32) -> f32 {
    if max_step <= 0.0 || max_step.is_nan() {
        return target;
    }
    let delta = target - current;
    if delta.abs() <= max_step {
        target
    } else {
        current + max_step.copysign(delta)
    }
}

/// Fill `out` with consecutive steps starting after `current`.  Returns
/// `true` when the last entry sits on the target.
pub fn interpolate_frames(current: f32, target: f32, max_step: f32, out: &mut [f32]) -> bool {
    let mut value = current;
    for slot in out.iter_mut() {
        value = step_toward(value, target, max_step);
        *slot = value;
    }
    value == target
}

/// Number of sub-frames needed to go from `start` to `target`.
pub fn frames_to_reach(start: f32, target: f32, max_step: f32) -> usize {
    let distance = (target - start).abs();
    if distance == 0.0 {
        return 0;
    }
    if max_step <= 0.0 || max_step.is_nan() {
        return 1;
    }
    (distance / max_step).ceil() as usize
}

/// A value converging on a target at a bounded speed, one tick at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    current: f32,
    target: f32,
    max_step: f32,
}

impl Channel {
    pub fn new(current: f32, target: f32, max_step: f32) -> Self {
        Self {
            current,
            target,
            max_step,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn max_step(&self) -> f32 {
        self.max_step
    }

    pub fn retarget(&mut self, target: f32) {
        self.target = target;
    }

    /// Restart from `current`, e.g. the last committed output.
    pub fn resync(&mut self, current: f32) {
        self.current = current;
    }

    pub fn set_max_step(&mut self, max_step: f32) {
        self.max_step = max_step;
    }

    pub fn is_reached(&self) -> bool {
        self.current == self.target
    }

    /// Play one tick into `out` and keep its last value.
    pub fn advance(&mut self, out: &mut [f32]) -> bool {
        let reached = interpolate_frames(self.current, self.target, self.max_step, out);
        if let Some(&last) = out.last() {
            self.current = last;
        }
        reached
    }
}
