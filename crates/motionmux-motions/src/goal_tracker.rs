//! [`GoalTracker`] – point a kinematic chain at a goal.
//!
//! Joint targets come either from an [`IkSolver`] (`look_at`) or directly
//! (`set_joints`); the joints then move there at a bounded speed.  Once
//! settled the tracker stays alive only while the sensed joints are still
//! away from their targets, and gives up after a timeout, which usually
//! means another producer is fighting it or the goal is out of reach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use motionmux_hal::{IkSolver, KinematicChain, Vec3};
use motionmux_kernel::{MotionCommand, MotionContext, MotionPhase, SettleTracker};
use motionmux_types::{MotionId, OutputCmd};

use crate::interpolate::Channel;

/// Default sensed-vs-target tolerance, radians.
pub const DEFAULT_TOLERANCE: f32 = 0.05;
/// Default time a settled target is held before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Goal-seeking producer for one chain.
#[derive(Debug)]
pub struct GoalTracker {
    id: MotionId,
    auto_prune: bool,
    chain: KinematicChain,
    channels: Vec<Channel>,
    tracker: SettleTracker,
    tolerance: f32,
    tracking_error: f32,
    timeout_warned: AtomicBool,
    scratch: Vec<f32>,
}

impl GoalTracker {
    /// A tracker driving `chain` with unlimited joint speed.
    pub fn new(chain: KinematicChain) -> Self {
        let channels = chain.angles().iter().map(|&a| Channel::new(a, a, 0.0)).collect();
        Self {
            id: MotionId::INVALID,
            auto_prune: true,
            chain,
            channels,
            tracker: SettleTracker::new(true, Some(DEFAULT_TIMEOUT)),
            tolerance: DEFAULT_TOLERANCE,
            tracking_error: 0.0,
            timeout_warned: AtomicBool::new(false),
            scratch: Vec::new(),
        }
    }

    /// Units per sub-frame for every joint.
    pub fn with_max_speed(mut self, max_step: f32) -> Self {
        for ch in &mut self.channels {
            ch.set_max_step(max_step);
        }
        self
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.tracker.set_hold(hold);
        self
    }

    /// `None` holds forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tracker.set_timeout(timeout);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn chain(&self) -> &KinematicChain {
        &self.chain
    }

    /// Joint targets, one per joint.
    pub fn targets(&self) -> Vec<f32> {
        self.channels.iter().map(Channel::target).collect()
    }

    /// Largest sensed-vs-target gap seen at the last update.
    pub fn tracking_error(&self) -> f32 {
        self.tracking_error
    }

    /// Aim the chain's end effector at `point` (chain base frame).  Returns
    /// whether the solver reached it; the best effort is used either way.
    pub fn look_at(&mut self, point: &Vec3, solver: &dyn IkSolver) -> bool {
        let converged = solver.solve(point, &mut self.chain);
        if !converged {
            tracing::debug!(motion = %self.id, ?point, "goal not fully reachable");
        }
        for (ch, &angle) in self.channels.iter_mut().zip(self.chain.angles()) {
            ch.retarget(angle);
        }
        self.mark_dirty();
        converged
    }

    /// Set joint targets directly, clamped to the chain's limits.  Returns
    /// `false` when any angle had to be clamped.
    pub fn set_joints(&mut self, angles: &[f32]) -> bool {
        let mut within = true;
        for (joint, &angle) in angles.iter().enumerate().take(self.chain.joint_count()) {
            within &= self.chain.set_angle(joint, angle);
        }
        for (ch, &angle) in self.channels.iter_mut().zip(self.chain.angles()) {
            ch.retarget(angle);
        }
        self.mark_dirty();
        within
    }

    fn mark_dirty(&mut self) {
        self.tracker.mark_dirty();
        self.timeout_warned.store(false, Ordering::Relaxed);
    }
}

impl MotionCommand for GoalTracker {
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
        if self.tracker.begin(ctx.now()) {
            for (ch, &slot) in self.channels.iter_mut().zip(self.chain.slots()) {
                ch.resync(ctx.get_output(slot).value);
            }
        }

        self.scratch.resize(ctx.sub_frames(), 0.0);
        let mut reached = true;
        let mut error: f32 = 0.0;
        for (ch, &slot) in self.channels.iter_mut().zip(self.chain.slots()) {
            reached &= ch.advance(&mut self.scratch);
            for (frame, &value) in self.scratch.iter().enumerate() {
                ctx.set_output_frame(slot, frame, OutputCmd::full(value));
            }
            error = error.max((ctx.sensors().position(slot) - ch.target()).abs());
        }
        self.tracking_error = error;
        if reached {
            self.tracker.settle(ctx);
        }
        self.channels.len()
    }

    fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    fn is_alive(&self) -> bool {
        match self.tracker.phase() {
            MotionPhase::Fresh | MotionPhase::Dirty | MotionPhase::Converging => true,
            MotionPhase::Settled => self.tracking_error > self.tolerance,
            MotionPhase::Dead => {
                if self.tracker.hold() && self.auto_prune && !self.timeout_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        motion = %self.id,
                        error = self.tracking_error,
                        "goal tracker timed out; possible joint conflict or unreachable goal"
                    );
                }
                false
            }
        }
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
        "GoalTracker"
    }
}
