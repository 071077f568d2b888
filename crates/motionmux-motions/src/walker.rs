//! [`GaitWalker`] – walk a legged body along a list of footsteps.
//!
//! A path is a sequence of [`Footstep`]s, each a body pose in the world plus
//! the legs that stay on the ground while the body moves on to the next
//! footstep.  Between two footsteps:
//!
//! - a leg in contact keeps its foot fixed in the world, so in the body frame
//!   it drifts backwards as the body advances;
//! - a leg in flight lifts off (raise), swings to its neutral stance under
//!   the next body pose (flight) and sets down (lower), following a
//!   parabolic height profile over the whole step.
//!
//! Foot positions are turned into joint angles by the leg's [`IkSolver`]
//! every sub-frame.  The walker is done, and no longer alive, once fewer than
//! two footsteps remain.

use std::f32::consts::PI;
use std::time::Duration;

use motionmux_hal::{IkSolver, KinematicChain, Vec3};
use motionmux_kernel::{MotionCommand, MotionContext};
use motionmux_types::{EventKind, MotionId, OutputCmd, Transition};

// ────────────────────────────────────────────────────────────────────────────
// Path types
// ────────────────────────────────────────────────────────────────────────────

/// Planar pose: position plus heading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose2D {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl Pose2D {
    pub fn new(x: f32, y: f32, theta: f32) -> Self {
        Self { x, y, theta }
    }

    /// Body-frame point to world frame; `z` passes through.
    pub fn transform(&self, p: Vec3) -> Vec3 {
        let (s, c) = self.theta.sin_cos();
        Vec3::new(self.x + c * p.x - s * p.y, self.y + s * p.x + c * p.y, p.z)
    }

    /// World-frame point to body frame; `z` passes through.
    pub fn inverse_transform(&self, p: Vec3) -> Vec3 {
        let (s, c) = self.theta.sin_cos();
        let (dx, dy) = (p.x - self.x, p.y - self.y);
        Vec3::new(c * dx + s * dy, -s * dx + c * dy, p.z)
    }

    /// Pose a fraction `s` of the way to `to`, turning the short way round.
    pub fn lerp(&self, to: &Pose2D, s: f32) -> Pose2D {
        let mut dtheta = to.theta - self.theta;
        while dtheta > PI {
            dtheta -= 2.0 * PI;
        }
        while dtheta < -PI {
            dtheta += 2.0 * PI;
        }
        Pose2D {
            x: self.x + (to.x - self.x) * s,
            y: self.y + (to.y - self.y) * s,
            theta: self.theta + dtheta * s,
        }
    }
}

/// One footstep of a path.
#[derive(Debug, Clone, PartialEq)]
pub struct Footstep {
    pub body: Pose2D,
    /// Per leg: on the ground while moving on to the next footstep.
    pub contacts: Vec<bool>,
}

impl Footstep {
    pub fn new(body: Pose2D, contacts: Vec<bool>) -> Self {
        Self { body, contacts }
    }

    fn in_contact(&self, leg: usize) -> bool {
        self.contacts.get(leg).copied().unwrap_or(true)
    }
}

/// One leg: its joints, where it is mounted and where its foot rests.
#[derive(Debug, Clone)]
pub struct Leg {
    pub chain: KinematicChain,
    /// Hip position in the body frame; IK targets are relative to it.
    pub hip: Vec3,
    /// Resting foot position in the body frame; `z` is ground height.
    pub neutral: Vec3,
}

impl Leg {
    pub fn new(chain: KinematicChain, hip: Vec3, neutral: Vec3) -> Self {
        Self { chain, hip, neutral }
    }
}

/// Step timing and shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaitSettings {
    /// Nominal time from one footstep to the next.
    pub step_duration: Duration,
    /// Peak foot lift.
    pub step_height: f32,
    /// Share of the step spent lifting before the foot moves sideways.
    pub raise_fraction: f32,
    /// Share of the step spent setting down after the foot arrived.
    pub lower_fraction: f32,
}

impl Default for GaitSettings {
    fn default() -> Self {
        Self {
            step_duration: Duration::from_millis(400),
            step_height: 0.02,
            raise_fraction: 0.25,
            lower_fraction: 0.25,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GaitWalker
// ────────────────────────────────────────────────────────────────────────────

/// Footstep-following gait producer.
pub struct GaitWalker {
    id: MotionId,
    auto_prune: bool,
    legs: Vec<Leg>,
    solver: Box<dyn IkSolver>,
    settings: GaitSettings,
    steps: Vec<Footstep>,
    index: usize,
    feet: Vec<Vec3>,
    started: bool,
    started_at: Duration,
    step_start: Duration,
}

impl std::fmt::Debug for GaitWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaitWalker")
            .field("id", &self.id)
            .field("legs", &self.legs.len())
            .field("steps", &self.steps.len())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl GaitWalker {
    pub fn new(legs: Vec<Leg>, solver: Box<dyn IkSolver>) -> Self {
        let feet = legs.iter().map(|leg| leg.neutral).collect();
        Self {
            id: MotionId::INVALID,
            auto_prune: true,
            legs,
            solver,
            settings: GaitSettings::default(),
            steps: Vec::new(),
            index: 0,
            feet,
            started: false,
            started_at: Duration::ZERO,
            step_start: Duration::ZERO,
        }
    }

    pub fn with_settings(mut self, settings: GaitSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the path; walking starts over at the next update.
    pub fn set_path(&mut self, steps: Vec<Footstep>) {
        if steps.len() < 2 {
            tracing::warn!(motion = %self.id, steps = steps.len(), "path needs at least two footsteps");
        }
        self.steps = steps;
        self.index = 0;
        self.started = false;
    }

    pub fn path(&self) -> &[Footstep] {
        &self.steps
    }

    /// Index of the footstep the body is walking away from.
    pub fn current_step(&self) -> usize {
        self.index
    }

    /// Footsteps left, counting the current one.
    pub fn remaining(&self) -> usize {
        self.steps.len().saturating_sub(self.index)
    }

    /// World positions of the feet at the start of the current step.
    pub fn feet(&self) -> &[Vec3] {
        &self.feet
    }

    fn start(&mut self, now: Duration) {
        self.started = true;
        self.started_at = now;
        self.step_start = now;
        if let Some(first) = self.steps.first() {
            self.feet = self.legs.iter().map(|leg| first.body.transform(leg.neutral)).collect();
        }
    }

    fn finish_step(&mut self) {
        let (Some(from), Some(to)) = (self.steps.get(self.index), self.steps.get(self.index + 1)) else {
            return;
        };
        for (leg_index, (leg, foot)) in self.legs.iter().zip(&mut self.feet).enumerate() {
            if !from.in_contact(leg_index) {
                *foot = to.body.transform(leg.neutral);
            }
        }
        self.index += 1;
        self.step_start += self.settings.step_duration;
    }

    /// Body-frame foot positions at time `t`, advancing the path as steps
    /// elapse.  Returns `true` if a step finished the path.
    fn pose_at(&mut self, t: Duration, out: &mut Vec<Vec3>) -> bool {
        let mut finished = false;
        let duration = self.settings.step_duration;
        while self.remaining() >= 2 && t >= self.step_start + duration {
            self.finish_step();
            finished = self.remaining() < 2;
        }

        out.clear();
        let (Some(from), Some(to)) = (self.steps.get(self.index), self.steps.get(self.index + 1)) else {
            // Path done (or never long enough): stand on the last footstep.
            let body = self.steps.last().map(|s| s.body).unwrap_or_default();
            out.extend(self.feet.iter().map(|&foot| body.inverse_transform(foot)));
            return finished;
        };

        let s = if duration.is_zero() {
            1.0
        } else {
            (t.saturating_sub(self.step_start).as_secs_f32() / duration.as_secs_f32()).clamp(0.0, 1.0)
        };
        let body = from.body.lerp(&to.body, s);
        for (leg_index, (leg, &foot)) in self.legs.iter().zip(&self.feet).enumerate() {
            let world = if from.in_contact(leg_index) {
                foot
            } else {
                self.swing(foot, to.body.transform(leg.neutral), s)
            };
            out.push(body.inverse_transform(world));
        }
        finished
    }

    // Raise / flight / lower with a parabolic lift, acc = 4h / dur^2.
    fn swing(&self, from: Vec3, to: Vec3, s: f32) -> Vec3 {
        let GaitSettings {
            step_duration,
            step_height,
            raise_fraction,
            lower_fraction,
        } = self.settings;
        let flight = (1.0 - raise_fraction - lower_fraction).max(f32::EPSILON);
        let u = ((s - raise_fraction) / flight).clamp(0.0, 1.0);
        let dur = step_duration.as_secs_f32();
        let tau = s * dur;
        let lift = if dur > 0.0 {
            let acc = 4.0 * step_height / (dur * dur);
            acc * tau * (dur - tau)
        } else {
            0.0
        };
        Vec3::new(
            from.x + (to.x - from.x) * u,
            from.y + (to.y - from.y) * u,
            from.z + (to.z - from.z) * u + lift,
        )
    }
}

impl MotionCommand for GaitWalker {
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
        if self.steps.len() < 2 {
            return 0;
        }
        if !self.started {
            self.start(ctx.now());
            tracing::info!(motion = %ctx.id(), steps = self.steps.len(), "walk started");
            ctx.post_event(EventKind::Walk, Transition::Activate, Duration::ZERO);
        }

        let mut feet = Vec::with_capacity(self.legs.len());
        let mut finished_at = None;
        for frame in 0..ctx.sub_frames() {
            let t = ctx.now() + ctx.frame_time() * frame as u32;
            if self.pose_at(t, &mut feet) {
                finished_at = Some(t);
            }
            for (leg, &foot) in self.legs.iter_mut().zip(&feet) {
                let target = foot.sub(leg.hip);
                if !self.solver.solve(&target, &mut leg.chain) {
                    tracing::trace!(motion = %ctx.id(), ?target, "foot target out of reach");
                }
                for (&slot, &angle) in leg.chain.slots().iter().zip(leg.chain.angles()) {
                    ctx.set_output_frame(slot, frame, OutputCmd::full(angle));
                }
            }
        }

        if let Some(t) = finished_at {
            let elapsed = t.saturating_sub(self.started_at);
            tracing::info!(motion = %ctx.id(), ?elapsed, "walk finished");
            ctx.post_event(EventKind::Walk, Transition::Deactivate, elapsed);
        }
        self.legs.iter().map(|leg| leg.chain.joint_count()).sum()
    }

    fn is_dirty(&self) -> bool {
        !self.started && self.steps.len() >= 2
    }

    fn is_alive(&self) -> bool {
        self.remaining() >= 2
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
        "GaitWalker"
    }
}
