//! [`EmergencyStop`] – freeze every output where it is, release with a fade.
//!
//! Stopping freezes each joint at the value it was last commanded (or, for a
//! slot nobody drives, at its sensed value), forces wheels to zero and lets
//! LEDs from other producers show through apart from a pair of blinking
//! indicator LEDs.  While frozen the joints give way to sustained external
//! force and re-freeze wherever they get pushed to.  Releasing fades the
//! override out over a configurable window instead of letting go at once.
//!
//! Requests made from other threads (through a checkout) only take effect at
//! the next update, where the engine time and the committed outputs are
//! known.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use motionmux_kernel::{EngineConfig, MotionEngine};
//! use motionmux_motions::emergency_stop::EmergencyStop;
//! use motionmux_types::{NullSink, Priority, SensorSnapshot};
//!
//! let engine = MotionEngine::new(EngineConfig::with_slots(2), Arc::new(NullSink)).unwrap();
//! let estop = EmergencyStop::new(engine.layout());
//! let id = engine.add_persistent(Box::new(estop), Priority::EMERGENCY);
//!
//! engine.checkout_as::<EmergencyStop>(id).unwrap().set_stopped(true);
//! engine.tick(&SensorSnapshot { positions: vec![0.3, -0.1], duties: vec![0.0; 2] });
//! assert_eq!(engine.get_output(0).value, 0.3);
//! ```

use std::time::Duration;

use motionmux_kernel::{MotionCommand, MotionContext};
use motionmux_types::{EventKind, MotionId, OutputCmd, Priority, SlotKind, SlotLayout, Transition};

use crate::led::LedEngine;
use crate::posture::PostureMotion;

/// Tuning knobs of the emergency stop.
#[derive(Debug, Clone, PartialEq)]
pub struct EstopSettings {
    /// Length of the release fade.
    pub fade: Duration,
    /// Joint speed limit while frozen, units per sub-frame.
    pub max_speed: f32,
    /// Smoothed duty cycle beyond which a joint yields.
    pub duty_cutoff: f32,
    /// Sensed-vs-held gap beyond which a joint re-freezes where it is.
    pub refreeze_gap: f32,
    /// Ticks to wait after freezing before reacting to outside forces.
    pub rest_ticks: u32,
    /// Blink period of the indicator LEDs.
    pub blink_period: Duration,
    /// Weight of the indicator LEDs while frozen.
    pub indicator_weight: f32,
}

impl Default for EstopSettings {
    fn default() -> Self {
        Self {
            fade: Duration::from_secs(1),
            max_speed: 0.15,
            duty_cutoff: 0.2,
            refreeze_gap: 0.15,
            rest_ticks: 5,
            blink_period: Duration::from_secs(2),
            indicator_weight: 0.5,
        }
    }
}

/// Freeze/release override.
#[derive(Debug)]
pub struct EmergencyStop {
    id: MotionId,
    settings: EstopSettings,
    kinds: Vec<SlotKind>,
    posture: PostureMotion,
    leds: LedEngine,
    led_slots: Vec<usize>,
    indicators: u64,
    requested: Option<bool>,
    frozen: bool,
    frozen_at: Duration,
    release_end: Option<Duration>,
    duty_avgs: Vec<f32>,
    escalation: Option<(Priority, Priority)>,
}

impl EmergencyStop {
    pub fn new(layout: &SlotLayout) -> Self {
        Self::with_settings(layout, EstopSettings::default())
    }

    pub fn with_settings(layout: &SlotLayout, settings: EstopSettings) -> Self {
        let kinds: Vec<SlotKind> = (0..layout.len()).filter_map(|slot| layout.kind(slot)).collect();
        let led_slots: Vec<usize> = layout.slots_of(SlotKind::Led).collect();
        let n = led_slots.len();
        // The last two LEDs blink alternately.
        let indicators = (n.saturating_sub(2)..n).fold(0u64, |mask, i| mask | bit(i));
        let mut posture = PostureMotion::new(kinds.len());
        posture.set_max_speed_all(settings.max_speed);
        Self {
            id: MotionId::INVALID,
            posture,
            leds: LedEngine::new(n),
            led_slots,
            indicators,
            requested: None,
            frozen: false,
            frozen_at: Duration::ZERO,
            release_end: None,
            duty_avgs: vec![0.0; kinds.len()],
            escalation: None,
            kinds,
            settings,
        }
    }

    /// Run at `frozen` priority while stopped and drop back to `idle` once
    /// the release fade has finished.
    pub fn with_escalation(mut self, frozen: Priority, idle: Priority) -> Self {
        self.escalation = Some((frozen, idle));
        self
    }

    pub fn settings(&self) -> &EstopSettings {
        &self.settings
    }

    /// Request a stop (`true`) or a release (`false`), applied at the next
    /// update.
    pub fn set_stopped(&mut self, stopped: bool) {
        self.requested = Some(stopped);
    }

    /// Flip the requested state.
    pub fn toggle(&mut self) {
        let stopped = self.is_stopped();
        self.set_stopped(!stopped);
    }

    /// Requested state, counting a request not yet applied.
    pub fn is_stopped(&self) -> bool {
        self.requested.unwrap_or(self.frozen)
    }

    /// `true` while the outputs are actually held.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// `true` while the release fade is still running.
    pub fn is_fading(&self) -> bool {
        self.release_end.is_some()
    }

    /// The held posture.
    pub fn posture(&self) -> &PostureMotion {
        &self.posture
    }

    fn freeze(&mut self, ctx: &mut MotionContext<'_>) {
        self.frozen = true;
        self.release_end = None;
        self.frozen_at = ctx.now();
        for (slot, &kind) in self.kinds.iter().enumerate() {
            match kind {
                SlotKind::Joint => {
                    let commanded = ctx.get_output(slot);
                    let value = if commanded.weight == 0.0 {
                        ctx.sensors().position(slot)
                    } else {
                        commanded.value
                    };
                    self.posture.snap(slot, OutputCmd::full(value));
                }
                SlotKind::Wheel => self.posture.snap(slot, OutputCmd::full(0.0)),
                SlotKind::Led => self.posture.snap(slot, OutputCmd::unset()),
            }
        }
        self.duty_avgs.fill(0.0);

        let period = self.settings.blink_period;
        self.leds.clear();
        let n = self.led_slots.len();
        if let Some(last) = n.checked_sub(1) {
            self.leds.cycle(bit(last), period, 1.0, 0.0, period / 2, ctx.now());
        }
        if let Some(second) = n.checked_sub(2) {
            self.leds.cycle(bit(second), period, 1.0, 0.0, Duration::ZERO, ctx.now());
        }

        tracing::warn!(motion = %ctx.id(), "emergency stop engaged");
        ctx.post_event(EventKind::EmergencyStop, Transition::Activate, Duration::ZERO);
        if let Some((frozen, _)) = self.escalation {
            ctx.request_priority(frozen);
        }
    }

    fn release(&mut self, ctx: &mut MotionContext<'_>) {
        self.frozen = false;
        self.release_end = Some(ctx.now() + self.settings.fade);
        let paused_for = ctx.now().saturating_sub(self.frozen_at);
        tracing::info!(motion = %ctx.id(), ?paused_for, "emergency stop released");
        ctx.post_event(EventKind::EmergencyStop, Transition::Deactivate, paused_for);
    }

    // Give way to outside forces once the joints have come to rest.
    fn yield_to_forces(&mut self, ctx: &MotionContext<'_>) {
        let rest = ctx.frame_time() * ctx.sub_frames() as u32 * self.settings.rest_ticks;
        if ctx.now().saturating_sub(self.frozen_at) <= rest {
            return;
        }
        for (slot, &kind) in self.kinds.iter().enumerate() {
            if kind != SlotKind::Joint {
                continue;
            }
            let avg = &mut self.duty_avgs[slot];
            *avg = *avg * 0.9 + ctx.sensors().duty(slot) * 0.1;
            let Some(mut held) = self.posture.target(slot) else {
                continue;
            };
            let sensed = ctx.sensors().position(slot);
            if (sensed - held.value).abs() > self.settings.refreeze_gap {
                tracing::debug!(slot, from = held.value, to = sensed, "joint pushed away; re-freezing");
                held = OutputCmd::full(sensed);
                self.posture.snap(slot, held);
            }
            if avg.abs() > self.settings.duty_cutoff {
                held.value -= *avg;
                self.posture.retarget(slot, held);
            }
        }
    }

    /// `scales[f]` multiplies the indicator weight of sub-frame `f`.
    fn play_leds(&mut self, ctx: &mut MotionContext<'_>, scales: &[f32]) {
        let frames = self.leds.frames(ctx.now(), ctx.frame_time(), ctx.sub_frames());
        for (led, (&slot, values)) in self.led_slots.iter().zip(&frames).enumerate() {
            if self.indicators & bit(led) == 0 {
                continue;
            }
            for (frame, &value) in values.iter().enumerate() {
                let scale = scales.get(frame).copied().unwrap_or(0.0);
                ctx.set_output_frame(slot, frame, OutputCmd::new(value, self.settings.indicator_weight * scale));
            }
        }
    }
}

fn bit(led: usize) -> u64 {
    u32::try_from(led)
        .ok()
        .and_then(|shift| 1u64.checked_shl(shift))
        .unwrap_or(0)
}

impl MotionCommand for EmergencyStop {
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
        match self.requested.take() {
            Some(true) if !self.frozen => self.freeze(ctx),
            Some(false) if self.frozen => self.release(ctx),
            _ => {}
        }

        let now = ctx.now();
        let scales: Vec<f32> = if self.frozen {
            self.yield_to_forces(ctx);
            vec![1.0; ctx.sub_frames()]
        } else {
            match self.release_end {
                None => return 0,
                Some(end) if now >= end => {
                    self.release_end = None;
                    self.posture.clear();
                    // Blank the LEDs once so nothing of the indicator lingers.
                    for &slot in &self.led_slots {
                        ctx.set_output(slot, OutputCmd::full(0.0));
                    }
                    if let Some((_, idle)) = self.escalation {
                        ctx.request_priority(idle);
                    }
                    return self.led_slots.len();
                }
                Some(end) => {
                    let fade = self.settings.fade.as_secs_f32();
                    (0..ctx.sub_frames())
                        .map(|frame| {
                            let at = now + ctx.frame_time() * frame as u32;
                            (end.saturating_sub(at).as_secs_f32() / fade).clamp(0.0, 1.0)
                        })
                        .collect()
                }
            }
        };

        self.play_leds(ctx, &scales);
        let (driven, reached) = self.posture.play(ctx, |frame| scales.get(frame).copied().unwrap_or(0.0));
        if self.frozen && reached {
            self.posture.tracker_mut().settle(ctx);
        }
        driven
    }

    fn is_dirty(&self) -> bool {
        self.requested.is_some() || self.frozen || self.release_end.is_some()
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn id(&self) -> MotionId {
        self.id
    }

    fn set_id(&mut self, id: MotionId) {
        self.id = id;
    }

    fn auto_prune(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "EmergencyStop"
    }
}
