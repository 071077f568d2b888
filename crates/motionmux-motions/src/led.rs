//! LED effects: [`LedEngine`] computes per-LED values over time and
//! [`LedMotion`] plays them into the LED slots of the engine.
//!
//! LEDs are addressed by their index among the LED slots (not by slot), and
//! groups of them by a bit mask: bit `i` selects LED `i`.
//!
//! Three effects are available:
//!
//! - **set**: a constant value.
//! - **flash**: a temporary value for a duration, after which the LED goes
//!   back to whatever it was doing.
//! - **cycle**: `cos(t * 2π / period) * (-amp / 2) + 0.5 + offset`, clipped
//!   to `[0, 1]`.  A large amplitude turns the smooth cycle into a blink.

use std::f32::consts::PI;
use std::time::Duration;

use motionmux_kernel::{MotionCommand, MotionContext};
use motionmux_types::{MotionId, OutputCmd, SlotKind, SlotLayout};

/// Every LED.
pub const ALL_LEDS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cycle {
    period: Duration,
    amp: f32,
    offset: f32,
    start: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LedState {
    value: f32,
    cycle: Option<Cycle>,
    flash_value: f32,
    flash_until: Duration,
}

/// Time-based LED effect calculator.
#[derive(Debug, Clone)]
pub struct LedEngine {
    leds: Vec<LedState>,
    dirty: bool,
    rendered_until: Duration,
}

impl LedEngine {
    pub fn new(num_leds: usize) -> Self {
        Self {
            leds: vec![LedState::default(); num_leds],
            dirty: true,
            rendered_until: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.leds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leds.is_empty()
    }

    fn selected(&mut self, mask: u64) -> impl Iterator<Item = &mut LedState> {
        self.leds
            .iter_mut()
            .enumerate()
            .filter(move |(i, _)| *i < 64 && (mask >> *i) & 1 == 1)
            .map(|(_, led)| led)
    }

    /// Hold `value` on the masked LEDs, ending any cycle.
    pub fn set(&mut self, mask: u64, value: f32) {
        for led in self.selected(mask) {
            led.value = value;
            led.cycle = None;
        }
        self.dirty = true;
    }

    /// Clear everything, then [`set`](Self::set).
    pub fn cset(&mut self, mask: u64, value: f32) {
        self.clear();
        self.set(mask, value);
    }

    /// `1 - value` for steady LEDs; cycling LEDs run in anti-phase.
    pub fn invert(&mut self, mask: u64) {
        for led in self.selected(mask) {
            match &mut led.cycle {
                Some(cycle) => cycle.amp = -cycle.amp,
                None => led.value = 1.0 - led.value,
            }
        }
        self.dirty = true;
    }

    /// Show `value` on the masked LEDs for `duration` starting at `now`.
    pub fn flash(&mut self, mask: u64, value: f32, duration: Duration, now: Duration) {
        for led in self.selected(mask) {
            led.flash_value = value;
            led.flash_until = now + duration;
        }
        self.dirty = true;
    }

    /// Flash the visible opposite of what each LED currently shows.
    pub fn flash_toggle(&mut self, mask: u64, duration: Duration, now: Duration) {
        for i in 0..self.leds.len().min(64) {
            if (mask >> i) & 1 == 1 {
                let value = flash_of(self.value_at(i, now));
                self.leds[i].flash_value = value;
                self.leds[i].flash_until = now + duration;
            }
        }
        self.dirty = true;
    }

    /// Start a cycle on the masked LEDs.  `phase` shifts where in the
    /// cycle the LEDs start; `period` includes both halves.
    pub fn cycle(&mut self, mask: u64, period: Duration, amp: f32, offset: f32, phase: Duration, now: Duration) {
        let cycle = Cycle {
            period,
            amp,
            offset,
            start: now.saturating_sub(phase),
        };
        for led in self.selected(mask) {
            led.cycle = Some(cycle);
        }
        self.dirty = true;
    }

    /// Turn every LED off and cancel all effects.
    pub fn clear(&mut self) {
        self.leds.fill(LedState::default());
        self.dirty = true;
    }

    /// Push every pending flash out by `extra`.
    pub fn extend_flash(&mut self, extra: Duration) {
        for led in &mut self.leds {
            if led.flash_until > Duration::ZERO {
                led.flash_until += extra;
            }
        }
    }

    /// Value of LED `led` at time `t`.
    pub fn value_at(&self, led: usize, t: Duration) -> f32 {
        let Some(state) = self.leds.get(led) else {
            return 0.0;
        };
        if t < state.flash_until {
            state.flash_value
        } else if let Some(cycle) = state.cycle {
            cycle_value(cycle.period, cycle.amp, cycle.offset, t.saturating_sub(cycle.start))
        } else {
            state.value
        }
    }

    /// Something changed since the last render, an LED is cycling or a
    /// flash ends after the last rendered sub-frame.
    pub fn is_dirty(&self) -> bool {
        self.dirty
            || self
                .leds
                .iter()
                .any(|led| led.cycle.is_some() || led.flash_until > self.rendered_until)
    }

    /// Values of every LED for each of `frames` sub-frames starting at
    /// `now`: `out[led][frame]`.
    pub fn frames(&mut self, now: Duration, frame_time: Duration, frames: usize) -> Vec<Vec<f32>> {
        self.dirty = false;
        self.rendered_until = now + frame_time * frames as u32;
        (0..self.leds.len())
            .map(|led| {
                (0..frames)
                    .map(|f| self.value_at(led, now + frame_time * f as u32))
                    .collect()
            })
            .collect()
    }
}

/// `cos(t * 2π / period) * (-amp / 2) + 0.5 + offset`, clipped to `[0, 1]`.
pub fn cycle_value(period: Duration, amp: f32, offset: f32, t: Duration) -> f32 {
    if period.is_zero() {
        return (0.5 + offset).clamp(0.0, 1.0);
    }
    let phase = t.as_secs_f32() * 2.0 * PI / period.as_secs_f32();
    (phase.cos() * (-amp / 2.0) + 0.5 + offset).clamp(0.0, 1.0)
}

// Mid-range values flash to the nearer extreme's opposite, the rest invert.
fn flash_of(value: f32) -> f32 {
    if value > 1.0 / 3.0 && value < 2.0 / 3.0 {
        if value < 0.5 { 1.0 } else { 0.0 }
    } else {
        1.0 - value
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LedMotion
// ────────────────────────────────────────────────────────────────────────────

/// Plays an [`LedEngine`] into the LED slots of a layout at full weight.
/// Always alive; remove it explicitly.
#[derive(Debug)]
pub struct LedMotion {
    id: MotionId,
    slots: Vec<usize>,
    engine: LedEngine,
    last_now: Duration,
}

impl LedMotion {
    /// Drives every LED slot of `layout`, in slot order.
    pub fn for_layout(layout: &SlotLayout) -> Self {
        Self::new(layout.slots_of(SlotKind::Led).collect())
    }

    /// Drives LED `i` on output slot `slots[i]`.
    pub fn new(slots: Vec<usize>) -> Self {
        let engine = LedEngine::new(slots.len());
        Self {
            id: MotionId::INVALID,
            slots,
            engine,
            last_now: Duration::ZERO,
        }
    }

    pub fn leds(&self) -> &LedEngine {
        &self.engine
    }

    pub fn leds_mut(&mut self) -> &mut LedEngine {
        &mut self.engine
    }

    /// Engine time seen at the last update; effects started from another
    /// thread are timed from here.
    pub fn last_now(&self) -> Duration {
        self.last_now
    }
}

impl MotionCommand for LedMotion {
    fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
        self.last_now = ctx.now();
        let frames = self.engine.frames(ctx.now(), ctx.frame_time(), ctx.sub_frames());
        for (&slot, values) in self.slots.iter().zip(&frames) {
            for (frame, &value) in values.iter().enumerate() {
                ctx.set_output_frame(slot, frame, OutputCmd::full(value));
            }
        }
        self.slots.len()
    }

    fn is_dirty(&self) -> bool {
        self.engine.is_dirty()
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

    fn name(&self) -> &str {
        "LedMotion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, engine_with_layout};
    use motionmux_types::{Priority, SensorSnapshot};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn set_and_invert() {
        let mut leds = LedEngine::new(3);
        leds.set(0b101, 0.25);
        assert_eq!(leds.value_at(0, ms(0)), 0.25);
        assert_eq!(leds.value_at(1, ms(0)), 0.0);
        leds.invert(0b001);
        assert_eq!(leds.value_at(0, ms(0)), 0.75);
    }

    #[test]
    fn flash_expires() {
        let mut leds = LedEngine::new(1);
        leds.set(ALL_LEDS, 0.2);
        leds.flash(ALL_LEDS, 1.0, ms(100), ms(50));
        assert_eq!(leds.value_at(0, ms(60)), 1.0);
        assert_eq!(leds.value_at(0, ms(150)), 0.2);

        leds.extend_flash(ms(100));
        assert_eq!(leds.value_at(0, ms(150)), 1.0);
    }

    #[test]
    fn flash_toggle_picks_visible_opposite() {
        let mut leds = LedEngine::new(3);
        leds.set(0b001, 0.9);
        leds.set(0b010, 0.4);
        leds.set(0b100, 0.6);
        leds.flash_toggle(ALL_LEDS, ms(10), ms(0));
        assert!((leds.value_at(0, ms(0)) - 0.1).abs() < 1e-6);
        assert_eq!(leds.value_at(1, ms(0)), 1.0);
        assert_eq!(leds.value_at(2, ms(0)), 0.0);
    }

    #[test]
    fn cycle_follows_cosine_profile() {
        let period = ms(1000);
        assert!((cycle_value(period, 1.0, 0.0, ms(0)) - 0.0).abs() < 1e-6);
        assert!((cycle_value(period, 1.0, 0.0, ms(250)) - 0.5).abs() < 1e-5);
        assert!((cycle_value(period, 1.0, 0.0, ms(500)) - 1.0).abs() < 1e-6);
        // Large amplitudes clip into a blink.
        assert_eq!(cycle_value(period, 10.0, -5.0, ms(0)), 0.0);
        assert_eq!(cycle_value(period, 4.0, 0.0, ms(500)), 1.0);
    }

    #[test]
    fn cycle_phase_shifts_start() {
        let mut leds = LedEngine::new(2);
        leds.cycle(0b01, ms(1000), 1.0, 0.0, Duration::ZERO, ms(500));
        leds.cycle(0b10, ms(1000), 1.0, 0.0, ms(500), ms(500));
        assert!(leds.value_at(0, ms(500)) < 1e-6);
        assert!((leds.value_at(1, ms(500)) - 1.0).abs() < 1e-6);
        leds.set(0b01, 0.3);
        assert_eq!(leds.value_at(0, ms(900)), 0.3);
    }

    #[test]
    fn dirty_tracks_effects() {
        let mut leds = LedEngine::new(1);
        assert!(leds.is_dirty());
        leds.frames(ms(0), ms(8), 4);
        assert!(!leds.is_dirty());

        leds.flash(ALL_LEDS, 1.0, ms(100), ms(0));
        leds.frames(ms(0), ms(8), 4);
        assert!(leds.is_dirty());
        leds.frames(ms(96), ms(8), 4);
        assert!(!leds.is_dirty());

        leds.cycle(ALL_LEDS, ms(100), 1.0, 0.0, Duration::ZERO, ms(128));
        leds.frames(ms(128), ms(8), 4);
        assert!(leds.is_dirty());
    }

    #[test]
    fn led_motion_drives_only_led_slots() {
        let layout = SlotLayout::new(vec![SlotKind::Joint, SlotKind::Led, SlotKind::Led]);
        let engine = engine_with_layout(layout.clone(), RecordingSink::new());
        let mut led = LedMotion::for_layout(&layout);
        led.leds_mut().set(0b10, 0.8);
        engine.add_persistent(Box::new(led), Priority::BACKGROUND);

        engine.tick(&SensorSnapshot::zeroed(3));
        assert!(!engine.get_output(0).is_set());
        assert_eq!(engine.get_output(1), OutputCmd::full(0.0));
        assert_eq!(engine.get_output(2), OutputCmd::full(0.8));
    }
}
