//! Shared liveness bookkeeping for target-seeking producers.
//!
//! Most producers follow the same arc: they are given a target (dirty), work
//! toward it over a few ticks (converging), reach it (settled) and then
//! either let go or hold it for a while before declaring themselves dead.
//! [`SettleTracker`] implements that arc once so individual producers only
//! report when their target has been reached.
//!
//! ```text
//!  Fresh ──set target──▶ Dirty ──update──▶ Converging ──reached──▶ Settled
//!                          ▲                                         │
//!                          └──────────────set target─────────────────┤
//!                                                                    ▼
//!                                             Dead ◀── !hold or timeout
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use motionmux_types::{EventKind, Transition};

use crate::motion::MotionContext;

/// Where a producer stands relative to its current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    /// Never given a target.
    Fresh,
    /// Given a target it has not started toward.
    Dirty,
    /// Working toward the target.
    Converging,
    /// Target reached and still alive.
    Settled,
    /// Target reached and nothing left to do.
    Dead,
}

/// Dirty/settled flags, the one-shot "target reached" event and the
/// hold/timeout liveness rule.
#[derive(Debug)]
pub struct SettleTracker {
    hold: bool,
    timeout: Option<Duration>,
    dirty: bool,
    began: bool,
    reached: bool,
    dirty_at: Duration,
    reached_at: Duration,
    last_now: Duration,
    timeout_warned: AtomicBool,
}

impl SettleTracker {
    /// `hold = false` lets go as soon as the target is reached; `hold = true`
    /// keeps the producer alive until `timeout` has elapsed after settling
    /// (`None` holds forever).
    pub fn new(hold: bool, timeout: Option<Duration>) -> Self {
        Self {
            hold,
            timeout,
            dirty: false,
            began: false,
            reached: false,
            dirty_at: Duration::ZERO,
            reached_at: Duration::ZERO,
            last_now: Duration::ZERO,
            timeout_warned: AtomicBool::new(false),
        }
    }

    pub fn set_hold(&mut self, hold: bool) {
        self.hold = hold;
    }

    pub fn hold(&self) -> bool {
        self.hold
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// A new target was set.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.reached = false;
        self.timeout_warned.store(false, Ordering::Relaxed);
    }

    /// Call at the top of every update.  Returns `true` when this update is
    /// the first one after the target changed.
    pub fn begin(&mut self, now: Duration) -> bool {
        self.last_now = now;
        if self.dirty {
            self.dirty = false;
            self.began = true;
            self.dirty_at = now;
            return true;
        }
        false
    }

    /// Record that the target has been reached.  The first call after a new
    /// target posts a `Motion/Status` event carrying the time it took.
    pub fn settle(&mut self, ctx: &MotionContext<'_>) {
        if self.reached {
            return;
        }
        self.reached = true;
        self.reached_at = ctx.now();
        ctx.post_event(
            EventKind::Motion,
            Transition::Status,
            ctx.now().saturating_sub(self.dirty_at),
        );
    }

    /// Forget that the target was reached without changing it, e.g. when
    /// an outside force pushed the output away.
    pub fn unsettle(&mut self) {
        self.reached = false;
    }

    /// `true` from the moment a target is set until it has been reached.
    pub fn is_dirty(&self) -> bool {
        self.dirty || (self.began && !self.reached)
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    /// Engine time at which the target was last reached.
    pub fn reached_at(&self) -> Option<Duration> {
        self.reached.then_some(self.reached_at)
    }

    /// Liveness under the hold/timeout rule.  The first time a held target
    /// times out a warning naming `name` is logged.
    pub fn is_alive(&self, name: &str) -> bool {
        if self.alive_within_timeout() {
            return true;
        }
        if self.reached && self.hold && !self.timeout_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                motion = name,
                held_for = ?self.last_now.saturating_sub(self.reached_at),
                "held target timed out"
            );
        }
        false
    }

    pub fn phase(&self) -> MotionPhase {
        if self.dirty {
            MotionPhase::Dirty
        } else if !self.began {
            MotionPhase::Fresh
        } else if !self.reached {
            MotionPhase::Converging
        } else if self.alive_within_timeout() {
            MotionPhase::Settled
        } else {
            MotionPhase::Dead
        }
    }

    fn alive_within_timeout(&self) -> bool {
        if self.dirty || !self.reached {
            return true;
        }
        if !self.hold {
            return false;
        }
        match self.timeout {
            None => true,
            Some(timeout) => self.last_now.saturating_sub(self.reached_at) <= timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::StagingBuffer;
    use motionmux_types::{
        EventSink, MotionEvent, MotionId, OutputFrame, SensorSnapshot, SlotLayout,
    };
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

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Run `f` with a context stamped at `now`.
    fn with_ctx(sink: &RecordingSink, now: Duration, f: impl FnOnce(&MotionContext<'_>)) {
        let layout = SlotLayout::joints(1);
        let sensors = SensorSnapshot::zeroed(1);
        let committed = OutputFrame::new(4, 1);
        let mut staging = StagingBuffer::new(4, 1);
        let ctx = MotionContext::new(
            MotionId::from_raw(1),
            now,
            ms(8),
            &layout,
            &sensors,
            &committed,
            &mut staging,
            sink,
        );
        f(&ctx);
    }

    #[test]
    fn walks_through_phases_without_hold() {
        let sink = RecordingSink::default();
        let mut t = SettleTracker::new(false, None);
        assert_eq!(t.phase(), MotionPhase::Fresh);
        assert!(t.is_alive("t"));

        t.mark_dirty();
        assert_eq!(t.phase(), MotionPhase::Dirty);
        assert!(t.is_dirty());

        assert!(t.begin(ms(0)));
        assert_eq!(t.phase(), MotionPhase::Converging);
        assert!(t.is_dirty());
        assert!(!t.begin(ms(32)));
        assert!(t.is_dirty());

        with_ctx(&sink, ms(32), |ctx| t.settle(ctx));
        assert_eq!(t.phase(), MotionPhase::Dead);
        assert!(!t.is_dirty());
        assert!(!t.is_alive("t"));
    }

    #[test]
    fn settle_event_fires_once_per_target() {
        let sink = RecordingSink::default();
        let mut t = SettleTracker::new(true, None);
        t.mark_dirty();
        t.begin(ms(64));
        with_ctx(&sink, ms(128), |ctx| t.settle(ctx));
        with_ctx(&sink, ms(160), |ctx| t.settle(ctx));

        {
            let events = sink.events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].transition, Transition::Status);
            assert_eq!(events[0].duration, ms(64));
        }

        t.mark_dirty();
        t.begin(ms(192));
        with_ctx(&sink, ms(224), |ctx| t.settle(ctx));
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn hold_keeps_alive_until_timeout() {
        let sink = RecordingSink::default();
        let mut t = SettleTracker::new(true, Some(ms(100)));
        t.mark_dirty();
        t.begin(ms(0));
        with_ctx(&sink, ms(0), |ctx| t.settle(ctx));
        assert_eq!(t.reached_at(), Some(ms(0)));

        t.begin(ms(100));
        assert!(t.is_alive("t"));
        assert_eq!(t.phase(), MotionPhase::Settled);

        t.begin(ms(132));
        assert!(!t.is_alive("t"));
        assert_eq!(t.phase(), MotionPhase::Dead);
    }

    #[test]
    fn hold_without_timeout_lives_forever() {
        let sink = RecordingSink::default();
        let mut t = SettleTracker::new(true, None);
        t.mark_dirty();
        t.begin(ms(0));
        with_ctx(&sink, ms(0), |ctx| t.settle(ctx));
        t.begin(Duration::from_secs(3600));
        assert!(t.is_alive("t"));
    }

    #[test]
    fn unsettle_makes_alive_again() {
        let sink = RecordingSink::default();
        let mut t = SettleTracker::new(false, None);
        t.mark_dirty();
        t.begin(ms(0));
        with_ctx(&sink, ms(0), |ctx| t.settle(ctx));
        assert!(!t.is_alive("t"));
        assert!(!t.is_dirty());
        t.unsettle();
        assert!(t.is_dirty());
        assert!(t.is_alive("t"));
        assert_eq!(t.phase(), MotionPhase::Converging);
    }
}
