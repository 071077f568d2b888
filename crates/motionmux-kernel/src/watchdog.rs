//! [`ContentionWatchdog`] – detects producers fighting over a slot.
//!
//! Every tick the engine reports which producers drove each slot (weight
//! above zero).  When two or more producers keep driving the same slot with
//! an unchanged line-up for longer than the configured deadline, the
//! watchdog flags the slot so the engine can warn and, where allowed,
//! force-retire the stale contestant.
//!
//! Time is engine time, so the watchdog is as deterministic as the ticks
//! that feed it.

use std::collections::HashMap;
use std::time::Duration;

use motionmux_types::MotionId;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// State of one slot as seen by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContention {
    /// At most one producer drives the slot.
    Clear,
    /// Several producers drive it, still within the deadline.
    Contested,
    /// Several producers have driven it past the deadline.
    Expired,
}

/// A contest that outlived the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredContest {
    pub slot: usize,
    /// Contestants, sorted by handle.
    pub contestants: Vec<MotionId>,
    /// How long the line-up has been unchanged.
    pub duration: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Contest {
    contestants: Vec<MotionId>,
    since: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// ContentionWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks per-slot contention across ticks.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use motionmux_kernel::watchdog::{ContentionWatchdog, SlotContention};
/// use motionmux_types::MotionId;
///
/// let (a, b) = (MotionId::from_raw(1), MotionId::from_raw(2));
/// let mut wd = ContentionWatchdog::new(Some(Duration::from_millis(64)));
///
/// assert!(wd.observe(&[vec![a, b]], Duration::ZERO).is_empty());
/// assert_eq!(wd.contention(0), SlotContention::Contested);
///
/// let expired = wd.observe(&[vec![a, b]], Duration::from_millis(96));
/// assert_eq!(expired.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ContentionWatchdog {
    deadline: Option<Duration>,
    contests: HashMap<usize, Contest>,
    last_now: Duration,
}

impl ContentionWatchdog {
    /// A watchdog flagging contests older than `deadline`; `None` disables
    /// expiry (contention is still tracked).
    pub fn new(deadline: Option<Duration>) -> Self {
        Self {
            deadline,
            contests: HashMap::new(),
            last_now: Duration::ZERO,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Feed one tick worth of drivers (`drivers[slot]`) observed at `now`.
    /// Returns the contests that expired at this observation.  An expired
    /// contest restarts its clock, so it is reported at most once per
    /// deadline period.
    pub fn observe(&mut self, drivers: &[Vec<MotionId>], now: Duration) -> Vec<ExpiredContest> {
        self.last_now = now;
        let mut expired = Vec::new();

        for (slot, ids) in drivers.iter().enumerate() {
            if ids.len() < 2 {
                self.contests.remove(&slot);
                continue;
            }
            let mut contestants = ids.clone();
            contestants.sort_unstable();

            let contest = self.contests.entry(slot).or_insert_with(|| Contest {
                contestants: contestants.clone(),
                since: now,
            });
            if contest.contestants != contestants {
                contest.contestants = contestants;
                contest.since = now;
                continue;
            }

            let age = now.saturating_sub(contest.since);
            if let Some(deadline) = self.deadline
                && age > deadline
            {
                expired.push(ExpiredContest {
                    slot,
                    contestants: contest.contestants.clone(),
                    duration: age,
                });
                contest.since = now;
            }
        }
        expired
    }

    /// Current state of `slot`.
    pub fn contention(&self, slot: usize) -> SlotContention {
        match (self.contests.get(&slot), self.deadline) {
            (None, _) => SlotContention::Clear,
            (Some(c), Some(deadline)) if self.last_now.saturating_sub(c.since) > deadline => {
                SlotContention::Expired
            }
            (Some(_), _) => SlotContention::Contested,
        }
    }

    /// Drop every trace of `id`, e.g. once it has been removed.
    pub fn forget(&mut self, id: MotionId) {
        self.contests.retain(|_, c| !c.contestants.contains(&id));
    }

    /// Whether `id` takes part in any open contest.
    pub fn is_tracking(&self, id: MotionId) -> bool {
        self.contests.values().any(|c| c.contestants.contains(&id))
    }
}
