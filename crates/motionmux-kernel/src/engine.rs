//! [`MotionEngine`] – the motion output arbitration engine.
//!
//! The engine owns every registered producer and, once per tick, asks each
//! of them for contributions, composites those contributions slot by slot in
//! ascending priority order and hands one committed value per slot per
//! sub-frame back to the caller.
//!
//! All methods take `&self`: the engine is shared as `Arc<MotionEngine>`
//! between the control-loop thread (which calls [`MotionEngine::tick`]) and
//! any number of threads that register, re-target or remove producers.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use motionmux_kernel::engine::{EngineConfig, MotionEngine};
//! use motionmux_kernel::motion::{MotionCommand, MotionContext};
//! use motionmux_types::{MotionId, NullSink, OutputCmd, Priority, SensorSnapshot};
//!
//! struct Hold { id: MotionId }
//!
//! impl MotionCommand for Hold {
//!     fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
//!         ctx.set_output(0, OutputCmd::full(0.5));
//!         1
//!     }
//!     fn is_dirty(&self) -> bool { false }
//!     fn is_alive(&self) -> bool { true }
//!     fn id(&self) -> MotionId { self.id }
//!     fn set_id(&mut self, id: MotionId) { self.id = id; }
//!     fn name(&self) -> &str { "Hold" }
//! }
//!
//! let engine = MotionEngine::new(EngineConfig::with_slots(2), Arc::new(NullSink)).unwrap();
//! let id = engine.add_persistent(Box::new(Hold { id: MotionId::INVALID }), Priority::STANDARD);
//!
//! let report = engine.tick(&SensorSnapshot::zeroed(2));
//! assert_eq!(report.evaluated, vec![id]);
//! assert_eq!(engine.get_output(0), OutputCmd::full(0.5));
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use motionmux_types::{
    EventKind, EventSink, MotionEvent, MotionId, MuxError, OutputCmd, OutputFrame, Persistence,
    Priority, SensorSnapshot, SlotLayout, Transition,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::checkout::{CheckoutGuard, TypedCheckout};
use crate::compositor::{Compositor, StagingBuffer};
use crate::motion::{MotionCommand, MotionContext, StartContext};
use crate::registry::{Entry, Registry, RemovalReason, Retiring};
use crate::retry_budget::RetryBudget;
use crate::watchdog::ContentionWatchdog;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn default_sub_frames() -> usize {
    4
}

fn default_frame_time_ms() -> u64 {
    8
}

fn default_retry_budget() -> u32 {
    3
}

/// Upper bound on [`EngineConfig::sub_frames`].
pub const MAX_SUB_FRAMES: usize = 1024;
/// Upper bound on [`EngineConfig::frame_time_ms`]: one minute per sub-frame.
pub const MAX_FRAME_TIME_MS: u64 = 60_000;

/// Engine tuning.  One tick covers `sub_frames * frame_time_ms` of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of output slots of the hardware model.
    #[serde(default)]
    pub num_slots: usize,
    /// Sub-frames composited per tick.
    #[serde(default = "default_sub_frames")]
    pub sub_frames: usize,
    /// Playback time of one sub-frame.
    #[serde(default = "default_frame_time_ms")]
    pub frame_time_ms: u64,
    /// Consecutive update failures tolerated before a producer is retired.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// How long two producers may fight over a slot before the stale one is
    /// retired.  `None` only tracks contention.
    #[serde(default)]
    pub contention_deadline_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_slots: 0,
            sub_frames: default_sub_frames(),
            frame_time_ms: default_frame_time_ms(),
            retry_budget: default_retry_budget(),
            contention_deadline_ms: None,
        }
    }
}

impl EngineConfig {
    /// Defaults for a model with `num_slots` outputs.
    pub fn with_slots(num_slots: usize) -> Self {
        Self {
            num_slots,
            ..Self::default()
        }
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.num_slots == 0 {
            return Err(MuxError::InvalidConfig("num_slots must be at least 1".into()));
        }
        if !(1..=MAX_SUB_FRAMES).contains(&self.sub_frames) {
            return Err(MuxError::InvalidConfig(format!(
                "sub_frames must be between 1 and {MAX_SUB_FRAMES} (got {})",
                self.sub_frames
            )));
        }
        if !(1..=MAX_FRAME_TIME_MS).contains(&self.frame_time_ms) {
            return Err(MuxError::InvalidConfig(format!(
                "frame_time_ms must be between 1 and {MAX_FRAME_TIME_MS} (got {})",
                self.frame_time_ms
            )));
        }
        Ok(())
    }

    pub fn frame_time(&self) -> Duration {
        Duration::from_millis(self.frame_time_ms)
    }

    /// Output time covered by one tick.  Saturates for configurations
    /// [`validate`](Self::validate) would reject.
    pub fn tick_period(&self) -> Duration {
        u32::try_from(self.sub_frames)
            .ok()
            .and_then(|n| self.frame_time().checked_mul(n))
            .unwrap_or(Duration::MAX)
    }

    pub fn contention_deadline(&self) -> Option<Duration> {
        self.contention_deadline_ms.map(Duration::from_millis)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of one compositing pass.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Index of the tick, starting at 0.
    pub tick: u64,
    /// Engine time at the start of the tick.
    pub now: Duration,
    /// Active producers at the start of the pass, in compositing order.
    pub snapshot: Vec<MotionId>,
    /// Producers considered this pass (neither skipped nor pruned).
    pub evaluated: Vec<MotionId>,
    /// Producers whose `update_outputs` ran and succeeded.
    pub invoked: Vec<MotionId>,
    /// Producers skipped because they were checked out or otherwise held.
    pub skipped: Vec<MotionId>,
    /// Prunable producers found dead; removed at the end of the pass.
    pub pruned: Vec<MotionId>,
    /// Producers whose hooks panicked this pass.
    pub failed: Vec<MotionId>,
    /// Producers force-retired at the end of the pass.
    pub retired: Vec<MotionId>,
    /// The committed outputs, ready for the downstream sink.
    pub frame: OutputFrame,
}

/// One line of [`MotionEngine::motion_report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionSummary {
    pub id: MotionId,
    pub name: String,
    pub priority: Priority,
    pub persistence: Persistence,
    pub checked_out: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

/// Tick-side state, locked for the duration of a pass.
struct PassState {
    tick: u64,
    compositor: Compositor,
    staging: StagingBuffer,
    budgets: HashMap<MotionId, RetryBudget>,
    watchdog: ContentionWatchdog,
}

/// The arbitration engine.  See the [module docs](self).
pub struct MotionEngine {
    config: EngineConfig,
    layout: SlotLayout,
    sink: Arc<dyn EventSink>,
    registry: Mutex<Registry>,
    committed: RwLock<OutputFrame>,
    pass: Mutex<PassState>,
    /// Retired producers whose tick-side state still has to be dropped.
    purge: Mutex<Vec<MotionId>>,
    ticks: AtomicU64,
}

impl MotionEngine {
    /// An engine whose slots are all joints.
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Result<Self, MuxError> {
        let layout = SlotLayout::joints(config.num_slots);
        Self::with_layout(config, layout, sink)
    }

    /// An engine for an explicit slot layout.
    ///
    /// # Errors
    ///
    /// [`MuxError::InvalidConfig`] when the configuration is unusable or
    /// disagrees with `layout`.
    pub fn with_layout(
        config: EngineConfig,
        layout: SlotLayout,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, MuxError> {
        config.validate()?;
        if layout.len() != config.num_slots {
            return Err(MuxError::InvalidConfig(format!(
                "layout has {} slots, config expects {}",
                layout.len(),
                config.num_slots
            )));
        }
        let (n, slots) = (config.sub_frames, config.num_slots);
        tracing::info!(slots, sub_frames = n, frame_time_ms = config.frame_time_ms, "motion engine created");
        Ok(Self {
            pass: Mutex::new(PassState {
                tick: 0,
                compositor: Compositor::new(n, slots),
                staging: StagingBuffer::new(n, slots),
                budgets: HashMap::new(),
                watchdog: ContentionWatchdog::new(config.contention_deadline()),
            }),
            committed: RwLock::new(OutputFrame::new(n, slots)),
            registry: Mutex::new(Registry::new()),
            purge: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
            config,
            layout,
            sink,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Engine time: completed ticks × tick period.
    pub fn now(&self) -> Duration {
        self.time_of(self.ticks.load(Ordering::Acquire))
    }

    fn time_of(&self, tick: u64) -> Duration {
        self.config
            .tick_period()
            .checked_mul(u32::try_from(tick).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }

    // ── registration ────────────────────────────────────────────────────────

    /// Register a producer that stays until removed explicitly.
    pub fn add_persistent(&self, producer: Box<dyn MotionCommand>, priority: Priority) -> MotionId {
        self.add(producer, priority, Persistence::Persistent)
    }

    /// Register a producer that is removed once it stops being alive.
    pub fn add_prunable(&self, producer: Box<dyn MotionCommand>, priority: Priority) -> MotionId {
        self.add(producer, priority, Persistence::Prunable)
    }

    fn add(
        &self,
        mut producer: Box<dyn MotionCommand>,
        priority: Priority,
        persistence: Persistence,
    ) -> MotionId {
        let (id, seq, in_pass) = {
            let mut registry = self.registry.lock();
            let (id, seq) = registry.mint();
            (id, seq, registry.in_pass())
        };
        producer.set_id(id);
        tracing::info!(motion = %id, name = producer.name(), %priority, ?persistence, "motion registered");

        if !in_pass {
            self.start_producer(id, &mut *producer);
        }
        let entry = Entry {
            id,
            priority,
            persistence,
            seq,
            motion: Arc::new(RwLock::new(producer)),
            checked_out: Arc::new(AtomicBool::new(false)),
            started: !in_pass,
        };
        self.registry.lock().insert(entry);
        id
    }

    /// Request removal of `id`.  Between ticks the removal is applied at
    /// once; during a tick it takes effect at the end of the pass.  A
    /// producer that is checked out when the removal applies is stopped at
    /// the first safe point after its guard drops.
    pub fn remove(&self, id: MotionId) -> Result<(), MuxError> {
        let applied = self.registry.lock().remove(id, RemovalReason::Removed)?;
        if let Some(retiring) = applied {
            self.finish_retiring(retiring);
        }
        Ok(())
    }

    /// Change the compositing rank of `id` from the next tick on.
    pub fn set_priority(&self, id: MotionId, priority: Priority) -> Result<(), MuxError> {
        self.registry.lock().set_priority(id, priority)
    }

    pub fn priority(&self, id: MotionId) -> Option<Priority> {
        self.registry.lock().get(id).map(|e| e.priority)
    }

    pub fn contains(&self, id: MotionId) -> bool {
        self.registry.lock().contains(id)
    }

    /// Number of registered producers.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of every registered producer, ascending.
    pub fn motion_ids(&self) -> Vec<MotionId> {
        self.registry.lock().ids()
    }

    // ── access ──────────────────────────────────────────────────────────────

    /// Read a producer without checking it out.
    ///
    /// # Errors
    ///
    /// [`MuxError::MotionBusy`] instead of waiting when the producer is held
    /// exclusively (checked out or being updated).
    pub fn peek<R>(&self, id: MotionId, f: impl FnOnce(&dyn MotionCommand) -> R) -> Result<R, MuxError> {
        let motion = {
            let registry = self.registry.lock();
            let entry = registry.get(id).ok_or(MuxError::UnknownMotion(id))?;
            Arc::clone(&entry.motion)
        };
        let guard = motion.try_read().ok_or(MuxError::MotionBusy(id))?;
        Ok(f(&**guard))
    }

    /// Take exclusive access to `id` until the returned guard drops.
    ///
    /// Fails at once when the handle is unknown or already checked out.
    /// Otherwise blocks only while the tick is updating that producer.
    pub fn checkout(&self, id: MotionId) -> Result<CheckoutGuard, MuxError> {
        let (motion, flag) = {
            let registry = self.registry.lock();
            let entry = registry.get(id).ok_or(MuxError::UnknownMotion(id))?;
            if entry
                .checked_out
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(MuxError::AlreadyCheckedOut(id));
            }
            (Arc::clone(&entry.motion), Arc::clone(&entry.checked_out))
        };
        let guard = motion.write_arc();
        tracing::trace!(motion = %id, "checked out");
        Ok(CheckoutGuard::new(id, guard, flag))
    }

    /// [`checkout`](Self::checkout) followed by a downcast to `T`.
    ///
    /// # Errors
    ///
    /// [`MuxError::TypeMismatch`] when the producer is not a `T`; the
    /// producer is checked back in before returning.
    pub fn checkout_as<T: MotionCommand>(&self, id: MotionId) -> Result<TypedCheckout<T>, MuxError> {
        self.checkout(id)?.downcast::<T>().map_err(|(_guard, err)| err)
    }

    /// Last committed command for `slot` (unset when absent).
    pub fn get_output(&self, slot: usize) -> OutputCmd {
        self.committed.read().last(slot).unwrap_or_default()
    }

    /// Copy of the last committed frame.
    pub fn committed_frame(&self) -> OutputFrame {
        self.committed.read().clone()
    }

    /// Log and return a summary of every registered producer.
    pub fn motion_report(&self) -> Vec<MotionSummary> {
        let entries: Vec<Entry> = self.registry.lock().entries().cloned().collect();
        let report: Vec<MotionSummary> = entries
            .iter()
            .map(|e| MotionSummary {
                id: e.id,
                name: e
                    .motion
                    .try_read()
                    .map_or_else(|| "<busy>".to_string(), |m| m.name().to_string()),
                priority: e.priority,
                persistence: e.persistence,
                checked_out: e.is_checked_out(),
            })
            .collect();
        tracing::info!(count = report.len(), "motion report");
        for line in &report {
            tracing::info!(
                motion = %line.id,
                name = %line.name,
                priority = %line.priority,
                persistence = ?line.persistence,
                checked_out = line.checked_out,
                "  active motion"
            );
        }
        report
    }

    // ── tick ────────────────────────────────────────────────────────────────

    /// Run one compositing pass over `sensors` (already calibrated).
    pub fn tick(&self, sensors: &SensorSnapshot) -> TickReport {
        let mut pass = self.pass.lock();
        let PassState {
            tick,
            compositor,
            staging,
            budgets,
            watchdog,
        } = &mut *pass;
        let now = self.time_of(*tick);
        self.purge_retired(compositor, budgets, watchdog);

        let snapshot = self.registry.lock().begin_pass();
        let mut report = TickReport {
            tick: *tick,
            now,
            snapshot: snapshot.iter().map(|e| e.id).collect(),
            evaluated: Vec::new(),
            invoked: Vec::new(),
            skipped: Vec::new(),
            pruned: Vec::new(),
            failed: Vec::new(),
            retired: Vec::new(),
            frame: OutputFrame::default(),
        };

        {
            let committed = self.committed.read();
            compositor.begin(&committed);

            for entry in &snapshot {
                let id = entry.id;
                if entry.is_checked_out() {
                    report.skipped.push(id);
                    continue;
                }
                let Some(mut motion) = entry.motion.try_write() else {
                    report.skipped.push(id);
                    continue;
                };

                if entry.persistence == Persistence::Prunable {
                    match catch_unwind(AssertUnwindSafe(|| motion.auto_prune() && !motion.is_alive())) {
                        Ok(false) => {}
                        Ok(true) => {
                            report.pruned.push(id);
                            continue;
                        }
                        Err(payload) => {
                            tracing::error!(motion = %id, panic = %panic_message(&*payload), "liveness check panicked; pruning");
                            report.failed.push(id);
                            report.pruned.push(id);
                            continue;
                        }
                    }
                }
                report.evaluated.push(id);

                if !entry.priority.is_expressed() {
                    continue;
                }
                let due = match catch_unwind(AssertUnwindSafe(|| motion.is_dirty() || motion.is_alive())) {
                    Ok(due) => due,
                    Err(payload) => {
                        tracing::error!(motion = %id, panic = %panic_message(&*payload), "state query panicked");
                        report.failed.push(id);
                        self.charge_failure(budgets, id, &mut report.retired);
                        continue;
                    }
                };
                if !due {
                    continue;
                }

                staging.clear();
                let mut ctx = MotionContext::new(
                    id,
                    now,
                    self.config.frame_time(),
                    &self.layout,
                    sensors,
                    &committed,
                    staging,
                    self.sink.as_ref(),
                );
                let outcome = catch_unwind(AssertUnwindSafe(|| motion.update_outputs(&mut ctx)));
                let priority_request = ctx.take_priority_request();
                drop(motion);

                match outcome {
                    Ok(_) => {
                        compositor.fold(id, staging);
                        report.invoked.push(id);
                        if let Some(budget) = budgets.get_mut(&id) {
                            budget.record_success();
                        }
                        if let Some(priority) = priority_request {
                            tracing::debug!(motion = %id, %priority, "priority change requested");
                            if let Err(e) = self.registry.lock().set_priority(id, priority) {
                                tracing::warn!(motion = %id, %priority, error = %e, "priority change rejected");
                            }
                        }
                    }
                    Err(payload) => {
                        tracing::error!(motion = %id, panic = %panic_message(&*payload), "update_outputs panicked; contributions discarded");
                        report.failed.push(id);
                        self.charge_failure(budgets, id, &mut report.retired);
                    }
                }
                staging.clear();
            }
        }

        // Swap buffers: the working frame becomes the committed one.
        {
            let mut committed = self.committed.write();
            compositor.swap_into(&mut committed);
            report.frame = committed.clone();
        }

        for contest in watchdog.observe(compositor.drivers(), now) {
            let victim = snapshot
                .iter()
                .filter(|e| contest.contestants.contains(&e.id))
                .filter(|e| e.persistence == Persistence::Prunable)
                .filter(|e| !report.retired.contains(&e.id) && !report.pruned.contains(&e.id))
                .min_by_key(|e| (e.priority, e.seq));
            match victim {
                Some(entry) => {
                    tracing::warn!(
                        slot = contest.slot,
                        contestants = ?contest.contestants,
                        held_for = ?contest.duration,
                        retiring = %entry.id,
                        "slot contention past deadline; retiring stale producer"
                    );
                    self.queue_retirement(entry.id, RemovalReason::Contention, &mut report.retired);
                }
                None => {
                    tracing::warn!(
                        slot = contest.slot,
                        contestants = ?contest.contestants,
                        held_for = ?contest.duration,
                        "persistent producers contending for slot"
                    );
                }
            }
        }

        // Safe point.
        let safe_point = {
            let mut registry = self.registry.lock();
            for &id in &report.pruned {
                match registry.remove(id, RemovalReason::Pruned) {
                    Ok(_) => {}
                    Err(MuxError::UnknownMotion(_)) => {
                        tracing::debug!(motion = %id, "pruned producer already removed");
                    }
                    Err(e) => tracing::warn!(motion = %id, error = %e, "prune failed"),
                }
            }
            registry.end_pass()
        };
        *tick += 1;
        self.ticks.store(*tick, Ordering::Release);

        for retiring in safe_point.to_stop {
            self.finish_retiring(retiring);
        }
        self.purge_retired(compositor, budgets, watchdog);
        for entry in safe_point.to_start {
            // Checked out before it could start: try again next safe point.
            if entry.is_checked_out() {
                continue;
            }
            if let Some(mut motion) = entry.motion.try_write() {
                self.start_producer(entry.id, &mut **motion);
                drop(motion);
                self.registry.lock().mark_started(entry.id);
            }
        }

        tracing::debug!(
            tick = report.tick,
            active = report.snapshot.len(),
            invoked = report.invoked.len(),
            skipped = report.skipped.len(),
            pruned = report.pruned.len(),
            failed = report.failed.len(),
            "tick complete"
        );
        report
    }

    // ── internals ───────────────────────────────────────────────────────────

    /// Drop the per-producer bookkeeping of retired producers.
    fn purge_retired(
        &self,
        compositor: &mut Compositor,
        budgets: &mut HashMap<MotionId, RetryBudget>,
        watchdog: &mut ContentionWatchdog,
    ) {
        for id in self.purge.lock().drain(..) {
            compositor.forget(id);
            budgets.remove(&id);
            watchdog.forget(id);
        }
    }

    fn charge_failure(&self, budgets: &mut HashMap<MotionId, RetryBudget>, id: MotionId, retired: &mut Vec<MotionId>) {
        let budget = budgets
            .entry(id)
            .or_insert_with(|| RetryBudget::new(self.config.retry_budget));
        if budget.record_failure() {
            tracing::warn!(motion = %id, failures = budget.streak(), "retry budget exhausted; retiring producer");
            self.queue_retirement(id, RemovalReason::RetryBudget, retired);
        }
    }

    fn queue_retirement(&self, id: MotionId, reason: RemovalReason, retired: &mut Vec<MotionId>) {
        if retired.contains(&id) {
            return;
        }
        if self.registry.lock().remove(id, reason).is_ok() {
            retired.push(id);
        }
    }

    fn start_producer(&self, id: MotionId, producer: &mut dyn MotionCommand) {
        let now = self.now();
        {
            let committed = self.committed.read();
            let ctx = StartContext::new(id, now, &self.layout, &committed);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| producer.on_start(&ctx))) {
                tracing::error!(motion = %id, panic = %panic_message(&*payload), "on_start panicked");
            }
        }
        self.sink.post_event(MotionEvent::new(
            EventKind::Motion,
            id,
            Transition::Activate,
            now,
            Duration::ZERO,
        ));
    }

    /// Run `on_stop` and post the deactivation, or park the record until the
    /// producer is free.
    fn finish_retiring(&self, retiring: Retiring) {
        let id = retiring.entry.id;
        if retiring.entry.is_checked_out() {
            tracing::debug!(motion = %id, "removal deferred until checkin");
            self.registry.lock().defer_retiring(retiring);
            return;
        }
        let Some(mut motion) = retiring.entry.motion.try_write() else {
            self.registry.lock().defer_retiring(retiring);
            return;
        };
        // Never-started producers never see on_stop or a deactivation.
        if retiring.entry.started {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| motion.on_stop())) {
                tracing::error!(motion = %id, panic = %panic_message(&*payload), "on_stop panicked");
            }
            self.sink.post_event(MotionEvent::new(
                EventKind::Motion,
                id,
                Transition::Deactivate,
                self.now(),
                Duration::ZERO,
            ));
        }
        motion.set_id(MotionId::INVALID);
        tracing::info!(motion = %id, name = motion.name(), reason = ?retiring.reason, "motion removed");
        drop(motion);

        // Inside a tick the pass lock is already held; the pass purges the
        // queue itself before it returns.
        self.purge.lock().push(id);
        if let Some(mut pass) = self.pass.try_lock() {
            let PassState {
                compositor,
                budgets,
                watchdog,
                ..
            } = &mut *pass;
            self.purge_retired(compositor, budgets, watchdog);
        }
    }

    #[cfg(test)]
    fn tracks_failures_of(&self, id: MotionId) -> (bool, bool) {
        let pass = self.pass.lock();
        (pass.budgets.contains_key(&id), pass.watchdog.is_tracking(id))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Weak, mpsc};
    use std::thread;

    use motionmux_types::NullSink;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<MotionEvent>>,
    }

    impl RecordingSink {
        fn transitions(&self, id: MotionId) -> Vec<Transition> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.source == id)
                .map(|e| e.transition)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn post_event(&self, event: MotionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Writes one fixed command to one slot while alive.
    struct Writer {
        id: MotionId,
        slot: usize,
        cmd: OutputCmd,
        alive: bool,
        updates: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl Writer {
        fn new(slot: usize, value: f32, weight: f32) -> Box<Self> {
            Box::new(Self {
                id: MotionId::INVALID,
                slot,
                cmd: OutputCmd::new(value, weight),
                alive: true,
                updates: Arc::new(AtomicUsize::new(0)),
                stops: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
            (Arc::clone(&self.updates), Arc::clone(&self.stops))
        }
    }

    impl MotionCommand for Writer {
        fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
            self.updates.fetch_add(1, Ordering::SeqCst);
            ctx.set_output(self.slot, self.cmd);
            1
        }
        fn is_dirty(&self) -> bool {
            false
        }
        fn is_alive(&self) -> bool {
            self.alive
        }
        fn id(&self) -> MotionId {
            self.id
        }
        fn set_id(&mut self, id: MotionId) {
            self.id = id;
        }
        fn on_stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &str {
            "Writer"
        }
    }

    /// Drives slot 0 from `a` and slot 1 from `b`.
    #[derive(Default)]
    struct Pair {
        id: MotionId,
        a: f32,
        b: f32,
    }

    impl MotionCommand for Pair {
        fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
            ctx.set_output(0, OutputCmd::full(self.a));
            ctx.set_output(1, OutputCmd::full(self.b));
            2
        }
        fn is_dirty(&self) -> bool {
            false
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
            "Pair"
        }
    }

    /// Stages an output, then panics for its first `fail_times` updates.
    struct Flaky {
        id: MotionId,
        fail_times: u32,
        calls: u32,
    }

    impl Flaky {
        fn new(fail_times: u32) -> Box<Self> {
            Box::new(Self {
                id: MotionId::INVALID,
                fail_times,
                calls: 0,
            })
        }
    }

    impl MotionCommand for Flaky {
        fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
            self.calls += 1;
            ctx.set_output(0, OutputCmd::full(9.0));
            if self.calls <= self.fail_times {
                panic!("flaky producer failure #{}", self.calls);
            }
            ctx.set_output(0, OutputCmd::full(1.0));
            1
        }
        fn is_dirty(&self) -> bool {
            false
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
            "Flaky"
        }
    }

    /// On its first update, removes `victim` and registers a new writer.
    struct Meddler {
        id: MotionId,
        engine: Weak<MotionEngine>,
        victim: MotionId,
        added: Arc<std::sync::Mutex<Option<MotionId>>>,
        done: bool,
    }

    impl MotionCommand for Meddler {
        fn update_outputs(&mut self, _ctx: &mut MotionContext<'_>) -> usize {
            if self.done {
                return 0;
            }
            self.done = true;
            if let Some(engine) = self.engine.upgrade() {
                engine.remove(self.victim).unwrap();
                let id = engine.add_persistent(Writer::new(1, 0.5, 1.0), Priority::STANDARD);
                *self.added.lock().unwrap() = Some(id);
            }
            0
        }
        fn is_dirty(&self) -> bool {
            false
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
            "Meddler"
        }
    }

    /// Writes its value and asks once to be raised above everything.
    struct Escalator {
        id: MotionId,
        asked: bool,
    }

    impl MotionCommand for Escalator {
        fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
            ctx.set_output(0, OutputCmd::full(1.0));
            if !self.asked {
                self.asked = true;
                ctx.request_priority(Priority::EMERGENCY.one_above());
            }
            1
        }
        fn is_dirty(&self) -> bool {
            false
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
            "Escalator"
        }
    }

    fn engine(slots: usize) -> MotionEngine {
        MotionEngine::new(EngineConfig::with_slots(slots), Arc::new(NullSink)).unwrap()
    }

    fn sensors(slots: usize) -> SensorSnapshot {
        SensorSnapshot::zeroed(slots)
    }

    fn sorted(mut ids: Vec<MotionId>) -> Vec<MotionId> {
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[test]
    fn config_defaults_and_validation() {
        let config: EngineConfig = serde_json::from_str(r#"{"num_slots": 3}"#).unwrap();
        assert_eq!(config.sub_frames, 4);
        assert_eq!(config.frame_time_ms, 8);
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.contention_deadline(), None);
        assert_eq!(config.tick_period(), Duration::from_millis(32));
        assert!(config.validate().is_ok());

        let bad = EngineConfig {
            sub_frames: 0,
            ..EngineConfig::with_slots(2)
        };
        assert!(matches!(bad.validate(), Err(MuxError::InvalidConfig(_))));
        assert!(EngineConfig::default().validate().is_err());
    }

    #[test]
    fn oversized_timing_is_rejected_and_period_saturates() {
        let slow = EngineConfig {
            frame_time_ms: u64::MAX,
            ..EngineConfig::with_slots(1)
        };
        assert!(matches!(slow.validate(), Err(MuxError::InvalidConfig(_))));
        assert_eq!(slow.tick_period(), Duration::MAX);
        assert!(MotionEngine::new(slow, Arc::new(NullSink)).is_err());

        let wide = EngineConfig {
            sub_frames: MAX_SUB_FRAMES + 1,
            ..EngineConfig::with_slots(1)
        };
        assert!(wide.validate().is_err());

        let edge = EngineConfig {
            sub_frames: MAX_SUB_FRAMES,
            frame_time_ms: MAX_FRAME_TIME_MS,
            ..EngineConfig::with_slots(1)
        };
        assert!(edge.validate().is_ok());
        assert_eq!(edge.tick_period(), Duration::from_millis(MAX_FRAME_TIME_MS) * MAX_SUB_FRAMES as u32);
    }

    #[test]
    fn layout_must_match_slot_count() {
        let result = MotionEngine::with_layout(
            EngineConfig::with_slots(3),
            SlotLayout::joints(2),
            Arc::new(NullSink),
        );
        assert!(matches!(result, Err(MuxError::InvalidConfig(_))));
    }

    #[test]
    fn engine_time_advances_by_tick_period() {
        let engine = engine(1);
        assert_eq!(engine.now(), Duration::ZERO);
        let first = engine.tick(&sensors(1));
        let second = engine.tick(&sensors(1));
        assert_eq!(first.now, Duration::ZERO);
        assert_eq!(second.tick, 1);
        assert_eq!(second.now, Duration::from_millis(32));
        assert_eq!(engine.now(), Duration::from_millis(64));
    }

    // ------------------------------------------------------------------
    // Registration & events
    // ------------------------------------------------------------------

    #[test]
    fn registration_issues_handles_and_posts_activate() {
        let sink = Arc::new(RecordingSink::default());
        let engine = MotionEngine::new(EngineConfig::with_slots(1), sink.clone()).unwrap();

        let a = engine.add_persistent(Writer::new(0, 1.0, 1.0), Priority::STANDARD);
        let b = engine.add_prunable(Writer::new(0, 1.0, 1.0), Priority::LOW);
        assert!(a.is_valid() && b.is_valid());
        assert_ne!(a, b);
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.motion_ids(), vec![a, b]);
        assert_eq!(engine.priority(b), Some(Priority::LOW));
        assert_eq!(engine.peek(a, |m| m.id()).unwrap(), a);
        assert_eq!(sink.transitions(a), vec![Transition::Activate]);

        engine.remove(a).unwrap();
        assert!(!engine.contains(a));
        assert_eq!(sink.transitions(a), vec![Transition::Activate, Transition::Deactivate]);
        assert_eq!(engine.remove(a), Err(MuxError::UnknownMotion(a)));
    }

    #[test]
    fn motion_report_lists_producers() {
        let engine = engine(1);
        let a = engine.add_persistent(Writer::new(0, 1.0, 1.0), Priority::HIGH);
        let report = engine.motion_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].id, a);
        assert_eq!(report[0].name, "Writer");
        assert_eq!(report[0].persistence, Persistence::Persistent);
        assert!(!report[0].checked_out);
    }

    // ------------------------------------------------------------------
    // Compositing
    // ------------------------------------------------------------------

    #[test]
    fn fold_order_follows_priority_not_registration() {
        let engine = engine(1);
        // Registered first, but outranks the standard producer.
        let p2 = engine.add_persistent(Writer::new(0, 0.0, 0.5), Priority::EMERGENCY);
        let p1 = engine.add_persistent(Writer::new(0, 10.0, 1.0), Priority::STANDARD);

        let report = engine.tick(&sensors(1));
        assert_eq!(report.snapshot, vec![p1, p2]);
        let out = engine.get_output(0);
        assert!((out.value - 5.0).abs() < 1e-6);
        assert!((out.weight - 1.0).abs() < 1e-6);

        engine.remove(p2).unwrap();
        engine.tick(&sensors(1));
        assert!((engine.get_output(0).value - 10.0).abs() < 1e-6);
    }

    #[test]
    fn same_tier_later_registration_has_final_say() {
        let engine = engine(1);
        let first = engine.add_persistent(Writer::new(0, 10.0, 1.0), Priority::STANDARD);
        let second = engine.add_persistent(Writer::new(0, 5.0, 0.5), Priority::STANDARD);

        let report = engine.tick(&sensors(1));
        assert_eq!(report.snapshot, vec![first, second]);
        assert!((engine.get_output(0).value - 7.5).abs() < 1e-6);
    }

    #[test]
    fn committed_weight_is_accumulated_authority() {
        let engine = engine(1);
        engine.add_persistent(Writer::new(0, 1.0, 0.5), Priority::LOW);
        engine.add_persistent(Writer::new(0, 1.0, 0.5), Priority::HIGH);
        engine.tick(&sensors(1));
        let out = engine.get_output(0);
        assert!((out.weight - 0.75).abs() < 1e-6);
        // 0 * 0.5 + 1 * 0.5, then 0.5 * 0.5 + 1 * 0.5
        assert!((out.value - 0.75).abs() < 1e-6);
    }

    #[test]
    fn undriven_slot_holds_previous_value() {
        let engine = engine(2);
        let a = engine.add_persistent(Writer::new(0, 0.8, 1.0), Priority::STANDARD);
        engine.tick(&sensors(2));
        engine.remove(a).unwrap();

        let report = engine.tick(&sensors(2));
        for frame in 0..4 {
            assert_eq!(report.frame.get(frame, 0), Some(OutputCmd::new(0.8, 0.0)));
            assert_eq!(report.frame.get(frame, 1), Some(OutputCmd::new(0.0, 0.0)));
        }
    }

    #[test]
    fn absent_slot_is_a_no_op() {
        let engine = engine(1);
        let bad = engine.add_persistent(Writer::new(99, 1.0, 1.0), Priority::STANDARD);
        engine.add_persistent(Writer::new(0, 0.3, 1.0), Priority::LOW);

        let report = engine.tick(&sensors(1));
        assert!(report.invoked.contains(&bad));
        assert!(report.failed.is_empty());
        assert!((engine.get_output(0).value - 0.3).abs() < 1e-6);
    }

    #[test]
    fn ignored_tier_is_kept_but_never_expressed() {
        let engine = engine(1);
        let writer = Writer::new(0, 1.0, 1.0);
        let (updates, _) = writer.counters();
        let id = engine.add_persistent(writer, Priority::IGNORED);

        let report = engine.tick(&sensors(1));
        assert_eq!(report.evaluated, vec![id]);
        assert!(report.invoked.is_empty());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert!(engine.contains(id));
        assert_eq!(engine.get_output(0), OutputCmd::unset());
    }

    #[test]
    fn priority_change_applies_from_next_tick() {
        let engine = engine(1);
        engine.add_persistent(Writer::new(0, 1.0, 1.0), Priority::STANDARD);
        let b = engine.add_persistent(Writer::new(0, 2.0, 1.0), Priority::HIGH);
        engine.tick(&sensors(1));
        assert!((engine.get_output(0).value - 2.0).abs() < 1e-6);

        engine.set_priority(b, Priority::LOW).unwrap();
        engine.tick(&sensors(1));
        assert!((engine.get_output(0).value - 1.0).abs() < 1e-6);
        assert!(engine.set_priority(MotionId::from_raw(77), Priority::LOW).is_err());
    }

    #[test]
    fn producer_can_escalate_itself() {
        let engine = engine(1);
        let esc = engine.add_persistent(
            Box::new(Escalator {
                id: MotionId::INVALID,
                asked: false,
            }),
            Priority::LOW,
        );
        engine.add_persistent(Writer::new(0, 2.0, 1.0), Priority::EMERGENCY);

        engine.tick(&sensors(1));
        assert!((engine.get_output(0).value - 2.0).abs() < 1e-6);
        assert_eq!(engine.priority(esc), Some(Priority::EMERGENCY.one_above()));

        engine.tick(&sensors(1));
        assert!((engine.get_output(0).value - 1.0).abs() < 1e-6);
    }

    // ------------------------------------------------------------------
    // Pruning & removal
    // ------------------------------------------------------------------

    #[test]
    fn dead_prunable_is_pruned_without_being_invoked() {
        let sink = Arc::new(RecordingSink::default());
        let engine = MotionEngine::new(EngineConfig::with_slots(1), sink.clone()).unwrap();
        let mut writer = Writer::new(0, 1.0, 1.0);
        writer.alive = false;
        let (updates, stops) = writer.counters();
        let id = engine.add_prunable(writer, Priority::STANDARD);

        let report = engine.tick(&sensors(1));
        assert_eq!(report.pruned, vec![id]);
        assert!(report.evaluated.is_empty());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!engine.contains(id));
        assert_eq!(sink.transitions(id), vec![Transition::Activate, Transition::Deactivate]);
    }

    #[test]
    fn dead_persistent_is_kept_but_not_invoked() {
        let engine = engine(1);
        let mut writer = Writer::new(0, 1.0, 1.0);
        writer.alive = false;
        let (updates, _) = writer.counters();
        let id = engine.add_persistent(writer, Priority::STANDARD);

        let report = engine.tick(&sensors(1));
        assert!(report.pruned.is_empty());
        assert_eq!(report.evaluated, vec![id]);
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert!(engine.contains(id));
    }

    #[test]
    fn auto_prune_off_keeps_dead_prunable() {
        struct Sticky(Box<Writer>);
        impl MotionCommand for Sticky {
            fn update_outputs(&mut self, ctx: &mut MotionContext<'_>) -> usize {
                self.0.update_outputs(ctx)
            }
            fn is_dirty(&self) -> bool {
                false
            }
            fn is_alive(&self) -> bool {
                false
            }
            fn id(&self) -> MotionId {
                self.0.id()
            }
            fn set_id(&mut self, id: MotionId) {
                self.0.set_id(id);
            }
            fn auto_prune(&self) -> bool {
                false
            }
            fn name(&self) -> &str {
                "Sticky"
            }
        }

        let engine = engine(1);
        let id = engine.add_prunable(Box::new(Sticky(Writer::new(0, 1.0, 1.0))), Priority::STANDARD);
        let report = engine.tick(&sensors(1));
        assert!(report.pruned.is_empty());
        assert!(engine.contains(id));
    }

    #[test]
    fn mid_pass_changes_apply_at_safe_point() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(MotionEngine::new(EngineConfig::with_slots(2), sink.clone()).unwrap());
        let added = Arc::new(std::sync::Mutex::new(None));

        let victim = engine.add_persistent(Writer::new(0, 1.0, 1.0), Priority::STANDARD);
        let meddler = engine.add_persistent(
            Box::new(Meddler {
                id: MotionId::INVALID,
                engine: Arc::downgrade(&engine),
                victim,
                added: Arc::clone(&added),
                done: false,
            }),
            Priority::LOW,
        );

        let first = engine.tick(&sensors(2));
        let new_id = added.lock().unwrap().expect("meddler registered a writer");
        // The victim was still evaluated this pass; the newcomer was not.
        assert_eq!(first.snapshot, vec![meddler, victim]);
        assert_eq!(first.invoked, vec![meddler, victim]);
        assert!(!engine.contains(victim));
        assert!(engine.contains(new_id));
        assert_eq!(sink.transitions(new_id), vec![Transition::Activate]);

        let second = engine.tick(&sensors(2));
        assert_eq!(second.snapshot, vec![meddler, new_id]);
        assert!((engine.get_output(1).value - 0.5).abs() < 1e-6);
    }

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    #[test]
    fn checkout_skips_producer_until_checkin() {
        let engine = engine(2);
        let id = engine.add_persistent(Box::new(Pair::default()), Priority::STANDARD);

        let mut pair = engine.checkout_as::<Pair>(id).unwrap();
        pair.a = 0.4;
        let report = engine.tick(&sensors(2));
        assert_eq!(report.skipped, vec![id]);
        assert_eq!(engine.get_output(0), OutputCmd::unset());
        drop(pair);

        let report = engine.tick(&sensors(2));
        assert_eq!(report.invoked, vec![id]);
        assert!((engine.get_output(0).value - 0.4).abs() < 1e-6);
    }

    #[test]
    fn second_checkout_fails_synchronously() {
        let engine = engine(2);
        let id = engine.add_persistent(Box::new(Pair::default()), Priority::STANDARD);

        let guard = engine.checkout(id).unwrap();
        assert_eq!(guard.id(), id);
        assert!(matches!(engine.checkout(id), Err(MuxError::AlreadyCheckedOut(h)) if h == id));
        assert!(matches!(engine.peek(id, |_| ()), Err(MuxError::MotionBusy(_))));
        drop(guard);

        assert!(engine.checkout(id).is_ok());
        let ghost = MotionId::from_raw(1000);
        assert!(matches!(engine.checkout(ghost), Err(MuxError::UnknownMotion(_))));
    }

    #[test]
    fn typed_checkout_rejects_wrong_type_and_checks_back_in() {
        let engine = engine(2);
        let id = engine.add_persistent(Box::new(Pair::default()), Priority::STANDARD);

        let err = engine.checkout_as::<Writer>(id).err();
        assert!(matches!(err, Some(MuxError::TypeMismatch { .. })));
        // The failed downcast released the checkout.
        assert!(engine.checkout_as::<Pair>(id).is_ok());
    }

    #[test]
    fn checkout_sees_consistent_state_across_threads() {
        let engine = Arc::new(engine(2));
        let id = engine.add_persistent(Box::new(Pair::default()), Priority::STANDARD);
        let (locked_tx, locked_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let writer_engine = Arc::clone(&engine);
        let writer = thread::spawn(move || {
            let mut pair = writer_engine.checkout_as::<Pair>(id).unwrap();
            pair.a = 3.0;
            locked_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            pair.b = 3.0;
        });

        locked_rx.recv().unwrap();
        let during = engine.tick(&sensors(2));
        assert_eq!(during.skipped, vec![id]);
        assert!(during.invoked.is_empty());

        go_tx.send(()).unwrap();
        writer.join().unwrap();

        let after = engine.tick(&sensors(2));
        assert_eq!(after.invoked, vec![id]);
        assert!((engine.get_output(0).value - 3.0).abs() < 1e-6);
        assert!((engine.get_output(1).value - 3.0).abs() < 1e-6);
    }

    #[test]
    fn removal_of_checked_out_producer_waits_for_checkin() {
        let sink = Arc::new(RecordingSink::default());
        let engine = MotionEngine::new(EngineConfig::with_slots(1), sink.clone()).unwrap();
        let writer = Writer::new(0, 1.0, 1.0);
        let (_, stops) = writer.counters();
        let id = engine.add_persistent(writer, Priority::STANDARD);

        let guard = engine.checkout(id).unwrap();
        engine.remove(id).unwrap();
        assert!(!engine.contains(id));
        assert!(matches!(engine.checkout(id), Err(MuxError::UnknownMotion(_))));

        engine.tick(&sensors(1));
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(sink.transitions(id), vec![Transition::Activate]);

        drop(guard);
        engine.tick(&sensors(1));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(sink.transitions(id), vec![Transition::Activate, Transition::Deactivate]);
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    #[test]
    fn panicking_update_discards_contributions() {
        let engine = engine(1);
        let id = engine.add_persistent(Flaky::new(1), Priority::STANDARD);

        let report = engine.tick(&sensors(1));
        assert_eq!(report.failed, vec![id]);
        assert!(report.invoked.is_empty());
        // The 9.0 staged before the panic never reached the frame.
        assert_eq!(engine.get_output(0), OutputCmd::unset());

        let report = engine.tick(&sensors(1));
        assert!(report.failed.is_empty());
        assert_eq!(engine.get_output(0), OutputCmd::full(1.0));
        assert!(engine.contains(id));
    }

    #[test]
    fn retry_budget_retires_repeat_offender() {
        let engine = engine(1);
        let id = engine.add_persistent(Flaky::new(u32::MAX), Priority::STANDARD);

        assert!(engine.tick(&sensors(1)).retired.is_empty());
        assert!(engine.tick(&sensors(1)).retired.is_empty());
        let third = engine.tick(&sensors(1));
        assert_eq!(third.retired, vec![id]);
        assert!(!engine.contains(id));
    }

    #[test]
    fn intermittent_failures_within_budget_are_tolerated() {
        let engine = engine(1);
        let id = engine.add_persistent(Flaky::new(2), Priority::STANDARD);
        for _ in 0..4 {
            assert!(engine.tick(&sensors(1)).retired.is_empty());
        }
        assert!(engine.contains(id));
    }

    #[test]
    fn removal_between_ticks_drops_failure_and_contention_state() {
        let engine = engine(1);
        let flaky = engine.add_persistent(Flaky::new(1), Priority::STANDARD);
        let other = engine.add_persistent(Writer::new(0, 0.5, 1.0), Priority::STANDARD);

        // Fails once, then recovers and contends with the writer for slot 0.
        assert_eq!(engine.tick(&sensors(1)).failed, vec![flaky]);
        assert_eq!(engine.tick(&sensors(1)).invoked, vec![flaky, other]);
        assert_eq!(engine.tracks_failures_of(flaky), (true, true));

        engine.remove(flaky).unwrap();
        assert_eq!(engine.tracks_failures_of(flaky), (false, false));

        engine.tick(&sensors(1));
        assert_eq!(engine.tracks_failures_of(flaky), (false, false));
        assert_eq!(engine.tracks_failures_of(other), (false, false));
    }

    #[test]
    fn retired_producer_state_is_dropped_at_the_safe_point() {
        let engine = engine(1);
        let id = engine.add_persistent(Flaky::new(u32::MAX), Priority::STANDARD);
        engine.tick(&sensors(1));
        assert_eq!(engine.tracks_failures_of(id), (true, false));
        engine.tick(&sensors(1));
        assert_eq!(engine.tick(&sensors(1)).retired, vec![id]);
        assert_eq!(engine.tracks_failures_of(id), (false, false));
    }

    // ------------------------------------------------------------------
    // Contention
    // ------------------------------------------------------------------

    #[test]
    fn contention_past_deadline_retires_lowest_prunable() {
        let config = EngineConfig {
            contention_deadline_ms: Some(64),
            ..EngineConfig::with_slots(1)
        };
        let engine = MotionEngine::new(config, Arc::new(NullSink)).unwrap();
        let low = engine.add_prunable(Writer::new(0, 1.0, 1.0), Priority::STANDARD);
        let high = engine.add_prunable(Writer::new(0, 2.0, 1.0), Priority::HIGH);

        for _ in 0..3 {
            assert!(engine.tick(&sensors(1)).retired.is_empty());
        }
        let report = engine.tick(&sensors(1));
        assert_eq!(report.retired, vec![low]);
        assert!(!engine.contains(low));
        assert!(engine.contains(high));
    }

    #[test]
    fn persistent_contention_only_warns() {
        let config = EngineConfig {
            contention_deadline_ms: Some(32),
            ..EngineConfig::with_slots(1)
        };
        let engine = MotionEngine::new(config, Arc::new(NullSink)).unwrap();
        let a = engine.add_persistent(Writer::new(0, 1.0, 1.0), Priority::STANDARD);
        let b = engine.add_persistent(Writer::new(0, 2.0, 1.0), Priority::STANDARD);
        for _ in 0..10 {
            assert!(engine.tick(&sensors(1)).retired.is_empty());
        }
        assert!(engine.contains(a) && engine.contains(b));
    }

    // ------------------------------------------------------------------
    // Snapshot property
    // ------------------------------------------------------------------

    mod proptest_snapshot {
        use super::*;
        use proptest::prelude::*;

        const TIERS: [Priority; 5] = [
            Priority::IGNORED,
            Priority::BACKGROUND,
            Priority::STANDARD,
            Priority::HIGH,
            Priority::EMERGENCY,
        ];

        #[derive(Debug, Clone)]
        enum Op {
            AddPersistent(usize),
            AddPrunable(usize, bool),
            Remove(usize),
            Tick,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..TIERS.len()).prop_map(Op::AddPersistent),
                (0..TIERS.len(), any::<bool>()).prop_map(|(t, alive)| Op::AddPrunable(t, alive)),
                (0usize..8).prop_map(Op::Remove),
                Just(Op::Tick),
            ]
        }

        proptest! {
            /// Every tick accounts for exactly the producers registered when
            /// it began, in (priority, registration) order.
            #[test]
            fn tick_covers_exactly_the_registry_snapshot(ops in prop::collection::vec(op(), 1..40)) {
                let engine = engine(1);
                let mut live: Vec<MotionId> = Vec::new();

                for op in ops {
                    match op {
                        Op::AddPersistent(t) => {
                            live.push(engine.add_persistent(Writer::new(0, 1.0, 0.5), TIERS[t]));
                        }
                        Op::AddPrunable(t, alive) => {
                            let mut writer = Writer::new(0, 1.0, 0.5);
                            writer.alive = alive;
                            live.push(engine.add_prunable(writer, TIERS[t]));
                        }
                        Op::Remove(i) => {
                            if !live.is_empty() {
                                let id = live.remove(i % live.len());
                                prop_assert!(engine.remove(id).is_ok());
                            }
                        }
                        Op::Tick => {
                            let registered = engine.motion_ids();
                            let mut expected = registered.clone();
                            expected.sort_by_key(|id| (engine.priority(*id), *id));

                            let report = engine.tick(&sensors(1));
                            prop_assert_eq!(&report.snapshot, &expected);

                            let mut covered = report.evaluated.clone();
                            covered.extend(&report.skipped);
                            covered.extend(&report.pruned);
                            prop_assert_eq!(sorted(covered), sorted(registered));

                            for id in &report.pruned {
                                prop_assert!(!engine.contains(*id));
                                live.retain(|l| l != id);
                            }
                        }
                    }
                }
            }
        }
    }
}
