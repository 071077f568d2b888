//! Sub-frame compositing.
//!
//! A producer never writes into the output frame directly.  Everything it
//! sets during `update_outputs` lands in a [`StagingBuffer`]; once the call
//! returns successfully the [`Compositor`] folds the staged contributions into
//! the working frame in one go:
//!
//! ```text
//! value     = value * (1 - w) + v * w
//! authority = 1 - (1 - authority) * (1 - w)
//! ```
//!
//! Producers are folded in ascending priority order, so the last one folded
//! has the final say.  A producer that panics midway has its staged
//! contributions thrown away and leaves the working frame untouched.

use std::collections::HashSet;

use motionmux_types::{MotionId, OutputCmd, OutputFrame};

// ────────────────────────────────────────────────────────────────────────────
// StagingBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Per-producer scratch space for contributions made during one
/// `update_outputs` call.  Setting the same slot/sub-frame twice keeps the
/// later command.
#[derive(Debug)]
pub struct StagingBuffer {
    sub_frames: usize,
    num_slots: usize,
    cells: Vec<Option<OutputCmd>>,
    touched: Vec<usize>,
    warned_slots: HashSet<usize>,
}

impl StagingBuffer {
    pub fn new(sub_frames: usize, num_slots: usize) -> Self {
        Self {
            sub_frames,
            num_slots,
            cells: vec![None; sub_frames * num_slots],
            touched: Vec::new(),
            warned_slots: HashSet::new(),
        }
    }

    pub fn sub_frames(&self) -> usize {
        self.sub_frames
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Stage `cmd` for one slot/sub-frame.  Out-of-range addresses are a
    /// configuration error: warned once per slot, otherwise ignored.
    pub fn stage(&mut self, id: MotionId, slot: usize, frame: usize, cmd: OutputCmd) {
        if slot >= self.num_slots || frame >= self.sub_frames {
            self.warn_bad_address(id, slot, frame);
            return;
        }
        let index = frame * self.num_slots + slot;
        if self.cells[index].is_none() {
            self.touched.push(index);
        }
        self.cells[index] = Some(cmd);
    }

    /// Report an unusable address without staging anything.
    pub fn warn_bad_address(&mut self, id: MotionId, slot: usize, frame: usize) {
        if self.warned_slots.insert(slot) {
            tracing::warn!(
                motion = %id,
                slot,
                frame,
                num_slots = self.num_slots,
                sub_frames = self.sub_frames,
                "output slot not present on this model; ignoring"
            );
        }
    }

    /// Staged contributions as `(frame, slot, cmd)`, in staging order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, OutputCmd)> + '_ {
        self.touched.iter().filter_map(move |&index| {
            self.cells[index].map(|cmd| (index / self.num_slots, index % self.num_slots, cmd))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Forget every staged contribution.
    pub fn clear(&mut self) {
        for index in self.touched.drain(..) {
            self.cells[index] = None;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Compositor
// ────────────────────────────────────────────────────────────────────────────

/// Working half of the double-buffered output frame.
#[derive(Debug)]
pub struct Compositor {
    working: OutputFrame,
    /// Producers that drove each slot (weight > 0) during the current pass.
    drivers: Vec<Vec<MotionId>>,
    warned_weights: HashSet<MotionId>,
}

impl Compositor {
    pub fn new(sub_frames: usize, num_slots: usize) -> Self {
        Self {
            working: OutputFrame::new(sub_frames, num_slots),
            drivers: vec![Vec::new(); num_slots],
            warned_weights: HashSet::new(),
        }
    }

    /// Reset the working frame for a new pass.  Every slot starts from the
    /// value it held at the end of the previous tick, with zero authority.
    pub fn begin(&mut self, committed: &OutputFrame) {
        for slot in 0..self.working.num_slots() {
            let prior = committed.last(slot).map_or(0.0, |cmd| cmd.value);
            for frame in 0..self.working.sub_frames() {
                if let Some(cell) = self.working.get_mut(frame, slot) {
                    *cell = OutputCmd::new(prior, 0.0);
                }
            }
        }
        for drivers in &mut self.drivers {
            drivers.clear();
        }
    }

    /// Fold everything `id` staged into the working frame.
    pub fn fold(&mut self, id: MotionId, staged: &StagingBuffer) {
        for (frame, slot, cmd) in staged.iter() {
            let w = self.sanitize_weight(id, cmd.weight);
            if w <= 0.0 {
                continue;
            }
            let Some(cell) = self.working.get_mut(frame, slot) else {
                continue;
            };
            *cell = fold_cmd(*cell, cmd.value, w);
            let drivers = &mut self.drivers[slot];
            if !drivers.contains(&id) {
                drivers.push(id);
            }
        }
    }

    /// Producers that drove each slot this pass, indexed by slot.
    pub fn drivers(&self) -> &[Vec<MotionId>] {
        &self.drivers
    }

    /// Drop the warn-once record of a removed producer.
    pub fn forget(&mut self, id: MotionId) {
        self.warned_weights.remove(&id);
    }

    /// Swap the working frame with `committed`.  Afterwards `committed`
    /// holds this pass's result.
    pub fn swap_into(&mut self, committed: &mut OutputFrame) {
        std::mem::swap(&mut self.working, committed);
    }

    fn sanitize_weight(&mut self, id: MotionId, weight: f32) -> f32 {
        if weight.is_nan() || weight < 0.0 {
            if self.warned_weights.insert(id) {
                tracing::warn!(motion = %id, weight, "invalid contribution weight treated as 0");
            }
            return 0.0;
        }
        weight.min(1.0)
    }
}

/// Blend one contribution over an accumulated command.
pub fn fold_cmd(acc: OutputCmd, value: f32, w: f32) -> OutputCmd {
    OutputCmd {
        value: acc.value * (1.0 - w) + value * w,
        weight: 1.0 - (1.0 - acc.weight) * (1.0 - w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> MotionId {
        MotionId::from_raw(raw)
    }

    #[test]
    fn staging_keeps_latest_command_per_cell() {
        let mut staging = StagingBuffer::new(2, 3);
        staging.stage(id(1), 1, 0, OutputCmd::full(0.2));
        staging.stage(id(1), 1, 0, OutputCmd::full(0.9));
        staging.stage(id(1), 2, 1, OutputCmd::new(0.5, 0.5));

        let staged: Vec<_> = staging.iter().collect();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0], (0, 1, OutputCmd::full(0.9)));
        assert_eq!(staged[1], (1, 2, OutputCmd::new(0.5, 0.5)));

        staging.clear();
        assert!(staging.is_empty());
        assert_eq!(staging.iter().count(), 0);
    }

    #[test]
    fn staging_ignores_out_of_range_addresses() {
        let mut staging = StagingBuffer::new(4, 2);
        staging.stage(id(1), 2, 0, OutputCmd::full(1.0));
        staging.stage(id(1), 0, 4, OutputCmd::full(1.0));
        assert!(staging.is_empty());
    }

    #[test]
    fn begin_holds_previous_value_without_authority() {
        let mut committed = OutputFrame::new(2, 1);
        *committed.get_mut(1, 0).unwrap() = OutputCmd::full(0.7);

        let mut comp = Compositor::new(2, 1);
        comp.begin(&committed);
        let mut out = OutputFrame::new(2, 1);
        comp.swap_into(&mut out);

        assert_eq!(out.get(0, 0), Some(OutputCmd::new(0.7, 0.0)));
        assert_eq!(out.get(1, 0), Some(OutputCmd::new(0.7, 0.0)));
    }

    #[test]
    fn full_weight_overrides_and_half_weight_blends() {
        let mut comp = Compositor::new(1, 1);
        comp.begin(&OutputFrame::new(1, 1));

        let mut staging = StagingBuffer::new(1, 1);
        staging.stage(id(1), 0, 0, OutputCmd::full(0.0));
        comp.fold(id(1), &staging);
        staging.clear();
        staging.stage(id(2), 0, 0, OutputCmd::new(0.8, 0.5));
        comp.fold(id(2), &staging);

        let mut out = OutputFrame::new(1, 1);
        comp.swap_into(&mut out);
        let cmd = out.get(0, 0).unwrap();
        assert!((cmd.value - 0.4).abs() < 1e-6);
        assert!((cmd.weight - 1.0).abs() < 1e-6);
        assert_eq!(comp.drivers().len(), 1);
    }

    #[test]
    fn weights_are_clamped_and_sanitized() {
        let mut comp = Compositor::new(1, 2);
        comp.begin(&OutputFrame::new(1, 2));

        let mut staging = StagingBuffer::new(1, 2);
        staging.stage(id(1), 0, 0, OutputCmd::new(3.0, 7.0));
        staging.stage(id(1), 1, 0, OutputCmd::new(3.0, -1.0));
        comp.fold(id(1), &staging);
        staging.clear();
        staging.stage(id(1), 1, 0, OutputCmd::new(3.0, f32::NAN));
        comp.fold(id(1), &staging);

        let mut out = OutputFrame::new(1, 2);
        comp.swap_into(&mut out);
        assert_eq!(out.get(0, 0), Some(OutputCmd::full(3.0)));
        assert_eq!(out.get(0, 1), Some(OutputCmd::new(0.0, 0.0)));
        assert_eq!(comp.drivers()[0], vec![id(1)]);
        assert!(comp.drivers()[1].is_empty());
    }

    #[test]
    fn zero_weight_passes_prior_through() {
        let acc = OutputCmd::new(0.3, 0.6);
        assert_eq!(fold_cmd(acc, 99.0, 0.0), acc);
    }

    mod proptest_fold {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Folding a sequence equals the closed form
            /// `S·Π(1-wᵢ) + Σ vᵢ·wᵢ·Π_{j>i}(1-wⱼ)`.
            #[test]
            fn fold_matches_closed_form(
                prior in -10.0f32..10.0,
                contributions in prop::collection::vec((-10.0f32..10.0, 0.0f32..=1.0), 0..6),
            ) {
                let mut acc = OutputCmd::new(prior, 0.0);
                for &(v, w) in &contributions {
                    acc = fold_cmd(acc, v, w);
                }

                let n = contributions.len();
                let keep_after = |i: usize| -> f32 {
                    contributions[i + 1..n].iter().map(|&(_, w)| 1.0 - w).product()
                };
                let all_keep: f32 = contributions.iter().map(|&(_, w)| 1.0 - w).product();
                let expected: f32 = prior * all_keep
                    + (0..n)
                        .map(|i| contributions[i].0 * contributions[i].1 * keep_after(i))
                        .sum::<f32>();

                prop_assert!((acc.value - expected).abs() < 1e-3, "{} vs {}", acc.value, expected);
                prop_assert!((acc.weight - (1.0 - all_keep)).abs() < 1e-4);
            }

            /// A full-weight contribution erases everything folded before it.
            #[test]
            fn full_weight_is_last_word(
                prior in -10.0f32..10.0,
                v in -10.0f32..10.0,
                w in 0.0f32..=1.0,
                last in -10.0f32..10.0,
            ) {
                let acc = fold_cmd(fold_cmd(OutputCmd::new(prior, 0.0), v, w), last, 1.0);
                prop_assert!((acc.value - last).abs() < 1e-5);
                prop_assert!((acc.weight - 1.0).abs() < 1e-6);
            }
        }
    }
}
