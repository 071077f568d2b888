//! [`RetryBudget`] – consecutive-failure counter for one producer.
//!
//! A producer whose `update_outputs` panics is skipped for that tick and the
//! failure is recorded here.  Once `budget` failures happen in a row the
//! budget is exhausted and the engine force-retires the producer.  Any
//! successful update resets the streak.
//!
//! # Example
//!
//! ```rust
//! use motionmux_kernel::retry_budget::RetryBudget;
//!
//! let mut budget = RetryBudget::new(3);
//!
//! assert!(!budget.record_failure());
//! assert!(!budget.record_failure());
//! assert!(budget.record_failure()); // third failure in a row → retire
//!
//! // A success clears the streak.
//! budget.record_success();
//! assert!(!budget.record_failure());
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// RetryBudget
// ─────────────────────────────────────────────────────────────────────────────

/// Counts consecutive update failures of a single producer.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Number of consecutive failures that exhausts the budget.
    budget: u32,
    /// Current streak of failures.
    streak: u32,
    /// Failures over the producer's whole lifetime, for diagnostics.
    total: u64,
}

impl RetryBudget {
    /// Create a new budget.  A `budget` of 0 is treated as 1: the first
    /// failure retires the producer.
    pub fn new(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
            streak: 0,
            total: 0,
        }
    }

    /// Record a failed update.  Returns `true` once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.streak = self.streak.saturating_add(1);
        self.total = self.total.saturating_add(1);
        self.is_exhausted()
    }

    /// Record a successful update, clearing the streak.
    pub fn record_success(&mut self) {
        self.streak = 0;
    }

    /// `true` when the current streak has reached the budget.
    pub fn is_exhausted(&self) -> bool {
        self.streak >= self.budget
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
