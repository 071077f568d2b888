//! `motionmux-kernel` – Motion output arbitration
//!
//! The heart of the stack.  Many independently written motion producers
//! propose values for the same output slots; the kernel decides, every tick,
//! what each slot actually gets.
//!
//! # Modules
//!
//! - [`motion`] – [`MotionCommand`][motion::MotionCommand]: the producer
//!   contract, plus the [`MotionContext`][motion::MotionContext] handed to
//!   every update.
//! - [`engine`] – [`MotionEngine`][engine::MotionEngine]: registration,
//!   removal, checkout and the per-tick compositing pass.
//! - [`compositor`] – staged contributions and the weighted fold into the
//!   double-buffered sub-frame output.
//! - [`checkout`] – [`CheckoutGuard`][checkout::CheckoutGuard] and
//!   [`TypedCheckout`][checkout::TypedCheckout]: RAII exclusive access to a
//!   registered producer from another thread.
//! - [`lifecycle`] – [`SettleTracker`][lifecycle::SettleTracker]: dirty /
//!   settled bookkeeping and the hold/timeout liveness rule shared by
//!   target-seeking producers.
//! - [`retry_budget`] – [`RetryBudget`][retry_budget::RetryBudget]: retires
//!   producers that keep failing.
//! - [`watchdog`] – [`ContentionWatchdog`][watchdog::ContentionWatchdog]:
//!   spots producers fighting over a slot past a deadline.

pub mod checkout;
pub mod compositor;
pub mod engine;
pub mod lifecycle;
pub mod motion;
mod registry;
pub mod retry_budget;
pub mod watchdog;

pub use checkout::{CheckoutGuard, TypedCheckout};
pub use engine::{EngineConfig, MotionEngine, MotionSummary, TickReport};
pub use lifecycle::{MotionPhase, SettleTracker};
pub use motion::{AsAny, MotionCommand, MotionContext, StartContext};
pub use registry::RemovalReason;
pub use retry_budget::RetryBudget;
pub use watchdog::{ContentionWatchdog, ExpiredContest, SlotContention};
