//! `motionmux-middleware` – Event fan-out
//!
//! Carries [`MotionEvent`](motionmux_types::MotionEvent)s from the engine and
//! its producers to any number of listeners without ever blocking the tick.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based broadcast bus built on Tokio channels; plugs into
//!   the engine as its [`EventSink`](motionmux_types::EventSink).

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
