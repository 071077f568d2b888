//! `motionmux-runtime` – Driving the engine in real time
//!
//! # Modules
//!
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   fixed-period read → calibrate → tick → commit cycle, on its own thread.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!   Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export to any
//!   OTLP-compatible collector.

pub mod control_loop;
pub mod telemetry;

pub use control_loop::{ControlLoop, ControlLoopConfig, LoopHandle, LoopStats};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
