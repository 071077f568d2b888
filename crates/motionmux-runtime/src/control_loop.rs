//! [`ControlLoop`] – the fixed-period driver of the arbitration engine.
//!
//! Each cycle:
//!
//! 1. **Read** – sample raw readings from the device's [`SensorSource`].
//! 2. **Calibrate** – map them into model units with the
//!    [`CalibrationTable`] so producers never see hardware offsets.
//! 3. **Tick** – run one [`MotionEngine::tick`] pass.
//! 4. **Commit** – hand the committed frame to the device's [`OutputSink`].
//!
//! The loop runs on its own thread (see [`ControlLoop::spawn`]) and sleeps
//! out the rest of each period.  Overruns are logged, not compensated.
//! Downstream commit failures are counted; once
//! [`ControlLoopConfig::max_consecutive_faults`] commits in a row have failed
//! the loop stops and returns the last error.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use motionmux_hal::SimBank;
//! use motionmux_kernel::{EngineConfig, MotionEngine};
//! use motionmux_runtime::control_loop::{ControlLoop, ControlLoopConfig};
//! use motionmux_types::NullSink;
//!
//! let bank = SimBank::builder().with_joint("neck").build();
//! let engine = Arc::new(
//!     MotionEngine::with_layout(EngineConfig::with_slots(1), bank.layout(), Arc::new(NullSink)).unwrap(),
//! );
//! let mut control = ControlLoop::new(engine, bank, ControlLoopConfig::default());
//! let report = control.run_once().unwrap();
//! assert_eq!(report.tick, 0);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use motionmux_hal::{OutputSink, SensorSource};
use motionmux_kernel::{MotionEngine, TickReport};
use motionmux_types::{CalibrationTable, MuxError};
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`ControlLoop`].
#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Wall-clock period between ticks.  `None` uses the engine's tick period
    /// (`frame_time × sub_frames`).
    pub period: Option<Duration>,
    /// Applied (inverted) to raw sensor readings before each tick.
    pub calibration: CalibrationTable,
    /// Consecutive failed commits tolerated before the loop gives up.
    pub max_consecutive_faults: u32,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            period: None,
            calibration: CalibrationTable::identity(),
            max_consecutive_faults: 3,
        }
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub overruns: u64,
    pub commit_failures: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a shared [`MotionEngine`] against one device.
pub struct ControlLoop<H> {
    engine: Arc<MotionEngine>,
    device: H,
    calibration: CalibrationTable,
    period: Duration,
    max_consecutive_faults: u32,
    consecutive_faults: u32,
    stats: LoopStats,
    shutdown: Arc<AtomicBool>,
}

impl<H: SensorSource + OutputSink> ControlLoop<H> {
    pub fn new(engine: Arc<MotionEngine>, device: H, config: ControlLoopConfig) -> Self {
        let period = config.period.unwrap_or_else(|| engine.config().tick_period());
        Self {
            engine,
            device,
            calibration: config.calibration,
            period,
            max_consecutive_faults: config.max_consecutive_faults.max(1),
            consecutive_faults: 0,
            stats: LoopStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Arc<MotionEngine> {
        &self.engine
    }

    pub fn device(&self) -> &H {
        &self.device
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Flag that stops [`run`](Self::run) at the next cycle boundary when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// One read → calibrate → tick → commit cycle.
    ///
    /// # Errors
    ///
    /// Propagates the sink's error; the tick itself has already run and the
    /// engine's committed frame is up to date either way.
    pub fn run_once(&mut self) -> Result<TickReport, MuxError> {
        let mut sensors = self.device.read();
        self.calibration.calibrate_snapshot(&mut sensors);

        let report = self.engine.tick(&sensors);
        self.stats.ticks += 1;

        match self.device.commit(&report.frame) {
            Ok(()) => {
                self.consecutive_faults = 0;
                Ok(report)
            }
            Err(e) => {
                self.consecutive_faults += 1;
                self.stats.commit_failures += 1;
                warn!(tick = report.tick, error = %e, faults = self.consecutive_faults, "output commit failed");
                Err(e)
            }
        }
    }

    /// Run until the shutdown flag is raised or the device keeps failing.
    pub fn run(&mut self) -> Result<LoopStats, MuxError> {
        info!(period_ms = self.period.as_millis() as u64, "control loop started");
        while !self.shutdown.load(Ordering::Acquire) {
            let started = Instant::now();
            if let Err(e) = self.run_once() {
                if self.consecutive_faults >= self.max_consecutive_faults {
                    error!(error = %e, "control loop stopping after repeated commit failures");
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            match self.period.checked_sub(elapsed) {
                Some(rest) => thread::sleep(rest),
                None => {
                    self.stats.overruns += 1;
                    debug!(
                        elapsed_us = elapsed.as_micros() as u64,
                        period_us = self.period.as_micros() as u64,
                        "tick overran its period"
                    );
                }
            }
        }
        info!(ticks = self.stats.ticks, overruns = self.stats.overruns, "control loop stopped");
        Ok(self.stats)
    }
}

impl<H: SensorSource + OutputSink + 'static> ControlLoop<H> {
    /// Move the loop onto a dedicated thread.
    pub fn spawn(mut self) -> std::io::Result<LoopHandle> {
        let shutdown = self.shutdown_handle();
        let join = thread::Builder::new()
            .name("motionmux-tick".into())
            .spawn(move || self.run())?;
        Ok(LoopHandle { shutdown, join })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a loop running on its own thread.
pub struct LoopHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<Result<LoopStats, MuxError>>,
}

impl LoopHandle {
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Raise the shutdown flag and wait for the thread to exit.
    pub fn stop(self) -> Result<LoopStats, MuxError> {
        self.shutdown.store(true, Ordering::Release);
        self.join.join().unwrap_or_else(|_| {
            Err(MuxError::HardwareFault {
                component: "control loop".into(),
                details: "tick thread panicked".into(),
            })
        })
    }
}
