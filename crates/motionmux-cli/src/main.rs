//! `motionmux` – demo driver for the motion output arbitration engine.
//!
//! This binary:
//!
//! 1. Loads `~/.motionmux/config.toml` (writing the defaults on first run) and
//!    applies `MOTIONMUX_*` environment overrides.
//! 2. Builds a simulated actuator bank (joints, one wheel, two LEDs) and an
//!    engine over its layout, with an emergency stop registered at the top
//!    tier and a couple of demo producers underneath.
//! 3. Runs the control loop on its own thread and prints every motion event.
//! 4. Intercepts **Ctrl-C** to engage the emergency stop, waits for the
//!    freeze to be committed and shuts down.

mod config;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use motionmux_hal::{ActuatorBank, SimBank};
use motionmux_kernel::MotionEngine;
use motionmux_middleware::{EventBus, Topic, TopicReceiver};
use motionmux_motions::{EmergencyStop, EstopSettings, LedMotion, PostureMotion};
use motionmux_runtime::{ControlLoop, ControlLoopConfig, init_tracing};
use motionmux_types::{EventKind, MotionEvent, MotionId, OutputCmd, Priority, SlotKind, SlotLayout, Transition};

const POLL: Duration = Duration::from_millis(50);
const FREEZE_WAIT: Duration = Duration::from_millis(500);

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    // ── Configuration ─────────────────────────────────────────────────────
    let (cfg, notice) = match config::load() {
        Ok(Some(cfg)) => (cfg, format!("Config loaded from {}", config::config_path().display())),
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => (cfg, format!("Default config written to {}", config::config_path().display())),
                Err(e) => (cfg, format!("Using defaults ({e})")),
            }
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, "Using default configuration.".to_string())
        }
    };
    cfg.validate()?;

    // ── Structured logging ────────────────────────────────────────────────
    let _guard = init_tracing("motionmux", cfg.log_format);

    print_banner();
    println!("  {}", notice.dimmed());

    // ── Hardware, bus and engine ──────────────────────────────────────────
    let bank = demo_bank(&cfg);
    let layout = bank.layout();
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe_to(Topic::All);

    let engine = Arc::new(
        MotionEngine::with_layout(cfg.engine.clone(), layout.clone(), bus.clone()).map_err(|e| e.to_string())?,
    );

    let settings = EstopSettings {
        fade: cfg.estop.fade(),
        ..EstopSettings::default()
    };
    let estop_id = engine.add_persistent(
        Box::new(EmergencyStop::with_settings(&layout, settings)),
        Priority::EMERGENCY,
    );
    add_demo_producers(&engine, &layout);

    for line in engine.motion_report() {
        println!(
            "    {} {:<14} {:?} {:?}",
            line.id.to_string().bold(),
            line.name,
            line.priority,
            line.persistence
        );
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_flag = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        interrupted_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use the demo timeout to stop");
    }

    // ── Control loop ──────────────────────────────────────────────────────
    let loop_config = ControlLoopConfig {
        calibration: cfg.calibration.clone(),
        ..ControlLoopConfig::default()
    };
    let handle = ControlLoop::new(engine.clone(), bank, loop_config)
        .spawn()
        .map_err(|e| format!("Failed to start control thread: {e}"))?;

    println!();
    println!("  Running.  Press {} to engage the emergency stop and exit.\n", "Ctrl-C".bold().yellow());

    let deadline = (cfg.demo_secs > 0).then(|| Instant::now() + Duration::from_secs(cfg.demo_secs));
    loop {
        print_events(&mut events);
        if interrupted.load(Ordering::SeqCst) {
            println!();
            println!("{}", "⚠  Ctrl-C received – engaging emergency stop …".yellow().bold());
            engage_estop(&engine, estop_id, &mut events);
            break;
        }
        if handle.is_finished() || deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(POLL);
    }

    let stats = handle.stop().map_err(|e| e.to_string())?;
    print_events(&mut events);
    info!(ticks = stats.ticks, overruns = stats.overruns, "demo finished");
    println!(
        "\n  {} {} ticks, {} overruns, {} commit failures.",
        "✓".green().bold(),
        stats.ticks,
        stats.overruns,
        stats.commit_failures
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo wiring
// ─────────────────────────────────────────────────────────────────────────────

/// `num_slots - 3` joints, then a wheel and two LEDs.
fn demo_bank(cfg: &config::Config) -> ActuatorBank {
    let joints = cfg.engine.num_slots.saturating_sub(3);
    let mut builder = SimBank::builder();
    for j in 0..joints {
        builder = builder.with_joint(format!("joint_{j}"));
    }
    builder
        .with_wheel("wheel")
        .with_led("led_left")
        .with_led("led_right")
        .with_calibration(cfg.calibration.clone())
        .build()
}

fn add_demo_producers(engine: &MotionEngine, layout: &SlotLayout) {
    let mut posture = PostureMotion::new(layout.len());
    for (i, slot) in layout.slots_of(SlotKind::Joint).enumerate() {
        let target = if i % 2 == 0 { 0.5 } else { -0.5 };
        posture.set_target(slot, OutputCmd::full(target));
    }
    posture.set_max_speed_all(0.01);
    engine.add_prunable(Box::new(posture), Priority::STANDARD);

    let mut leds = LedMotion::for_layout(layout);
    leds.leds_mut()
        .cycle(motionmux_motions::led::ALL_LEDS, Duration::from_secs(3), 0.5, 0.5, Duration::ZERO, Duration::ZERO);
    engine.add_persistent(Box::new(leds), Priority::BACKGROUND);
}

/// Request the stop and wait until the engine reports the freeze.
fn engage_estop(engine: &MotionEngine, id: MotionId, events: &mut TopicReceiver) {
    match engine.checkout_as::<EmergencyStop>(id) {
        Ok(mut estop) => estop.set_stopped(true),
        Err(e) => {
            println!("{}: {}", "Could not reach the emergency stop".red(), e);
            return;
        }
    }
    let started = Instant::now();
    while started.elapsed() < FREEZE_WAIT {
        for event in events.drain() {
            let frozen = event.source == id
                && event.kind == EventKind::EmergencyStop
                && event.transition == Transition::Activate;
            print_event(&event);
            if frozen {
                println!("{}", "  ✓ Outputs frozen.".green());
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    println!("{}", "  ✗ No freeze confirmed before shutdown.".red());
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_events(events: &mut TopicReceiver) {
    for event in events.drain() {
        print_event(&event);
    }
}

fn print_event(event: &MotionEvent) {
    let transition = match event.transition {
        Transition::Activate => "activate".green(),
        Transition::Status => "status".cyan(),
        Transition::Deactivate => "deactivate".yellow(),
    };
    println!(
        "  [{:>7} ms] {:<14} {:<10} {} {}",
        event.engine_time.as_millis(),
        format!("{:?}", event.kind).bold(),
        transition,
        event.source,
        format!("({} ms)", event.duration.as_millis()).dimmed()
    );
}

fn print_banner() {
    println!();
    println!("{}", "  ┌┬┐┌─┐┌┬┐┬┌─┐┌┐┌┌┬┐┬ ┬─┐ ┬".bold().cyan());
    println!("{}", "  ││││ │ │ ││ ││││││││ │┌┴┬┘".bold().cyan());
    println!("{}", "  ┴ ┴└─┘ ┴ ┴└─┘┘└┘┴ ┴└─┘┴ └─".bold().cyan());
    println!();
    println!("  {} {}", "motionmux".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Motion output arbitration engine");
    println!();
}
