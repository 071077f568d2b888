//! Configuration Vault – reads/writes `~/.motionmux/config.toml`.

use motionmux_kernel::EngineConfig;
use motionmux_runtime::LogFormat;
use motionmux_types::CalibrationTable;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Emergency-stop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstopConfig {
    /// Fade-out after release, in milliseconds.
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,
}

impl Default for EstopConfig {
    fn default() -> Self {
        Self {
            fade_ms: default_fade_ms(),
        }
    }
}

impl EstopConfig {
    pub fn fade(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }
}

/// Persisted configuration stored in `~/.motionmux/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_engine")]
    pub engine: EngineConfig,

    /// Per-slot scale/offset applied between the engine and the hardware.
    #[serde(default)]
    pub calibration: CalibrationTable,

    #[serde(default)]
    pub estop: EstopConfig,

    #[serde(default)]
    pub log_format: LogFormat,

    /// How long the demo runs before releasing on its own; 0 runs until
    /// Ctrl-C.
    #[serde(default = "default_demo_secs")]
    pub demo_secs: u64,
}

/// Smallest model the demo can drive: one joint, one wheel, two LEDs.
pub const MIN_DEMO_SLOTS: usize = 4;

fn default_engine() -> EngineConfig {
    EngineConfig::with_slots(8)
}
fn default_fade_ms() -> u64 {
    1000
}
fn default_demo_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            calibration: CalibrationTable::identity(),
            estop: EstopConfig::default(),
            log_format: LogFormat::default(),
            demo_secs: default_demo_secs(),
        }
    }
}

impl Config {
    /// Reject values the demo cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate().map_err(|e| e.to_string())?;
        if self.engine.num_slots < MIN_DEMO_SLOTS {
            return Err(format!(
                "engine.num_slots must be at least {MIN_DEMO_SLOTS} (got {})",
                self.engine.num_slots
            ));
        }
        let n = self.engine.num_slots;
        if self.calibration.scale.len() > n || self.calibration.offset.len() > n {
            return Err(format!("calibration covers more than {n} slots"));
        }
        Ok(())
    }
}

/// Return the path to `~/.motionmux/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".motionmux").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `MOTIONMUX_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MOTIONMUX_SUB_FRAMES` | `engine.sub_frames` |
/// | `MOTIONMUX_FRAME_TIME_MS` | `engine.frame_time_ms` |
/// | `MOTIONMUX_NUM_SLOTS` | `engine.num_slots` |
/// | `MOTIONMUX_RETRY_BUDGET` | `engine.retry_budget` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }
    if let Some(n) = parsed(&lookup, "MOTIONMUX_SUB_FRAMES") {
        cfg.engine.sub_frames = n;
    }
    if let Some(ms) = parsed(&lookup, "MOTIONMUX_FRAME_TIME_MS") {
        cfg.engine.frame_time_ms = ms;
    }
    if let Some(n) = parsed(&lookup, "MOTIONMUX_NUM_SLOTS") {
        cfg.engine.num_slots = n;
    }
    if let Some(n) = parsed(&lookup, "MOTIONMUX_RETRY_BUDGET") {
        cfg.engine.retry_budget = n;
    }
}

/// Save the config to disk, creating `~/.motionmux/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // rwx------
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // rw-------
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
