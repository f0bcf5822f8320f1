//! Handles engine configuration loading and management.
//!
//! This module defines `AppConfig`, which holds the CouchDB connection settings,
//! the slide timing parameters (`PlaybackConfig`) and the liveness monitor
//! thresholds (`WatchdogConfig`). `load_config` reads them from an INI file.

use configparser::ini::Ini;
use super::errors::ConfigError;
use super::model::PlayOrder;
use log::{info, debug, error};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/signage.conf";

/// Slide timing and ordering. Any change to these values resets the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackConfig {
    pub auto_slide_interval_ms: u64,
    pub video_play_duration_ms: u64,
    pub transition_duration_ms: u64,
    pub play_order: PlayOrder,
    /// Upper bound of the delay between arming a slide's timer and preloading the
    /// next slide.
    pub preload_lead_ms: u64,
    /// How long a video may take to report playback before it is shown with image
    /// timing.
    pub readiness_timeout_ms: u64,
    /// Fixed seed for random play order. `None` seeds from the OS.
    pub shuffle_seed: Option<u64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            auto_slide_interval_ms: 5_000,
            video_play_duration_ms: 10_000,
            transition_duration_ms: 500,
            play_order: PlayOrder::Sequential,
            preload_lead_ms: 5_000,
            readiness_timeout_ms: 5_000,
            shuffle_seed: None,
        }
    }
}

impl PlaybackConfig {
    pub fn auto_slide_interval(&self) -> Duration {
        Duration::from_millis(self.auto_slide_interval_ms)
    }

    pub fn video_play_duration(&self) -> Duration {
        Duration::from_millis(self.video_play_duration_ms)
    }

    pub fn transition_duration(&self) -> Duration {
        Duration::from_millis(self.transition_duration_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Delay after arming a duration timer at which the next slide is preloaded:
    /// `min(preload_lead, duration / 2)`.
    pub fn preload_offset(&self, duration: Duration) -> Duration {
        Duration::from_millis(self.preload_lead_ms).min(duration / 2)
    }
}

/// Liveness monitor thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchdogConfig {
    pub check_interval_ms: u64,
    pub warning_threshold_ms: u64,
    pub recovery_threshold_ms: u64,
    /// Where stall records are persisted. `None` keeps them in memory only.
    pub diagnostics_path: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            warning_threshold_ms: 120_000,
            recovery_threshold_ms: 180_000,
            diagnostics_path: None,
        }
    }
}

/// Holds the application's configuration parameters.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub couchdb_url: String,
    pub board_id: String,
    /// Management console, logged at startup when present.
    pub manager_url: Option<String>,
    pub database: String,
    pub playback: PlaybackConfig,
    pub watchdog: WatchdogConfig,
}

impl AppConfig {
    /// URL of the board document.
    pub fn board_url(&self) -> String {
        format!("{}/{}/{}", self.couchdb_url, self.database, self.board_id)
    }
}

/// Loads application configuration from the specified INI file path.
///
/// Reads `[settings]` (required), `[playback]` and `[watchdog]` (optional, defaulted).
///
/// # Errors
/// Returns `ConfigError` if the file cannot be read, is malformed,
/// if essential keys are missing, or if a value cannot be parsed.
#[must_use = "loading configuration can fail, the Result must be handled"]
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    info!("Attempting to load config from: {}", path);
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| {
        error!("Error loading config file '{}': {}", path, e);
        // configparser reports I/O failures as plain strings.
        let lower = e.to_lowercase();
        if lower.contains("os error 2") || lower.contains("failed to read file") {
            ConfigError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, e))
        } else {
            ConfigError::Parse(e)
        }
    })?;
    let config = config_from_ini(&ini)?;
    info!("Configuration loaded successfully from {}: {:?}", path, config);
    Ok(config)
}

/// Parses configuration from INI text.
#[must_use = "parsing configuration can fail, the Result must be handled"]
pub fn load_config_from_str(contents: &str) -> Result<AppConfig, ConfigError> {
    let mut ini = Ini::new();
    ini.read(contents.to_string()).map_err(ConfigError::Parse)?;
    config_from_ini(&ini)
}

fn config_from_ini(ini: &Ini) -> Result<AppConfig, ConfigError> {
    let get_key = |key_name: &str| {
        ini.get("settings", key_name).ok_or_else(|| {
            error!("Missing configuration key '{}' in section '[settings]'", key_name);
            ConfigError::MissingKey(key_name.to_string())
        })
    };

    let couchdb_url = get_key("couchdb_url")?.trim_end_matches('/').to_string();
    debug!("Loaded config value for key 'couchdb_url': {}", couchdb_url);
    let board_id = get_key("board_id")?;
    debug!("Loaded config value for key 'board_id': {}", board_id);
    let manager_url = ini.get("settings", "manager_url").filter(|url| !url.is_empty());
    let database = ini.get("settings", "database").unwrap_or_else(|| "boards".to_string());

    let defaults = PlaybackConfig::default();
    let play_order = match ini.get("playback", "play_order") {
        Some(raw) => PlayOrder::parse(&raw)
            .ok_or(ConfigError::InvalidValue { key: "play_order".into(), value: raw })?,
        None => defaults.play_order,
    };
    let playback = PlaybackConfig {
        auto_slide_interval_ms: positive_ms(
            ini,
            "playback",
            "auto_slide_interval_ms",
            defaults.auto_slide_interval_ms,
        )?,
        video_play_duration_ms: positive_ms(
            ini,
            "playback",
            "video_play_duration_ms",
            defaults.video_play_duration_ms,
        )?,
        transition_duration_ms: read_u64(ini, "playback", "transition_duration_ms")?
            .unwrap_or(defaults.transition_duration_ms),
        play_order,
        preload_lead_ms: read_u64(ini, "playback", "preload_lead_ms")?
            .unwrap_or(defaults.preload_lead_ms),
        readiness_timeout_ms: positive_ms(
            ini,
            "playback",
            "readiness_timeout_ms",
            defaults.readiness_timeout_ms,
        )?,
        shuffle_seed: read_u64(ini, "playback", "shuffle_seed")?,
    };

    let wd = WatchdogConfig::default();
    let watchdog = WatchdogConfig {
        check_interval_ms: positive_ms(ini, "watchdog", "check_interval_ms", wd.check_interval_ms)?,
        warning_threshold_ms: positive_ms(
            ini,
            "watchdog",
            "warning_threshold_ms",
            wd.warning_threshold_ms,
        )?,
        recovery_threshold_ms: positive_ms(
            ini,
            "watchdog",
            "recovery_threshold_ms",
            wd.recovery_threshold_ms,
        )?,
        diagnostics_path: ini
            .get("watchdog", "diagnostics_path")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from),
    };
    if watchdog.recovery_threshold_ms < watchdog.warning_threshold_ms {
        return Err(ConfigError::InvalidValue {
            key: "recovery_threshold_ms".into(),
            value: watchdog.recovery_threshold_ms.to_string(),
        });
    }

    Ok(AppConfig { couchdb_url, board_id, manager_url, database, playback, watchdog })
}

fn read_u64(ini: &Ini, section: &str, key: &str) -> Result<Option<u64>, ConfigError> {
    match ini.get(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: raw }),
    }
}

fn positive_ms(ini: &Ini, section: &str, key: &str, default: u64) -> Result<u64, ConfigError> {
    match read_u64(ini, section, key)? {
        Some(0) => Err(ConfigError::InvalidValue { key: key.to_string(), value: "0".into() }),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}
