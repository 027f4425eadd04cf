//! Configuration loading using Figment.
//!
//! Configuration is assembled from, in increasing priority:
//! 1. Built-in defaults (`DslmConfig::default()`)
//! 2. A TOML file (by default `config/dslm.toml`)
//! 3. Environment variables prefixed with `DSLM_`, nested keys separated by `__`
//!
//! The resulting [`DslmConfig`] is built once at startup and passed by reference to
//! every component; nothing in the crate reads configuration lazily.
//!
//! # Example
//! ```no_run
//! use dslm_daq::config::DslmConfig;
//!
//! let config = DslmConfig::load()?;
//! config.validate()?;
//! println!("Sample rate: {} Hz", config.scanning.sample_rate);
//! # Ok::<(), dslm_daq::error::DslmError>(())
//! ```
//!
//! Override from the environment: `DSLM_SCANNING__SAMPLE_RATE=20000`.

use crate::error::{AppResult, DslmError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dslm.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DslmConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scan board and waveform timing
    pub scanning: ScanningConfig,
    /// Camera defaults
    pub camera: CameraConfig,
    /// Queue sizes and polling behaviour
    pub queues: QueueConfig,
    /// Saving defaults
    pub saving: SavingConfig,
    /// Default paths
    pub paths: PathsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Write per-worker concurrence logs to `paths.log`
    #[serde(default)]
    pub concurrence_log: bool,
}

/// Analog channel declaration on a scan board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRange {
    /// Physical channel name (e.g. `Dev1/ao0:3`)
    pub channel: String,
    /// Minimum voltage
    pub min_val: f64,
    /// Maximum voltage
    pub max_val: f64,
}

/// Scan board channel layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    /// Piezo position read-back
    pub z_read: ChannelRange,
    /// Piezo and z galvos plus camera trigger
    pub z_write: ChannelRange,
    /// Lateral and frontal xy galvos
    pub xy_write: ChannelRange,
    /// Terminal used to share the start trigger between tasks
    pub sync_trigger: String,
}

/// Scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanningConfig {
    /// Board backend (`mock` is the only backend built into this crate)
    pub backend: String,
    /// Analog sample rate in Hz
    pub sample_rate: f64,
    /// Samples written and read per control tick
    pub n_samples: usize,
    /// Piezo volts per micrometer
    pub piezo_scale: f64,
    /// Channel layout
    pub board: BoardConfig,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Camera backend (`mock` is the only backend built into this crate)
    pub backend: String,
    /// Full sensor resolution `[height, width]`
    pub sensor_resolution: [usize; 2],
    /// Binning applied at startup
    pub default_binning: usize,
    /// Exposure at startup, milliseconds
    pub default_exposure_ms: f64,
    /// Frames between two frame rate estimates
    pub n_fps_frames: usize,
}

/// Queue sizing and polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Raw frames buffered between camera and dispatcher
    pub camera_capacity: usize,
    /// Volumes held for display before new ones are dropped
    pub viewer_capacity: usize,
    /// Volumes buffered between dispatcher and saver
    pub saver_capacity: usize,
    /// Timeout of every non-blocking poll
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// How long shutdown waits for each worker
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

/// Saving configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavingConfig {
    /// RAM budget of one in-memory chunk, megabytes
    pub array_ram_mb: f64,
    /// Voxel size (z, y, x) in micrometers at binning 1
    pub voxel_size: [f64; 3],
}

/// Default paths
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Default output directory for datasets
    pub data: PathBuf,
    /// Directory for concurrence logs
    pub log: PathBuf,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "DSLM".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
            concurrence_log: false,
        }
    }
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            sample_rate: 40_000.0,
            n_samples: 10_000,
            piezo_scale: 1.0 / 40.0,
            board: BoardConfig {
                z_read: ChannelRange {
                    channel: "Dev1/ai0:0".to_string(),
                    min_val: 0.0,
                    max_val: 10.0,
                },
                z_write: ChannelRange {
                    channel: "Dev1/ao0:3".to_string(),
                    min_val: -5.0,
                    max_val: 10.0,
                },
                xy_write: ChannelRange {
                    channel: "Dev2/ao0:1".to_string(),
                    min_val: -5.0,
                    max_val: 10.0,
                },
                sync_trigger: "/Dev1/ao/StartTrigger".to_string(),
            },
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            sensor_resolution: [2048, 2048],
            default_binning: 2,
            default_exposure_ms: 60.0,
            n_fps_frames: 20,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            camera_capacity: 1200,
            viewer_capacity: 3,
            saver_capacity: 2000,
            poll_timeout: Duration::from_millis(1),
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SavingConfig {
    fn default() -> Self {
        Self {
            array_ram_mb: 450.0,
            voxel_size: [1.0, 1.0, 1.0],
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            data: home.clone(),
            log: home.join("logs"),
        }
    }
}

impl Default for DslmConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            scanning: ScanningConfig::default(),
            camera: CameraConfig::default(),
            queues: QueueConfig::default(),
            saving: SavingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl DslmConfig {
    /// Load configuration from `config/dslm.toml` and environment variables.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(DslmConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DSLM_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DslmError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DslmError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if !(self.scanning.sample_rate > 0.0) {
            return Err(DslmError::Configuration(format!(
                "sample_rate must be positive, got {}",
                self.scanning.sample_rate
            )));
        }

        if self.scanning.n_samples == 0 {
            return Err(DslmError::Configuration(
                "n_samples must be at least 1".to_string(),
            ));
        }

        let board = &self.scanning.board;
        for range in [&board.z_read, &board.z_write, &board.xy_write] {
            if range.min_val >= range.max_val {
                return Err(DslmError::Configuration(format!(
                    "Channel '{}' has an empty voltage range [{}, {}]",
                    range.channel, range.min_val, range.max_val
                )));
            }
        }

        if self.camera.default_binning == 0 || self.camera.n_fps_frames == 0 {
            return Err(DslmError::Configuration(
                "camera binning and n_fps_frames must be at least 1".to_string(),
            ));
        }

        if self.queues.camera_capacity == 0
            || self.queues.viewer_capacity == 0
            || self.queues.saver_capacity == 0
        {
            return Err(DslmError::Configuration(
                "queue capacities must be at least 1".to_string(),
            ));
        }

        if !(self.saving.array_ram_mb > 0.0) {
            return Err(DslmError::Configuration(format!(
                "array_ram_mb must be positive, got {}",
                self.saving.array_ram_mb
            )));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DslmError::Configuration(e.to_string()))
    }
}
