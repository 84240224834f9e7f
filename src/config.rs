//! Rig configuration using Figment.
//!
//! Configuration is layered from:
//! 1. Built-in defaults ([`RigConfig::default`])
//! 2. A TOML file (`config/scanrig.toml` unless another path is given)
//! 3. Environment variables prefixed with `SCANRIG_`
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! SCANRIG_SERIAL__PORT=/dev/ttyACM0
//! SCANRIG_PROTOCOL__MAX_RETRIES=5
//! SCANRIG_SCAN__SETTLE_DELAY=750ms
//! ```
//!
//! Durations are written in humantime form (`"250ms"`, `"2s"`, `"1m 30s"`).
//!
//! The configuration is loaded once at session start and treated as immutable
//! for the lifetime of that session; components receive cloned sections.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::core::{Axis, AxisLimits, AxisTable};
use crate::scan::FocusDirective;
use crate::transform::CalibrationOffsets;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scanrig.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCANRIG_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Protocol engine timing and retry policy
    pub protocol: ProtocolConfig,
    /// Per-axis limits, home positions and feedback flags
    pub axes: AxisTable<AxisConfig>,
    /// Motion controller behaviour
    pub motion: MotionConfig,
    /// Fixed calibration offsets for coordinate transforms
    pub calibration: CalibrationOffsets,
    /// Scan sequencing settings
    pub scan: ScanConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scanrig".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// How the engine learns about machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMode {
    /// Ask the controller to push reports (`$Report/Interval=<ms>`).
    Auto,
    /// Queue `?` real-time polls through the writer at a fixed interval.
    Poll,
}

/// Protocol engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Time to wait for `ok`/`error` after writing a command
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Number of times a whole command is re-sent after an ack timeout
    pub max_retries: u32,
    /// Pause after each acknowledged command before the next write
    #[serde(with = "humantime_serde")]
    pub inter_command_delay: Duration,
    /// Push or poll status reports
    pub status_mode: StatusMode,
    /// Report interval (auto) or poll period (poll)
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    /// Upper bound for one motion wait
    #[serde(with = "humantime_serde")]
    pub motion_timeout: Duration,
    /// Window after an ack in which an Idle report does not yet mean "done"
    #[serde(with = "humantime_serde")]
    pub motion_start_grace: Duration,
    /// Upper bound for a homing cycle (the controller acks `$H` when it finishes)
    #[serde(with = "humantime_serde")]
    pub homing_timeout: Duration,
    /// Time allowed for the controller to leave Alarm after `$X`
    #[serde(with = "humantime_serde")]
    pub unlock_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_retries: 3,
            inter_command_delay: Duration::from_millis(20),
            status_mode: StatusMode::Auto,
            status_interval: Duration::from_millis(50),
            motion_timeout: Duration::from_secs(60),
            motion_start_grace: Duration::from_millis(150),
            homing_timeout: Duration::from_secs(90),
            unlock_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-axis configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Minimum position (soft limit)
    pub min: f64,
    /// Maximum position (soft limit)
    pub max: f64,
    /// Expected position after homing
    #[serde(default)]
    pub home: f64,
    /// Whether the controller reports a real position for this axis
    #[serde(default = "default_has_feedback")]
    pub has_feedback: bool,
}

impl AxisConfig {
    /// Travel limits of this axis.
    pub fn limits(&self) -> AxisLimits {
        AxisLimits::new(self.min, self.max)
    }
}

impl Default for AxisTable<AxisConfig> {
    fn default() -> Self {
        AxisTable {
            x: AxisConfig {
                min: 0.0,
                max: 300.0,
                home: 0.0,
                has_feedback: true,
            },
            y: AxisConfig {
                min: 0.0,
                max: 250.0,
                home: 0.0,
                has_feedback: true,
            },
            z: AxisConfig {
                min: -3600.0,
                max: 3600.0,
                home: 0.0,
                has_feedback: true,
            },
            c: AxisConfig {
                min: -90.0,
                max: 90.0,
                home: 0.0,
                has_feedback: false,
            },
        }
    }
}

impl AxisTable<AxisConfig> {
    /// Soft limits for every axis.
    pub fn limits(&self) -> AxisTable<AxisLimits> {
        AxisTable {
            x: self.x.limits(),
            y: self.y.limits(),
            z: self.z.limits(),
            c: self.c.limits(),
        }
    }
}

/// Motion controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Feedrate used when a caller does not give one (units/min)
    pub default_feedrate: f64,
    /// Allowed deviation from the home position after homing
    pub home_tolerance: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_feedrate: 3000.0,
            home_tolerance: 0.05,
        }
    }
}

/// Scan sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Pause after motion completes, before any capture
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Pause after each focus change
    #[serde(with = "humantime_serde")]
    pub lens_settle_delay: Duration,
    /// Upper bound for one capture call
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// Light intensity during point captures (0.0..=1.0)
    pub capture_intensity: f64,
    /// Light intensity during calibration (0.0..=1.0)
    pub calibration_intensity: f64,
    /// Run one autofocus pass on every camera before the first point
    pub calibrate: bool,
    /// Home all axes during calibration
    pub home_on_start: bool,
    /// Directive used for points that say `UseDefault`
    pub default_focus: FocusDirective,
    /// Feedrate for scan moves; falls back to `motion.default_feedrate`
    pub feedrate: Option<f64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            lens_settle_delay: Duration::from_millis(100),
            capture_timeout: Duration::from_secs(10),
            capture_intensity: 0.8,
            calibration_intensity: 0.6,
            calibrate: true,
            home_on_start: false,
            default_focus: FocusDirective::AutoOnce,
            feedrate: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_baud_rate() -> u32 {
    115200
}

fn default_has_feedback() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RigConfig {
    /// Load from the default path, environment overrides applied.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path`; a missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment().merge(Toml::file(path.as_ref())))
    }

    /// Load from an in-memory TOML document (environment overrides still apply).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment().merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(RigConfig::default()))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be positive".to_string(),
            ));
        }

        self.validate_protocol()?;

        for axis in Axis::ALL {
            let cfg = self.axes.get(axis);
            if !(cfg.min.is_finite() && cfg.max.is_finite()) || cfg.min >= cfg.max {
                return Err(ConfigError::ValidationError(format!(
                    "Axis {}: min ({}) must be below max ({})",
                    axis, cfg.min, cfg.max
                )));
            }
            if !cfg.limits().contains(cfg.home) {
                return Err(ConfigError::ValidationError(format!(
                    "Axis {}: home position {} outside limits [{}, {}]",
                    axis, cfg.home, cfg.min, cfg.max
                )));
            }
        }

        if self.motion.default_feedrate <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "motion.default_feedrate must be positive, got {}",
                self.motion.default_feedrate
            )));
        }
        if self.motion.home_tolerance < 0.0 {
            return Err(ConfigError::ValidationError(
                "motion.home_tolerance cannot be negative".to_string(),
            ));
        }

        self.validate_scan()?;
        Ok(())
    }

    fn validate_protocol(&self) -> Result<(), ConfigError> {
        let protocol = &self.protocol;
        let positive = [
            ("ack_timeout", protocol.ack_timeout),
            ("status_interval", protocol.status_interval),
            ("motion_timeout", protocol.motion_timeout),
            ("homing_timeout", protocol.homing_timeout),
            ("unlock_timeout", protocol.unlock_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "protocol.{} must be greater than zero",
                    name
                )));
            }
        }

        // A shorter grace window could expire before the first report after an ack.
        if protocol.motion_start_grace <= protocol.status_interval {
            return Err(ConfigError::ValidationError(format!(
                "protocol.motion_start_grace ({:?}) must be longer than protocol.status_interval ({:?})",
                protocol.motion_start_grace, protocol.status_interval
            )));
        }
        Ok(())
    }

    fn validate_scan(&self) -> Result<(), ConfigError> {
        let scan = &self.scan;
        for (name, value) in [
            ("capture_intensity", scan.capture_intensity),
            ("calibration_intensity", scan.calibration_intensity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "scan.{} must be within 0.0..=1.0, got {}",
                    name, value
                )));
            }
        }

        if let Some(feedrate) = scan.feedrate {
            if feedrate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "scan.feedrate must be positive, got {}",
                    feedrate
                )));
            }
        }

        if let FocusDirective::Stack(values) = &scan.default_focus {
            if values.is_empty() {
                return Err(ConfigError::ValidationError(
                    "scan.default_focus stack cannot be empty".to_string(),
                ));
            }
        }

        if scan.capture_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "scan.capture_timeout must be greater than zero".to_string(),
            ));
        }

        if scan.settle_delay < self.protocol.inter_command_delay {
            warn!(
                settle_delay = ?scan.settle_delay,
                inter_command_delay = ?self.protocol.inter_command_delay,
                "settle delay is shorter than the inter-command delay"
            );
        }
        Ok(())
    }

    /// Feedrate used for scan moves.
    pub fn scan_feedrate(&self) -> f64 {
        self.scan.feedrate.unwrap_or(self.motion.default_feedrate)
    }
}
