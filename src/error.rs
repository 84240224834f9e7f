//! Custom error types for the rig controller.
//!
//! This module defines the primary error type, `RigError`, shared by every layer
//! of the crate. It is built with `thiserror` so that lower layers can surface
//! typed failures and higher layers can decide what to do with them by class.
//!
//! ## Error Classes
//!
//! Each variant maps onto an [`ErrorClass`], ordered by severity:
//!
//! - **`CaptureFailure`**: a single capture went wrong. The scan continues.
//! - **`OutOfRange`**: a target was rejected before any hardware I/O.
//! - **`AlarmNotCleared`**: the controller stayed in alarm, or raised one during a move.
//!   Fatal to the move, not to the session.
//! - **`CommunicationTimeout`**: the controller never acknowledged, even after retries.
//! - **`ConnectionLost`**: the transport went away. The engine reconnects lazily.
//! - **`HardwareFatal`**: anything that makes continuing the session unsafe.
//!
//! The orchestrator uses [`RigError::is_session_fatal`] to choose between
//! recording a point-local failure and failing the whole session.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::Axis;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Crate-wide error type.
#[derive(Error, Debug, Clone)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Command '{command}' not acknowledged after {attempts} attempt(s)")]
    CommunicationTimeout { command: String, attempts: u32 },

    #[error("Connection to motion controller lost: {0}")]
    ConnectionLost(String),

    #[error("Command '{command}' rejected by controller (error:{code})")]
    CommandRejected { command: String, code: u16 },

    #[error("Axis {axis} target {value} outside limits [{min}, {max}]")]
    OutOfRange {
        axis: Axis,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Controller alarm could not be cleared: {0}")]
    AlarmNotCleared(String),

    #[error("Controller raised ALARM:{code} during motion")]
    MotionAlarm { code: u16 },

    #[error("Motion did not complete within {0:?}")]
    MotionTimeout(Duration),

    #[error("Motion wait cancelled by abort request")]
    MotionCancelled,

    #[error("Homing failed: {0}")]
    HomingFailed(String),

    #[error("Capture failed on camera '{camera_id}': {reason}")]
    CaptureFailure { camera_id: String, reason: String },

    #[error("Fatal hardware error: {0}")]
    HardwareFatal(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<std::io::Error> for RigError {
    fn from(err: std::io::Error) -> Self {
        RigError::Io(err.to_string())
    }
}

impl From<crate::config::ConfigError> for RigError {
    fn from(err: crate::config::ConfigError) -> Self {
        RigError::Config(err.to_string())
    }
}

/// Severity-ordered classification of failures.
///
/// A session records the most severe class it has seen, so the ordering of the
/// variants matters: later variants are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    CaptureFailure,
    OutOfRange,
    AlarmNotCleared,
    CommunicationTimeout,
    ConnectionLost,
    HardwareFatal,
}

impl RigError {
    /// Map this error onto its severity class.
    pub fn class(&self) -> ErrorClass {
        match self {
            RigError::CaptureFailure { .. } => ErrorClass::CaptureFailure,
            RigError::OutOfRange { .. } => ErrorClass::OutOfRange,
            RigError::AlarmNotCleared(_)
            | RigError::MotionAlarm { .. }
            | RigError::CommandRejected { .. } => ErrorClass::AlarmNotCleared,
            RigError::CommunicationTimeout { .. } | RigError::MotionTimeout(_) => {
                ErrorClass::CommunicationTimeout
            }
            RigError::ConnectionLost(_) | RigError::Io(_) => ErrorClass::ConnectionLost,
            RigError::Config(_)
            | RigError::InvalidArgument(_)
            | RigError::HomingFailed(_)
            | RigError::HardwareFatal(_)
            | RigError::MotionCancelled
            | RigError::InvalidTransition { .. }
            | RigError::FeatureNotEnabled(_) => ErrorClass::HardwareFatal,
        }
    }

    /// Whether the error ends the current scan session.
    ///
    /// Point-local errors (capture failures, rejected targets, alarms that the
    /// next move can recover from) return `false`.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            RigError::CaptureFailure { .. }
            | RigError::OutOfRange { .. }
            | RigError::AlarmNotCleared(_)
            | RigError::MotionAlarm { .. }
            | RigError::CommandRejected { .. } => false,
            _ => true,
        }
    }

    /// Whether the error means the link to the controller is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RigError::ConnectionLost(_) | RigError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::CommandRejected {
            command: "G1 X5".to_string(),
            code: 9,
        };
        assert_eq!(
            err.to_string(),
            "Command 'G1 X5' rejected by controller (error:9)"
        );
    }

    #[test]
    fn test_config_and_argument_errors_are_distinct() {
        let config: RigError =
            crate::config::ConfigError::ValidationError("protocol.max_retries".into()).into();
        assert!(matches!(config, RigError::Config(_)));
        assert!(config.to_string().starts_with("Configuration error:"));

        let argument = RigError::InvalidArgument("feedrate must be positive, got 0".into());
        assert_eq!(
            argument.to_string(),
            "Invalid argument: feedrate must be positive, got 0"
        );
        assert!(argument.is_session_fatal());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorClass::HardwareFatal > ErrorClass::ConnectionLost);
        assert!(ErrorClass::ConnectionLost > ErrorClass::CommunicationTimeout);
        assert!(ErrorClass::AlarmNotCleared > ErrorClass::OutOfRange);
        assert!(ErrorClass::OutOfRange > ErrorClass::CaptureFailure);
    }

    #[test]
    fn test_point_local_errors_are_not_session_fatal() {
        let capture = RigError::CaptureFailure {
            camera_id: "cam0".into(),
            reason: "blurry".into(),
        };
        assert!(!capture.is_session_fatal());
        assert_eq!(capture.class(), ErrorClass::CaptureFailure);

        let range = RigError::OutOfRange {
            axis: Axis::X,
            value: 500.0,
            min: 0.0,
            max: 300.0,
        };
        assert!(!range.is_session_fatal());

        assert!(RigError::ConnectionLost("eof".into()).is_session_fatal());
        assert!(RigError::HardwareFatal("stalled".into()).is_session_fatal());
    }
}
