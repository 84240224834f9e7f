//! Scan points, focus directives and the record of one scan session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::Position4D;
use crate::error::{ErrorClass, RigError};
use crate::transform::CameraRelative;

/// How the cameras focus before capturing at a point.
///
/// In TOML: `{ mode = "manual", value = 12.5 }`, `{ mode = "stack", value = [10.0, 12.0] }`,
/// `{ mode = "auto_once" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum FocusDirective {
    /// Fixed focus value
    Manual(f64),
    /// One capture per value, in order, at the same position
    Stack(Vec<f64>),
    /// Single autofocus pass, then capture
    AutoOnce,
    /// Camera keeps refocusing on its own
    Continuous,
    /// Whatever the scan configuration says
    UseDefault,
}

impl FocusDirective {
    /// Number of captures per camera this directive produces at one point.
    pub fn capture_count(&self) -> usize {
        match self {
            FocusDirective::Stack(values) => values.len(),
            _ => 1,
        }
    }
}

/// One target of a scan pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Where the camera should be
    pub target: CameraRelative,
    /// How to focus there
    pub focus: FocusDirective,
}

impl ScanPoint {
    /// Point at `target`, focused per `focus`.
    pub fn new(target: CameraRelative, focus: FocusDirective) -> Self {
        Self { target, focus }
    }
}

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Planned,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    /// Whether the session has ended.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted | SessionStatus::Failed
        )
    }
}

/// One camera capture at one point (and one stack slot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Index of the point this capture belongs to
    pub point_index: usize,
    /// Camera that took it
    pub camera_id: String,
    /// Position in the focus stack, zero based
    pub stack_index: usize,
    /// Size of the focus stack (1 without a stack)
    pub stack_total: usize,
    /// Manual or stack focus value, if one was set
    pub focus_value: Option<f64>,
    /// Whether the camera produced an image
    pub success: bool,
    /// Image data reference or file path
    pub data_or_path: Option<String>,
    /// Camera-specific extras
    pub metadata: BTreeMap<String, String>,
    /// Failure description
    pub error: Option<String>,
    /// When the capture finished
    pub captured_at: DateTime<Utc>,
}

impl CaptureRecord {
    /// Record for one camera at one stack slot.
    pub fn new(
        point_index: usize,
        camera_id: impl Into<String>,
        stack_index: usize,
        stack_total: usize,
        focus_value: Option<f64>,
    ) -> Self {
        Self {
            point_index,
            camera_id: camera_id.into(),
            stack_index,
            stack_total,
            focus_value,
            success: false,
            data_or_path: None,
            metadata: BTreeMap::new(),
            error: None,
            captured_at: Utc::now(),
        }
    }
}

/// Outcome of one scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResult {
    /// Index into the pattern
    pub index: usize,
    /// Machine position the point mapped to
    pub machine_target: Position4D,
    /// Every capture taken at this point
    pub captures: Vec<CaptureRecord>,
    /// Failure description
    pub error: Option<String>,
    /// Class of the point-level failure
    pub error_class: Option<ErrorClass>,
}

impl PointResult {
    /// Empty result for point `index`.
    pub fn new(index: usize, machine_target: Position4D) -> Self {
        Self {
            index,
            machine_target,
            captures: Vec::new(),
            error: None,
            error_class: None,
        }
    }

    /// Record a point-level failure.
    pub fn set_error(&mut self, err: &RigError) {
        self.error = Some(err.to_string());
        self.error_class = Some(err.class());
    }

    /// Captures that did not succeed.
    pub fn failed_captures(&self) -> impl Iterator<Item = &CaptureRecord> {
        self.captures.iter().filter(|c| !c.success)
    }
}

/// Everything known about one scan, kept after it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    /// The planned points, in scan order
    pub points: Vec<ScanPoint>,
    /// Next point to run; equals `points.len()` once every point ran
    pub current_index: usize,
    /// Lifecycle status
    pub status: SessionStatus,
    /// One entry per visited point
    pub results: Vec<PointResult>,
    /// Most severe error class seen so far
    pub worst_error: Option<ErrorClass>,
    /// Error that ended the session, if any
    pub failure: Option<String>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// When the session ended, if it has
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    /// Planned session starting at `start_index`.
    pub fn new(points: Vec<ScanPoint>, start_index: usize) -> Self {
        Self {
            points,
            current_index: start_index,
            status: SessionStatus::Planned,
            results: Vec::new(),
            worst_error: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Raise `worst_error` to `class` if it is more severe.
    pub fn note_error(&mut self, class: ErrorClass) {
        self.worst_error = Some(match self.worst_error {
            Some(worst) => worst.max(class),
            None => class,
        });
    }

    /// Append a point result and advance the index.
    pub fn record(&mut self, result: PointResult) {
        if let Some(class) = result.error_class {
            self.note_error(class);
        }
        self.results.push(result);
    }

    /// Captures attempted so far.
    pub fn capture_count(&self) -> usize {
        self.results.iter().map(|r| r.captures.len()).sum()
    }

    /// Captures that succeeded.
    pub fn successful_captures(&self) -> usize {
        self.results
            .iter()
            .flat_map(|r| r.captures.iter())
            .filter(|c| c.success)
            .count()
    }

    /// Pretty-printed JSON of the whole session.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_count() {
        assert_eq!(FocusDirective::Manual(3.0).capture_count(), 1);
        assert_eq!(FocusDirective::UseDefault.capture_count(), 1);
        assert_eq!(FocusDirective::Stack(vec![1.0, 2.0, 3.0]).capture_count(), 3);
    }

    #[test]
    fn test_focus_directive_json_shape() {
        let json = serde_json::to_string(&FocusDirective::Stack(vec![1.0, 2.5])).unwrap();
        assert_eq!(json, r#"{"mode":"stack","value":[1.0,2.5]}"#);
        let auto: FocusDirective = serde_json::from_str(r#"{"mode":"auto_once"}"#).unwrap();
        assert_eq!(auto, FocusDirective::AutoOnce);
    }

    #[test]
    fn test_worst_error_only_rises() {
        let mut session = ScanSession::new(Vec::new(), 0);
        session.note_error(ErrorClass::OutOfRange);
        session.note_error(ErrorClass::CaptureFailure);
        assert_eq!(session.worst_error, Some(ErrorClass::OutOfRange));
        session.note_error(ErrorClass::ConnectionLost);
        assert_eq!(session.worst_error, Some(ErrorClass::ConnectionLost));
    }
}
