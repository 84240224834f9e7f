//! Mock camera and lighting subsystems.
//!
//! Record every call so tests can assert on what the orchestrator did, and
//! inject failures per camera. Captures take a configurable time using
//! `tokio::time::sleep`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::{RigError, RigResult};
use crate::scan::{CameraSubsystem, CaptureResult, FocusDirective, FocusMode, LightZone, LightingSubsystem};

// =============================================================================
// MockCameras
// =============================================================================

#[derive(Default)]
struct CameraLog {
    captures: Vec<(String, FocusDirective)>,
    focus_calls: Vec<(String, FocusMode)>,
    failing: HashSet<String>,
    reporting_failure: HashSet<String>,
    failing_focus: HashSet<String>,
    fatal: HashSet<String>,
}

/// A set of simulated cameras sharing one trigger.
///
/// ```rust,ignore
/// let cameras = MockCameras::new(["left", "centre", "right"]);
/// cameras.fail_captures("centre");
/// ```
pub struct MockCameras {
    ids: Vec<String>,
    capture_delay: Duration,
    log: Mutex<CameraLog>,
    started: watch::Sender<usize>,
}

impl MockCameras {
    /// Cameras with the given ids, all healthy.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (started, _) = watch::channel(0);
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            capture_delay: Duration::from_millis(5),
            log: Mutex::new(CameraLog::default()),
            started,
        }
    }

    /// Cameras named `cam0`, `cam1`, ...
    pub fn numbered(count: usize) -> Self {
        Self::new((0..count).map(|i| format!("cam{}", i)))
    }

    /// Make every capture take `delay`.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Wrap for sharing with an orchestrator.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Every capture on `camera_id` returns an error.
    pub fn fail_captures(&self, camera_id: &str) {
        self.log.lock().failing.insert(camera_id.to_string());
    }

    /// Every capture on `camera_id` completes with `success = false`.
    pub fn report_failures(&self, camera_id: &str) {
        self.log.lock().reporting_failure.insert(camera_id.to_string());
    }

    /// Every capture on `camera_id` returns `HardwareFatal`.
    pub fn fail_fatally(&self, camera_id: &str) {
        self.log.lock().fatal.insert(camera_id.to_string());
    }

    /// Every focus call on `camera_id` returns an error.
    pub fn fail_focus(&self, camera_id: &str) {
        self.log.lock().failing_focus.insert(camera_id.to_string());
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut log = self.log.lock();
        log.failing.clear();
        log.reporting_failure.clear();
        log.failing_focus.clear();
        log.fatal.clear();
    }

    /// Every capture request, in call order.
    pub fn captures(&self) -> Vec<(String, FocusDirective)> {
        self.log.lock().captures.clone()
    }

    /// Every focus request, in call order.
    pub fn focus_calls(&self) -> Vec<(String, FocusMode)> {
        self.log.lock().focus_calls.clone()
    }

    /// Number of capture requests so far.
    pub fn capture_count(&self) -> usize {
        self.log.lock().captures.len()
    }

    /// Counter of captures started, for tests that act mid-scan.
    pub fn subscribe_started(&self) -> watch::Receiver<usize> {
        self.started.subscribe()
    }
}

#[async_trait]
impl CameraSubsystem for MockCameras {
    fn camera_ids(&self) -> Vec<String> {
        self.ids.clone()
    }

    async fn capture(&self, camera_id: &str, focus: &FocusDirective) -> RigResult<CaptureResult> {
        self.started.send_modify(|n| *n += 1);
        sleep(self.capture_delay).await;

        let mut log = self.log.lock();
        log.captures.push((camera_id.to_string(), focus.clone()));
        let frame = log.captures.len();

        if log.fatal.contains(camera_id) {
            return Err(RigError::HardwareFatal(format!(
                "camera '{}' stopped responding",
                camera_id
            )));
        }
        if log.failing.contains(camera_id) {
            return Err(RigError::CaptureFailure {
                camera_id: camera_id.to_string(),
                reason: "sensor readout failed".to_string(),
            });
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("frame".to_string(), frame.to_string());
        if let FocusDirective::Manual(value) = focus {
            metadata.insert("focus".to_string(), format!("{:.3}", value));
        }

        Ok(CaptureResult {
            data_or_path: Some(format!("mock://{}/{:05}.raw", camera_id, frame)),
            success: !log.reporting_failure.contains(camera_id),
            metadata,
        })
    }

    async fn set_focus(&self, camera_id: &str, focus: FocusMode) -> RigResult<()> {
        let mut log = self.log.lock();
        log.focus_calls.push((camera_id.to_string(), focus));
        if log.failing_focus.contains(camera_id) {
            return Err(RigError::CaptureFailure {
                camera_id: camera_id.to_string(),
                reason: "focus motor stalled".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// MockLighting
// =============================================================================

/// One call made on [`MockLighting`].
#[derive(Debug, Clone, PartialEq)]
pub enum LightEvent {
    Set { zone: LightZone, intensity: f64 },
    AllOff,
}

/// Lighting that records calls and tracks whether anything is lit.
#[derive(Default)]
pub struct MockLighting {
    events: Mutex<Vec<LightEvent>>,
    refuse: Mutex<bool>,
}

impl MockLighting {
    /// Lighting that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (return false for) every intensity request.
    pub fn set_refuse(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    /// Every accepted request, in call order.
    pub fn events(&self) -> Vec<LightEvent> {
        self.events.lock().clone()
    }

    /// Number of requests that switched light on.
    pub fn on_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LightEvent::Set { intensity, .. } if *intensity > 0.0))
            .count()
    }

    /// Number of requests that switched everything off.
    pub fn off_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LightEvent::AllOff))
            .count()
    }

    /// Whether the last call left the lights on.
    pub fn is_lit(&self) -> bool {
        matches!(
            self.events.lock().last(),
            Some(LightEvent::Set { intensity, .. }) if *intensity > 0.0
        )
    }
}

#[async_trait]
impl LightingSubsystem for MockLighting {
    async fn set_intensity(&self, zone: &LightZone, intensity: f64) -> bool {
        if *self.refuse.lock() || !(0.0..=1.0).contains(&intensity) {
            return false;
        }
        self.events.lock().push(LightEvent::Set {
            zone: zone.clone(),
            intensity,
        });
        true
    }

    async fn all_off(&self) {
        self.events.lock().push(LightEvent::AllOff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_camera_failure_injection() {
        let cameras = MockCameras::new(["a", "b"]);
        cameras.fail_captures("b");

        let ok = cameras.capture("a", &FocusDirective::Manual(2.0)).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.metadata.get("focus").map(String::as_str), Some("2.000"));
        assert!(cameras.capture("b", &FocusDirective::AutoOnce).await.is_err());
        assert_eq!(cameras.capture_count(), 2);
    }

    #[tokio::test]
    async fn test_lighting_records_scope() {
        let lights = MockLighting::new();
        assert!(lights.set_intensity(&LightZone::All, 0.5).await);
        assert!(lights.is_lit());
        assert!(!lights.set_intensity(&LightZone::All, 1.5).await);
        lights.all_off().await;
        assert!(!lights.is_lit());
        assert_eq!((lights.on_count(), lights.off_count()), (1, 1));
    }
}
