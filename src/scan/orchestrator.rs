//! Scan sequencing.
//!
//! The orchestrator walks a [`PatternSource`] point by point: move, settle,
//! focus, capture on every camera at once, record. Lighting is switched once
//! per phase (calibration, and each point's capture phase including its whole
//! focus stack), never per camera or per stack slot.
//!
//! ## States
//!
//! ```text
//! Idle ─▶ Planning ─▶ Calibrating ─▶ Running ⇄ Paused
//!            │             │            │         │
//!            └─────────────┴────────────┴─────────┴─▶ Completed | Aborted | Failed ─▶ Idle
//! ```
//!
//! Transitions not in [`OrchestratorState::can_transition_to`] are refused with
//! `InvalidTransition`. Pause and abort requests come in through a
//! [`ScanHandle`]; pause is honoured at the next point boundary.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::collaborators::{CameraSubsystem, FocusMode, LightZone, LightingSubsystem, PatternSource};
use super::session::{
    CaptureRecord, FocusDirective, PointResult, ScanPoint, ScanSession, SessionStatus,
};
use crate::config::{RigConfig, ScanConfig};
use crate::error::{RigError, RigResult};
use crate::motion::MotionController;
use crate::transform::CoordinateTransformer;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestratorState {
    Idle,
    Planning,
    Calibrating,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl OrchestratorState {
    /// The transition table.
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Calibrating)
                | (Planning, Aborted)
                | (Planning, Failed)
                | (Calibrating, Running)
                | (Calibrating, Aborted)
                | (Calibrating, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Aborted)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Aborted)
                | (Completed, Idle)
                | (Aborted, Idle)
                | (Failed, Idle)
        )
    }

    /// Completed, Aborted or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed | OrchestratorState::Aborted | OrchestratorState::Failed
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    Continue,
    Pause,
    Abort,
}

struct ScanShared {
    state: watch::Sender<OrchestratorState>,
    control: watch::Sender<ControlRequest>,
    session: RwLock<Option<ScanSession>>,
    motion: Arc<MotionController>,
}

/// Cloneable remote control for a running (or finished) scan.
#[derive(Clone)]
pub struct ScanHandle {
    shared: Arc<ScanShared>,
}

impl ScanHandle {
    /// Ask the scan to pause at the next point boundary.
    pub fn pause(&self) {
        self.shared.control.send_if_modified(|request| {
            if *request == ControlRequest::Continue {
                *request = ControlRequest::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Resume a paused scan at the point where it stopped.
    pub fn resume(&self) {
        self.shared.control.send_if_modified(|request| {
            if *request == ControlRequest::Pause {
                *request = ControlRequest::Continue;
                true
            } else {
                false
            }
        });
    }

    /// Abort the scan: stops any motion immediately.
    ///
    /// The scan switches the lights off and ends in `Aborted`.
    pub async fn abort(&self) -> RigResult<()> {
        self.shared.control.send_replace(ControlRequest::Abort);
        let state = self.state();
        info!(%state, "scan abort requested");
        if matches!(
            state,
            OrchestratorState::Calibrating | OrchestratorState::Running
        ) {
            self.shared.motion.stop().await?;
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.shared.state.subscribe()
    }

    /// Copy of the current (or last) session.
    pub fn session(&self) -> Option<ScanSession> {
        self.shared.session.read().clone()
    }

    /// Wait until the orchestrator reaches `target`.
    pub async fn wait_for(&self, target: OrchestratorState) -> RigResult<()> {
        let mut rx = self.subscribe_state();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RigError::HardwareFatal("orchestrator dropped".to_string()))
    }

    fn is_abort_requested(&self) -> bool {
        *self.shared.control.borrow() == ControlRequest::Abort
    }
}

enum Checkpoint {
    Proceed,
    Abort,
}

/// What happens to the cameras for one stack slot.
struct FocusStep {
    mode: Option<FocusMode>,
    directive: FocusDirective,
    value: Option<f64>,
}

/// Drives scans over motion, cameras and lighting.
pub struct ScanOrchestrator {
    motion: Arc<MotionController>,
    transformer: CoordinateTransformer,
    cameras: Arc<dyn CameraSubsystem>,
    lighting: Arc<dyn LightingSubsystem>,
    config: ScanConfig,
    feedrate: f64,
    handle: ScanHandle,
}

impl ScanOrchestrator {
    /// Orchestrator over the given collaborators; `feedrate` applies to every scan move.
    pub fn new(
        motion: Arc<MotionController>,
        transformer: CoordinateTransformer,
        cameras: Arc<dyn CameraSubsystem>,
        lighting: Arc<dyn LightingSubsystem>,
        config: ScanConfig,
        feedrate: f64,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        let (control, _) = watch::channel(ControlRequest::Continue);
        let handle = ScanHandle {
            shared: Arc::new(ScanShared {
                state,
                control,
                session: RwLock::new(None),
                motion: motion.clone(),
            }),
        };

        Self {
            motion,
            transformer,
            cameras,
            lighting,
            config,
            feedrate,
            handle,
        }
    }

    /// Orchestrator with scan settings and feedrate taken from `config`.
    pub fn from_config(
        motion: Arc<MotionController>,
        cameras: Arc<dyn CameraSubsystem>,
        lighting: Arc<dyn LightingSubsystem>,
        config: &RigConfig,
    ) -> Self {
        Self::new(
            motion,
            CoordinateTransformer::new(config.calibration),
            cameras,
            lighting,
            config.scan.clone(),
            config.scan_feedrate(),
        )
    }

    /// Control handle for pause, resume and abort from other tasks.
    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        self.handle.state()
    }

    fn transition(&self, next: OrchestratorState) -> RigResult<()> {
        let mut refused = None;
        self.handle.shared.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                info!(from = %state, to = %next, "scan state");
                *state = next;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        match refused {
            None => Ok(()),
            Some(from) => Err(RigError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            }),
        }
    }

    fn publish(&self, session: &ScanSession) {
        *self.handle.shared.session.write() = Some(session.clone());
    }

    /// Run every point of `pattern`.
    pub async fn run(&self, pattern: &dyn PatternSource) -> RigResult<ScanSession> {
        self.run_from(pattern, 0).await
    }

    /// Run `pattern` starting at point `start_index`.
    ///
    /// Returns the finished session whatever its outcome; `Err` only when the
    /// scan could not start.
    pub async fn run_from(
        &self,
        pattern: &dyn PatternSource,
        start_index: usize,
    ) -> RigResult<ScanSession> {
        if self.state().is_terminal() {
            self.transition(OrchestratorState::Idle)?;
        }
        self.transition(OrchestratorState::Planning)?;
        self.handle
            .shared
            .control
            .send_replace(ControlRequest::Continue);

        let mut points = Vec::with_capacity(pattern.len());
        for index in 0..pattern.len() {
            match pattern.point(index) {
                Some(point) => points.push(point),
                None => {
                    let err = RigError::InvalidArgument(format!(
                        "pattern has no point at index {} of {}",
                        index,
                        pattern.len()
                    ));
                    let session = ScanSession::new(points, 0);
                    return Ok(self.fail(session, err).await);
                }
            }
        }

        if start_index > points.len() {
            let err = RigError::InvalidArgument(format!(
                "start index {} beyond pattern of {} points",
                start_index,
                points.len()
            ));
            let session = ScanSession::new(points, 0);
            return Ok(self.fail(session, err).await);
        }

        let mut session = ScanSession::new(points, start_index);
        self.plan(&session);
        self.publish(&session);
        info!(
            points = session.points.len(),
            start = start_index,
            "scan planned"
        );

        if self.handle.is_abort_requested() {
            return Ok(self.finish_aborted(session).await);
        }

        self.transition(OrchestratorState::Calibrating)?;
        if let Err(e) = self.calibrate().await {
            if self.handle.is_abort_requested() || matches!(e, RigError::MotionCancelled) {
                return Ok(self.finish_aborted(session).await);
            }
            if e.is_session_fatal() {
                return Ok(self.fail(session, e).await);
            }
            warn!(error = %e, "calibration incomplete, continuing");
            session.note_error(e.class());
        }

        if self.handle.is_abort_requested() {
            return Ok(self.finish_aborted(session).await);
        }

        self.transition(OrchestratorState::Running)?;
        session.status = SessionStatus::Running;
        self.publish(&session);

        let mut control = self.handle.shared.control.subscribe();
        for index in start_index..session.points.len() {
            if let Checkpoint::Abort = self.checkpoint(&mut control, &mut session).await {
                return Ok(self.finish_aborted(session).await);
            }

            session.current_index = index;
            let point = session.points[index].clone();
            let (result, err) = self.run_point(index, &point).await;
            session.record(result);
            self.publish(&session);

            match err {
                None => {}
                Some(_) if self.handle.is_abort_requested() => {
                    return Ok(self.finish_aborted(session).await);
                }
                Some(RigError::MotionCancelled) => {
                    return Ok(self.finish_aborted(session).await);
                }
                Some(e) if e.is_session_fatal() => {
                    return Ok(self.fail(session, e).await);
                }
                Some(e) => {
                    warn!(point = index, error = %e, "point failed, continuing");
                }
            }
        }

        if self.handle.is_abort_requested() {
            return Ok(self.finish_aborted(session).await);
        }

        session.current_index = session.points.len();
        session.status = SessionStatus::Completed;
        session.finished_at = Some(chrono::Utc::now());
        self.transition(OrchestratorState::Completed)?;
        self.publish(&session);
        info!(
            captures = session.capture_count(),
            ok = session.successful_captures(),
            "scan completed"
        );
        Ok(session)
    }

    /// Warn about targets that will be rejected when their turn comes.
    fn plan(&self, session: &ScanSession) {
        let limits = self.motion.limits();
        for (index, point) in session.points.iter().enumerate() {
            let target = self.transformer.to_machine(&point.target);
            if let Err(e) = limits.check(&target) {
                warn!(point = index, error = %e, "planned point outside axis limits");
            }
        }
    }

    /// Honour pause and abort requests between points.
    async fn checkpoint(
        &self,
        control: &mut watch::Receiver<ControlRequest>,
        session: &mut ScanSession,
    ) -> Checkpoint {
        loop {
            let request = *control.borrow_and_update();
            match request {
                ControlRequest::Continue => {
                    if self.state() == OrchestratorState::Paused {
                        if self.transition(OrchestratorState::Running).is_err() {
                            return Checkpoint::Abort;
                        }
                        session.status = SessionStatus::Running;
                        self.publish(session);
                        info!(index = session.current_index, "scan resumed");
                    }
                    return Checkpoint::Proceed;
                }
                ControlRequest::Pause => {
                    if self.state() != OrchestratorState::Paused {
                        if self.transition(OrchestratorState::Paused).is_err() {
                            return Checkpoint::Abort;
                        }
                        session.status = SessionStatus::Paused;
                        self.publish(session);
                        info!(index = session.current_index, "scan paused");
                    }
                    if control.changed().await.is_err() {
                        return Checkpoint::Abort;
                    }
                }
                ControlRequest::Abort => return Checkpoint::Abort,
            }
        }
    }

    /// Optional homing, then one autofocus pass on every camera under a single
    /// illumination scope.
    async fn calibrate(&self) -> RigResult<()> {
        if self.config.home_on_start {
            self.motion.home_all().await?;
        }
        if !self.config.calibrate {
            return Ok(());
        }

        let ids = self.cameras.camera_ids();
        info!(cameras = ids.len(), "calibrating focus");

        if !self
            .lighting
            .set_intensity(&LightZone::All, self.config.calibration_intensity)
            .await
        {
            warn!("lighting refused calibration intensity");
        }

        let results = join_all(
            ids.iter()
                .map(|id| self.cameras.set_focus(id, FocusMode::AutoOnce)),
        )
        .await;
        tokio::time::sleep(self.config.lens_settle_delay).await;

        self.lighting.all_off().await;

        let mut first_failure = None;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(camera = %id, error = %e, "calibration autofocus failed");
                first_failure.get_or_insert(RigError::CaptureFailure {
                    camera_id: id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move, settle and capture one point.
    async fn run_point(&self, index: usize, point: &ScanPoint) -> (PointResult, Option<RigError>) {
        let target = self.transformer.to_machine(&point.target);
        let mut result = PointResult::new(index, target);
        debug!(point = index, %target, "moving to point");

        if let Err(e) = self.motion.move_absolute(target, self.feedrate).await {
            result.set_error(&e);
            return (result, Some(e));
        }
        tokio::time::sleep(self.config.settle_delay).await;

        let steps = self.focus_steps(&point.focus);
        if steps.is_empty() {
            warn!(point = index, "empty focus stack, nothing captured");
            return (result, None);
        }

        if !self
            .lighting
            .set_intensity(&LightZone::All, self.config.capture_intensity)
            .await
        {
            warn!(point = index, "lighting refused capture intensity");
        }

        let total = steps.len();
        let mut fatal = None;
        for (slot, step) in steps.iter().enumerate() {
            if self.handle.is_abort_requested() {
                break;
            }
            let (records, slot_fatal) = self.capture_slot(index, slot, total, step).await;
            result.captures.extend(records);
            if slot_fatal.is_some() {
                fatal = slot_fatal;
                break;
            }
        }

        self.lighting.all_off().await;

        if let Some(e) = fatal {
            result.set_error(&e);
            return (result, Some(e));
        }

        let failure = result.failed_captures().next().map(|record| RigError::CaptureFailure {
            camera_id: record.camera_id.clone(),
            reason: record
                .error
                .clone()
                .unwrap_or_else(|| "capture failed".to_string()),
        });
        match failure {
            Some(e) => {
                result.set_error(&e);
                (result, Some(e))
            }
            None => (result, None),
        }
    }

    fn focus_steps(&self, directive: &FocusDirective) -> Vec<FocusStep> {
        let resolved = match directive {
            FocusDirective::UseDefault => &self.config.default_focus,
            other => other,
        };

        match resolved {
            FocusDirective::Manual(value) => vec![FocusStep {
                mode: Some(FocusMode::Value(*value)),
                directive: resolved.clone(),
                value: Some(*value),
            }],
            FocusDirective::Stack(values) => values
                .iter()
                .map(|value| FocusStep {
                    mode: Some(FocusMode::Value(*value)),
                    directive: FocusDirective::Manual(*value),
                    value: Some(*value),
                })
                .collect(),
            FocusDirective::AutoOnce => vec![FocusStep {
                mode: Some(FocusMode::AutoOnce),
                directive: FocusDirective::AutoOnce,
                value: None,
            }],
            FocusDirective::Continuous => vec![FocusStep {
                mode: Some(FocusMode::Continuous),
                directive: FocusDirective::Continuous,
                value: None,
            }],
            FocusDirective::UseDefault => vec![FocusStep {
                mode: None,
                directive: FocusDirective::UseDefault,
                value: None,
            }],
        }
    }

    /// Focus every camera, wait for the lens, then capture on all of them at once.
    ///
    /// Also returns the first session-fatal error any camera raised.
    async fn capture_slot(
        &self,
        point_index: usize,
        slot: usize,
        total: usize,
        step: &FocusStep,
    ) -> (Vec<CaptureRecord>, Option<RigError>) {
        let ids = self.cameras.camera_ids();

        let focus_results: Vec<RigResult<()>> = match step.mode {
            Some(mode) => {
                let results = join_all(ids.iter().map(|id| self.cameras.set_focus(id, mode))).await;
                if !matches!(mode, FocusMode::Continuous) {
                    tokio::time::sleep(self.config.lens_settle_delay).await;
                }
                results
            }
            None => vec![Ok(()); ids.len()],
        };

        let capture_timeout = self.config.capture_timeout;
        let captures = ids.iter().zip(focus_results).map(|(id, focus)| async move {
            let mut record = CaptureRecord::new(point_index, id.as_str(), slot, total, step.value);
            let mut fatal = None;
            if let Err(e) = focus {
                record.error = Some(format!("focus failed: {}", e));
                return (record, fatal);
            }

            match tokio::time::timeout(capture_timeout, self.cameras.capture(id, &step.directive)).await {
                Ok(Ok(capture)) => {
                    record.success = capture.success;
                    record.data_or_path = capture.data_or_path;
                    record.metadata = capture.metadata;
                    if !capture.success {
                        record.error = Some("camera reported failure".to_string());
                    }
                }
                Ok(Err(e)) => {
                    record.error = Some(e.to_string());
                    if e.is_session_fatal() {
                        fatal = Some(e);
                    }
                }
                Err(_) => {
                    record.error = Some(format!("capture timed out after {:?}", capture_timeout))
                }
            }
            record.captured_at = chrono::Utc::now();
            (record, fatal)
        });

        let mut records = Vec::with_capacity(ids.len());
        let mut fatal = None;
        for (record, record_fatal) in join_all(captures).await {
            if !record.success {
                warn!(
                    point = point_index,
                    camera = %record.camera_id,
                    stack = slot,
                    error = ?record.error,
                    "capture failed"
                );
            }
            if fatal.is_none() {
                fatal = record_fatal;
            }
            records.push(record);
        }
        (records, fatal)
    }

    async fn finish_aborted(&self, mut session: ScanSession) -> ScanSession {
        self.lighting.all_off().await;
        session.status = SessionStatus::Aborted;
        session.finished_at = Some(chrono::Utc::now());
        if let Err(e) = self.transition(OrchestratorState::Aborted) {
            error!(error = %e, "could not enter Aborted");
        }
        self.publish(&session);
        info!(index = session.current_index, "scan aborted");
        session
    }

    async fn fail(&self, mut session: ScanSession, err: RigError) -> ScanSession {
        error!(error = %err, index = session.current_index, "scan failed");
        self.lighting.all_off().await;
        session.note_error(err.class());
        session.failure = Some(err.to_string());
        session.status = SessionStatus::Failed;
        session.finished_at = Some(chrono::Utc::now());
        if let Err(e) = self.transition(OrchestratorState::Failed) {
            error!(error = %e, "could not enter Failed");
        }
        self.publish(&session);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrchestratorState::*;

    #[test]
    fn test_transition_table() {
        assert!(Idle.can_transition_to(Planning));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Calibrating.can_transition_to(Paused));
    }

    #[test]
    fn test_terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Aborted.is_terminal());
        assert!(!Paused.is_terminal());
    }
}
