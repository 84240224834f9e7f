//! Four-axis motion on top of the protocol engine.
//!
//! Adds axis semantics to the raw command stream: soft limits checked before
//! any I/O, combined moves, homing, alarm recovery, and position tracking for
//! axes whose encoder value never changes (the tilt axis on most rigs).

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AxisConfig, MotionConfig, RigConfig};
use crate::core::{Axis, AxisLimits, AxisTable, MachineState, Position4D};
use crate::error::{RigError, RigResult};
use crate::protocol::{grbl, ProtocolEngine};

/// Time allowed for the feed hold to bring the machine to rest before reset.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Motion controller for the X, Y, Z and C axes.
///
/// For axes configured with `has_feedback = false` the controller keeps the
/// last commanded value and reports it in place of the hardware value. The
/// tracked value is written when a move is issued, before the command leaves
/// the process, and rolled back only if the controller never accepted it.
pub struct MotionController {
    engine: Arc<ProtocolEngine>,
    axes: AxisTable<AxisConfig>,
    limits: AxisTable<AxisLimits>,
    motion: MotionConfig,
    overrides: RwLock<[Option<f64>; 4]>,
}

impl MotionController {
    /// Feedback-less axes start out tracked at their home value.
    pub fn new(engine: Arc<ProtocolEngine>, axes: AxisTable<AxisConfig>, motion: MotionConfig) -> Self {
        let mut overrides = [None; 4];
        for (axis, cfg) in axes.iter() {
            if !cfg.has_feedback {
                overrides[axis.index()] = Some(cfg.home);
            }
        }

        Self {
            engine,
            limits: axes.limits(),
            axes,
            motion,
            overrides: RwLock::new(overrides),
        }
    }

    /// Controller using the axis and motion sections of `config`.
    pub fn from_config(engine: Arc<ProtocolEngine>, config: &RigConfig) -> Self {
        Self::new(engine, config.axes, config.motion.clone())
    }

    /// Protocol engine this controller drives.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Travel limits checked before every move.
    pub fn limits(&self) -> &AxisTable<AxisLimits> {
        &self.limits
    }

    /// Feedrate used when the caller has none.
    pub fn default_feedrate(&self) -> f64 {
        self.motion.default_feedrate
    }

    // =========================================================================
    // Position and state
    // =========================================================================

    /// Current position: hardware values with tracked overrides on top.
    pub fn get_position(&self) -> Position4D {
        let hardware = self.engine.snapshot().position;
        self.merge(hardware)
    }

    fn merge(&self, hardware: Position4D) -> Position4D {
        let overrides = self.overrides.read();
        let mut merged = hardware;
        for axis in Axis::ALL {
            if let Some(value) = overrides[axis.index()] {
                merged[axis] = value;
            }
        }
        merged
    }

    /// Tracked value for an axis without feedback, if it has one.
    pub fn tracked(&self, axis: Axis) -> Option<f64> {
        self.overrides.read()[axis.index()]
    }

    /// Machine state from the latest status report.
    pub fn state(&self) -> MachineState {
        self.engine.state()
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// Move all four axes to `target` in one combined command.
    ///
    /// Returns only after the controller reports the motion finished.
    pub async fn move_absolute(&self, target: Position4D, feedrate: f64) -> RigResult<()> {
        self.limits.check(&target)?;
        if !(feedrate.is_finite() && feedrate > 0.0) {
            return Err(RigError::InvalidArgument(format!(
                "feedrate must be positive, got {}",
                feedrate
            )));
        }

        self.ensure_unlocked().await?;

        let command = grbl::motion_command(&target, feedrate);
        let previous = self.track_issued(&target);
        debug!(%target, feedrate, "issuing move");

        let protocol = self.engine.config();
        let ticket = match self
            .engine
            .send_motion(command, protocol.ack_timeout, protocol.max_retries)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                debug!(error = %e, "move not accepted, restoring tracked axes");
                *self.overrides.write() = previous;
                return Err(e);
            }
        };

        self.engine.wait_motion(ticket, protocol.motion_timeout).await?;
        debug!(%target, "move complete");
        Ok(())
    }

    /// Move by `delta` from the current position.
    ///
    /// The delta is resolved to an absolute target here, so the wire command
    /// is always absolute.
    pub async fn move_relative(&self, delta: Position4D, feedrate: f64) -> RigResult<()> {
        let target = self.get_position().offset_by(&delta);
        self.move_absolute(target, feedrate).await
    }

    /// Record the commanded values for feedback-less axes; returns the old values.
    fn track_issued(&self, target: &Position4D) -> [Option<f64>; 4] {
        let mut overrides = self.overrides.write();
        let previous = *overrides;
        for axis in Axis::ALL {
            if overrides[axis.index()].is_some() {
                overrides[axis.index()] = Some(target[axis]);
            }
        }
        previous
    }

    async fn ensure_unlocked(&self) -> RigResult<()> {
        if !self.engine.is_alarm() {
            return Ok(());
        }
        let code = self.engine.snapshot().alarm_code;
        info!(alarm = ?code, "controller in alarm, unlocking before move");
        self.engine.clear_alarm().await
    }

    // =========================================================================
    // Homing, alarms, stop
    // =========================================================================

    /// Run the controller's homing cycle and verify the result.
    ///
    /// Axes with feedback must end within `home_tolerance` of their configured
    /// home; tracked axes are reset to their home value.
    pub async fn home_all(&self) -> RigResult<()> {
        let protocol = self.engine.config();
        info!("homing all axes");

        // The controller acknowledges `$H` only once homing has finished.
        let result = async {
            let ticket = self
                .engine
                .send_motion(grbl::HOME, protocol.homing_timeout, 0)
                .await?;
            self.engine.wait_motion(ticket, protocol.homing_timeout).await
        }
        .await;

        match result {
            Ok(()) => {}
            Err(RigError::MotionAlarm { code }) => {
                return Err(RigError::HomingFailed(format!("ALARM:{} during homing", code)));
            }
            Err(RigError::CommandRejected { code, .. }) => {
                return Err(RigError::HomingFailed(format!("homing rejected (error:{})", code)));
            }
            Err(e) => return Err(e),
        }

        let snapshot = self.engine.snapshot();
        if snapshot.state != MachineState::Idle {
            return Err(RigError::HomingFailed(format!(
                "controller in {} after homing",
                snapshot.state
            )));
        }

        for (axis, cfg) in self.axes.iter() {
            if !cfg.has_feedback {
                continue;
            }
            let actual = snapshot.position[axis];
            if (actual - cfg.home).abs() > self.motion.home_tolerance {
                warn!(%axis, actual, expected = cfg.home, "axis off home after homing");
                return Err(RigError::HomingFailed(format!(
                    "axis {} at {:.3}, expected {:.3}",
                    axis, actual, cfg.home
                )));
            }
        }

        {
            let mut overrides = self.overrides.write();
            for (axis, cfg) in self.axes.iter() {
                if !cfg.has_feedback {
                    overrides[axis.index()] = Some(cfg.home);
                }
            }
        }

        info!(position = %self.get_position(), "homing complete");
        Ok(())
    }

    /// Unlock the controller after an alarm.
    pub async fn clear_alarm(&self) -> RigResult<()> {
        self.engine.clear_alarm().await
    }

    /// Stop immediately: cancel motion waits, hold the feed, then soft reset.
    pub async fn stop(&self) -> RigResult<()> {
        self.engine.abort_motion().await?;
        if let Err(e) = self
            .engine
            .wait_for_state(|s| s.state != MachineState::Moving, STOP_SETTLE_TIMEOUT)
            .await
        {
            debug!(error = %e, "machine still moving after feed hold");
        }
        self.engine.soft_reset().await?;
        warn!("motion stopped by soft reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::hardware::sim::{SimConfig, SimulatedController};

    fn fast_protocol() -> ProtocolConfig {
        ProtocolConfig {
            ack_timeout: Duration::from_millis(200),
            inter_command_delay: Duration::ZERO,
            status_interval: Duration::from_millis(10),
            motion_start_grace: Duration::from_millis(30),
            motion_timeout: Duration::from_secs(5),
            ..ProtocolConfig::default()
        }
    }

    fn controller(sim: &SimulatedController) -> MotionController {
        let engine = Arc::new(ProtocolEngine::new(Arc::new(sim.clone()), fast_protocol()));
        MotionController::new(engine, AxisTable::default(), MotionConfig::default())
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_before_io() {
        let sim = SimulatedController::new(SimConfig::default());
        let motion = controller(&sim);

        let err = motion
            .move_absolute(Position4D::new(10.0, 10.0, 0.0, 120.0), 1000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::OutOfRange { axis: Axis::C, .. }));
        assert!(sim.received_lines().is_empty());
        assert_eq!(motion.tracked(Axis::C), Some(0.0));
    }

    #[tokio::test]
    async fn test_tilt_is_tracked_while_hardware_reports_zero() {
        let sim = SimulatedController::new(SimConfig::default());
        let motion = controller(&sim);

        let target = Position4D::new(12.0, 8.0, 45.0, -30.0);
        motion.move_absolute(target, 6000.0).await.unwrap();

        assert_eq!(motion.engine().snapshot().position.c, 0.0);
        assert!(motion.get_position().approx_eq(&target, 1e-3));
    }

    #[tokio::test]
    async fn test_rejected_move_rolls_back_tracked_tilt() {
        let sim = SimulatedController::new(SimConfig::default());
        let motion = controller(&sim);

        sim.reject_next_lines(1, 9);
        let err = motion
            .move_absolute(Position4D::new(1.0, 1.0, 0.0, 15.0), 1000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::CommandRejected { code: 9, .. }));
        assert_eq!(motion.tracked(Axis::C), Some(0.0));
    }
}
