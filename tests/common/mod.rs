//! Common test utilities for scanrig integration tests
//!
//! Builds a complete rig (simulated controller, protocol engine, motion
//! controller) with timings short enough for tests, plus helpers for scan
//! orchestration against the mock collaborators.

#![allow(dead_code)] // Not every test file uses every helper

use std::sync::Arc;
use std::time::Duration;

use scanrig::config::{MotionConfig, ProtocolConfig, ScanConfig, StatusMode};
use scanrig::core::AxisTable;
use scanrig::hardware::mock::{MockCameras, MockLighting};
use scanrig::hardware::sim::{SimConfig, SimulatedController};
use scanrig::motion::MotionController;
use scanrig::protocol::ProtocolEngine;
use scanrig::scan::{FocusDirective, ScanOrchestrator, ScanPoint};
use scanrig::transform::{CameraRelative, CoordinateTransformer};

/// Position comparison tolerance; the wire format carries three decimals.
pub const EPSILON: f64 = 1e-3;

/// Everything below the orchestrator, wired to one simulator.
pub struct Rig {
    pub sim: SimulatedController,
    pub engine: Arc<ProtocolEngine>,
    pub motion: Arc<MotionController>,
}

/// Protocol timings scaled down for tests.
pub fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        ack_timeout: Duration::from_millis(150),
        max_retries: 3,
        inter_command_delay: Duration::ZERO,
        status_mode: StatusMode::Auto,
        status_interval: Duration::from_millis(10),
        motion_timeout: Duration::from_secs(5),
        motion_start_grace: Duration::from_millis(40),
        homing_timeout: Duration::from_secs(3),
        unlock_timeout: Duration::from_millis(300),
    }
}

pub fn rig() -> Rig {
    rig_with(fast_protocol(), SimConfig::default())
}

pub fn rig_with(protocol: ProtocolConfig, sim_config: SimConfig) -> Rig {
    let sim = SimulatedController::new(sim_config);
    let engine = Arc::new(ProtocolEngine::new(Arc::new(sim.clone()), protocol));
    let motion = Arc::new(MotionController::new(
        engine.clone(),
        AxisTable::default(),
        MotionConfig::default(),
    ));
    Rig { sim, engine, motion }
}

/// Scan timings scaled down for tests.
pub fn fast_scan() -> ScanConfig {
    ScanConfig {
        settle_delay: Duration::from_millis(5),
        lens_settle_delay: Duration::from_millis(2),
        capture_timeout: Duration::from_secs(2),
        ..ScanConfig::default()
    }
}

pub fn orchestrator(
    rig: &Rig,
    cameras: &Arc<MockCameras>,
    lights: &Arc<MockLighting>,
    scan: ScanConfig,
) -> ScanOrchestrator {
    ScanOrchestrator::new(
        rig.motion.clone(),
        CoordinateTransformer::default(),
        cameras.clone(),
        lights.clone(),
        scan,
        6000.0,
    )
}

/// `count` points on one ring at radius 100, height 50.
pub fn ring(count: usize, focus: FocusDirective) -> Vec<ScanPoint> {
    (0..count)
        .map(|i| {
            ScanPoint::new(
                CameraRelative::new(100.0, 50.0, i as f64 * 30.0, -10.0),
                focus.clone(),
            )
        })
        .collect()
}

/// Wait (bounded) until `condition` holds, polling every few milliseconds.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
