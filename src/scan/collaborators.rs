//! Interfaces to the subsystems a scan drives besides motion.
//!
//! The orchestrator only depends on these traits; real camera and lighting
//! drivers live outside this crate. [`crate::hardware::mock`] has recording
//! implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::session::{FocusDirective, ScanPoint};
use crate::error::RigResult;

/// Focus request sent to one camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FocusMode {
    Value(f64),
    AutoOnce,
    Continuous,
}

/// What a camera returns for one capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Image data reference or file path
    pub data_or_path: Option<String>,
    /// Whether the camera produced an image
    pub success: bool,
    /// Camera-specific extras (exposure, lens position, ...)
    pub metadata: BTreeMap<String, String>,
}

/// The set of physical cameras on the rig.
#[async_trait]
pub trait CameraSubsystem: Send + Sync {
    fn camera_ids(&self) -> Vec<String>;

    async fn capture(&self, camera_id: &str, focus: &FocusDirective) -> RigResult<CaptureResult>;

    async fn set_focus(&self, camera_id: &str, focus: FocusMode) -> RigResult<()>;
}

/// Lighting zone selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightZone {
    All,
    Zone(String),
}

/// Rig illumination.
#[async_trait]
pub trait LightingSubsystem: Send + Sync {
    /// Set `zone` to `intensity` (0.0..=1.0). Returns false if the request was refused.
    async fn set_intensity(&self, zone: &LightZone, intensity: f64) -> bool;

    async fn all_off(&self);
}

/// Ordered, indexable source of scan points.
pub trait PatternSource: Send + Sync {
    fn len(&self) -> usize;

    fn point(&self, index: usize) -> Option<ScanPoint>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PatternSource for Vec<ScanPoint> {
    fn len(&self) -> usize {
        <[ScanPoint]>::len(self)
    }

    fn point(&self, index: usize) -> Option<ScanPoint> {
        self.get(index).cloned()
    }
}
