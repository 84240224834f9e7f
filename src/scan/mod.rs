//! Scan sessions: patterns, collaborators and the orchestrator.

pub mod collaborators;
pub mod orchestrator;
pub mod pattern;
pub mod session;

pub use collaborators::{
    CameraSubsystem, CaptureResult, FocusMode, LightZone, LightingSubsystem, PatternSource,
};
pub use orchestrator::{OrchestratorState, ScanHandle, ScanOrchestrator};
pub use pattern::CylindricalPattern;
pub use session::{
    CaptureRecord, FocusDirective, PointResult, ScanPoint, ScanSession, SessionStatus,
};
