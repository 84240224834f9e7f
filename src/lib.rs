//! Control core for a motorized four-axis 3D scanning rig.
//!
//! The rig moves a camera carriage horizontally (X) and vertically (Y), spins a
//! turntable (Z) and tilts the cameras (C). A GRBL-family controller drives
//! the motors over a serial line.
//!
//! Layers, bottom up:
//!
//! - [`hardware`]: the link to the controller (serial port or in-process
//!   simulator) and mock camera/lighting subsystems
//! - [`protocol`]: [`protocol::ProtocolEngine`] correlates commands with
//!   replies on the shared link and owns the live machine state
//! - [`motion`]: [`motion::MotionController`] adds limits, homing, alarm
//!   recovery and tilt tracking
//! - [`transform`]: camera-relative, machine and Cartesian coordinates
//! - [`scan`]: [`scan::ScanOrchestrator`] runs a scan pattern point by point
//!
//! Configuration lives in [`config`], errors in [`error`].

pub mod config;
pub mod core;
pub mod error;
pub mod hardware;
pub mod motion;
pub mod protocol;
pub mod scan;
pub mod transform;

pub use crate::config::RigConfig;
pub use crate::core::{Axis, MachineState, Position4D};
pub use crate::error::{ErrorClass, RigError, RigResult};
