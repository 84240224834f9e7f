//! Axis-level motion control.

pub mod controller;

pub use controller::MotionController;
