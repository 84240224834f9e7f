//! Coordinate transforms between the three spaces the rig works in.
//!
//! - **Camera-relative** (cylindrical): radius from the turntable axis, camera
//!   height, turntable rotation and camera tilt.
//! - **Machine**: the controller's X/Y/Z/C axes. On this mechanism the linear X
//!   axis *is* the radial distance, so camera-relative ↔ machine is a pure
//!   offset, with no trigonometry involved.
//! - **Cartesian**: object-space x/y/z, only used for export and visualisation.
//!
//! Tilt sign convention: positive tilts the camera up, negative tilts it down,
//! zero is horizontal.

use serde::{Deserialize, Serialize};

use crate::core::Position4D;

/// A planar calibration offset (x = radial, y = vertical), in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset2D {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
}

impl Offset2D {
    /// Offset from its two components.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Fixed calibration offsets measured for a physical rig.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOffsets {
    /// Offset from the camera's optical centre to the machine origin
    pub camera_to_origin: Offset2D,
    /// Offset from the turntable centre to the machine origin
    pub turntable_to_origin: Offset2D,
}

impl CalibrationOffsets {
    fn radial(&self) -> f64 {
        self.camera_to_origin.x + self.turntable_to_origin.x
    }

    fn vertical(&self) -> f64 {
        self.camera_to_origin.y + self.turntable_to_origin.y
    }
}

/// Camera pose relative to the object on the turntable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraRelative {
    /// Distance from the turntable axis (mm)
    pub radius: f64,
    /// Camera height above the turntable plane (mm)
    pub height: f64,
    /// Turntable rotation (degrees)
    pub rotation: f64,
    /// Camera tilt (degrees, positive = up)
    pub tilt: f64,
}

impl CameraRelative {
    /// Pose from its four components.
    pub fn new(radius: f64, height: f64, rotation: f64, tilt: f64) -> Self {
        Self {
            radius,
            height,
            rotation,
            tilt,
        }
    }
}

/// Object-space Cartesian point (mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cartesian {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

/// Stateless converter parameterized by the rig's calibration offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateTransformer {
    offsets: CalibrationOffsets,
}

impl CoordinateTransformer {
    /// Transformer for one set of calibration offsets.
    pub fn new(offsets: CalibrationOffsets) -> Self {
        Self { offsets }
    }

    /// Calibration offsets in use.
    pub fn offsets(&self) -> &CalibrationOffsets {
        &self.offsets
    }

    /// Camera-relative pose to machine axes.
    pub fn to_machine(&self, pose: &CameraRelative) -> Position4D {
        Position4D::new(
            pose.radius + self.offsets.radial(),
            pose.height + self.offsets.vertical(),
            pose.rotation,
            pose.tilt,
        )
    }

    /// Machine axes back to a camera-relative pose.
    pub fn from_machine(&self, position: &Position4D) -> CameraRelative {
        CameraRelative::new(
            position.x - self.offsets.radial(),
            position.y - self.offsets.vertical(),
            position.z,
            position.c,
        )
    }

    /// Camera position in object space. Tilt does not affect the camera position.
    pub fn to_cartesian(&self, pose: &CameraRelative) -> Cartesian {
        let theta = pose.rotation.to_radians();
        Cartesian {
            x: pose.radius * theta.cos(),
            y: pose.radius * theta.sin(),
            z: pose.height,
        }
    }

    /// Object-space point to a camera-relative pose with the given tilt.
    ///
    /// The rotation comes back in (-180, 180].
    pub fn from_cartesian(&self, point: &Cartesian, tilt: f64) -> CameraRelative {
        CameraRelative::new(
            point.x.hypot(point.y),
            point.z,
            point.y.atan2(point.x).to_degrees(),
            tilt,
        )
    }

    /// Tilt (degrees) that points a camera at `radius`/`camera_height` towards
    /// the turntable axis at `focus_height`.
    ///
    /// Camera above the focus point tilts down (negative), below tilts up
    /// (positive), level is exactly zero.
    pub fn tilt_to_focus(radius: f64, camera_height: f64, focus_height: f64) -> f64 {
        (focus_height - camera_height).atan2(radius).to_degrees()
    }

    /// The same pose with its tilt replaced by the solved focus tilt.
    pub fn aimed_at(&self, pose: &CameraRelative, focus_height: f64) -> CameraRelative {
        CameraRelative {
            tilt: Self::tilt_to_focus(pose.radius, pose.height, focus_height),
            ..*pose
        }
    }

    /// Object-space point the camera looks at, where its optical axis crosses
    /// the turntable axis.
    pub fn focus_point(&self, pose: &CameraRelative) -> Cartesian {
        Cartesian {
            x: 0.0,
            y: 0.0,
            z: pose.height + pose.radius * pose.tilt.to_radians().tan(),
        }
    }
}

/// Wrap an angle into (-180, 180].
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}
