//! Core data types shared by every layer of the rig controller.
//!
//! - [`Axis`]: the four machine axes and their wire letters
//! - [`Position4D`]: a point in machine space (mm for X/Y, degrees for Z/C)
//! - [`MachineState`]: controller state derived from the status stream
//! - [`AxisLimits`] / [`AxisTable`]: per-axis soft limits and lookups

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::error::{RigError, RigResult};

// =============================================================================
// Axis
// =============================================================================

/// One of the four machine axes.
///
/// X and Y are linear (radial distance and camera height), Z is the continuous
/// turntable rotation and C is the camera tilt, which has no position sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    C,
}

impl Axis {
    /// All axes in wire order.
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::C];

    /// G-code word letter for this axis.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::C => 'C',
        }
    }

    /// Position of this axis in status report fields.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::C => 3,
        }
    }

    /// Parse a G-code word letter. `A` is accepted as an alias for the fourth axis.
    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'C' | 'A' => Some(Axis::C),
            _ => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// =============================================================================
// Position4D
// =============================================================================

/// A machine-space position: x/y in millimeters, z (rotation) and c (tilt) in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position4D {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
    /// C (tilt) component
    pub c: f64,
}

impl Position4D {
    /// Machine origin.
    pub const ZERO: Position4D = Position4D {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        c: 0.0,
    };

    /// Position from its four axis values.
    pub fn new(x: f64, y: f64, z: f64, c: f64) -> Self {
        Self { x, y, z, c }
    }

    /// Build from status-report field order (x, y, z, c).
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    /// Axis values in X, Y, Z, C order.
    pub fn to_array(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.c]
    }

    /// Value of one axis.
    pub fn get(&self, axis: Axis) -> f64 {
        self[axis]
    }

    /// Component-wise sum, used for relative moves.
    pub fn offset_by(&self, delta: &Position4D) -> Position4D {
        Position4D::new(
            self.x + delta.x,
            self.y + delta.y,
            self.z + delta.z,
            self.c + delta.c,
        )
    }

    /// Largest absolute per-axis difference to `other`.
    pub fn max_deviation(&self, other: &Position4D) -> f64 {
        Axis::ALL
            .iter()
            .map(|&axis| (self[axis] - other[axis]).abs())
            .fold(0.0, f64::max)
    }

    /// Per-axis comparison within `epsilon`.
    pub fn approx_eq(&self, other: &Position4D, epsilon: f64) -> bool {
        self.max_deviation(other) <= epsilon
    }
}

impl Index<Axis> for Position4D {
    type Output = f64;

    fn index(&self, axis: Axis) -> &f64 {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::C => &self.c,
        }
    }
}

impl IndexMut<Axis> for Position4D {
    fn index_mut(&mut self, axis: Axis) -> &mut f64 {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::C => &mut self.c,
        }
    }
}

impl fmt::Display for Position4D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(x={:.3}, y={:.3}, z={:.3}, c={:.3})",
            self.x, self.y, self.z, self.c
        )
    }
}

// =============================================================================
// MachineState
// =============================================================================

/// Controller state, derived solely from the status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Moving,
    Homing,
    Alarm,
    Hold,
}

impl MachineState {
    /// Whether the machine is still executing a motion or homing cycle.
    pub fn is_busy(self) -> bool {
        matches!(self, MachineState::Moving | MachineState::Homing | MachineState::Hold)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Idle => "Idle",
            MachineState::Moving => "Moving",
            MachineState::Homing => "Homing",
            MachineState::Alarm => "Alarm",
            MachineState::Hold => "Hold",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Inclusive soft limits for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Lowest allowed value
    pub min: f64,
    /// Highest allowed value
    pub max: f64,
}

impl AxisLimits {
    /// Inclusive range `[min, max]`.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Whether `value` is inside the range (NaN never is).
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    /// Reject `value` for `axis` if it lies outside the limits (NaN included).
    pub fn check(&self, axis: Axis, value: f64) -> RigResult<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(RigError::OutOfRange {
                axis,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// One value per axis, indexable by [`Axis`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisTable<T> {
    /// Entry for X
    pub x: T,
    /// Entry for Y
    pub y: T,
    /// Entry for Z
    pub z: T,
    /// Entry for C
    pub c: T,
}

impl<T> AxisTable<T> {
    /// Entry for one axis.
    pub fn get(&self, axis: Axis) -> &T {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::C => &self.c,
        }
    }

    /// Mutable entry for one axis.
    pub fn get_mut(&mut self, axis: Axis) -> &mut T {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::C => &mut self.c,
        }
    }

    /// Iterate `(axis, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, &T)> {
        Axis::ALL.into_iter().map(move |axis| (axis, self.get(axis)))
    }
}

impl AxisTable<AxisLimits> {
    /// Validate a whole position against the per-axis limits.
    ///
    /// Returns the first offending axis in wire order.
    pub fn check(&self, position: &Position4D) -> RigResult<()> {
        for (axis, limits) in self.iter() {
            limits.check(axis, position[axis])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AxisTable<AxisLimits> {
        AxisTable {
            x: AxisLimits::new(0.0, 300.0),
            y: AxisLimits::new(0.0, 200.0),
            z: AxisLimits::new(-720.0, 720.0),
            c: AxisLimits::new(-90.0, 90.0),
        }
    }

    #[test]
    fn test_axis_letters_round_trip() {
        for axis in Axis::ALL {
            assert_eq!(Axis::from_letter(axis.letter()), Some(axis));
        }
        assert_eq!(Axis::from_letter('a'), Some(Axis::C));
        assert_eq!(Axis::from_letter('Q'), None);
    }

    #[test]
    fn test_position_indexing() {
        let mut p = Position4D::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(p[Axis::Z], 3.0);
        p[Axis::C] = -10.0;
        assert_eq!(p.c, -10.0);
        assert_eq!(p.to_array(), [1.0, 2.0, 3.0, -10.0]);
    }

    #[test]
    fn test_limits_reject_first_offending_axis() {
        let table = limits();
        assert!(table.check(&Position4D::new(10.0, 10.0, 0.0, 0.0)).is_ok());

        let err = table
            .check(&Position4D::new(10.0, 250.0, 0.0, 120.0))
            .unwrap_err();
        match err {
            RigError::OutOfRange { axis, value, .. } => {
                assert_eq!(axis, Axis::Y);
                assert_eq!(value, 250.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_limits_reject_nan() {
        let limits = AxisLimits::new(-1.0, 1.0);
        assert!(limits.check(Axis::X, f64::NAN).is_err());
        assert!(limits.check(Axis::X, 1.0).is_ok());
    }

    #[test]
    fn test_max_deviation() {
        let a = Position4D::new(1.0, 2.0, 3.0, 4.0);
        let b = Position4D::new(1.0, 2.5, 2.0, 4.0);
        assert_eq!(a.max_deviation(&b), 1.0);
        assert!(a.approx_eq(&a, 1e-9));
    }
}
