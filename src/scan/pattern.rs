//! Cylindrical scan patterns.

use serde::{Deserialize, Serialize};

use super::collaborators::PatternSource;
use super::session::{FocusDirective, ScanPoint};
use crate::transform::{CameraRelative, CoordinateTransformer};

/// Rings of evenly spaced rotations at a fixed camera radius.
///
/// Points are ordered ring by ring (lowest first), rotation ascending within a
/// ring. With `focus_height` set, every point's tilt aims the camera at that
/// height on the turntable axis; otherwise the tilt is `fixed_tilt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CylindricalPattern {
    /// Camera distance from the turntable axis
    pub radius: f64,
    /// Ring heights, scanned in order
    pub heights: Vec<f64>,
    /// Turntable stops per ring, evenly spaced
    pub rotations_per_ring: usize,
    /// Rotation of the first stop on every ring
    #[serde(default)]
    pub start_rotation: f64,
    /// Height every point aims at, if any
    #[serde(default)]
    pub focus_height: Option<f64>,
    /// Tilt used when no focus height is set
    #[serde(default)]
    pub fixed_tilt: f64,
    /// Focus directive for every point
    #[serde(default = "default_focus")]
    pub focus: FocusDirective,
}

fn default_focus() -> FocusDirective {
    FocusDirective::UseDefault
}

impl CylindricalPattern {
    /// Level cameras at the given ring heights.
    pub fn new(radius: f64, heights: Vec<f64>, rotations_per_ring: usize) -> Self {
        Self {
            radius,
            heights,
            rotations_per_ring,
            start_rotation: 0.0,
            focus_height: None,
            fixed_tilt: 0.0,
            focus: default_focus(),
        }
    }

    /// `rings` heights evenly spread over `[bottom, top]`.
    pub fn with_rings(radius: f64, bottom: f64, top: f64, rings: usize, rotations_per_ring: usize) -> Self {
        let heights = match rings {
            0 => Vec::new(),
            1 => vec![bottom],
            n => {
                let step = (top - bottom) / (n - 1) as f64;
                (0..n).map(|i| bottom + step * i as f64).collect()
            }
        };
        Self::new(radius, heights, rotations_per_ring)
    }

    /// Tilt every point towards `focus_height` on the turntable axis.
    pub fn aimed_at(mut self, focus_height: f64) -> Self {
        self.focus_height = Some(focus_height);
        self
    }

    /// Focus directive for every point.
    pub fn with_focus(mut self, focus: FocusDirective) -> Self {
        self.focus = focus;
        self
    }

    fn rotation_step(&self) -> f64 {
        360.0 / self.rotations_per_ring as f64
    }
}

impl PatternSource for CylindricalPattern {
    fn len(&self) -> usize {
        self.heights.len() * self.rotations_per_ring
    }

    fn point(&self, index: usize) -> Option<ScanPoint> {
        if index >= self.len() {
            return None;
        }
        let ring = index / self.rotations_per_ring;
        let slot = index % self.rotations_per_ring;

        let height = self.heights[ring];
        let rotation = self.start_rotation + self.rotation_step() * slot as f64;
        let tilt = match self.focus_height {
            Some(focus) => CoordinateTransformer::tilt_to_focus(self.radius, height, focus),
            None => self.fixed_tilt,
        };

        Some(ScanPoint::new(
            CameraRelative::new(self.radius, height, rotation, tilt),
            self.focus.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_ordering() {
        let pattern = CylindricalPattern::with_rings(120.0, 0.0, 100.0, 3, 4);
        assert_eq!(pattern.len(), 12);

        let p = pattern.point(5).unwrap();
        assert_eq!(p.target.height, 50.0);
        assert_eq!(p.target.rotation, 90.0);
        assert!(pattern.point(12).is_none());
    }

    #[test]
    fn test_aimed_rings_tilt_towards_focus() {
        let pattern = CylindricalPattern::with_rings(100.0, 0.0, 100.0, 3, 1).aimed_at(50.0);
        let tilts: Vec<f64> = (0..3).map(|i| pattern.point(i).unwrap().target.tilt).collect();
        assert!(tilts[0] > 0.0);
        assert_eq!(tilts[1], 0.0);
        assert!(tilts[2] < 0.0);
        assert!((tilts[0] - 26.565).abs() < 1e-3);
    }

    #[test]
    fn test_zero_rotations_is_empty() {
        let pattern = CylindricalPattern::new(100.0, vec![0.0, 10.0], 0);
        assert!(pattern.is_empty());
        assert!(pattern.point(0).is_none());
    }
}
