//! Scan-constant calibration types.
//!
//! These values are set on a stage before a scan starts and only read while
//! the scan runs. Each stage owns its own copy; there is no shared store.

use crate::data::buffer::FrameBuffer;
use crate::error::{AppResult, ReductionError};
use ndarray::Array2;
use serde::Deserialize;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// How a partial sector is folded into the profiles.
///
/// Every mode except `None` and `Full` adds a second, symmetric sector whose
/// pixels are mapped back onto the primary sector's angles before binning.
/// Directions are as the frame is displayed, with row 0 at the top: angles
/// grow from +x towards +y, which is clockwise on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymmetryMode {
    /// Only the configured sector.
    #[default]
    None,
    /// Whole annulus; the angle range is ignored.
    Full,
    /// Mirror image about the horizontal axis.
    XReflect,
    /// Mirror image about the vertical axis.
    YReflect,
    /// Sector rotated a quarter turn clockwise on screen, i.e. a sector at
    /// `[a, b]` gains a copy at `[a + 90, b + 90]` degrees.
    #[serde(rename = "clockwise_90")]
    Clockwise90,
    /// Sector rotated a quarter turn anticlockwise on screen, a copy at
    /// `[a - 90, b - 90]` degrees.
    #[serde(rename = "anticlockwise_90")]
    AntiClockwise90,
    /// Sector rotated half a turn.
    Invert,
}

impl SymmetryMode {
    /// Label written to the output metadata.
    pub fn label(&self) -> &'static str {
        match self {
            SymmetryMode::None => "none",
            SymmetryMode::Full => "full",
            SymmetryMode::XReflect => "x_reflect",
            SymmetryMode::YReflect => "y_reflect",
            SymmetryMode::Clockwise90 => "clockwise_90",
            SymmetryMode::AntiClockwise90 => "anticlockwise_90",
            SymmetryMode::Invert => "invert",
        }
    }

    /// Map an angle of the symmetric sector back onto the primary sector.
    ///
    /// Returns `None` for modes without a symmetric copy.
    pub fn fold(&self, theta: f64) -> Option<f64> {
        match self {
            SymmetryMode::None | SymmetryMode::Full => None,
            SymmetryMode::XReflect => Some(-theta),
            SymmetryMode::YReflect => Some(PI - theta),
            SymmetryMode::Clockwise90 => Some(theta - FRAC_PI_2),
            SymmetryMode::AntiClockwise90 => Some(theta + FRAC_PI_2),
            SymmetryMode::Invert => Some(theta + PI),
        }
    }
}

/// Linear pixel-radius to momentum-transfer calibration, `q = gradient * r + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct QAxisCalibration {
    /// Slope in q units per pixel.
    pub gradient: f64,
    /// q at zero radius.
    pub intercept: f64,
}

impl QAxisCalibration {
    /// Momentum transfer at `radius` pixels.
    pub fn q(&self, radius: f64) -> f64 {
        self.gradient * radius + self.intercept
    }
}

/// Sector geometry in pixel coordinates.
///
/// `center` is `[x, y]` where `x` runs along columns and `y` along rows, with
/// pixel `(row, col)` covering `[col, col + 1) x [row, row + 1)`. Angles are in
/// radians, measured from the +x axis towards +y.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorGeometry {
    /// Beam center `[x, y]`.
    pub center: [f64; 2],
    /// Inner and outer radius.
    pub radii: [f64; 2],
    /// Start and stop angle in radians.
    pub angles: [f64; 2],
    /// Symmetry folding.
    pub symmetry: SymmetryMode,
    /// Fractional pixel areas at sector boundaries instead of binary inclusion.
    pub clipping_compensation: bool,
}

impl SectorGeometry {
    /// Geometry with no symmetry and binary pixel inclusion.
    pub fn new(center: [f64; 2], radii: [f64; 2], angles: [f64; 2]) -> Self {
        Self {
            center,
            radii,
            angles,
            symmetry: SymmetryMode::None,
            clipping_compensation: false,
        }
    }

    /// Same as [`SectorGeometry::new`] with angles given in degrees.
    pub fn from_degrees(center: [f64; 2], radii: [f64; 2], angles_deg: [f64; 2]) -> Self {
        Self::new(
            center,
            radii,
            [angles_deg[0].to_radians(), angles_deg[1].to_radians()],
        )
    }

    /// Builder-style symmetry setter.
    pub fn with_symmetry(mut self, symmetry: SymmetryMode) -> Self {
        self.symmetry = symmetry;
        self
    }

    /// Builder-style clipping compensation setter.
    pub fn with_clipping_compensation(mut self, enabled: bool) -> Self {
        self.clipping_compensation = enabled;
        self
    }

    /// Angular extent covered by the primary sector, at most a full turn.
    pub fn angular_span(&self) -> f64 {
        if self.symmetry == SymmetryMode::Full {
            TAU
        } else {
            (self.angles[1] - self.angles[0]).min(TAU)
        }
    }

    /// Start angle of the primary sector.
    pub fn start_angle(&self) -> f64 {
        if self.symmetry == SymmetryMode::Full {
            0.0
        } else {
            self.angles[0]
        }
    }

    /// Offset of `theta` into the primary sector, or `None` when outside it.
    pub fn angle_offset(&self, theta: f64) -> Option<f64> {
        let span = self.angular_span();
        let offset = (theta - self.start_angle()).rem_euclid(TAU);
        (offset <= span).then_some(offset)
    }

    /// Reject degenerate sectors.
    pub fn validate(&self, stage: &str) -> AppResult<()> {
        let values = self.center.iter().chain(&self.radii).chain(&self.angles);
        if values.into_iter().any(|v| !v.is_finite()) {
            return Err(ReductionError::geometry(stage, "non-finite geometry value"));
        }
        if self.radii[0] < 0.0 {
            return Err(ReductionError::geometry(
                stage,
                format!("negative inner radius {}", self.radii[0]),
            ));
        }
        if self.radii[1] <= self.radii[0] {
            return Err(ReductionError::geometry(
                stage,
                format!(
                    "zero or inverted radius span [{}, {}]",
                    self.radii[0], self.radii[1]
                ),
            ));
        }
        if self.symmetry != SymmetryMode::Full && self.angles[1] <= self.angles[0] {
            return Err(ReductionError::geometry(
                stage,
                format!(
                    "zero or inverted angle range [{}, {}]",
                    self.angles[0], self.angles[1]
                ),
            ));
        }
        Ok(())
    }
}

/// Encode a boolean mask as a 0/1 integer buffer for the output sink.
pub fn mask_buffer(name: &str, mask: &Array2<bool>) -> FrameBuffer {
    FrameBuffer::from_i32(name, mask.mapv(i32::from).into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn validate_rejects_degenerate_sectors() {
        let ok = SectorGeometry::from_degrees([2.0, 2.0], [0.0, 2.0], [0.0, 90.0]);
        assert!(ok.validate("saxs").is_ok());

        let flat = SectorGeometry::from_degrees([2.0, 2.0], [2.0, 2.0], [0.0, 90.0]);
        assert!(matches!(
            flat.validate("saxs"),
            Err(ReductionError::GeometryError { .. })
        ));

        let inverted = SectorGeometry::from_degrees([2.0, 2.0], [0.0, 2.0], [90.0, 10.0]);
        assert!(inverted.validate("saxs").is_err());

        // Full symmetry ignores the angle range entirely.
        assert!(inverted
            .with_symmetry(SymmetryMode::Full)
            .validate("saxs")
            .is_ok());
    }

    #[test]
    fn angle_offset_wraps_around_zero() {
        let geometry = SectorGeometry::from_degrees([0.0, 0.0], [0.0, 1.0], [-45.0, 45.0]);
        assert_relative_eq!(
            geometry.angle_offset(0.0).unwrap(),
            45f64.to_radians(),
            epsilon = 1e-12
        );
        assert!(geometry.angle_offset(PI).is_none());
        assert!(geometry.angle_offset(350f64.to_radians()).is_some());
    }

    #[test]
    fn fold_maps_symmetric_copy_onto_primary() {
        let theta = 30f64.to_radians();
        assert_relative_eq!(SymmetryMode::XReflect.fold(-theta).unwrap(), theta);
        assert_relative_eq!(SymmetryMode::YReflect.fold(PI - theta).unwrap(), theta);
        assert_relative_eq!(
            SymmetryMode::Invert.fold(theta - PI).unwrap(),
            theta,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            SymmetryMode::Clockwise90.fold(theta + FRAC_PI_2).unwrap(),
            theta,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            SymmetryMode::AntiClockwise90.fold(theta - FRAC_PI_2).unwrap(),
            theta,
            epsilon = 1e-12
        );
        assert!(SymmetryMode::Full.fold(theta).is_none());
    }

    #[test]
    fn q_axis_is_linear_in_radius() {
        let cal = QAxisCalibration {
            gradient: 0.5,
            intercept: 0.1,
        };
        assert_relative_eq!(cal.q(4.0), 2.1);
    }
}
