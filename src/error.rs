//! Custom error types for the reduction pipeline.
//!
//! This module defines the primary error type, `ReductionError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure a reduction stage can run into, from a missing
//! upstream buffer to a degenerate sector geometry.
//!
//! ## Error Hierarchy
//!
//! - **`MissingInput`**: the upstream buffer a stage reads is not present in the sink.
//!   The stage skips its output for this point and the chain carries on.
//! - **`Unconfigured`**: an optional calibration the stage needs was never set. The
//!   stage is skipped like a missing input and its dependents are skipped too.
//! - **`DimensionMismatch`**: calibration and raw data shapes are incompatible. The
//!   stage aborts its own output, the chain continues with the next stage.
//! - **`GeometryError`**: degenerate sector (zero radius span, inverted angle range).
//! - **`Shape`**: a frame buffer was built or reshaped with an inconsistent element count.
//! - **`Config`** / **`Configuration`**: parse errors from the `config` crate and
//!   semantic errors found while building stages from settings.
//!
//! Stage-scoped variants carry the stage name so that a log line or a
//! [`PointReport`](crate::reduction::chain::PointReport) always identifies the
//! offending step.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ReductionError>;

/// Primary error type for the reduction pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReductionError {
    /// The declared upstream buffer is absent from the sink.
    ///
    /// **Error Type**: Non-fatal. The stage writes nothing for this point.
    #[error("Stage '{stage}': input '{key}' not found in sink")]
    MissingInput {
        /// Stage that attempted the lookup.
        stage: String,
        /// Name that could not be resolved.
        key: String,
    },

    /// The stage has nothing to do until a calibration is set.
    ///
    /// **Error Type**: Non-fatal. The stage writes nothing for this point.
    #[error("Stage '{stage}': no {calibration} configured")]
    Unconfigured {
        /// Stage that was skipped.
        stage: String,
        /// Calibration that is missing.
        calibration: String,
    },

    /// Calibration and data shapes are incompatible.
    ///
    /// **Error Type**: Persistent until the calibration is corrected between scans.
    #[error("Stage '{stage}': dimension mismatch on {dimension}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Stage that detected the mismatch.
        stage: String,
        /// Axis or quantity that disagrees (e.g. `rank`, `axis 1`, `frames`).
        dimension: String,
        /// Value the stage required.
        expected: String,
        /// Value actually seen.
        found: String,
    },

    /// Sector geometry cannot be integrated.
    #[error("Stage '{stage}': invalid geometry: {reason}")]
    GeometryError {
        /// Stage owning the geometry.
        stage: String,
        /// Human readable description of the problem.
        reason: String,
    },

    /// Element count does not match the requested shape.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Configuration file parsing failed.
    ///
    /// Wraps `config::ConfigError` rendered as text so the error stays `Clone`.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// No factory is registered for a stage type.
    #[error("Unknown stage type '{0}'")]
    UnknownStageType(String),

    /// Two stages of one chain share a name.
    #[error("Duplicate stage name '{0}' in chain")]
    DuplicateStageName(String),
}

impl From<ndarray::ShapeError> for ReductionError {
    fn from(err: ndarray::ShapeError) -> Self {
        ReductionError::Shape(err.to_string())
    }
}

impl From<config::ConfigError> for ReductionError {
    fn from(err: config::ConfigError) -> Self {
        ReductionError::Config(err.to_string())
    }
}

impl ReductionError {
    /// Shorthand for a [`ReductionError::MissingInput`].
    pub fn missing_input(stage: impl Into<String>, key: impl Into<String>) -> Self {
        ReductionError::MissingInput {
            stage: stage.into(),
            key: key.into(),
        }
    }

    /// Shorthand for a [`ReductionError::Unconfigured`].
    pub fn unconfigured(stage: impl Into<String>, calibration: impl Into<String>) -> Self {
        ReductionError::Unconfigured {
            stage: stage.into(),
            calibration: calibration.into(),
        }
    }

    /// Shorthand for a [`ReductionError::DimensionMismatch`].
    pub fn dimension_mismatch(
        stage: impl Into<String>,
        dimension: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        ReductionError::DimensionMismatch {
            stage: stage.into(),
            dimension: dimension.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Shorthand for a [`ReductionError::GeometryError`].
    pub fn geometry(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        ReductionError::GeometryError {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Name of the stage this error belongs to, if it is stage scoped.
    pub fn stage(&self) -> Option<&str> {
        match self {
            ReductionError::MissingInput { stage, .. }
            | ReductionError::Unconfigured { stage, .. }
            | ReductionError::DimensionMismatch { stage, .. }
            | ReductionError::GeometryError { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Whether the error means "nothing to do" rather than a real failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ReductionError::MissingInput { .. } | ReductionError::Unconfigured { .. }
        )
    }
}
