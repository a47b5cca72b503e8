//! Stage factories keyed by configuration type name.
use crate::data::calibration::{QAxisCalibration, SectorGeometry, SymmetryMode};
use crate::error::{AppResult, ReductionError};
use crate::reduction::average::Average;
use crate::reduction::background::BackgroundSubtraction;
use crate::reduction::invariant::Invariant;
use crate::reduction::normalisation::Normalisation;
use crate::reduction::response::DetectorResponse;
use crate::reduction::scale::Scale;
use crate::reduction::sector::SectorIntegration;
use crate::reduction::{ReductionStage, StageInfo};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use toml::Value;

type StageFactory =
    Box<dyn Fn(StageInfo, &Value) -> AppResult<Box<dyn ReductionStage>> + Send + Sync>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NormalisationParams {
    calibration_name: String,
    #[serde(default)]
    calib_channel: usize,
    #[serde(default = "one")]
    normvalue: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScaleParams {
    #[serde(default = "one")]
    scaling: f64,
    #[serde(default)]
    offset: f64,
    units: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SectorParams {
    center: [f64; 2],
    radii: [f64; 2],
    /// Degrees.
    #[serde(default = "full_turn")]
    angles: [f64; 2],
    #[serde(default)]
    symmetry: SymmetryMode,
    #[serde(default)]
    clipping_compensation: bool,
    q_calibration: Option<QAxisCalibration>,
    camera_length: Option<f64>,
    radial_bins: Option<usize>,
    azimuthal_bins: Option<usize>,
}

fn one() -> f64 {
    1.0
}

fn full_turn() -> [f64; 2] {
    [0.0, 360.0]
}

fn params<T: DeserializeOwned>(stage: &str, config: &Value) -> AppResult<T> {
    config
        .clone()
        .try_into()
        .map_err(|e| ReductionError::Configuration(format!("stage '{}': {}", stage, e)))
}

/// Creates stages from `[[chain.stages]]` entries.
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    /// Registry with every built-in stage type.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("average", |info, config| {
            params::<NoParams>(&info.name, config)?;
            Ok(Box::new(Average::with_info(info)))
        });
        registry.register("invariant", |info, config| {
            params::<NoParams>(&info.name, config)?;
            Ok(Box::new(Invariant::with_info(info)))
        });
        // Response and background frames are set through the stage API.
        registry.register("response", |info, config| {
            params::<NoParams>(&info.name, config)?;
            Ok(Box::new(DetectorResponse::with_info(info)))
        });
        registry.register("background", |info, config| {
            params::<NoParams>(&info.name, config)?;
            Ok(Box::new(BackgroundSubtraction::with_info(info)))
        });
        registry.register("normalisation", |info, config| {
            let p: NormalisationParams = params(&info.name, config)?;
            Ok(Box::new(Normalisation::with_info(
                info,
                p.calibration_name,
                p.calib_channel,
                p.normvalue,
            )))
        });
        registry.register("scale", |info, config| {
            let p: ScaleParams = params(&info.name, config)?;
            let stage = Scale::with_info(info, p.scaling, p.offset);
            Ok(Box::new(match p.units {
                Some(units) => stage.with_units(units),
                None => stage,
            }))
        });
        registry.register("sector", |info, config| {
            let p: SectorParams = params(&info.name, config)?;
            let geometry = SectorGeometry::from_degrees(p.center, p.radii, p.angles)
                .with_symmetry(p.symmetry)
                .with_clipping_compensation(p.clipping_compensation);
            geometry.validate(&info.name)?;

            let mut stage = SectorIntegration::with_info(info, geometry);
            if let Some(cal) = p.q_calibration {
                stage.set_q_calibration(cal);
            }
            if let Some(length) = p.camera_length {
                stage.set_camera_length(length);
            }
            stage.set_radial_bins(p.radial_bins)?;
            stage.set_azimuthal_bins(p.azimuthal_bins)?;
            Ok(Box::new(stage))
        });

        registry
    }

    /// Add or replace the factory for `type_name`.
    pub fn register<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(StageInfo, &Value) -> AppResult<Box<dyn ReductionStage>> + Send + Sync + 'static,
    {
        self.factories
            .insert(type_name.to_string(), Box::new(factory));
    }

    /// Build a stage of type `type_name`.
    pub fn create(
        &self,
        type_name: &str,
        info: StageInfo,
        config: &Value,
    ) -> AppResult<Box<dyn ReductionStage>> {
        self.factories
            .get(type_name)
            .ok_or_else(|| ReductionError::UnknownStageType(type_name.to_string()))
            .and_then(|factory| factory(info, config))
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
