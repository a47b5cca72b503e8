//! Sector integration of 2D detector frames.
//!
//! Reduces each `[height, width]` frame to a radial profile (mean intensity
//! per radius bin over the sector's angles) and an azimuthal profile (mean
//! intensity per angle bin over the sector's radii). The pixel-to-bin weights
//! come from an [`AreaMap`] which is built on first use and reused for every
//! point until the geometry, mask, frame shape or bin counts change.

use crate::data::buffer::FrameBuffer;
use crate::data::calibration::{mask_buffer, QAxisCalibration, SectorGeometry};
use crate::data::sink::OutputSink;
use crate::error::{AppResult, ReductionError};
use crate::reduction::area_map::{default_azimuthal_bins, AreaMap, AreaMapKey};
use crate::reduction::{read_frames, PointContext, ReductionStage, StageInfo, Q_FIELD, Q_UNITS};
use ndarray::{Array1, Array2, Axis, Ix3};
use std::any::Any;
use tracing::debug;

/// Field holding the azimuthal profile.
pub const AZIMUTH_FIELD: &str = "azimuth";

/// Sector integration stage.
#[derive(Debug, Clone)]
pub struct SectorIntegration {
    info: StageInfo,
    geometry: SectorGeometry,
    mask: Option<Array2<bool>>,
    mask_generation: u64,
    radial_bins: Option<usize>,
    azimuthal_bins: Option<usize>,
    default_azimuthal: Option<(SectorGeometry, usize)>,
    q_calibration: Option<QAxisCalibration>,
    camera_length: Option<f64>,
    cache: Option<AreaMap>,
    rebuilds: u64,
}

impl SectorIntegration {
    /// Sector stage called `name`.
    pub fn new(name: impl Into<String>, geometry: SectorGeometry) -> Self {
        Self::with_info(StageInfo::new(name), geometry)
    }

    /// Sector stage with full identity.
    pub fn with_info(info: StageInfo, geometry: SectorGeometry) -> Self {
        Self {
            info,
            geometry,
            mask: None,
            mask_generation: 0,
            radial_bins: None,
            azimuthal_bins: None,
            default_azimuthal: None,
            q_calibration: None,
            camera_length: None,
            cache: None,
            rebuilds: 0,
        }
    }

    /// Current geometry.
    pub fn geometry(&self) -> &SectorGeometry {
        &self.geometry
    }

    /// Replace the geometry.
    pub fn set_geometry(&mut self, geometry: SectorGeometry) {
        self.geometry = geometry;
    }

    /// Exclude pixels where `mask` is true. Must match the frame shape.
    pub fn set_mask(&mut self, mask: Array2<bool>) {
        self.mask = Some(mask);
        self.mask_generation += 1;
    }

    /// Use every pixel.
    pub fn clear_mask(&mut self) {
        if self.mask.take().is_some() {
            self.mask_generation += 1;
        }
    }

    /// Current mask.
    pub fn mask(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    /// Pixel-radius to q calibration; enables the q-axis output.
    pub fn set_q_calibration(&mut self, calibration: QAxisCalibration) {
        self.q_calibration = Some(calibration);
    }

    /// Sample to detector distance, written as metadata.
    pub fn set_camera_length(&mut self, camera_length: f64) {
        self.camera_length = Some(camera_length);
    }

    /// Override the radial bin count. `None` restores the default.
    pub fn set_radial_bins(&mut self, bins: Option<usize>) -> AppResult<()> {
        self.radial_bins = self.check_bins("radial_bins", bins)?;
        Ok(())
    }

    /// Override the azimuthal bin count. `None` restores the default.
    pub fn set_azimuthal_bins(&mut self, bins: Option<usize>) -> AppResult<()> {
        self.azimuthal_bins = self.check_bins("azimuthal_bins", bins)?;
        Ok(())
    }

    fn check_bins(&self, field: &str, bins: Option<usize>) -> AppResult<Option<usize>> {
        if bins == Some(0) {
            return Err(ReductionError::Configuration(format!(
                "stage '{}': {} must be at least 1",
                self.info.name, field
            )));
        }
        Ok(bins)
    }

    /// Radial profile length: one bin per pixel of radius unless overridden.
    pub fn radial_bins(&self) -> usize {
        self.radial_bins.unwrap_or_else(|| {
            let [r0, r1] = self.geometry.radii;
            ((r1 - r0).ceil().max(1.0)) as usize
        })
    }

    /// Azimuthal profile length unless overridden, see [`default_azimuthal_bins`].
    pub fn azimuthal_bins(&self) -> usize {
        self.azimuthal_bins.unwrap_or_else(|| match self.default_azimuthal {
            Some((geometry, bins)) if geometry == self.geometry => bins,
            _ => default_azimuthal_bins(&self.geometry),
        })
    }

    fn resolve_azimuthal_bins(&mut self) -> usize {
        if let Some(bins) = self.azimuthal_bins {
            return bins;
        }
        match self.default_azimuthal {
            Some((geometry, bins)) if geometry == self.geometry => bins,
            _ => {
                let bins = default_azimuthal_bins(&self.geometry);
                self.default_azimuthal = Some((self.geometry, bins));
                bins
            }
        }
    }

    /// How many times the area map has been computed.
    pub fn area_map_builds(&self) -> u64 {
        self.rebuilds
    }

    /// Radius at the center of each radial bin.
    pub fn bin_radii(&self) -> Array1<f64> {
        let [r0, r1] = self.geometry.radii;
        let bins = self.radial_bins();
        let dr = (r1 - r0) / bins as f64;
        Array1::from_shape_fn(bins, |i| r0 + (i as f64 + 0.5) * dr)
    }

    fn area_map(&mut self, frame_shape: (usize, usize)) -> AppResult<&AreaMap> {
        let key = AreaMapKey {
            geometry: self.geometry,
            frame_shape,
            mask_generation: self.mask_generation,
            radial_bins: self.radial_bins(),
            azimuthal_bins: self.resolve_azimuthal_bins(),
        };
        let map = match self.cache.take() {
            Some(map) if map.key() == &key => map,
            _ => {
                debug!(stage = %self.info.name, ?frame_shape, "building sector area map");
                let map = AreaMap::build(key, self.mask.as_ref())?;
                self.rebuilds += 1;
                map
            }
        };
        let map: &AreaMap = self.cache.insert(map);
        Ok(map)
    }

    fn write_scan_constants(&self, sink: &mut dyn OutputSink) {
        let name = self.info.name.as_str();
        let geometry = &self.geometry;
        let scan = |field: &str, values: Vec<f64>| {
            FrameBuffer::from_f64(field, Array1::from(values).into_dyn())
        };

        self.info.write_metadata(self.detector_type(), sink);
        sink.put(
            name,
            scan("beam_center", geometry.center.to_vec()),
            Some("pixels"),
            None,
            false,
        );
        let angles = [geometry.start_angle(), geometry.start_angle() + geometry.angular_span()]
            .map(f64::to_degrees);
        sink.put(
            name,
            scan("integration_angles", angles.to_vec()),
            Some("degrees"),
            None,
            false,
        );
        sink.put(
            name,
            scan("integration_radii", geometry.radii.to_vec()),
            Some("pixels"),
            None,
            false,
        );
        sink.put_metadata_string(name, "integration_symmetry", geometry.symmetry.label());
        sink.put_metadata_string(
            name,
            "clipping_compensation",
            if geometry.clipping_compensation {
                "true"
            } else {
                "false"
            },
        );
        if let Some(cal) = &self.q_calibration {
            sink.put(
                name,
                scan("calibration", vec![cal.gradient, cal.intercept]),
                None,
                None,
                false,
            );
        }
        if let Some(camera_length) = self.camera_length {
            sink.put_metadata_scalar(name, "camera_length", camera_length);
        }
        if let Some(mask) = &self.mask {
            sink.put(name, mask_buffer("mask", mask), None, None, false);
        }
        if let Some(q) = self.q_axis() {
            sink.put(name, q, Some(Q_UNITS), Some(1), false);
        }
    }
}

impl ReductionStage for SectorIntegration {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "SECTOR_INTEGRATION"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        self.geometry.validate(&self.info.name)?;
        let data = read_frames(&self.info.name, ctx, sink)?;
        if data.ndim() != 3 {
            return Err(ReductionError::dimension_mismatch(
                &self.info.name,
                "rank",
                3,
                data.ndim(),
            ));
        }
        let data = data.into_dimensionality::<Ix3>()?;
        let (frames, height, width) = data.dim();
        if let Some(mask) = &self.mask {
            if mask.dim() != (height, width) {
                return Err(ReductionError::dimension_mismatch(
                    &self.info.name,
                    "mask shape",
                    format!("{:?}", (height, width)),
                    format!("{:?}", mask.dim()),
                ));
            }
        }

        let map = self.area_map((height, width))?;
        let mut radial = Array2::zeros((frames, map.radial_area().len()));
        let mut azimuthal = Array2::zeros((frames, map.azimuthal_area().len()));
        for (f, frame) in data.axis_iter(Axis(0)).enumerate() {
            let (r, a) = map.integrate(frame);
            radial.row_mut(f).assign(&r);
            azimuthal.row_mut(f).assign(&a);
        }
        debug!(stage = %self.info.name, frames, "integrated sector");

        self.info.write_data(radial.into_dyn(), None, sink);
        sink.put(
            &self.info.name,
            FrameBuffer::from_f64(AZIMUTH_FIELD, azimuthal.into_dyn()),
            None,
            None,
            true,
        );
        self.write_scan_constants(sink);
        Ok(())
    }

    fn q_axis(&self) -> Option<FrameBuffer> {
        let cal = self.q_calibration?;
        let q = self.bin_radii().mapv(|r| cal.q(r));
        Some(FrameBuffer::from_f64(Q_FIELD, q.into_dyn()))
    }

    fn at_scan_start(&mut self) -> AppResult<()> {
        self.geometry.validate(&self.info.name)
    }

    fn at_scan_end(&mut self) {
        self.cache = None;
    }
}
