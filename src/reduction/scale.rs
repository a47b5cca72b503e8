//! Linear rescaling.
use crate::data::buffer::FrameBuffer;
use crate::data::sink::OutputSink;
use crate::error::AppResult;
use crate::reduction::{echo_q_axis, read_frames, PointContext, ReductionStage, StageInfo};
use std::any::Any;
use tracing::debug;

/// `out = raw * scaling + offset`, e.g. for absolute intensity calibration.
#[derive(Debug, Clone)]
pub struct Scale {
    info: StageInfo,
    scaling: f64,
    offset: f64,
    units: Option<String>,
    q_axis: Option<FrameBuffer>,
}

impl Scale {
    /// Scale stage called `name`.
    pub fn new(name: impl Into<String>, scaling: f64, offset: f64) -> Self {
        Self::with_info(StageInfo::new(name), scaling, offset)
    }

    /// Scale stage with full identity.
    pub fn with_info(info: StageInfo, scaling: f64, offset: f64) -> Self {
        Self {
            info,
            scaling,
            offset,
            units: None,
            q_axis: None,
        }
    }

    /// Units of the rescaled data, e.g. `1/cm` for absolute intensities.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

impl ReductionStage for Scale {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "SCALER"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let mut data = read_frames(&self.info.name, ctx, sink)?;
        let (scaling, offset) = (self.scaling, self.offset);
        data.mapv_inplace(|v| v * scaling + offset);
        debug!(stage = %self.info.name, scaling, offset, "rescaled frames");

        let rank = data.ndim();
        self.info.write_data(data, self.units.as_deref(), sink);
        self.info.write_metadata(self.detector_type(), sink);
        sink.put_metadata_scalar(&self.info.name, "scaling", scaling);
        sink.put_metadata_scalar(&self.info.name, "offset", offset);
        echo_q_axis(&self.info, &mut self.q_axis, ctx.q_axis, rank, sink);
        Ok(())
    }

    fn q_axis(&self) -> Option<FrameBuffer> {
        self.q_axis.clone()
    }
}
