//! Total integrated intensity per frame.
use crate::data::sink::OutputSink;
use crate::error::AppResult;
use crate::reduction::{read_frames, PointContext, ReductionStage, StageInfo};
use ndarray::{Array1, Axis};
use std::any::Any;
use tracing::debug;

/// Sums every frame of `[frames, ...rest]` into a `[frames]` vector.
///
/// The output has no radial axis, so no q-axis is ever written or exposed,
/// even when the upstream stage offers one.
#[derive(Debug, Clone)]
pub struct Invariant {
    info: StageInfo,
}

impl Invariant {
    /// Invariant stage called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(StageInfo::new(name))
    }

    /// Invariant stage with full identity.
    pub fn with_info(info: StageInfo) -> Self {
        Self { info }
    }
}

impl ReductionStage for Invariant {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "INVARIANT"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let data = read_frames(&self.info.name, ctx, sink)?;
        let sums: Array1<f64> = data.axis_iter(Axis(0)).map(|frame| frame.sum()).collect();
        debug!(stage = %self.info.name, frames = sums.len(), "computed invariant");

        self.info.write_data(sums.into_dyn(), None, sink);
        self.info.write_metadata(self.detector_type(), sink);
        Ok(())
    }
}
