//! Mean over the frame axis.
use crate::data::buffer::FrameBuffer;
use crate::data::sink::OutputSink;
use crate::error::{AppResult, ReductionError};
use crate::reduction::{echo_q_axis, read_frames, PointContext, ReductionStage, StageInfo};
use ndarray::Axis;
use std::any::Any;
use tracing::debug;

/// Reduces `[frames, ...rest]` to `rest` by the arithmetic mean over frames.
///
/// NaN and infinities propagate per IEEE arithmetic.
#[derive(Debug, Clone)]
pub struct Average {
    info: StageInfo,
    q_axis: Option<FrameBuffer>,
}

impl Average {
    /// Average stage called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(StageInfo::new(name))
    }

    /// Average stage with full identity.
    pub fn with_info(info: StageInfo) -> Self {
        Self { info, q_axis: None }
    }
}

impl ReductionStage for Average {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "AVERAGE"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn reduces_frames(&self) -> bool {
        true
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let data = read_frames(&self.info.name, ctx, sink)?;
        let mean = data.mean_axis(Axis(0)).ok_or_else(|| {
            ReductionError::dimension_mismatch(&self.info.name, "frames", ">= 1", 0)
        })?;
        debug!(stage = %self.info.name, frames = ctx.frames, "averaged frames");

        let rank = mean.ndim();
        self.info.write_data(mean, None, sink);
        self.info.write_metadata(self.detector_type(), sink);
        echo_q_axis(&self.info, &mut self.q_axis, ctx.q_axis, rank, sink);
        Ok(())
    }

    fn q_axis(&self) -> Option<FrameBuffer> {
        self.q_axis.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::test_support::sink_with;
    use approx::assert_relative_eq;

    fn run(shape: &[usize], values: Vec<f64>, frames: usize) -> Vec<f64> {
        let mut sink = sink_with("raw", shape, values);
        let mut stage = Average::new("avg");
        let ctx = PointContext {
            frames,
            upstream: "raw",
            q_axis: None,
        };
        stage.writeout(&ctx, &mut sink).unwrap();
        sink.get("avg").unwrap().to_vec_f64()
    }

    #[test]
    fn mean_over_frames_per_trailing_index() {
        let out = run(&[3, 2], vec![1.0, 10.0, 2.0, 20.0, 6.0, 30.0], 3);
        assert_relative_eq!(out[0], 3.0);
        assert_relative_eq!(out[1], 20.0);
    }

    #[test]
    fn single_frame_is_returned_unchanged() {
        let values = vec![1.5, -2.0, 3.25, 4.0];
        assert_eq!(run(&[1, 2, 2], values.clone(), 1), values);
    }

    #[test]
    fn output_drops_frame_axis() {
        let mut sink = sink_with("raw", &[2, 2, 3], vec![1.0; 12]);
        let mut stage = Average::new("avg");
        let ctx = PointContext {
            frames: 2,
            upstream: "raw",
            q_axis: None,
        };
        stage.writeout(&ctx, &mut sink).unwrap();
        assert_eq!(sink.get("avg").unwrap().shape(), &[2, 3]);
        assert_eq!(sink.node("avg").unwrap().strings["detector_type"], "AVERAGE");
    }

    #[test]
    fn zero_frames_is_a_dimension_mismatch() {
        let mut sink = sink_with("raw", &[2, 2], vec![1.0; 4]);
        let mut stage = Average::new("avg");
        let ctx = PointContext {
            frames: 0,
            upstream: "raw",
            q_axis: None,
        };
        assert!(matches!(
            stage.writeout(&ctx, &mut sink),
            Err(ReductionError::DimensionMismatch { .. })
        ));
        assert!(sink.get("avg").is_none());
    }
}
