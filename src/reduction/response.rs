//! Detector response (flat-field) correction.
use crate::data::buffer::FrameBuffer;
use crate::data::sink::OutputSink;
use crate::error::{AppResult, ReductionError};
use crate::reduction::{
    check_frame_shape, echo_q_axis, read_frames, PointContext, ReductionStage, StageInfo,
};
use ndarray::{ArrayD, Axis};
use std::any::Any;
use tracing::debug;

/// Divides every frame by a measured per-pixel response to flatten detector
/// non-uniformity: `out[f, i] = raw[f, i] / response[i]`.
///
/// Zero response pixels are not guarded and yield IEEE infinities or NaN.
#[derive(Debug, Clone)]
pub struct DetectorResponse {
    info: StageInfo,
    response: Option<ArrayD<f64>>,
    q_axis: Option<FrameBuffer>,
}

impl DetectorResponse {
    /// Response stage called `name` with no response frame yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(StageInfo::new(name))
    }

    /// Response stage with full identity.
    pub fn with_info(info: StageInfo) -> Self {
        Self {
            info,
            response: None,
            q_axis: None,
        }
    }

    /// Set the response frame; its shape must equal one frame of the data.
    pub fn set_response(&mut self, response: ArrayD<f64>) {
        self.response = Some(response);
    }

    /// Current response frame.
    pub fn response(&self) -> Option<&ArrayD<f64>> {
        self.response.as_ref()
    }
}

impl ReductionStage for DetectorResponse {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "DETECTOR_RESPONSE"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let response = self.response.as_ref().ok_or_else(|| {
            ReductionError::Configuration(format!(
                "stage '{}' has no response frame",
                self.info.name
            ))
        })?;
        let mut data = read_frames(&self.info.name, ctx, sink)?;
        check_frame_shape(&self.info.name, &data, response)?;

        for mut frame in data.axis_iter_mut(Axis(0)) {
            frame /= response;
        }
        debug!(stage = %self.info.name, frames = ctx.frames, "applied detector response");

        let rank = data.ndim();
        self.info.write_data(data, None, sink);
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
    use ndarray::arr2;

    #[test]
    fn divides_each_frame_by_response() {
        let mut sink = sink_with("raw", &[2, 2, 2], vec![2.0, 4.0, 6.0, 8.0, 4.0, 8.0, 12.0, 16.0]);
        let mut stage = DetectorResponse::new("resp");
        stage.set_response(arr2(&[[2.0, 4.0], [3.0, 8.0]]).into_dyn());
        let ctx = PointContext {
            frames: 2,
            upstream: "raw",
            q_axis: None,
        };
        stage.writeout(&ctx, &mut sink).unwrap();
        assert_eq!(
            sink.get("resp").unwrap().to_vec_f64(),
            vec![1.0, 1.0, 2.0, 1.0, 2.0, 2.0, 4.0, 2.0]
        );
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let mut sink = sink_with("raw", &[1, 2, 2], vec![1.0; 4]);
        let mut stage = DetectorResponse::new("resp");
        stage.set_response(ndarray::arr1(&[1.0, 1.0, 1.0, 1.0]).into_dyn());
        let ctx = PointContext {
            frames: 1,
            upstream: "raw",
            q_axis: None,
        };
        match stage.writeout(&ctx, &mut sink) {
            Err(ReductionError::DimensionMismatch { dimension, .. }) => {
                assert_eq!(dimension, "rank")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(sink.get("resp").is_none());
    }
}
