//! Normalisation against a calibration channel.
use crate::data::buffer::FrameBuffer;
use crate::data::sink::OutputSink;
use crate::error::{AppResult, ReductionError};
use crate::reduction::{
    echo_q_axis, leading_frames, read_frames, PointContext, ReductionStage, StageInfo,
};
use ndarray::{Axis, Ix2};
use std::any::Any;
use tracing::debug;

/// Scales every frame by `normvalue / calib[f, calib_channel]`.
///
/// The calibration data (typically incident flux counters) is looked up in the
/// sink by `calibration_name`, not held by the stage, and must be rank 2:
/// `[frames, channels]`. A zero calibration value is not guarded and yields
/// IEEE infinities or NaN.
#[derive(Debug, Clone)]
pub struct Normalisation {
    info: StageInfo,
    calibration_name: String,
    calib_channel: usize,
    normvalue: f64,
    q_axis: Option<FrameBuffer>,
}

impl Normalisation {
    /// Normalisation stage called `name` reading channel `calib_channel` of node `calibration_name`.
    pub fn new(
        name: impl Into<String>,
        calibration_name: impl Into<String>,
        calib_channel: usize,
        normvalue: f64,
    ) -> Self {
        Self::with_info(StageInfo::new(name), calibration_name, calib_channel, normvalue)
    }

    /// Normalisation stage with full identity.
    pub fn with_info(
        info: StageInfo,
        calibration_name: impl Into<String>,
        calib_channel: usize,
        normvalue: f64,
    ) -> Self {
        Self {
            info,
            calibration_name: calibration_name.into(),
            calib_channel,
            normvalue,
            q_axis: None,
        }
    }

    /// Node the calibration channel is read from.
    pub fn calibration_name(&self) -> &str {
        &self.calibration_name
    }

    /// Target value after normalisation.
    pub fn normvalue(&self) -> f64 {
        self.normvalue
    }
}

impl ReductionStage for Normalisation {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "NORMALISATION"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let stage = self.info.name.as_str();
        let mut data = read_frames(stage, ctx, sink)?;
        let calibration = sink
            .get(&self.calibration_name)
            .ok_or_else(|| ReductionError::missing_input(stage, &self.calibration_name))?;
        if calibration.rank() != 2 {
            return Err(ReductionError::dimension_mismatch(
                stage,
                "calibration rank",
                2,
                calibration.rank(),
            ));
        }
        let channels = calibration.shape()[1];
        if self.calib_channel >= channels {
            return Err(ReductionError::dimension_mismatch(
                stage,
                "calibration channel",
                format!("< {}", channels),
                self.calib_channel,
            ));
        }
        let calib = leading_frames(stage, calibration, ctx.frames)?.into_dimensionality::<Ix2>()?;

        for (f, mut frame) in data.axis_iter_mut(Axis(0)).enumerate() {
            frame *= self.normvalue / calib[[f, self.calib_channel]];
        }
        debug!(
            stage = %stage,
            calibration = %self.calibration_name,
            channel = self.calib_channel,
            "normalised frames"
        );

        let rank = data.ndim();
        self.info.write_data(data, None, sink);
        self.info.write_metadata(self.detector_type(), sink);
        sink.put_metadata_scalar(&self.info.name, "normvalue", self.normvalue);
        sink.put_metadata_scalar(&self.info.name, "calibration_channel", self.calib_channel as f64);
        sink.put_metadata_string(&self.info.name, "calibration_name", &self.calibration_name);
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
    use crate::reduction::test_support::{put, sink_with};

    fn ctx(frames: usize) -> PointContext<'static> {
        PointContext {
            frames,
            upstream: "raw",
            q_axis: None,
        }
    }

    #[test]
    fn unit_calibration_and_normvalue_is_identity() {
        let values = vec![3.0, -1.5, 8.0, 0.0, 2.0, 7.25];
        let mut sink = sink_with("raw", &[2, 3], values.clone());
        put(&mut sink, "I0", &[2, 2], vec![5.0, 1.0, 9.0, 1.0]);

        let mut stage = Normalisation::new("norm", "I0", 1, 1.0);
        stage.writeout(&ctx(2), &mut sink).unwrap();
        assert_eq!(sink.get("norm").unwrap().to_vec_f64(), values);
    }

    #[test]
    fn scales_each_frame_by_its_own_channel_value() {
        let mut sink = sink_with("raw", &[2, 2], vec![10.0, 20.0, 10.0, 20.0]);
        put(&mut sink, "I0", &[2, 1], vec![2.0, 4.0]);

        let mut stage = Normalisation::new("norm", "I0", 0, 8.0);
        stage.writeout(&ctx(2), &mut sink).unwrap();
        assert_eq!(
            sink.get("norm").unwrap().to_vec_f64(),
            vec![40.0, 80.0, 20.0, 40.0]
        );
        assert_eq!(sink.node("norm").unwrap().scalars["normvalue"], 8.0);
    }

    #[test]
    fn calibration_must_be_rank_two() {
        let mut sink = sink_with("raw", &[1, 2], vec![1.0, 1.0]);
        put(&mut sink, "I0", &[1, 2, 1], vec![1.0, 1.0]);

        let mut stage = Normalisation::new("norm", "I0", 0, 1.0);
        assert!(matches!(
            stage.writeout(&ctx(1), &mut sink),
            Err(ReductionError::DimensionMismatch { ref dimension, .. }) if dimension == "calibration rank"
        ));
    }

    #[test]
    fn missing_calibration_node_is_missing_input() {
        let mut sink = sink_with("raw", &[1, 2], vec![1.0, 1.0]);
        let mut stage = Normalisation::new("norm", "I0", 0, 1.0);
        assert_eq!(
            stage.writeout(&ctx(1), &mut sink),
            Err(ReductionError::missing_input("norm", "I0"))
        );
    }

    #[test]
    fn zero_calibration_propagates_infinity() {
        let mut sink = sink_with("raw", &[1, 1], vec![1.0]);
        put(&mut sink, "I0", &[1, 1], vec![0.0]);
        let mut stage = Normalisation::new("norm", "I0", 0, 1.0);
        stage.writeout(&ctx(1), &mut sink).unwrap();
        assert!(sink.get("norm").unwrap().to_vec_f64()[0].is_infinite());
    }
}
