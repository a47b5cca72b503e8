//! Background frame subtraction.
use crate::data::buffer::FrameBuffer;
use crate::data::sink::OutputSink;
use crate::error::{AppResult, ReductionError};
use crate::reduction::{
    check_frame_shape, echo_q_axis, read_frames, PointContext, ReductionStage, StageInfo,
};
use ndarray::{ArrayD, Axis};
use std::any::Any;
use tracing::debug;

/// Subtracts one background frame from every frame:
/// `out[f, i] = raw[f, i] - background[i]`.
///
/// Without a background the stage is skipped and writes nothing.
#[derive(Debug, Clone)]
pub struct BackgroundSubtraction {
    info: StageInfo,
    background: Option<ArrayD<f64>>,
    q_axis: Option<FrameBuffer>,
}

impl BackgroundSubtraction {
    /// Background stage called `name` with no background yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(StageInfo::new(name))
    }

    /// Background stage with full identity.
    pub fn with_info(info: StageInfo) -> Self {
        Self {
            info,
            background: None,
            q_axis: None,
        }
    }

    /// Set the background frame; its shape must equal one frame of the data.
    pub fn set_background(&mut self, background: ArrayD<f64>) {
        self.background = Some(background);
    }

    /// Remove the background; later points skip the stage.
    pub fn clear_background(&mut self) {
        self.background = None;
    }

    /// Current background frame.
    pub fn background(&self) -> Option<&ArrayD<f64>> {
        self.background.as_ref()
    }
}

impl ReductionStage for BackgroundSubtraction {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn detector_type(&self) -> &str {
        "BACKGROUND_SUBTRACTION"
    }

    fn key(&self) -> Option<&str> {
        self.info.key.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()> {
        let Some(background) = self.background.as_ref() else {
            return Err(ReductionError::unconfigured(&self.info.name, "background"));
        };
        let mut data = read_frames(&self.info.name, ctx, sink)?;
        check_frame_shape(&self.info.name, &data, background)?;

        for mut frame in data.axis_iter_mut(Axis(0)) {
            frame -= background;
        }
        debug!(stage = %self.info.name, frames = ctx.frames, "subtracted background");

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
