//! Reduction stages and the chain that runs them.
//!
//! A stage consumes the named buffer of its upstream node, transforms the
//! leading `frames` entries and writes its results back into the sink under
//! its own name. Stages are chained by name; see [`chain::ReductionChain`].
//!
//! ## Stages
//!
//! - [`average::Average`]: mean over the frame axis
//! - [`invariant::Invariant`]: total intensity per frame
//! - [`response::DetectorResponse`]: flat-field division
//! - [`background::BackgroundSubtraction`]: background frame subtraction
//! - [`normalisation::Normalisation`]: scaling by a calibration channel
//! - [`scale::Scale`]: linear rescaling
//! - [`sector::SectorIntegration`]: azimuthal and radial profiles

pub mod area_map;
pub mod average;
pub mod background;
pub mod chain;
pub mod invariant;
pub mod normalisation;
pub mod response;
pub mod scale;
pub mod sector;

use crate::data::buffer::FrameBuffer;
use crate::data::sink::{OutputSink, DATA_FIELD};
use crate::error::{AppResult, ReductionError};
use ndarray::{ArrayD, Axis, Slice};
use std::any::Any;

/// Units of a q-axis.
pub const Q_UNITS: &str = "1/A";

/// Field name of a q-axis.
pub const Q_FIELD: &str = "q";

/// Per-point inputs a stage needs beyond its own calibration.
#[derive(Debug, Clone, Copy)]
pub struct PointContext<'a> {
    /// Number of new frames available in this point.
    pub frames: usize,
    /// Node name of the buffer this stage consumes.
    pub upstream: &'a str,
    /// q-axis exposed by the upstream stage, if any.
    pub q_axis: Option<&'a FrameBuffer>,
}

/// Trait for a reduction stage.
///
/// Stages are constructed and calibrated before the scan, receive one
/// [`ReductionStage::writeout`] per scan point and keep no state between
/// points other than their calibration.
pub trait ReductionStage: Send {
    /// Unique name within a chain; also the sink node the stage writes to.
    fn name(&self) -> &str;

    /// Category tag written to the output metadata.
    fn detector_type(&self) -> &str;

    /// Upstream node this stage insists on reading, overriding the chain default.
    fn key(&self) -> Option<&str> {
        None
    }

    /// The concrete stage, for recalibration through
    /// [`ReductionChain::stage_as_mut`](chain::ReductionChain::stage_as_mut).
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Transform the upstream data of one point and write the results.
    fn writeout(&mut self, ctx: &PointContext<'_>, sink: &mut dyn OutputSink) -> AppResult<()>;

    /// True when the output has no frame axis.
    ///
    /// Dependents of such a stage treat the leading axis of its output as
    /// their frame axis.
    fn reduces_frames(&self) -> bool {
        false
    }

    /// q-axis describing the last axis of this stage's output.
    fn q_axis(&self) -> Option<FrameBuffer> {
        None
    }

    /// Called once before the first point of a scan.
    fn at_scan_start(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Called once after the last point of a scan.
    fn at_scan_end(&mut self) {}
}

/// Identity and descriptive metadata shared by every stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInfo {
    /// Stage name.
    pub name: String,
    /// Explicit upstream node.
    pub key: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Detector serial number.
    pub serial_number: Option<String>,
}

impl StageInfo {
    /// Info with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style upstream override.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Write the descriptive attributes of the stage node.
    pub(crate) fn write_metadata(&self, detector_type: &str, sink: &mut dyn OutputSink) {
        sink.put_metadata_string(&self.name, "detector_type", detector_type);
        if let Some(description) = &self.description {
            sink.put_metadata_string(&self.name, "description", description);
        }
        if let Some(serial) = &self.serial_number {
            sink.put_metadata_string(&self.name, "serial_number", serial);
        }
    }

    /// Write per-point primary data.
    pub(crate) fn write_data(
        &self,
        data: ArrayD<f64>,
        units: Option<&str>,
        sink: &mut dyn OutputSink,
    ) {
        sink.put(
            &self.name,
            FrameBuffer::from_f64(DATA_FIELD, data),
            units,
            None,
            true,
        );
    }
}

/// Fetch the upstream buffer of `ctx` as `f64`, restricted to the leading `ctx.frames` frames.
pub(crate) fn read_frames(
    stage: &str,
    ctx: &PointContext<'_>,
    sink: &dyn OutputSink,
) -> AppResult<ArrayD<f64>> {
    let buffer = sink
        .get(ctx.upstream)
        .ok_or_else(|| ReductionError::missing_input(stage, ctx.upstream))?;
    leading_frames(stage, buffer, ctx.frames)
}

/// Restrict `buffer` to its first `frames` entries along axis 0.
pub(crate) fn leading_frames(
    stage: &str,
    buffer: &FrameBuffer,
    frames: usize,
) -> AppResult<ArrayD<f64>> {
    let available = buffer
        .frames()
        .ok_or_else(|| ReductionError::dimension_mismatch(stage, "rank", ">= 1", 0))?;
    if frames > available {
        return Err(ReductionError::dimension_mismatch(
            stage,
            "frames",
            frames,
            available,
        ));
    }
    let data = buffer.to_f64();
    if frames == available {
        return Ok(data);
    }
    Ok(data.slice_axis(Axis(0), Slice::from(0..frames)).to_owned())
}

/// Check that `calibration` matches the per-frame shape of `data`.
pub(crate) fn check_frame_shape(
    stage: &str,
    data: &ArrayD<f64>,
    calibration: &ArrayD<f64>,
) -> AppResult<()> {
    let rest = &data.shape()[1..];
    if rest.len() != calibration.ndim() {
        return Err(ReductionError::dimension_mismatch(
            stage,
            "rank",
            rest.len(),
            calibration.ndim(),
        ));
    }
    for (axis, (&want, &got)) in rest.iter().zip(calibration.shape()).enumerate() {
        if want != got {
            return Err(ReductionError::dimension_mismatch(
                stage,
                format!("axis {}", axis + 1),
                want,
                got,
            ));
        }
    }
    Ok(())
}

/// Remember the incoming q-axis and write it as a scan constant labelling the last data axis.
pub(crate) fn echo_q_axis(
    info: &StageInfo,
    slot: &mut Option<FrameBuffer>,
    incoming: Option<&FrameBuffer>,
    data_rank: usize,
    sink: &mut dyn OutputSink,
) {
    *slot = incoming.map(|q| q.clone().with_name(Q_FIELD));
    if let Some(q) = slot.as_ref() {
        sink.put(
            &info.name,
            q.clone(),
            Some(Q_UNITS),
            data_rank.checked_sub(1),
            false,
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::data::buffer::{ElementType, FrameBuffer};
    use crate::data::sink::{MemorySink, OutputSink, DATA_FIELD};

    /// Sink holding `values` with `shape` under node `node`.
    pub fn sink_with(node: &str, shape: &[usize], values: Vec<f64>) -> MemorySink {
        let mut sink = MemorySink::new();
        put(&mut sink, node, shape, values);
        sink
    }

    /// Write a per-point primary buffer.
    pub fn put(sink: &mut MemorySink, node: &str, shape: &[usize], values: Vec<f64>) {
        let buffer = FrameBuffer::new(DATA_FIELD, shape, ElementType::Float64, Some(values))
            .unwrap();
        sink.put(node, buffer, None, None, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::test_support::sink_with;
    use ndarray::ArrayD;

    #[test]
    fn read_frames_limits_to_leading_frames() {
        let sink = sink_with("raw", &[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let ctx = PointContext {
            frames: 2,
            upstream: "raw",
            q_axis: None,
        };
        let data = read_frames("avg", &ctx, &sink).unwrap();
        assert_eq!(data.shape(), &[2, 2]);
        assert_eq!(data.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn read_frames_reports_missing_and_short_inputs() {
        let sink = sink_with("raw", &[1, 2], vec![1.0, 2.0]);
        let missing = PointContext {
            frames: 1,
            upstream: "nope",
            q_axis: None,
        };
        assert_eq!(
            read_frames("avg", &missing, &sink),
            Err(ReductionError::missing_input("avg", "nope"))
        );

        let short = PointContext {
            frames: 4,
            upstream: "raw",
            q_axis: None,
        };
        assert!(matches!(
            read_frames("avg", &short, &sink),
            Err(ReductionError::DimensionMismatch { ref dimension, .. }) if dimension == "frames"
        ));
    }

    #[test]
    fn check_frame_shape_names_offending_axis() {
        let data = ArrayD::<f64>::zeros(vec![2, 4, 5]);
        let good = ArrayD::<f64>::zeros(vec![4, 5]);
        let bad = ArrayD::<f64>::zeros(vec![4, 6]);
        assert!(check_frame_shape("resp", &data, &good).is_ok());
        match check_frame_shape("resp", &data, &bad) {
            Err(ReductionError::DimensionMismatch {
                stage, dimension, ..
            }) => {
                assert_eq!(stage, "resp");
                assert_eq!(dimension, "axis 2");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
