//! Ordered execution of reduction stages.
//!
//! The chain resolves every stage's upstream node once, when it is built: a
//! stage reads the output of the stage before it (the raw key for the first
//! stage) unless it declares an explicit [`ReductionStage::key`]. The
//! resulting `(stage, upstream)` pairs never change while the chain exists.
//!
//! Per point, failures are isolated. A failing stage is logged and recorded in
//! the [`PointReport`]; stages that depend on it are skipped, while stages
//! reading other nodes still run.

use crate::config::ChainSettings;
use crate::data::buffer::FrameBuffer;
use crate::data::registry::StageRegistry;
use crate::data::sink::{OutputSink, DATA_FIELD};
use crate::error::{AppResult, ReductionError};
use crate::reduction::{PointContext, ReductionStage};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// What happened to one stage during a point.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage ran and returned successfully.
    Written,
    /// The stage's input or calibration was unavailable; nothing was written.
    Skipped(ReductionError),
    /// The stage ran and failed; nothing further was written by it.
    Failed(ReductionError),
}

impl StageOutcome {
    /// True for [`StageOutcome::Written`].
    pub fn is_written(&self) -> bool {
        matches!(self, StageOutcome::Written)
    }

    /// The error behind a skip or failure.
    pub fn error(&self) -> Option<&ReductionError> {
        match self {
            StageOutcome::Written => None,
            StageOutcome::Skipped(err) | StageOutcome::Failed(err) => Some(err),
        }
    }
}

/// Outcome of every stage for one point, in chain order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointReport {
    /// `(stage name, outcome)` pairs.
    pub outcomes: Vec<(String, StageOutcome)>,
}

impl PointReport {
    /// True when every stage wrote its output.
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_written())
    }

    /// Outcome of stage `name`.
    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// Stages that failed outright, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ReductionError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            StageOutcome::Failed(err) => Some((name.as_str(), err)),
            _ => None,
        })
    }
}

struct Link {
    stage: Box<dyn ReductionStage>,
    upstream: String,
}

/// Builder for [`ReductionChain`].
pub struct ChainBuilder {
    raw_key: String,
    stages: Vec<Box<dyn ReductionStage>>,
}

impl ChainBuilder {
    /// Append a stage.
    pub fn stage(mut self, stage: Box<dyn ReductionStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Resolve upstream names and check that stage names are unique.
    pub fn build(self) -> AppResult<ReductionChain> {
        let mut seen = HashSet::new();
        let mut links = Vec::with_capacity(self.stages.len());
        let mut previous = self.raw_key.clone();

        for stage in self.stages {
            let name = stage.name().to_string();
            if name == self.raw_key || !seen.insert(name.clone()) {
                return Err(ReductionError::DuplicateStageName(name));
            }
            let upstream = stage
                .key()
                .map(str::to_string)
                .unwrap_or_else(|| previous.clone());
            debug!(stage = %name, upstream = %upstream, "linked stage");
            previous = name;
            links.push(Link { stage, upstream });
        }

        Ok(ReductionChain {
            raw_key: self.raw_key,
            links,
        })
    }
}

/// An ordered list of stages fed from one raw data node.
pub struct ReductionChain {
    raw_key: String,
    links: Vec<Link>,
}

impl std::fmt::Debug for ReductionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionChain")
            .field("raw_key", &self.raw_key)
            .field("links", &self.links().collect::<Vec<_>>())
            .finish()
    }
}

impl ReductionChain {
    /// Start building a chain whose first stage reads `raw_key`.
    pub fn builder(raw_key: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            raw_key: raw_key.into(),
            stages: Vec::new(),
        }
    }

    /// Build a chain from its configuration, creating stages through `registry`.
    pub fn from_settings(settings: &ChainSettings, registry: &StageRegistry) -> AppResult<Self> {
        let mut builder = Self::builder(&settings.raw_key);
        for config in &settings.stages {
            builder = builder.stage(registry.create(&config.r#type, config.info(), &config.params)?);
        }
        let chain = builder.build()?;
        info!(raw_key = %chain.raw_key, stages = chain.len(), "reduction chain configured");
        Ok(chain)
    }

    /// Node the first stage reads.
    pub fn raw_key(&self) -> &str {
        &self.raw_key
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True when the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// `(stage name, upstream node)` pairs in execution order.
    pub fn links(&self) -> impl Iterator<Item = (&str, &str)> {
        self.links
            .iter()
            .map(|l| (l.stage.name(), l.upstream.as_str()))
    }

    /// Upstream node of stage `name`.
    pub fn upstream_of(&self, name: &str) -> Option<&str> {
        self.links()
            .find(|(stage, _)| *stage == name)
            .map(|(_, upstream)| upstream)
    }

    /// Stage called `name`.
    pub fn stage(&self, name: &str) -> Option<&dyn ReductionStage> {
        self.links
            .iter()
            .find(|l| l.stage.name() == name)
            .map(|l| l.stage.as_ref())
    }

    /// Mutable access to stage `name`, for recalibration between scans.
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut Box<dyn ReductionStage>> {
        self.links
            .iter_mut()
            .find(|l| l.stage.name() == name)
            .map(|l| &mut l.stage)
    }

    /// Stage `name` as its concrete type, e.g. to set a background frame on a
    /// chain built from configuration.
    pub fn stage_as_mut<T: ReductionStage + 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.stage_mut(name)
            .and_then(|stage| stage.as_any_mut().downcast_mut::<T>())
    }

    /// Forward the scan start to every stage; the first error aborts the scan.
    pub fn at_scan_start(&mut self) -> AppResult<()> {
        for link in &mut self.links {
            if let Err(err) = link.stage.at_scan_start() {
                error!(stage = %link.stage.name(), error = %err, "stage rejected scan start");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Forward the scan end to every stage.
    pub fn at_scan_end(&mut self) {
        for link in &mut self.links {
            link.stage.at_scan_end();
        }
    }

    /// Start a new point: deposit the leading `frames` frames of `raw` under
    /// the raw key, then run every stage.
    pub fn push_raw(
        &mut self,
        raw: &FrameBuffer,
        frames: usize,
        sink: &mut dyn OutputSink,
    ) -> AppResult<PointReport> {
        let point = raw.slice_frames(0, frames)?.with_name(DATA_FIELD);
        sink.begin_point();
        sink.put(&self.raw_key, point, None, None, true);
        Ok(self.writeout(frames, sink))
    }

    /// Run every stage for one point whose raw data is already in `sink`.
    pub fn writeout(&mut self, frames: usize, sink: &mut dyn OutputSink) -> PointReport {
        let mut report = PointReport::default();
        let mut unavailable: HashSet<String> = HashSet::new();
        let mut q_axes: HashMap<String, FrameBuffer> = HashMap::new();
        let mut frame_counts: HashMap<String, usize> = HashMap::new();

        for link in &mut self.links {
            let name = link.stage.name().to_string();
            let frames = frame_counts.get(&link.upstream).copied().unwrap_or(frames);
            let outcome = if unavailable.contains(&link.upstream) {
                let err = ReductionError::missing_input(&name, &link.upstream);
                warn!(stage = %name, key = %link.upstream, "upstream produced no output, skipping");
                StageOutcome::Skipped(err)
            } else {
                let ctx = PointContext {
                    frames,
                    upstream: &link.upstream,
                    q_axis: q_axes.get(&link.upstream),
                };
                match link.stage.writeout(&ctx, sink) {
                    Ok(()) => StageOutcome::Written,
                    Err(err @ ReductionError::Unconfigured { .. }) => {
                        info!(stage = %name, error = %err, "stage skipped");
                        StageOutcome::Skipped(err)
                    }
                    Err(err) if err.is_skip() => {
                        warn!(stage = %name, error = %err, "stage skipped");
                        StageOutcome::Skipped(err)
                    }
                    Err(err) => {
                        error!(stage = %name, error = %err, "stage failed");
                        StageOutcome::Failed(err)
                    }
                }
            };

            if outcome.is_written() {
                if let Some(q) = link.stage.q_axis() {
                    q_axes.insert(name.clone(), q);
                }
                let produced = if link.stage.reduces_frames() {
                    sink.get(&name).and_then(FrameBuffer::frames).unwrap_or(1)
                } else {
                    frames
                };
                frame_counts.insert(name.clone(), produced);
            } else {
                unavailable.insert(name.clone());
            }
            report.outcomes.push((name, outcome));
        }

        debug!(
            stages = report.outcomes.len(),
            clean = report.is_clean(),
            "point reduced"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sink::MemorySink;
    use crate::reduction::average::Average;
    use crate::reduction::background::BackgroundSubtraction;
    use crate::reduction::invariant::Invariant;
    use crate::reduction::scale::Scale;
    use crate::reduction::test_support::sink_with;
    use crate::reduction::StageInfo;
    use tracing_test::traced_test;

    struct Failing;

    impl ReductionStage for Failing {
        fn name(&self) -> &str {
            "broken"
        }

        fn detector_type(&self) -> &str {
            "TEST"
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }

        fn writeout(&mut self, _ctx: &PointContext<'_>, _sink: &mut dyn OutputSink) -> AppResult<()> {
            Err(ReductionError::dimension_mismatch("broken", "rank", 3, 2))
        }
    }

    #[test]
    fn stages_read_previous_output_by_default() {
        let chain = ReductionChain::builder("raw")
            .stage(Box::new(Scale::new("a", 2.0, 0.0)))
            .stage(Box::new(Scale::new("b", 1.0, 1.0)))
            .stage(Box::new(Invariant::with_info(StageInfo::new("c").with_key("a"))))
            .build()
            .unwrap();

        let links: Vec<_> = chain.links().collect();
        assert_eq!(links, vec![("a", "raw"), ("b", "a"), ("c", "a")]);
        assert_eq!(chain.upstream_of("b"), Some("a"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ReductionChain::builder("raw")
            .stage(Box::new(Average::new("avg")))
            .stage(Box::new(Average::new("avg")))
            .build();
        assert!(matches!(result, Err(ReductionError::DuplicateStageName(ref n)) if n == "avg"));

        let shadowing = ReductionChain::builder("raw")
            .stage(Box::new(Average::new("raw")))
            .build();
        assert!(shadowing.is_err());
    }

    #[test]
    fn dependents_of_a_failed_stage_are_skipped() {
        let mut chain = ReductionChain::builder("raw")
            .stage(Box::new(Failing))
            .stage(Box::new(Average::new("avg")))
            .build()
            .unwrap();
        let mut sink = sink_with("raw", &[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        // Stale output from an earlier point must not be picked up.
        sink.put(
            "broken",
            FrameBuffer::from_f64(DATA_FIELD, ndarray::arr1(&[9.0]).into_dyn()),
            None,
            None,
            true,
        );

        let report = chain.writeout(2, &mut sink);
        assert!(matches!(report.outcome("broken"), Some(StageOutcome::Failed(_))));
        assert!(matches!(
            report.outcome("avg"),
            Some(StageOutcome::Skipped(ReductionError::MissingInput { .. }))
        ));
        assert!(sink.get("avg").is_none());
        assert_eq!(report.failures().count(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    #[traced_test]
    fn failures_are_logged_and_the_chain_carries_on() {
        let mut chain = ReductionChain::builder("raw")
            .stage(Box::new(Scale::new("first", 2.0, 0.0)))
            .stage(Box::new(Failing))
            .stage(Box::new(Invariant::with_info(StageInfo::new("sum").with_key("first"))))
            .build()
            .unwrap();
        let mut sink = sink_with("raw", &[1, 2], vec![1.0, 2.0]);

        let report = chain.writeout(1, &mut sink);
        assert_eq!(report.outcome("sum"), Some(&StageOutcome::Written));
        assert_eq!(sink.get("sum").unwrap().to_vec_f64(), vec![6.0]);
        assert!(logs_contain("stage failed"));
        assert!(logs_contain("broken"));
    }

    #[test]
    #[traced_test]
    fn missing_raw_data_is_a_warning() {
        let mut chain = ReductionChain::builder("raw")
            .stage(Box::new(Average::new("avg")))
            .build()
            .unwrap();
        let mut sink = MemorySink::new();

        let report = chain.writeout(1, &mut sink);
        assert!(matches!(report.outcome("avg"), Some(StageOutcome::Skipped(_))));
        assert!(logs_contain("stage skipped"));
        assert!(!logs_contain("stage failed"));
    }

    #[test]
    #[traced_test]
    fn unset_background_is_reported_as_skipped() {
        let mut chain = ReductionChain::builder("raw")
            .stage(Box::new(BackgroundSubtraction::new("bg")))
            .stage(Box::new(Average::new("avg")))
            .build()
            .unwrap();
        let mut sink = sink_with("raw", &[1, 2], vec![1.0, 2.0]);

        let report = chain.writeout(1, &mut sink);
        assert!(matches!(
            report.outcome("bg"),
            Some(StageOutcome::Skipped(ReductionError::Unconfigured { .. }))
        ));
        assert!(matches!(
            report.outcome("avg"),
            Some(StageOutcome::Skipped(ReductionError::MissingInput { ref key, .. })) if key == "bg"
        ));
        assert_eq!(report.failures().count(), 0);
        assert!(logs_contain("no background configured"));
        assert!(!logs_contain("stage failed"));
    }

    #[test]
    fn push_raw_slices_frames_and_starts_a_new_point() {
        let mut chain = ReductionChain::builder("det")
            .stage(Box::new(Average::new("avg")))
            .build()
            .unwrap();
        let mut sink = MemorySink::new();
        let raw = FrameBuffer::from_f64(
            "device",
            ndarray::Array::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 100.0, 100.0])
                .unwrap()
                .into_dyn(),
        );

        let report = chain.push_raw(&raw, 2, &mut sink).unwrap();
        assert!(report.is_clean());
        assert_eq!(sink.get("det").unwrap().shape(), &[2, 2]);
        assert_eq!(sink.get("avg").unwrap().to_vec_f64(), vec![2.0, 3.0]);

        chain.push_raw(&raw, 1, &mut sink).unwrap();
        assert_eq!(sink.get("avg").unwrap().to_vec_f64(), vec![1.0, 2.0]);
        assert_eq!(sink.history().len(), 1);
    }

    #[test]
    fn stages_can_be_recalibrated_by_type() {
        let mut chain = ReductionChain::builder("raw")
            .stage(Box::new(Scale::new("abs", 1.0, 0.0)))
            .stage(Box::new(BackgroundSubtraction::new("bg")))
            .build()
            .unwrap();
        assert!(chain.stage_as_mut::<Average>("bg").is_none());

        let bg = chain
            .stage_as_mut::<BackgroundSubtraction>("bg")
            .unwrap();
        bg.set_background(ndarray::arr1(&[1.0, 1.0]).into_dyn());

        let mut sink = sink_with("raw", &[1, 2], vec![3.0, 4.0]);
        assert!(chain.writeout(1, &mut sink).is_clean());
        assert_eq!(sink.get("bg").unwrap().to_vec_f64(), vec![2.0, 3.0]);
    }

    #[test]
    fn push_raw_rejects_more_frames_than_available() {
        let mut chain = ReductionChain::builder("det").build().unwrap();
        let mut sink = MemorySink::new();
        let raw = FrameBuffer::from_f64("device", ndarray::ArrayD::zeros(vec![1, 4]));
        assert!(chain.push_raw(&raw, 3, &mut sink).is_err());
        assert!(sink.get("det").is_none());
    }
}
