//! Output sink contract and an in-memory reference implementation.
//!
//! The sink is the hierarchical tree stages deposit their results into: one
//! node per stage name, holding named data fields and descriptive attributes.
//! It is also the dataflow medium between stages, since a stage reads its input
//! by looking up the node of the stage (or raw source) it depends on.

use crate::data::buffer::FrameBuffer;
use std::collections::BTreeMap;
use tracing::trace;

/// Field name of a node's primary data.
pub const DATA_FIELD: &str = "data";

/// Destination for stage outputs.
///
/// Implementations are driven from a single thread, one stage after another.
/// Entries written with `per_point == false` are scan constants: the first
/// write is kept and later ones are ignored.
pub trait OutputSink {
    /// Primary data (the [`DATA_FIELD`] field) of node `name`.
    fn get(&self, name: &str) -> Option<&FrameBuffer> {
        self.get_field(name, DATA_FIELD)
    }

    /// A specific field of node `node`.
    fn get_field(&self, node: &str, field: &str) -> Option<&FrameBuffer>;

    /// Deposit `buffer` under node `stage`, using the buffer's name as field name.
    fn put(
        &mut self,
        stage: &str,
        buffer: FrameBuffer,
        units: Option<&str>,
        axis: Option<usize>,
        per_point: bool,
    );

    /// Attach a descriptive string attribute to node `stage`.
    fn put_metadata_string(&mut self, stage: &str, key: &str, value: &str);

    /// Attach a scalar attribute to node `stage`.
    fn put_metadata_scalar(&mut self, stage: &str, key: &str, value: f64);

    /// Called before the raw data of a new point is deposited.
    ///
    /// Sinks that keep per-point data visible across calls must hide it here,
    /// so a stage that writes nothing cannot leave stale output for its
    /// dependents.
    fn begin_point(&mut self) {}
}

/// One data field stored in a sink node.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEntry {
    /// The data.
    pub buffer: FrameBuffer,
    /// Physical units, if any.
    pub units: Option<String>,
    /// Axis index this field labels, when it is an axis.
    pub axis: Option<usize>,
    /// Per-point data versus scan constant.
    pub per_point: bool,
}

/// A node of the [`MemorySink`] tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkNode {
    /// Data fields keyed by field name.
    pub fields: BTreeMap<String, SinkEntry>,
    /// String attributes.
    pub strings: BTreeMap<String, String>,
    /// Scalar attributes.
    pub scalars: BTreeMap<String, f64>,
}

/// In-memory tree sink.
///
/// Holds the current point's per-point fields alongside the scan constants.
/// [`OutputSink::begin_point`] archives the per-point fields of the finished
/// point so the next point starts from a clean slate.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    nodes: BTreeMap<String, SinkNode>,
    history: Vec<BTreeMap<String, BTreeMap<String, SinkEntry>>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node `name`, if anything was written to it.
    pub fn node(&self, name: &str) -> Option<&SinkNode> {
        self.nodes.get(name)
    }

    /// Full entry of a field, including units and flags.
    pub fn entry(&self, node: &str, field: &str) -> Option<&SinkEntry> {
        self.nodes.get(node).and_then(|n| n.fields.get(field))
    }

    /// Names of all nodes.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Per-point fields of previously finished points, oldest first.
    pub fn history(&self) -> &[BTreeMap<String, BTreeMap<String, SinkEntry>>] {
        &self.history
    }

    fn node_mut(&mut self, name: &str) -> &mut SinkNode {
        self.nodes.entry(name.to_string()).or_default()
    }
}

impl OutputSink for MemorySink {
    fn get_field(&self, node: &str, field: &str) -> Option<&FrameBuffer> {
        self.entry(node, field).map(|e| &e.buffer)
    }

    fn put(
        &mut self,
        stage: &str,
        buffer: FrameBuffer,
        units: Option<&str>,
        axis: Option<usize>,
        per_point: bool,
    ) {
        let node = self.node_mut(stage);
        let field = buffer.name().to_string();
        if let Some(existing) = node.fields.get(&field) {
            if !existing.per_point {
                trace!(stage = %stage, field = %field, "scan constant already written");
                return;
            }
        }
        node.fields.insert(
            field,
            SinkEntry {
                buffer,
                units: units.map(str::to_string),
                axis,
                per_point,
            },
        );
    }

    fn put_metadata_string(&mut self, stage: &str, key: &str, value: &str) {
        self.node_mut(stage)
            .strings
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    fn put_metadata_scalar(&mut self, stage: &str, key: &str, value: f64) {
        self.node_mut(stage)
            .scalars
            .entry(key.to_string())
            .or_insert(value);
    }

    /// Archive the current per-point fields and clear them.
    fn begin_point(&mut self) {
        let mut archived = BTreeMap::new();
        for (name, node) in self.nodes.iter_mut() {
            let (per_point, constant): (BTreeMap<_, _>, BTreeMap<_, _>) =
                std::mem::take(&mut node.fields)
                    .into_iter()
                    .partition(|(_, entry)| entry.per_point);
            node.fields = constant;
            if !per_point.is_empty() {
                archived.insert(name.clone(), per_point);
            }
        }
        if !archived.is_empty() {
            self.history.push(archived);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::buffer::ElementType;

    fn buffer(name: &str, value: f64) -> FrameBuffer {
        FrameBuffer::new(name, &[2], ElementType::Float64, Some(vec![value; 2])).unwrap()
    }

    #[test]
    fn get_returns_primary_data_field() {
        let mut sink = MemorySink::new();
        sink.put("avg", buffer(DATA_FIELD, 1.0), Some("counts"), None, true);
        sink.put("avg", buffer("q", 2.0), Some("1/A"), Some(0), false);

        assert_eq!(sink.get("avg").unwrap().to_vec_f64(), vec![1.0, 1.0]);
        assert_eq!(sink.get_field("avg", "q").unwrap().to_vec_f64(), vec![2.0, 2.0]);
        assert_eq!(sink.entry("avg", "q").unwrap().units.as_deref(), Some("1/A"));
        assert!(sink.get("missing").is_none());
    }

    #[test]
    fn scan_constants_are_written_once() {
        let mut sink = MemorySink::new();
        sink.put("saxs", buffer("mask", 1.0), None, None, false);
        sink.put("saxs", buffer("mask", 5.0), None, None, false);
        sink.put_metadata_string("saxs", "detector_type", "SAXS");
        sink.put_metadata_string("saxs", "detector_type", "WAXS");

        assert_eq!(sink.get_field("saxs", "mask").unwrap().to_vec_f64(), vec![1.0, 1.0]);
        assert_eq!(sink.node("saxs").unwrap().strings["detector_type"], "SAXS");
    }

    #[test]
    fn per_point_data_is_overwritten_and_archived() {
        let mut sink = MemorySink::new();
        sink.put("bg", buffer(DATA_FIELD, 1.0), None, None, true);
        sink.put("bg", buffer("q", 9.0), None, Some(0), false);
        sink.begin_point();

        assert!(sink.get("bg").is_none());
        assert!(sink.get_field("bg", "q").is_some());
        assert_eq!(sink.history().len(), 1);

        sink.put("bg", buffer(DATA_FIELD, 2.0), None, None, true);
        sink.put("bg", buffer(DATA_FIELD, 3.0), None, None, true);
        assert_eq!(sink.get("bg").unwrap().to_vec_f64(), vec![3.0, 3.0]);
    }
}
