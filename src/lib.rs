//! # NCD Reduction Library
//!
//! This crate implements the per-scan-point reduction pipeline for non-crystalline
//! diffraction (SAXS/WAXS) area and linear detectors. A driver hands the chain a raw
//! detector buffer once per scan point; the chain pushes it through an ordered list
//! of stages (response correction, background subtraction, normalisation, averaging,
//! invariant, sector integration) and every stage deposits its named results into an
//! output sink.
//!
//! ## Crate Structure
//!
//! - **`config`**: Loads chain and stage declarations from TOML files. See `config::Settings`.
//! - **`data`**: Frame buffers, per-stage calibration types, the `OutputSink` contract with an
//!   in-memory implementation, and the `StageRegistry` that turns configuration into stages.
//! - **`error`**: Defines the `ReductionError` enum for centralized error handling.
//! - **`logging`**: `tracing-subscriber` initialisation for hosts that want formatted output.
//! - **`reduction`**: The `ReductionStage` trait, the concrete stages and `ReductionChain`.
//!
//! ## Example
//!
//! ```
//! use ncd_reduction::data::buffer::FrameBuffer;
//! use ncd_reduction::data::calibration::{SectorGeometry, SymmetryMode};
//! use ncd_reduction::data::sink::{MemorySink, OutputSink};
//! use ncd_reduction::reduction::chain::ReductionChain;
//! use ncd_reduction::reduction::sector::SectorIntegration;
//! use ndarray::ArrayD;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let geometry = SectorGeometry::new([2.0, 2.0], [0.0, 2.0], [0.0, 0.0])
//!     .with_symmetry(SymmetryMode::Full);
//! let mut chain = ReductionChain::builder("detector")
//!     .stage(Box::new(SectorIntegration::new("saxs", geometry)))
//!     .build()?;
//!
//! let mut sink = MemorySink::new();
//! let raw = FrameBuffer::from_f64("detector", ArrayD::from_elem(vec![1, 4, 4], 10.0));
//! chain.at_scan_start()?;
//! let report = chain.push_raw(&raw, 1, &mut sink)?;
//! chain.at_scan_end();
//!
//! assert!(report.is_clean());
//! assert_eq!(sink.get("saxs").map(|b| b.shape().to_vec()), Some(vec![1, 2]));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod reduction;
