//! Frame buffers, calibration types, the output sink and stage construction.
pub mod buffer;
pub mod calibration;
pub mod registry;
pub mod sink;
