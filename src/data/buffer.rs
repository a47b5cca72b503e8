//! Named, shaped, typed multi-dimensional buffers.
//!
//! A [`FrameBuffer`] is the unit of data that moves between reduction stages and
//! into the output sink. Per-point buffers are laid out as
//! `[frames, ...spatial dims]` in row-major order; per-scan buffers (masks,
//! axes, geometry echoes) carry whatever shape they need.
//!
//! Storage is an `ndarray::ArrayD` of one of three element types. Stages do
//! their arithmetic in `f64` through [`FrameBuffer::to_f64`] and hand back
//! `Float64` buffers.

use crate::error::{AppResult, ReductionError};
use ndarray::{ArrayD, Axis, IxDyn, Slice};

/// Element type of a [`FrameBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// 32-bit signed integer (raw detector counts).
    Int32,
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Int32 => "int32",
        };
        write!(f, "{}", label)
    }
}

/// Typed storage behind a [`FrameBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    /// 32-bit float storage.
    Float32(ArrayD<f32>),
    /// 64-bit float storage.
    Float64(ArrayD<f64>),
    /// 32-bit integer storage.
    Int32(ArrayD<i32>),
}

impl BufferData {
    fn shape(&self) -> &[usize] {
        match self {
            BufferData::Float32(a) => a.shape(),
            BufferData::Float64(a) => a.shape(),
            BufferData::Int32(a) => a.shape(),
        }
    }

    fn element_type(&self) -> ElementType {
        match self {
            BufferData::Float32(_) => ElementType::Float32,
            BufferData::Float64(_) => ElementType::Float64,
            BufferData::Int32(_) => ElementType::Int32,
        }
    }
}

/// A named multi-dimensional numeric buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    name: String,
    data: BufferData,
}

impl FrameBuffer {
    /// Build a buffer from a shape, an element type and optional flat row-major data.
    ///
    /// Without data the buffer is zero filled. With data, `data.len()` must equal
    /// the product of `shape`; values are converted to `element_type`
    /// (float to integer conversion truncates toward zero and saturates).
    pub fn new(
        name: impl Into<String>,
        shape: &[usize],
        element_type: ElementType,
        data: Option<Vec<f64>>,
    ) -> AppResult<Self> {
        let expected: usize = shape.iter().product();
        let flat = match data {
            Some(values) => {
                if values.len() != expected {
                    return Err(ReductionError::Shape(format!(
                        "{} elements supplied for shape {:?} ({} required)",
                        values.len(),
                        shape,
                        expected
                    )));
                }
                values
            }
            None => vec![0.0; expected],
        };
        let array = ArrayD::from_shape_vec(IxDyn(shape), flat)?;
        Ok(Self::from_f64(name, array).cast(element_type))
    }

    /// Wrap an existing `f64` array.
    pub fn from_f64(name: impl Into<String>, array: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            data: BufferData::Float64(array),
        }
    }

    /// Wrap an existing `f32` array.
    pub fn from_f32(name: impl Into<String>, array: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            data: BufferData::Float32(array),
        }
    }

    /// Wrap an existing `i32` array.
    pub fn from_i32(name: impl Into<String>, array: ArrayD<i32>) -> Self {
        Self {
            name: name.into(),
            data: BufferData::Int32(array),
        }
    }

    /// Buffer name (the field name it is written under).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same data under a different name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Dimension sizes.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// True when the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the leading (frame) axis, `None` for a scalar buffer.
    pub fn frames(&self) -> Option<usize> {
        self.shape().first().copied()
    }

    /// Element type of the storage.
    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    /// Borrow the typed storage.
    pub fn data(&self) -> &BufferData {
        &self.data
    }

    /// Borrow the storage when it is already `f64`.
    pub fn as_f64(&self) -> Option<&ArrayD<f64>> {
        match &self.data {
            BufferData::Float64(a) => Some(a),
            _ => None,
        }
    }

    /// Copy of the data as `f64`, whatever the element type.
    pub fn to_f64(&self) -> ArrayD<f64> {
        match &self.data {
            BufferData::Float32(a) => a.mapv(f64::from),
            BufferData::Float64(a) => a.clone(),
            BufferData::Int32(a) => a.mapv(f64::from),
        }
    }

    /// Flat row-major copy of the data as `f64`.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        self.to_f64().iter().copied().collect()
    }

    /// Reinterpret the data under a new shape with the same element count.
    pub fn reshape(self, shape: &[usize]) -> AppResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != self.len() {
            return Err(ReductionError::Shape(format!(
                "cannot reshape '{}' from {:?} to {:?}: element count {} != {}",
                self.name,
                self.shape(),
                shape,
                self.len(),
                expected
            )));
        }
        let dim = IxDyn(shape);
        let data = match self.data {
            BufferData::Float32(a) => BufferData::Float32(
                a.as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(dim)?,
            ),
            BufferData::Float64(a) => BufferData::Float64(
                a.as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(dim)?,
            ),
            BufferData::Int32(a) => BufferData::Int32(
                a.as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(dim)?,
            ),
        };
        Ok(Self {
            name: self.name,
            data,
        })
    }

    /// Copy `count` entries of the leading axis starting at `start`.
    ///
    /// Used to extract the new frames of a scan point from a larger device buffer.
    pub fn slice_frames(&self, start: usize, count: usize) -> AppResult<Self> {
        let available = self.frames().ok_or_else(|| {
            ReductionError::Shape(format!("'{}' is a scalar buffer", self.name))
        })?;
        let end = start.checked_add(count).unwrap_or(usize::MAX);
        if end > available {
            return Err(ReductionError::Shape(format!(
                "frames {}..{} out of range for '{}' with {} frames",
                start, end, self.name, available
            )));
        }
        let slice = Slice::from(start..end);
        let data = match &self.data {
            BufferData::Float32(a) => BufferData::Float32(a.slice_axis(Axis(0), slice).to_owned()),
            BufferData::Float64(a) => BufferData::Float64(a.slice_axis(Axis(0), slice).to_owned()),
            BufferData::Int32(a) => BufferData::Int32(a.slice_axis(Axis(0), slice).to_owned()),
        };
        Ok(Self {
            name: self.name.clone(),
            data,
        })
    }

    /// Convert the storage to another element type.
    ///
    /// `Float32 -> Float64` is exact. `Float64 -> Float32` rounds to nearest and
    /// may lose precision; this is expected, not an error.
    pub fn cast(self, element_type: ElementType) -> Self {
        if self.element_type() == element_type {
            return self;
        }
        let data = match (self.data, element_type) {
            (BufferData::Float32(a), ElementType::Float64) => BufferData::Float64(a.mapv(f64::from)),
            (BufferData::Int32(a), ElementType::Float64) => BufferData::Float64(a.mapv(f64::from)),
            (BufferData::Float64(a), ElementType::Float32) => {
                BufferData::Float32(a.mapv(|v| v as f32))
            }
            (BufferData::Int32(a), ElementType::Float32) => BufferData::Float32(a.mapv(|v| v as f32)),
            (BufferData::Float64(a), ElementType::Int32) => BufferData::Int32(a.mapv(|v| v as i32)),
            (BufferData::Float32(a), ElementType::Int32) => BufferData::Int32(a.mapv(|v| v as i32)),
            (data, _) => data,
        };
        Self {
            name: self.name,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_element_count() {
        let err = FrameBuffer::new("raw", &[2, 3], ElementType::Float64, Some(vec![1.0; 5]));
        assert!(matches!(err, Err(ReductionError::Shape(_))));

        let ok = FrameBuffer::new("raw", &[2, 3], ElementType::Float32, None).unwrap();
        assert_eq!(ok.shape(), &[2, 3]);
        assert_eq!(ok.element_type(), ElementType::Float32);
        assert_eq!(ok.to_vec_f64(), vec![0.0; 6]);
    }

    #[test]
    fn reshape_preserves_total_count() {
        let buf = FrameBuffer::new(
            "raw",
            &[2, 2, 2],
            ElementType::Float64,
            Some((0..8).map(f64::from).collect()),
        )
        .unwrap();
        let flat = buf.clone().reshape(&[8]).unwrap();
        assert_eq!(flat.shape(), &[8]);
        assert_eq!(flat.to_vec_f64(), buf.to_vec_f64());

        assert!(buf.reshape(&[3, 3]).is_err());
    }

    #[test]
    fn slice_frames_copies_leading_axis() {
        let buf = FrameBuffer::new(
            "raw",
            &[4, 2],
            ElementType::Int32,
            Some((0..8).map(f64::from).collect()),
        )
        .unwrap();
        let slice = buf.slice_frames(1, 2).unwrap();
        assert_eq!(slice.shape(), &[2, 2]);
        assert_eq!(slice.to_vec_f64(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(slice.element_type(), ElementType::Int32);

        assert!(buf.slice_frames(3, 2).is_err());
    }

    #[test]
    fn cast_round_trips_through_wider_type() {
        let buf = FrameBuffer::new("raw", &[3], ElementType::Float32, Some(vec![0.5, 1.25, -2.0]))
            .unwrap();
        let wide = buf.clone().cast(ElementType::Float64);
        assert_eq!(wide.element_type(), ElementType::Float64);
        assert_eq!(wide.as_f64().unwrap().as_slice().unwrap(), &[0.5, 1.25, -2.0]);
        assert_eq!(wide.cast(ElementType::Float32), buf);
    }

    #[test]
    fn narrowing_cast_rounds() {
        let buf = FrameBuffer::new("raw", &[1], ElementType::Float64, Some(vec![0.1])).unwrap();
        let narrow = buf.cast(ElementType::Float32);
        assert_eq!(narrow.to_vec_f64(), vec![f64::from(0.1f32)]);
    }
}
