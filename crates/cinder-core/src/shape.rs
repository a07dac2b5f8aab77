//! Allocation shapes with stack-allocated storage for ≤4 dimensions.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, Result};

/// An ordered sequence of positive extents.
///
/// The byte size derived from a shape is immutable for the lifetime of an
/// allocation; the only permitted shape change is the in-place 2-D transpose,
/// which is a permutation of the same element count.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Create a shape, validating that every extent is positive.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::Configuration(
                "shape must have at least one dimension".into(),
            ));
        }
        if let Some(zero) = dims.iter().position(|&d| d == 0) {
            return Err(Error::Configuration(format!(
                "shape extent at axis {zero} must be positive"
            )));
        }
        Ok(Self {
            dims: SmallVec::from_slice(dims),
        })
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of a specific dimension.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// The reversed shape of a 2-D matrix. Defined for rank 2 only.
    pub fn transposed(&self) -> Result<Shape> {
        if self.ndim() != 2 {
            return Err(Error::UnsupportedRank { ndim: self.ndim() });
        }
        Ok(Shape {
            dims: SmallVec::from_slice(&[self.dims[1], self.dims[0]]),
        })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
