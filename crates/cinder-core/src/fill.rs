//! Fill sources for new allocations and scalar operands.
//!
//! The source design dispatched on the runtime type of the fill argument
//! (scalar, sequence, host array, or another handle). Here each case is a
//! variant of [`Fill`], resolved by exhaustive matching.

use num_complex::{Complex32, Complex64};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::memory::{DevicePtr, UnifiedPtr};

/// A single element value, tagged by its natural element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F32(f32),
    F64(f64),
    C32(Complex32),
    C64(Complex64),
}

impl Scalar {
    pub fn dtype(&self) -> DType {
        match self {
            Scalar::F32(_) => DType::F32,
            Scalar::F64(_) => DType::F64,
            Scalar::C32(_) => DType::C32,
            Scalar::C64(_) => DType::C64,
        }
    }

    /// The value as (re, im) in double precision.
    fn components(&self) -> (f64, f64) {
        match *self {
            Scalar::F32(v) => (v as f64, 0.0),
            Scalar::F64(v) => (v, 0.0),
            Scalar::C32(v) => (v.re as f64, v.im as f64),
            Scalar::C64(v) => (v.re, v.im),
        }
    }

    /// Encode as one element of `dtype` in native byte order, casting the
    /// value into the destination type the way a host array fill would.
    /// A complex value cannot land in a real dtype.
    pub(crate) fn encode(&self, dtype: DType) -> Result<Vec<u8>> {
        let (re, im) = self.components();
        if im != 0.0 && !dtype.is_complex() {
            return Err(Error::Configuration(format!(
                "complex fill value for real dtype {dtype}"
            )));
        }
        Ok(match dtype {
            DType::F32 => (re as f32).to_ne_bytes().to_vec(),
            DType::F64 => re.to_ne_bytes().to_vec(),
            DType::C32 => {
                bytemuck::bytes_of(&Complex32::new(re as f32, im as f32)).to_vec()
            }
            DType::C64 => bytemuck::bytes_of(&Complex64::new(re, im)).to_vec(),
        })
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::F32(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<Complex32> for Scalar {
    fn from(v: Complex32) -> Self {
        Scalar::C32(v)
    }
}

impl From<Complex64> for Scalar {
    fn from(v: Complex64) -> Self {
        Scalar::C64(v)
    }
}

/// A borrowed, typed host buffer. Slices are contiguous by construction,
/// which is what the native copy calls require of host memory.
#[derive(Debug, Clone, Copy)]
pub enum HostSlice<'a> {
    F32(&'a [f32]),
    F64(&'a [f64]),
    C32(&'a [Complex32]),
    C64(&'a [Complex64]),
}

impl<'a> HostSlice<'a> {
    pub fn dtype(&self) -> DType {
        match self {
            HostSlice::F32(_) => DType::F32,
            HostSlice::F64(_) => DType::F64,
            HostSlice::C32(_) => DType::C32,
            HostSlice::C64(_) => DType::C64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostSlice::F32(s) => s.len(),
            HostSlice::F64(s) => s.len(),
            HostSlice::C32(s) => s.len(),
            HostSlice::C64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            HostSlice::F32(s) => bytemuck::cast_slice(s),
            HostSlice::F64(s) => bytemuck::cast_slice(s),
            HostSlice::C32(s) => bytemuck::cast_slice(s),
            HostSlice::C64(s) => bytemuck::cast_slice(s),
        }
    }
}

impl<'a> From<&'a [f32]> for HostSlice<'a> {
    fn from(s: &'a [f32]) -> Self {
        HostSlice::F32(s)
    }
}

impl<'a> From<&'a [f64]> for HostSlice<'a> {
    fn from(s: &'a [f64]) -> Self {
        HostSlice::F64(s)
    }
}

impl<'a> From<&'a [Complex32]> for HostSlice<'a> {
    fn from(s: &'a [Complex32]) -> Self {
        HostSlice::C32(s)
    }
}

impl<'a> From<&'a [Complex64]> for HostSlice<'a> {
    fn from(s: &'a [Complex64]) -> Self {
        HostSlice::C64(s)
    }
}

/// The initial contents of a new allocation.
#[derive(Debug, Clone, Copy)]
pub enum Fill<'a> {
    /// Broadcast one value over every element.
    Scalar(Scalar),
    /// Element-wise copy from a host buffer. A size or dtype mismatch is
    /// governed by the owning device's mismatch policy.
    Host(HostSlice<'a>),
    /// Device-to-device copy from an existing device-exclusive allocation.
    Ptr(&'a DevicePtr),
    /// Device-to-device copy from an existing unified allocation.
    Unified(&'a UnifiedPtr),
}

impl<'a> Fill<'a> {
    pub fn scalar(v: impl Into<Scalar>) -> Self {
        Fill::Scalar(v.into())
    }

    pub fn host(s: impl Into<HostSlice<'a>>) -> Self {
        Fill::Host(s.into())
    }

    pub fn ptr(p: &'a DevicePtr) -> Self {
        Fill::Ptr(p)
    }

    pub fn unified(p: &'a UnifiedPtr) -> Self {
        Fill::Unified(p)
    }
}

impl<'a> From<Scalar> for Fill<'a> {
    fn from(v: Scalar) -> Self {
        Fill::Scalar(v)
    }
}

impl<'a> From<HostSlice<'a>> for Fill<'a> {
    fn from(s: HostSlice<'a>) -> Self {
        Fill::Host(s)
    }
}

impl<'a> From<&'a DevicePtr> for Fill<'a> {
    fn from(p: &'a DevicePtr) -> Self {
        Fill::Ptr(p)
    }
}

impl<'a> From<&'a UnifiedPtr> for Fill<'a> {
    fn from(p: &'a UnifiedPtr) -> Self {
        Fill::Unified(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_encode_casts_real_types() {
        let enc = Scalar::F64(1.5).encode(DType::F32).unwrap();
        assert_eq!(enc, 1.5f32.to_ne_bytes());

        let enc = Scalar::F32(2.0).encode(DType::C64).unwrap();
        let v: Complex64 = bytemuck::pod_read_unaligned(&enc);
        assert_eq!(v, Complex64::new(2.0, 0.0));
    }

    #[test]
    fn complex_scalar_rejected_for_real_dtype() {
        let e = Scalar::C32(Complex32::new(1.0, 2.0))
            .encode(DType::F32)
            .unwrap_err();
        assert!(matches!(e, Error::Configuration(_)));
    }

    #[test]
    fn host_slice_views() {
        let data = [1.0f32, 2.0, 3.0];
        let h = HostSlice::from(&data[..]);
        assert_eq!(h.dtype(), DType::F32);
        assert_eq!(h.len(), 3);
        assert_eq!(h.nbytes(), 12);
        assert_eq!(h.as_bytes().len(), 12);
    }
}
