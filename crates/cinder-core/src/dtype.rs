//! Element types and the typed host/device boundary.
//!
//! [`DType`] itself lives in `cinder-driver` because the native kernels are
//! parameterized by it; this module re-exports it and adds the [`Element`]
//! trait that maps concrete Rust element types onto it for typed copies and
//! host views.

use num_complex::{Complex32, Complex64};

pub use cinder_driver::DType;

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for num_complex::Complex32 {}
    impl Sealed for num_complex::Complex64 {}
}

/// A Rust element type that can cross the host/device boundary.
///
/// Sealed: exactly the four supported element types implement it. The
/// `bytemuck::Pod` bound is what lets typed slices be viewed as raw bytes
/// for transfer.
pub trait Element: bytemuck::Pod + PartialEq + std::fmt::Debug + private::Sealed {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

impl Element for Complex32 {
    const DTYPE: DType = DType::C32;
}

impl Element for Complex64 {
    const DTYPE: DType = DType::C64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_dtype_mapping() {
        assert_eq!(<f32 as Element>::DTYPE, DType::F32);
        assert_eq!(<f64 as Element>::DTYPE, DType::F64);
        assert_eq!(<Complex32 as Element>::DTYPE, DType::C32);
        assert_eq!(<Complex64 as Element>::DTYPE, DType::C64);
    }

    #[test]
    fn element_size_agrees_with_dtype() {
        assert_eq!(std::mem::size_of::<Complex32>(), DType::C32.size_of());
        assert_eq!(std::mem::size_of::<Complex64>(), DType::C64.size_of());
    }
}
