//! Typed compute kernels for the host emulation.
//!
//! Each entry point views an allocation's bytes as the requested element
//! type and applies the operation in-place. Buffers are 16-byte aligned
//! (see `Allocation`), so the byte↔element casts always succeed.

use std::ops::{Add, Div, Mul, Sub};

use num_complex::{Complex32, Complex64};

use crate::{DType, DriverError, EwOp};

fn apply_vec<T>(op: EwOp, dst: &mut [T], src: &[T])
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T>,
{
    let n = dst.len().min(src.len());
    for i in 0..n {
        dst[i] = match op {
            EwOp::Add => dst[i] + src[i],
            EwOp::Sub => dst[i] - src[i],
            EwOp::Mul => dst[i] * src[i],
            EwOp::Div => dst[i] / src[i],
        };
    }
}

fn apply_scalar<T>(op: EwOp, dst: &mut [T], value: T)
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T>,
{
    for d in dst.iter_mut() {
        *d = match op {
            EwOp::Add => *d + value,
            EwOp::Sub => *d - value,
            EwOp::Mul => *d * value,
            EwOp::Div => *d / value,
        };
    }
}

fn elems<T: bytemuck::Pod>(bytes: &[u8], len: usize) -> &[T] {
    let n = len.min(bytes.len() / std::mem::size_of::<T>());
    bytemuck::cast_slice(&bytes[..n * std::mem::size_of::<T>()])
}

fn elems_mut<T: bytemuck::Pod>(bytes: &mut [u8], len: usize) -> &mut [T] {
    let n = len.min(bytes.len() / std::mem::size_of::<T>());
    bytemuck::cast_slice_mut(&mut bytes[..n * std::mem::size_of::<T>()])
}

pub(crate) fn ew_vec(op: EwOp, dst: &mut [u8], src: &[u8], len: usize, dtype: DType) {
    match dtype {
        DType::F32 => apply_vec(op, elems_mut::<f32>(dst, len), elems::<f32>(src, len)),
        DType::F64 => apply_vec(op, elems_mut::<f64>(dst, len), elems::<f64>(src, len)),
        DType::C32 => apply_vec(
            op,
            elems_mut::<Complex32>(dst, len),
            elems::<Complex32>(src, len),
        ),
        DType::C64 => apply_vec(
            op,
            elems_mut::<Complex64>(dst, len),
            elems::<Complex64>(src, len),
        ),
    }
}

pub(crate) fn ew_scalar(op: EwOp, dst: &mut [u8], value: &[u8], len: usize, dtype: DType) {
    match dtype {
        DType::F32 => apply_scalar(
            op,
            elems_mut::<f32>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::F64 => apply_scalar(
            op,
            elems_mut::<f64>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::C32 => apply_scalar(
            op,
            elems_mut::<Complex32>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::C64 => apply_scalar(
            op,
            elems_mut::<Complex64>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
    }
}

fn transpose_t<T: Copy + bytemuck::Pod>(bytes: &mut [u8], rows: usize, cols: usize) {
    let buf = elems_mut::<T>(bytes, rows * cols);
    let tmp: Vec<T> = buf.to_vec();
    for r in 0..rows {
        for c in 0..cols {
            buf[c * rows + r] = tmp[r * cols + c];
        }
    }
}

pub(crate) fn transpose(bytes: &mut [u8], rows: usize, cols: usize, dtype: DType) {
    match dtype {
        DType::F32 => transpose_t::<f32>(bytes, rows, cols),
        DType::F64 => transpose_t::<f64>(bytes, rows, cols),
        DType::C32 => transpose_t::<Complex32>(bytes, rows, cols),
        DType::C64 => transpose_t::<Complex64>(bytes, rows, cols),
    }
}

pub(crate) fn conjugate(bytes: &mut [u8], len: usize, dtype: DType) -> Result<(), DriverError> {
    match dtype {
        DType::C32 => {
            for v in elems_mut::<Complex32>(bytes, len) {
                *v = v.conj();
            }
        }
        DType::C64 => {
            for v in elems_mut::<Complex64>(bytes, len) {
                *v = v.conj();
            }
        }
        other => {
            return Err(DriverError::Failure(format!(
                "conjugate kernel is undefined for {other}"
            )));
        }
    }
    Ok(())
}

pub(crate) fn axpy(y: &mut [u8], x: &[u8], alpha: &[u8], n: usize, dtype: DType) {
    match dtype {
        DType::F32 => {
            let a: f32 = bytemuck::pod_read_unaligned(alpha);
            let x = elems::<f32>(x, n);
            let y = elems_mut::<f32>(y, n);
            for i in 0..x.len().min(y.len()) {
                y[i] = a * x[i] + y[i];
            }
        }
        DType::F64 => {
            let a: f64 = bytemuck::pod_read_unaligned(alpha);
            let x = elems::<f64>(x, n);
            let y = elems_mut::<f64>(y, n);
            for i in 0..x.len().min(y.len()) {
                y[i] = a * x[i] + y[i];
            }
        }
        DType::C32 => {
            let a: Complex32 = bytemuck::pod_read_unaligned(alpha);
            let x = elems::<Complex32>(x, n);
            let y = elems_mut::<Complex32>(y, n);
            for i in 0..x.len().min(y.len()) {
                y[i] = a * x[i] + y[i];
            }
        }
        DType::C64 => {
            let a: Complex64 = bytemuck::pod_read_unaligned(alpha);
            let x = elems::<Complex64>(x, n);
            let y = elems_mut::<Complex64>(y, n);
            for i in 0..x.len().min(y.len()) {
                y[i] = a * x[i] + y[i];
            }
        }
    }
}

pub(crate) fn scal(x: &mut [u8], alpha: &[u8], n: usize, dtype: DType) {
    ew_scalar(EwOp::Mul, x, alpha, n, dtype);
}

pub(crate) fn nrm2(x: &[u8], n: usize, dtype: DType) -> f64 {
    match dtype {
        DType::F32 => elems::<f32>(x, n)
            .iter()
            .map(|v| (*v as f64) * (*v as f64))
            .sum::<f64>()
            .sqrt(),
        DType::F64 => elems::<f64>(x, n).iter().map(|v| v * v).sum::<f64>().sqrt(),
        DType::C32 => elems::<Complex32>(x, n)
            .iter()
            .map(|v| v.norm_sqr() as f64)
            .sum::<f64>()
            .sqrt(),
        DType::C64 => elems::<Complex64>(x, n)
            .iter()
            .map(|v| v.norm_sqr())
            .sum::<f64>()
            .sqrt(),
    }
}
