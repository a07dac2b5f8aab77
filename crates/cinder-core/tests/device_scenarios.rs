//! End-to-end scenarios against the emulation backend.

use std::sync::Arc;

use cinder_core::prelude::*;
use cinder_driver::host::HostDriver;
use num_complex::Complex32;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i,
            x,
            y,
            tol
        );
    }
}

fn device(n_streams: usize) -> (Arc<HostDriver>, Device) {
    let driver = Arc::new(HostDriver::new(1));
    let d = Device::with_config(
        driver.clone(),
        0,
        DeviceConfig {
            n_streams,
            ..DeviceConfig::default()
        },
    )
    .unwrap();
    (driver, d)
}

// ============================================================================
// Fills and readback
// ============================================================================

#[test]
fn broadcast_fill_readback_every_dtype() {
    let (_driver, d) = device(0);

    let p = d.alloc(&[5, 7], DType::F32, Fill::scalar(0.25f32)).unwrap();
    assert!(p.to_host_vec::<f32>().unwrap().iter().all(|&v| v == 0.25));

    let p = d.alloc(&[35], DType::F64, Fill::scalar(-8.0f64)).unwrap();
    assert!(p.to_host_vec::<f64>().unwrap().iter().all(|&v| v == -8.0));

    let c32 = Complex32::new(1.0, -1.0);
    let p = d.alloc(&[3, 3], DType::C32, Fill::scalar(c32)).unwrap();
    assert!(p.to_host_vec::<Complex32>().unwrap().iter().all(|&v| v == c32));

    let c64 = num_complex::Complex64::new(2.5, 4.0);
    let p = d.alloc(&[9], DType::C64, Fill::scalar(c64)).unwrap();
    assert!(p
        .to_host_vec::<num_complex::Complex64>()
        .unwrap()
        .iter()
        .all(|&v| v == c64));
}

// ============================================================================
// The complex arithmetic chain
// ============================================================================

#[test]
fn complex_arithmetic_chain_matches_host_reference() {
    let (_driver, d) = device(0);
    let shape = [768usize, 512];
    let n = shape[0] * shape[1];

    let va = Complex32::new(3.0, 5.0);
    let vb = Complex32::new(16.0, 1.0);
    let mut a = d.alloc(&shape, DType::C32, Fill::scalar(va)).unwrap();
    let mut b = d.alloc(&shape, DType::C32, Fill::scalar(vb)).unwrap();

    b.add(&a).unwrap();
    b.mul(&a).unwrap();
    a.sub(&b).unwrap();
    a.div(&b).unwrap();

    // The same chain with ordinary host arithmetic.
    let mut ha = vec![va; n];
    let mut hb = vec![vb; n];
    for i in 0..n {
        hb[i] += ha[i];
        hb[i] *= ha[i];
        ha[i] -= hb[i];
        ha[i] /= hb[i];
    }

    let got = a.to_host_vec::<Complex32>().unwrap();
    for (i, (g, e)) in got.iter().zip(&ha).enumerate() {
        assert!(
            (g.re - e.re).abs() < 1e-5 && (g.im - e.im).abs() < 1e-5,
            "element {i} differs: {g} vs {e}"
        );
    }
}

// ============================================================================
// Streams
// ============================================================================

/// Two streams, each owning a disjoint half of a vector, synchronized out
/// of issue order. Each stream's results depend only on its own half.
#[test]
fn two_stream_halves_are_isolated_across_out_of_order_sync() {
    let (_driver, d) = device(2);
    let n = 10usize;
    let alpha = 2.0f32;

    // a = 0..20 split in halves, b = ones.
    let a: Vec<Vec<f32>> = (0..2)
        .map(|s| (0..n).map(|i| (s * n + i) as f32).collect())
        .collect();
    let b = vec![1.0f32; n];
    let mut c = [vec![0.0f32; n], vec![0.0f32; n]];

    d.require_streamable(&[&a[0][..], &a[1][..], &b[..], &c[0][..], &c[1][..]])
        .unwrap();

    // Mallocs are synchronous; keep them out of the async region.
    let mut dev: Vec<(DevicePtr, DevicePtr)> = d
        .streams()
        .iter()
        .map(|s| {
            (
                s.alloc(&[n], DType::F32, None).unwrap(),
                s.alloc(&[n], DType::F32, None).unwrap(),
            )
        })
        .collect();

    for (i, s) in d.streams().iter().enumerate() {
        let (sa, sb) = &mut dev[i];
        s.memcpy_h2d_async(sa, &a[i]).unwrap();
        s.memcpy_h2d_async(sb, &b).unwrap();
        s.blas().axpy(n, alpha, sa, sb).unwrap();
        s.blas().scal(n, alpha, sb).unwrap();
    }
    {
        let (_, sb0) = &dev[0];
        let (_, sb1) = &dev[1];
        d.stream(0)
            .unwrap()
            .memcpy_d2h_async(&mut c[0], sb0)
            .unwrap();
        d.stream(1)
            .unwrap()
            .memcpy_d2h_async(&mut c[1], sb1)
            .unwrap();
    }

    // Sync in reverse issue order. Stream 1 completing must not make
    // stream 0's enqueued work observable.
    d.stream(1).unwrap().sync().unwrap();
    let expected = |half: &[f32]| -> Vec<f32> {
        half.iter().map(|&x| alpha * (alpha * x + 1.0)).collect()
    };
    assert_close(&c[1], &expected(&a[1]), 1e-6);
    assert!(c[0].iter().all(|&v| v == 0.0), "stream 0 must still be pending");

    d.stream(0).unwrap().sync().unwrap();
    assert_close(&c[0], &expected(&a[0]), 1e-6);

    // Norms match the host computation: nrms = |alpha*(alpha*a + b)| per half.
    let nrm0 = d.stream(0).unwrap().blas().nrm2(n, &dev[0].1).unwrap();
    let nrm1 = d.stream(1).unwrap().blas().nrm2(n, &dev[1].1).unwrap();
    assert!((nrm0 - 72.938332).abs() < 1e-3, "nrm0 = {nrm0}");
    assert!((nrm1 - 193.183853).abs() < 1e-3, "nrm1 = {nrm1}");
}

#[test]
fn nrm2_observes_enqueued_work_without_explicit_sync() {
    let (_driver, d) = device(1);
    let s = d.stream(0).unwrap();
    let data = [3.0f32, 4.0, 0.0, 0.0];
    d.host_pin(&data).unwrap();

    let mut p = s.alloc(&[4], DType::F32, None).unwrap();
    s.memcpy_h2d_async(&mut p, &data).unwrap();
    // Host-pointer-mode semantics: the norm call drains the queue itself.
    let nrm = s.blas().nrm2(4, &p).unwrap();
    assert!((nrm - 5.0).abs() < 1e-9);
}

// ============================================================================
// Copies
// ============================================================================

#[test]
fn d2d_reproduces_source_bytes_and_bounds_destination() {
    let (_driver, d) = device(0);
    let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.5).collect();
    let src = d.alloc(&[64], DType::F32, Fill::host(&data[..])).unwrap();
    let mut dst = d.alloc(&[64], DType::F32, None).unwrap();

    DevicePtr::d2d(&src, &mut dst, None).unwrap();
    assert_eq!(dst.to_host_vec::<f32>().unwrap(), data);

    // Partial copy within bounds.
    let mut half = d.alloc(&[32], DType::F32, None).unwrap();
    DevicePtr::d2d(&src, &mut half, Some(32 * 4)).unwrap();
    assert_eq!(half.to_host_vec::<f32>().unwrap(), &data[..32]);

    // Unbounded copy into a smaller destination is a hard failure.
    let e = DevicePtr::d2d(&src, &mut half, None).unwrap_err();
    assert!(matches!(e, Error::DestinationTooSmall { .. }));
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn device_teardown_unpins_and_frees_everything() {
    let driver = Arc::new(HostDriver::new(1));
    let host_buf = [0.0f32; 128];
    {
        let d = Device::with_config(
            driver.clone(),
            0,
            DeviceConfig {
                n_streams: 2,
                ..DeviceConfig::default()
            },
        )
        .unwrap();
        d.host_pin(&host_buf).unwrap();
        let s = d.stream(0).unwrap();
        let mut p = s.alloc(&[32], DType::F32, None).unwrap();
        p.zero_async(None).unwrap();
        // Dropped with work still enqueued; teardown must sync first.
        drop(p);
        assert_eq!(driver.pinned_count(), 1);
    }
    assert_eq!(driver.pinned_count(), 0);
    assert_eq!(driver.allocation_count(), 0);
}

// ============================================================================
// Device sets
// ============================================================================

#[test]
fn device_set_coordinates_multiple_gpus() {
    let driver: Arc<dyn cinder_driver::Driver> = Arc::new(HostDriver::new(2));
    let set = DeviceSet::new(driver, &[0, 1], &[1]).unwrap();
    assert_eq!(set.len(), 2);

    let mut handles: Vec<DevicePtr> = set
        .iter()
        .map(|d| {
            d.stream(0)
                .unwrap()
                .alloc(&[8], DType::F64, Fill::scalar(2.0f64))
                .unwrap()
        })
        .collect();
    for p in &mut handles {
        p.mul_scalar(3.0f64).unwrap();
    }
    set.sync_all().unwrap();
    for p in &handles {
        assert!(p.to_host_vec::<f64>().unwrap().iter().all(|&v| v == 6.0));
    }
}

#[test]
fn device_set_rejects_mismatched_stream_counts() {
    let driver: Arc<dyn cinder_driver::Driver> = Arc::new(HostDriver::new(3));
    let e = DeviceSet::new(driver, &[0, 1, 2], &[1, 2]).unwrap_err();
    assert!(matches!(e, Error::Configuration(_)));
}

// ============================================================================
// Unified memory
// ============================================================================

#[test]
fn unified_handles_share_bytes_with_device_ops() {
    let (_driver, d) = device(0);
    let mut u = d
        .alloc_unified(&[16], DType::F32, Fill::scalar(1.0f32))
        .unwrap();
    u.add_scalar(4.0f32).unwrap();

    // The device consumes the same bytes: copy into a device handle and
    // read it back through the device path.
    let mut p = d.alloc(&[16], DType::F32, Fill::unified(&u)).unwrap();
    assert_eq!(p.to_host_vec::<f32>().unwrap(), [5.0; 16]);

    p.mul_scalar(2.0f32).unwrap();
    let back = d.alloc_unified(&[16], DType::F32, Fill::ptr(&p)).unwrap();
    assert_eq!(back.as_slice::<f32>().unwrap(), &[10.0; 16]);
}
