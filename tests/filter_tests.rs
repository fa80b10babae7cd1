//! End-to-end filter runs: tiling, in-place operation, sanitization,
//! progress and graph reuse

mod common;

use common::{committed_device, max_abs_diff, TestImage};
use denoiseforge::api::DeviceRef;
use denoiseforge::network::{builtin_weights, WeightDataType};
use denoiseforge::tensor::{Format, Image, ImageDesc};
use denoiseforge::{DeviceType, ErrorCode, Filter, ProgressCallback, Quality, Storage, SyncMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn rt_filter(device: &Arc<denoiseforge::Device>, color: &TestImage, output: &TestImage) -> Filter {
    let mut filter = device.new_filter("RT").unwrap();
    filter.set_image("color", Arc::clone(&color.image)).unwrap();
    filter.set_image("output", Arc::clone(&output.image)).unwrap();
    filter
}

fn recording(stop_at: Option<f64>) -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |fraction| {
        log.lock().unwrap().push(fraction);
        stop_at.map_or(true, |stop| fraction < stop)
    });
    (callback, seen)
}

#[test]
fn test_in_place_odd_sized_image() {
    let device = committed_device();
    for hdr in [false, true] {
        for max_memory_mb in [0, 3000] {
            let hi = if hdr { 8.0 } else { 1.0 };
            let image = TestImage::noise(&device, 257, 89, 7, 0.0, hi);
            let mut filter = rt_filter(&device, &image, &image);
            filter.set_bool("hdr", hdr).unwrap();
            filter.set_int("quality", Quality::Fast.as_raw()).unwrap();
            filter.set_int("maxMemoryMB", max_memory_mb).unwrap();
            filter.commit().unwrap();
            assert_eq!(filter.stats().tile_count > 1, max_memory_mb == 0);
            filter.execute(SyncMode::Sync).unwrap();

            let pixels = image.pixels();
            assert!(pixels.iter().all(|v| v.is_finite() && *v >= 0.0));
            if !hdr {
                assert!(pixels.iter().all(|v| *v <= 1.0));
            }
        }
    }
}

#[test]
fn test_tiling_does_not_change_the_result() {
    let device = committed_device();
    for hdr in [false, true] {
        let color = TestImage::noise(&device, 120, 100, 11, 0.0, if hdr { 4.0 } else { 1.0 });
        let untiled = TestImage::constant(&device, 120, 100, 0.0);
        let tiled = TestImage::constant(&device, 120, 100, 0.0);

        let mut filter = rt_filter(&device, &color, &untiled);
        filter.set_bool("hdr", hdr).unwrap();
        filter.set_int("quality", Quality::Fast.as_raw()).unwrap();
        filter.commit().unwrap();
        assert_eq!(filter.stats().tile_count, 1);
        filter.execute(SyncMode::Sync).unwrap();

        filter.set_image("output", Arc::clone(&tiled.image)).unwrap();
        filter.set_int("maxMemoryMB", 0).unwrap();
        filter.commit().unwrap();
        assert!(filter.stats().tile_count > 1);
        filter.execute(SyncMode::Sync).unwrap();

        let diff = max_abs_diff(&untiled.pixels(), &tiled.pixels());
        assert!(diff <= 1e-4, "hdr={} max difference {}", hdr, diff);
    }
}

#[test]
fn test_constant_image_stays_close_inside() {
    let device = committed_device();
    let color = TestImage::constant(&device, 64, 64, 0.5);
    let output = TestImage::constant(&device, 64, 64, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();

    let pixels = output.pixels();
    for y in 8..56 {
        for x in 8..56 {
            let v = pixels[(y * 64 + x) * 3];
            assert!((v - 0.5).abs() < 0.05, "pixel ({}, {}) = {}", x, y, v);
        }
    }
}

#[test]
fn test_non_finite_inputs_are_sanitized() {
    let device = committed_device();
    let poison = |x: usize, y: usize, c: usize| match (x + 3 * y + c) % 7 {
        0 => f32::NAN,
        1 => f32::INFINITY,
        2 => f32::NEG_INFINITY,
        3 => -5.0,
        4 => 1e30,
        _ => 0.25,
    };

    for hdr in [true, false] {
        let color = TestImage::new(&device, 40, 36, poison);
        let output = TestImage::constant(&device, 40, 36, 0.0);
        let mut filter = rt_filter(&device, &color, &output);
        filter.set_bool("hdr", hdr).unwrap();
        filter.commit().unwrap();
        filter.execute(SyncMode::Sync).unwrap();

        for v in output.pixels() {
            assert!(v.is_finite(), "hdr={} produced {}", hdr, v);
            assert!(v >= 0.0);
            if !hdr {
                assert!(v <= 1.0);
            }
        }
    }
}

#[test]
fn test_directional_lightmap_stays_signed() {
    let device = committed_device();
    let color = TestImage::noise(&device, 33, 21, 3, -1.0, 1.0);
    let output = TestImage::constant(&device, 33, 21, 0.0);
    let mut filter = device.new_filter("RTLightmap").unwrap();
    filter.set_image("color", Arc::clone(&color.image)).unwrap();
    filter.set_image("output", Arc::clone(&output.image)).unwrap();
    filter.set_bool("directional", true).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();

    let pixels = output.pixels();
    assert!(pixels.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert!(pixels.iter().any(|v| *v < 0.0));
}

#[test]
fn test_progress_is_monotonic_and_completes() {
    let device = committed_device();
    let color = TestImage::noise(&device, 90, 70, 5, 0.0, 1.0);
    let output = TestImage::constant(&device, 90, 70, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.set_int("quality", Quality::Fast.as_raw()).unwrap();
    filter.set_int("maxMemoryMB", 0).unwrap();
    let (callback, seen) = recording(None);
    filter.set_progress_monitor(Some(callback));
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), filter.stats().tile_count + 1);
    assert_eq!(seen[0], 0.0);
    assert_eq!(*seen.last().unwrap(), 1.0);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!(seen[..seen.len() - 1].iter().all(|f| *f < 1.0));
}

#[test]
fn test_cancel_stops_sync_execution() {
    let device = committed_device();
    let color = TestImage::noise(&device, 90, 70, 5, 0.0, 1.0);
    let output = TestImage::constant(&device, 90, 70, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.set_int("quality", Quality::Fast.as_raw()).unwrap();
    filter.set_int("maxMemoryMB", 0).unwrap();
    let (callback, seen) = recording(Some(0.5));
    filter.set_progress_monitor(Some(callback));
    filter.commit().unwrap();

    let err = filter.execute(SyncMode::Sync).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    {
        let seen = seen.lock().unwrap();
        let last = *seen.last().unwrap();
        assert!((0.5..1.0).contains(&last));
        assert!(seen.len() < filter.stats().tile_count + 1);
    }

    // a later run without the callback is unaffected
    filter.set_progress_monitor(None);
    filter.execute(SyncMode::Sync).unwrap();
}

#[test]
fn test_cancel_at_completion_is_ignored() {
    let device = committed_device();
    let color = TestImage::constant(&device, 16, 16, 0.3);
    let output = TestImage::constant(&device, 16, 16, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    let (callback, seen) = recording(Some(1.0));
    filter.set_progress_monitor(Some(callback));
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0.0, 1.0]);
}

#[test]
fn test_async_execution_and_cancellation() {
    let device = DeviceRef::new(DeviceType::Cpu.as_raw()).unwrap();
    device.set_int(Some("numThreads"), 2);
    device.commit();
    let color = TestImage::noise(device.device(), 90, 70, 9, 0.0, 1.0);
    let output = TestImage::constant(device.device(), 90, 70, -1.0);

    let mut typed = device.device().new_filter("RT").unwrap();
    typed.set_image("color", Arc::clone(&color.image)).unwrap();
    typed.set_image("output", Arc::clone(&output.image)).unwrap();
    typed.set_int("quality", Quality::Fast.as_raw()).unwrap();
    typed.set_int("maxMemoryMB", 0).unwrap();
    typed.commit().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    typed.set_progress_monitor(Some(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    })));
    typed.execute(SyncMode::Async).unwrap();
    device.sync();
    assert_eq!(device.get_error().0, ErrorCode::None);
    assert_eq!(calls.load(Ordering::SeqCst), typed.stats().tile_count + 1);
    assert!(output.pixels().iter().all(|v| (0.0..=1.0).contains(v)));

    let (callback, seen) = recording(Some(0.5));
    typed.set_progress_monitor(Some(callback));
    typed.execute(SyncMode::Async).unwrap();
    device.sync();
    assert_eq!(device.get_error().0, ErrorCode::Cancelled);
    let last = *seen.lock().unwrap().last().unwrap();
    assert!(last < 1.0);

    // the stream is usable again after the failed sync
    typed.set_progress_monitor(None);
    typed.execute(SyncMode::Sync).unwrap();
}

#[test]
fn test_filter_update_sequence() {
    let device = committed_device();
    let color = TestImage::noise(&device, 64, 48, 1, 0.0, 1.0);
    let output = TestImage::constant(&device, 64, 48, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 1);

    // new size
    let color = TestImage::noise(&device, 40, 40, 2, 0.0, 1.0);
    let output = TestImage::constant(&device, 40, 40, 0.0);
    filter.set_image("color", Arc::clone(&color.image)).unwrap();
    filter.set_image("output", Arc::clone(&output.image)).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 2);

    // half precision auxiliary input
    let desc = ImageDesc::new(Format::Half3, 40, 40, 0, 0).unwrap();
    let albedo_buffer = device.new_buffer(desc.byte_size(), Storage::Host).unwrap();
    let half = vec![half::f16::from_f32(0.5).to_bits(); 40 * 40 * 3];
    albedo_buffer.write(0, bytemuck::cast_slice(&half)).unwrap();
    let albedo = Image::from_buffer(&albedo_buffer, desc, 0).unwrap();
    filter.set_image("albedo", albedo).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 3);

    filter.unset_image("albedo").unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 4);

    filter.set_bool("hdr", true).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 4);
    assert_eq!(filter.stats().param_updates, 1);

    filter.set_int("quality", Quality::Balanced.as_raw()).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert_eq!(filter.stats().graph_builds, 5);
    assert_eq!(filter.stats().executions, 6);
    assert!(output.pixels().iter().all(|v| v.is_finite()));
}

#[test]
fn test_clean_aux_with_albedo_and_normal() {
    let device = committed_device();
    let color = TestImage::noise(&device, 24, 24, 4, 0.0, 1.0);
    let albedo = TestImage::constant(&device, 24, 24, 0.8);
    let normal = TestImage::noise(&device, 24, 24, 6, -1.0, 1.0);
    let output = TestImage::constant(&device, 24, 24, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.set_image("albedo", Arc::clone(&albedo.image)).unwrap();
    filter.set_image("normal", Arc::clone(&normal.image)).unwrap();
    filter.set_bool("cleanAux", true).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    assert!(output.pixels().iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_user_weights_match_builtin() {
    let device = committed_device();
    let color = TestImage::noise(&device, 48, 40, 8, 0.0, 1.0);
    let reference = TestImage::constant(&device, 48, 40, 0.0);
    let mut filter = rt_filter(&device, &color, &reference);
    filter.set_int("quality", Quality::Fast.as_raw()).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();

    let weights = builtin_weights(Quality::Fast, 3, false).unwrap();
    for (dtype, tolerance) in [(WeightDataType::F32, 1e-6), (WeightDataType::F16, 1e-2)] {
        let output = TestImage::constant(&device, 48, 40, 0.0);
        let mut user = rt_filter(&device, &color, &output);
        user.set_data("weights", Some(&weights.to_bytes(dtype))).unwrap();
        user.commit().unwrap();
        user.execute(SyncMode::Sync).unwrap();
        let diff = max_abs_diff(&reference.pixels(), &output.pixels());
        assert!(diff <= tolerance, "{:?} weights differ by {}", dtype, diff);
    }
}

#[test]
fn test_user_weights_must_match_inputs() {
    let device = committed_device();
    let color = TestImage::noise(&device, 16, 16, 8, 0.0, 1.0);
    let albedo = TestImage::constant(&device, 16, 16, 0.5);
    let output = TestImage::constant(&device, 16, 16, 0.0);
    let mut filter = rt_filter(&device, &color, &output);
    filter.set_image("albedo", Arc::clone(&albedo.image)).unwrap();

    let weights = builtin_weights(Quality::Fast, 3, false).unwrap();
    filter
        .set_data("weights", Some(&weights.to_bytes(WeightDataType::F32)))
        .unwrap();
    assert!(filter.commit().is_err());
    assert!(!filter.is_committed());

    filter.unset_image("albedo").unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
}

#[test]
fn test_shared_host_memory_images() {
    let device = DeviceRef::new(DeviceType::Cpu.as_raw()).unwrap();
    device.set_int(Some("numThreads"), 2);
    device.commit();

    let (w, h) = (20usize, 12usize);
    let mut color = vec![0.4f32; w * h * 3];
    let mut output = vec![-1.0f32; w * h * 3];
    let filter = device.new_filter(Some("RT")).unwrap();
    let float3 = Format::Float3.as_raw();
    // SAFETY: both vectors outlive every execution below
    unsafe {
        filter.set_shared_image(Some("color"), color.as_mut_ptr().cast(), float3, w, h, 0, 0, 0);
        filter.set_shared_image(Some("output"), output.as_mut_ptr().cast(), float3, w, h, 0, 0, 0);
        filter.set_shared_image(Some("albedo"), std::ptr::null_mut(), float3, w, h, 0, 0, 0);
    }
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    filter.commit();
    filter.execute();
    assert_eq!(device.get_error().0, ErrorCode::None);
    assert!(output.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_handle_level_filter_errors() {
    let device = DeviceRef::new(DeviceType::Cpu.as_raw()).unwrap();
    device.commit();

    assert!(device.new_filter(None).is_none());
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    assert!(device.new_filter(Some("NL")).is_none());
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    let filter = device.new_filter(Some("RT")).unwrap();
    filter.set_data(Some("weights"), None, 16);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_data(Some("weights"), None, 0);
    assert_eq!(device.get_error().0, ErrorCode::None);

    let buffer = device.new_buffer(1024, Storage::Host as i32).unwrap();
    filter.set_image(Some("color"), Some(&buffer), 99, 8, 8, 0, 0, 0);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_image(Some("color"), Some(&buffer), Format::Float3.as_raw(), 64, 64, 0, 0, 0);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_image(Some("color"), None, Format::Float3.as_raw(), 8, 8, 0, 0, 0);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    filter.set_int(Some("quality"), 3);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_int(Some("noSuchParameter"), 1);
    assert_eq!(device.get_error().0, ErrorCode::None);
    assert_eq!(filter.get_int(Some("noSuchParameter")), 0);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    assert!(filter.get_float(Some("inputScale")).is_nan());

    filter.execute();
    assert_eq!(device.get_error().0, ErrorCode::InvalidOperation);
}

#[test]
fn test_shrunk_input_buffer_fails_before_any_work() {
    let device = committed_device();
    for (in_place, mode) in [(false, SyncMode::Sync), (true, SyncMode::Sync), (false, SyncMode::Async)] {
        let color = TestImage::noise(&device, 32, 32, 9, 0.0, 4.0);
        let output = TestImage::constant(&device, 32, 32, 0.0);
        let mut filter = rt_filter(&device, &color, if in_place { &color } else { &output });
        filter.set_bool("hdr", true).unwrap();
        let (callback, seen) = recording(None);
        filter.set_progress_monitor(Some(callback));
        filter.commit().unwrap();

        assert_eq!(color.buffer.realloc(16).unwrap_err().code(), ErrorCode::Unknown);
        assert!(color.image.ptr().is_null());
        let err = filter.execute(mode).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);

        // nothing was queued, so the stream drains cleanly
        device.sync().unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(filter.stats().executions, 0);

        color.buffer.realloc(32 * 32 * 12).unwrap();
        filter.execute(SyncMode::Sync).unwrap();
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 1.0);
    }
}
