//! Buffer allocation, synchronous and asynchronous transfers

mod common;

use common::committed_device;
use denoiseforge::api::DeviceRef;
use denoiseforge::{DeviceType, ErrorCode, Storage};
use proptest::prelude::*;

fn committed_ref() -> DeviceRef {
    let device = DeviceRef::new(DeviceType::Cpu.as_raw()).unwrap();
    device.set_int(Some("numThreads"), 2);
    device.commit();
    assert_eq!(device.get_error().0, ErrorCode::None);
    device
}

#[test]
fn test_new_buffer_is_zeroed() {
    let device = committed_device();
    let buffer = device.new_buffer(1000, Storage::Undefined).unwrap();
    assert_eq!(buffer.storage(), Storage::Host);
    assert_eq!(buffer.byte_size(), 1000);
    let mut bytes = vec![0xffu8; 1000];
    buffer.read(0, &mut bytes).unwrap();
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_zero_sized_buffer() {
    let device = committed_device();
    let buffer = device.new_buffer(0, Storage::Device).unwrap();
    assert_eq!(buffer.byte_size(), 0);
    buffer.read(0, &mut []).unwrap();
    assert_eq!(buffer.write(0, &[1]).unwrap_err().code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_out_of_range_write_copies_nothing() {
    let device = committed_device();
    let buffer = device.new_buffer(8, Storage::Host).unwrap();
    assert_eq!(
        buffer.write(4, &[1, 2, 3, 4, 5]).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    let mut bytes = [0xffu8; 8];
    buffer.read(0, &mut bytes).unwrap();
    assert_eq!(bytes, [0; 8]);

    let mut dst = [0xaau8; 4];
    assert_eq!(
        buffer.read(usize::MAX, &mut dst).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(dst, [0xaa; 4]);
}

#[test]
fn test_huge_allocation_is_out_of_memory() {
    let device = committed_device();
    assert_eq!(
        device.new_buffer(usize::MAX / 2, Storage::Host).unwrap_err().code(),
        ErrorCode::OutOfMemory
    );
}

#[test]
fn test_raw_storage_mode_validation() {
    let device = committed_ref();
    assert!(device.new_buffer(16, -5).is_none());
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    let buffer = device.new_buffer(16, Storage::Managed as i32).unwrap();
    assert_eq!(buffer.storage(), Storage::Managed as i32);
    assert_eq!(buffer.size(), 16);
}

#[test]
fn test_null_pointers_are_rejected() {
    let device = committed_ref();
    let buffer = device.new_buffer(16, Storage::Host as i32).unwrap();

    buffer.write(0, 4, None);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    buffer.read(0, 4, None);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    // an empty transfer needs no pointer
    buffer.read(0, 0, None);
    assert_eq!(device.get_error().0, ErrorCode::None);

    let mut small = [0u8; 2];
    buffer.read(0, 4, Some(&mut small));
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
}

#[test]
fn test_async_transfers_complete_on_sync() {
    let device = committed_ref();
    let buffer = device.new_buffer(64, Storage::Device as i32).unwrap();

    let data: Vec<u8> = (0..32).collect();
    buffer.write_async(16, 32, Some(&data));
    let pending = buffer.read_async(8, 48).unwrap();
    device.sync();
    assert_eq!(device.get_error().0, ErrorCode::None);

    let bytes = pending.take().unwrap();
    assert_eq!(bytes.len(), 48);
    assert_eq!(&bytes[..8], &[0; 8]);
    assert_eq!(&bytes[8..40], data.as_slice());
    assert_eq!(&bytes[40..], &[0; 8]);
    assert!(pending.take().is_none());
}

#[test]
fn test_async_out_of_range_fails_immediately() {
    let device = committed_ref();
    let buffer = device.new_buffer(16, Storage::Host as i32).unwrap();
    assert!(buffer.read_async(8, 16).is_none());
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    buffer.write_async(12, 8, Some(&[0u8; 8]));
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_write_then_read_returns_same_bytes(
        data in proptest::collection::vec(any::<u8>(), 1..256),
        offset in 0usize..64,
    ) {
        let device = committed_device();
        let buffer = device.new_buffer(offset + data.len(), Storage::Host).unwrap();
        buffer.write(offset, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        buffer.read(offset, &mut back).unwrap();
        prop_assert_eq!(back, data);
    }
}

#[test]
fn test_overflowing_image_strides_are_reported() {
    let device = committed_ref();
    let buffer = device.new_buffer(1024, Storage::Host as i32).unwrap();
    let filter = device.new_filter(Some("RT")).unwrap();
    let float3 = denoiseforge::tensor::Format::Float3.as_raw();

    filter.set_image(Some("color"), Some(&buffer), float3, 4, 4, 0, 0, usize::MAX / 2);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_image(Some("color"), Some(&buffer), float3, 4, 4, 0, usize::MAX / 2, 0);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);
    filter.set_image(Some("color"), Some(&buffer), float3, 4, 4, 0, 16, usize::MAX / 3);
    assert_eq!(device.get_error().0, ErrorCode::InvalidArgument);

    // a valid strided binding still goes through afterwards
    filter.set_image(Some("color"), Some(&buffer), float3, 4, 4, 0, 16, 64);
    assert_eq!(device.get_error().0, ErrorCode::None);
}
