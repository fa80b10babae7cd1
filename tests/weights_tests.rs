//! Weight blobs loaded from disk and bound to filters

mod common;

use anyhow::Context;
use common::{committed_device, max_abs_diff, TestImage};
use denoiseforge::network::{builtin_weights, UNetSpec, WeightDataType};
use denoiseforge::{ErrorCode, Quality, SyncMode, Weights};
use std::sync::Arc;

#[test]
fn test_saved_blob_drives_the_filter() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("balanced.dnwt");
    let weights = builtin_weights(Quality::Balanced, 3, false)?;
    weights.save(&path, WeightDataType::F32)?;

    let loaded = Weights::load(&path)?;
    let spec = UNetSpec::from_weights(&loaded, 3)?;
    assert_eq!(spec, UNetSpec::for_quality(Quality::Balanced, 3));

    let device = committed_device();
    let color = TestImage::noise(&device, 30, 26, 12, 0.0, 1.0);
    let expected = TestImage::constant(&device, 30, 26, 0.0);
    let actual = TestImage::constant(&device, 30, 26, 0.0);

    let mut builtin = device.new_filter("RT")?;
    builtin.set_image("color", Arc::clone(&color.image))?;
    builtin.set_image("output", Arc::clone(&expected.image))?;
    builtin.set_int("quality", Quality::Balanced.as_raw())?;
    builtin.commit()?;
    builtin.execute(SyncMode::Sync)?;

    let blob = std::fs::read(&path).context("reading saved weights")?;
    let mut user = device.new_filter("RT")?;
    user.set_image("color", Arc::clone(&color.image))?;
    user.set_image("output", Arc::clone(&actual.image))?;
    // quality is ignored once weights are supplied
    user.set_int("quality", Quality::Fast.as_raw())?;
    user.set_data("weights", Some(&blob))?;
    user.commit()?;
    user.execute(SyncMode::Sync)?;

    assert!(max_abs_diff(&expected.pixels(), &actual.pixels()) <= 1e-6);
    Ok(())
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Weights::load(&dir.path().join("absent.dnwt")).unwrap_err();
    assert_ne!(err.code(), ErrorCode::None);
    assert!(err.to_string().contains("absent.dnwt"));
}

#[test]
fn test_blob_missing_a_layer_is_rejected() -> anyhow::Result<()> {
    let full = builtin_weights(Quality::Fast, 3, false)?;
    let mut partial = Weights::new();
    for name in full.names().filter(|n| !n.starts_with("dec_conv0")) {
        let tensor = full.get(name).context("listed tensor")?;
        partial.insert(name, tensor.dims.clone(), tensor.values.clone())?;
    }

    let device = committed_device();
    let color = TestImage::constant(&device, 16, 16, 0.5);
    let output = TestImage::constant(&device, 16, 16, 0.0);
    let mut filter = device.new_filter("RT")?;
    filter.set_image("color", Arc::clone(&color.image))?;
    filter.set_image("output", Arc::clone(&output.image))?;
    filter.set_data("weights", Some(&partial.to_bytes(WeightDataType::F32)))?;
    let err = filter.commit().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);
    Ok(())
}
