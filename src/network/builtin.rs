//! Built-in weights
//!
//! Weights are generated deterministically from the quality tier, the input
//! channel count and the aux cleanliness flag. The first encoder channels
//! carry a 3x3 box filter of the color channels and the last decoder copies
//! them through its skip connection, so the deeper levels only add a small
//! learned-looking residual on top of a smoothed color image.

use crate::network::unet::{ConvLayer, Quality, UNetSpec, OUTPUT_CHANNELS};
use crate::network::weights::Weights;
use crate::error::DenoiseResult;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Amplitude of hidden-layer weights
const HIDDEN_SCALE: f32 = 0.05;
/// Amplitude of the decoder residual
const RESIDUAL_SCALE: f32 = 1e-3;

fn seed(quality: Quality, in_channels: usize, clean_aux: bool) -> u64 {
    0x444e_5754_0000_0000
        ^ ((quality.resolve().as_raw() as u64) << 16)
        ^ ((in_channels as u64) << 4)
        ^ u64::from(clean_aux)
}

#[inline]
fn tap(layer: &ConvLayer, o: usize, i: usize, ky: usize, kx: usize) -> usize {
    ((o * layer.in_channels() + i) * 3 + ky) * 3 + kx
}

fn layer_weights(layer: &ConvLayer, rng: &mut ChaCha8Rng) -> Vec<f32> {
    let n: usize = layer.weight_dims().iter().product();
    match layer.name {
        "enc_conv0" => {
            let mut w: Vec<f32> = (0..n).map(|_| rng.gen_range(-HIDDEN_SCALE..HIDDEN_SCALE)).collect();
            for o in 0..OUTPUT_CHANNELS.min(layer.out_channels) {
                for i in 0..layer.in_channels() {
                    let v = if i == o { 1.0 / 9.0 } else { 0.0 };
                    for ky in 0..3 {
                        for kx in 0..3 {
                            w[tap(layer, o, i, ky, kx)] = v;
                        }
                    }
                }
            }
            w
        }
        "dec_conv0" => {
            let mut w = vec![0.0; n];
            for o in 0..layer.out_channels {
                for i in 0..layer.src_channels {
                    w[tap(layer, o, i, 1, 1)] = rng.gen_range(-RESIDUAL_SCALE..RESIDUAL_SCALE);
                }
                if o < layer.concat_channels {
                    w[tap(layer, o, layer.src_channels + o, 1, 1)] = 1.0;
                }
            }
            w
        }
        _ => (0..n).map(|_| rng.gen_range(-HIDDEN_SCALE..HIDDEN_SCALE)).collect(),
    }
}

/// Weights for a quality tier and input channel count
pub fn builtin_weights(quality: Quality, in_channels: usize, clean_aux: bool) -> DenoiseResult<Weights> {
    let spec = UNetSpec::for_quality(quality, in_channels);
    let mut rng = ChaCha8Rng::seed_from_u64(seed(quality, in_channels, clean_aux));
    let mut weights = Weights::new();
    for layer in spec.layers() {
        let values = layer_weights(&layer, &mut rng);
        weights.insert(&layer.weight_name(), layer.weight_dims().to_vec(), values)?;
        weights.insert(&layer.bias_name(), vec![layer.out_channels], vec![0.0; layer.out_channels])?;
    }
    tracing::debug!(
        "generated {} built-in weights ({} quality, {} input channels)",
        weights.num_values(),
        quality,
        in_channels
    );
    Ok(weights)
}
