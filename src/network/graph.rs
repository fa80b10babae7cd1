//! Network graph
//!
//! Instantiates the UNet for one tile size on an engine. Every intermediate
//! tensor and every op scratch range lives in a single arena buffer whose
//! layout comes from the tensor lifetimes below; weights live in a second
//! buffer that is uploaded once. Between tiles only the bindings of the two
//! boundary ops change.

use crate::backend::Engine;
use crate::error::DenoiseResult;
use crate::logic_error;
use crate::memory::{
    plan_lifetimes, round_up, ArenaPlan, Buffer, LifetimeRequest, MemoryCalculator, Storage, MEMORY_ALIGNMENT,
};
use crate::network::unet::{ConvLayer, UNetSpec, UNET_ALIGNMENT};
use crate::network::weights::Weights;
use crate::ops::{
    AutoexposureOp, ConvDesc, ConvOp, InputProcessOp, OutputProcessOp, ProcessParams, ResampleOp,
};
use crate::tensor::{DataType, Image, ImageDesc, Tensor, TensorDesc, TensorLayout, Tile};
use std::sync::Arc;
use tracing::debug;

// Node indices double as op indices for lifetime planning.
const AUTOEXPOSURE: usize = 0;
const INPUT_PROCESS: usize = 1;
const OUTPUT_PROCESS: usize = 11;

// Tensor slots
const T_INPUT: usize = 0;
const T_ENC0: usize = 1;
const T_POOL1: usize = 2;
const T_ENC1: usize = 3;
const T_POOL2: usize = 4;
const T_BOTT: usize = 5;
const T_UP2: usize = 6;
const T_DEC1: usize = 7;
const T_UP1: usize = 8;
const T_OUT: usize = 9;

/// Name and `[first, last]` op window of every tensor slot
const TENSOR_LIFETIMES: [(&str, usize, usize); 10] = [
    ("input", 1, 2),
    ("enc0", 2, 10),
    ("pool1", 3, 4),
    ("enc1", 4, 8),
    ("pool2", 5, 6),
    ("bottleneck", 6, 7),
    ("upsample2", 7, 8),
    ("dec1", 8, 9),
    ("upsample1", 9, 10),
    ("output", 10, 11),
];

/// Source, concatenated source and destination slots of nodes 2..=10
const WIRING: [(usize, Option<usize>, usize); 9] = [
    (T_INPUT, None, T_ENC0),
    (T_ENC0, None, T_POOL1),
    (T_POOL1, None, T_ENC1),
    (T_ENC1, None, T_POOL2),
    (T_POOL2, None, T_BOTT),
    (T_BOTT, None, T_UP2),
    (T_UP2, Some(T_ENC1), T_DEC1),
    (T_DEC1, None, T_UP1),
    (T_UP1, Some(T_ENC0), T_OUT),
];

enum Node {
    Autoexposure(Box<dyn AutoexposureOp>),
    Input(Box<dyn InputProcessOp>),
    Conv(Box<dyn ConvOp>),
    Resample(Box<dyn ResampleOp>),
    Output(Box<dyn OutputProcessOp>),
}

macro_rules! dispatch {
    ($node:expr, $op:ident => $body:expr) => {
        match $node {
            Node::Autoexposure($op) => $body,
            Node::Input($op) => $body,
            Node::Conv($op) => $body,
            Node::Resample($op) => $body,
            Node::Output($op) => $body,
        }
    };
}

/// Shape of a graph instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphConfig {
    pub spec: UNetSpec,
    pub tile_h: usize,
    pub tile_w: usize,
    /// Full color image, for autoexposure
    pub image: ImageDesc,
}

impl GraphConfig {
    pub fn new(spec: UNetSpec, tile_h: usize, tile_w: usize, image: ImageDesc) -> Self {
        Self {
            spec,
            tile_h,
            tile_w,
            image,
        }
    }
}

/// Images bound for one tile
#[derive(Clone)]
pub struct TileImages {
    pub color: Arc<Image>,
    pub albedo: Option<Arc<Image>>,
    pub normal: Option<Arc<Image>>,
    pub output: Arc<Image>,
}

/// Ops and their memory layout before allocation
struct Blueprint {
    nodes: Vec<Node>,
    tensors: Vec<TensorDesc>,
    requests: Vec<LifetimeRequest>,
    /// `(node, request)` pairs of ops that need scratch
    scratch: Vec<(usize, usize)>,
}

fn conv_desc(layer: &ConvLayer, src: &TensorDesc, concat: Option<&TensorDesc>) -> DenoiseResult<ConvDesc> {
    Ok(ConvDesc {
        src: src.clone(),
        concat: concat.cloned(),
        weight: TensorDesc::new(layer.weight_dims().to_vec(), TensorLayout::Oihw, DataType::Float32)?,
        bias: TensorDesc::new(vec![layer.out_channels], TensorLayout::X, DataType::Float32)?,
        activation: layer.activation,
    })
}

impl Blueprint {
    fn new(engine: &Arc<dyn Engine>, config: &GraphConfig) -> DenoiseResult<Self> {
        let (th, tw) = (config.tile_h, config.tile_w);
        if th % UNET_ALIGNMENT != 0 || tw % UNET_ALIGNMENT != 0 {
            return Err(logic_error!(
                "tile {}x{} is not aligned to {}",
                tw,
                th,
                UNET_ALIGNMENT
            ));
        }

        let layers = config.spec.layers();
        let input = TensorDesc::chw(config.spec.in_channels, th, tw);

        let mut enc_conv0 = engine.new_conv(&conv_desc(&layers[0], &input, None)?)?;
        let enc0 = enc_conv0.dst_desc();
        let mut pool1 = engine.new_pool(&enc0)?;
        let pool1_out = pool1.dst_desc();
        let mut enc_conv1 = engine.new_conv(&conv_desc(&layers[1], &pool1_out, None)?)?;
        let enc1 = enc_conv1.dst_desc();
        let mut pool2 = engine.new_pool(&enc1)?;
        let pool2_out = pool2.dst_desc();
        let mut bottleneck = engine.new_conv(&conv_desc(&layers[2], &pool2_out, None)?)?;
        let bott = bottleneck.dst_desc();
        let mut upsample2 = engine.new_upsample(&bott)?;
        let up2 = upsample2.dst_desc();
        let mut dec_conv1 = engine.new_conv(&conv_desc(&layers[3], &up2, Some(&enc1))?)?;
        let dec1 = dec_conv1.dst_desc();
        let mut upsample1 = engine.new_upsample(&dec1)?;
        let up1 = upsample1.dst_desc();
        let mut dec_conv0 = engine.new_conv(&conv_desc(&layers[4], &up1, Some(&enc0))?)?;
        let out = dec_conv0.dst_desc();

        for (conv, layer) in [&mut enc_conv0, &mut enc_conv1, &mut bottleneck, &mut dec_conv1, &mut dec_conv0]
            .into_iter()
            .zip(&layers)
        {
            conv.set_name(layer.name);
        }
        pool1.set_name("pool1");
        pool2.set_name("pool2");
        upsample2.set_name("upsample2");
        upsample1.set_name("upsample1");

        let nodes = vec![
            Node::Autoexposure(engine.new_autoexposure(&config.image)?),
            Node::Input(engine.new_input_process(&input)?),
            Node::Conv(enc_conv0),
            Node::Resample(pool1),
            Node::Conv(enc_conv1),
            Node::Resample(pool2),
            Node::Conv(bottleneck),
            Node::Resample(upsample2),
            Node::Conv(dec_conv1),
            Node::Resample(upsample1),
            Node::Conv(dec_conv0),
            Node::Output(engine.new_output_process(&out)?),
        ];

        for node in &nodes {
            if !dispatch!(node, op => op.is_supported()) {
                return Err(logic_error!(
                    "'{}' is not supported by the {} engine",
                    dispatch!(node, op => op.name()),
                    engine.device_type()
                ));
            }
        }

        let tensors = vec![input, enc0, pool1_out, enc1, pool2_out, bott, up2, dec1, up1, out];
        let mut requests: Vec<LifetimeRequest> = tensors
            .iter()
            .zip(TENSOR_LIFETIMES)
            .map(|(desc, (name, first, last))| LifetimeRequest::new(name, desc.byte_size(), first, last))
            .collect();

        let mut scratch = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            let size = dispatch!(node, op => op.scratch_aligned_size());
            if size > 0 {
                let name = format!("{}.scratch", dispatch!(node, op => op.name()));
                scratch.push((index, requests.len()));
                requests.push(LifetimeRequest::new(name, size, index, index));
            }
        }

        Ok(Self {
            nodes,
            tensors,
            requests,
            scratch,
        })
    }
}

/// Offsets of each layer's weight and bias in the weight buffer, and its size
fn weight_layout(spec: &UNetSpec) -> (Vec<(usize, usize)>, usize) {
    let mut offset = 0;
    let mut offsets = Vec::new();
    for layer in spec.layers() {
        let weight_bytes = layer.weight_dims().iter().product::<usize>() * 4;
        let bias_offset = offset + round_up(weight_bytes, MEMORY_ALIGNMENT);
        offsets.push((offset, bias_offset));
        offset = bias_offset + round_up(layer.out_channels * 4, MEMORY_ALIGNMENT);
    }
    (offsets, offset)
}

/// UNet instance for one tile size
pub struct NetworkGraph {
    config: GraphConfig,
    nodes: Vec<Node>,
    tensors: Vec<Arc<Tensor>>,
    arena: Arc<Buffer>,
    weights: Arc<Buffer>,
}

impl std::fmt::Debug for NetworkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGraph")
            .field("config", &self.config)
            .field("arena_bytes", &self.arena.byte_size())
            .field("weight_bytes", &self.weights.byte_size())
            .finish()
    }
}

impl NetworkGraph {
    /// Bytes a graph of this shape needs: arena, weights and the image
    /// pixels one tile touches
    pub fn estimate_bytes(engine: &Arc<dyn Engine>, config: &GraphConfig) -> DenoiseResult<usize> {
        let blueprint = Blueprint::new(engine, config)?;
        let plan = plan_lifetimes(&blueprint.requests)?;
        let (_, weight_bytes) = weight_layout(&config.spec);

        let mut calc = MemoryCalculator::new();
        calc.add_bytes("arena", plan.byte_size);
        calc.add_bytes("weights", weight_bytes);
        calc.add_tensor(
            "tile images",
            config.tile_h * config.tile_w * (config.spec.in_channels + 3),
            std::mem::size_of::<f32>(),
        );
        Ok(calc.total_bytes())
    }

    /// Build, allocate, upload weights and finalize every op
    ///
    /// Autoexposure is finalized when it is first submitted, since it needs
    /// the color image.
    pub fn new(
        engine: &Arc<dyn Engine>,
        config: GraphConfig,
        weights: &Weights,
        params: ProcessParams,
    ) -> DenoiseResult<Self> {
        config.spec.validate(weights)?;
        let Blueprint {
            mut nodes,
            tensors: descs,
            requests,
            scratch,
        } = Blueprint::new(engine, &config)?;

        let ArenaPlan { offsets, byte_size } = plan_lifetimes(&requests)?;
        let arena = Buffer::new(Arc::clone(engine), byte_size, Storage::Device)?;
        let tensors = descs
            .into_iter()
            .zip(&offsets)
            .map(|(desc, &offset)| Tensor::new(&arena, desc, offset))
            .collect::<DenoiseResult<Vec<_>>>()?;

        for (node, request) in scratch {
            let elements = requests[request].byte_size / std::mem::size_of::<f32>();
            let desc = TensorDesc::new(vec![elements], TensorLayout::X, DataType::Float32)?;
            let tensor = Tensor::new(&arena, desc, offsets[request])?;
            dispatch!(&mut nodes[node], op => op.set_scratch(tensor))?;
        }

        let layers = config.spec.layers();
        let (weight_offsets, weight_bytes) = weight_layout(&config.spec);
        let weight_buffer = Buffer::new(Arc::clone(engine), weight_bytes, Storage::Device)?;
        let mut conv_weights = Vec::with_capacity(layers.len());
        for (layer, &(weight_offset, bias_offset)) in layers.iter().zip(&weight_offsets) {
            let weight = weights.expect(&layer.weight_name(), &layer.weight_dims())?;
            let bias = weights.expect(&layer.bias_name(), &[layer.out_channels])?;
            let w = Tensor::new(
                &weight_buffer,
                TensorDesc::new(layer.weight_dims().to_vec(), TensorLayout::Oihw, DataType::Float32)?,
                weight_offset,
            )?;
            let b = Tensor::new(
                &weight_buffer,
                TensorDesc::new(vec![layer.out_channels], TensorLayout::X, DataType::Float32)?,
                bias_offset,
            )?;
            w.upload(&weight.values)?;
            b.upload(&bias.values)?;
            conv_weights.push((w, b));
        }

        let mut conv_weights = conv_weights.into_iter();
        for (k, &(src, concat, dst)) in WIRING.iter().enumerate() {
            let concat = concat.map(|slot| Arc::clone(&tensors[slot]));
            match &mut nodes[k + 2] {
                Node::Conv(op) => {
                    let (w, b) = conv_weights
                        .next()
                        .ok_or_else(|| logic_error!("more convolutions than weight layers"))?;
                    op.set_src(Arc::clone(&tensors[src]), concat);
                    op.set_weight(w, b);
                    op.set_dst(Arc::clone(&tensors[dst]));
                }
                Node::Resample(op) => {
                    op.set_src(Arc::clone(&tensors[src]));
                    op.set_dst(Arc::clone(&tensors[dst]));
                }
                _ => return Err(logic_error!("unexpected node at position {}", k + 2)),
            }
        }

        let mut graph = Self {
            config,
            nodes,
            tensors,
            arena,
            weights: weight_buffer,
        };
        let (input, output) = (Arc::clone(&graph.tensors[T_INPUT]), Arc::clone(&graph.tensors[T_OUT]));
        graph.input_op()?.set_dst(input);
        graph.output_op()?.set_src(output);
        graph.set_params(params)?;

        for node in graph.nodes.iter_mut().skip(INPUT_PROCESS) {
            dispatch!(node, op => op.finalize())?;
        }

        debug!(
            "built {}x{} tile graph: arena {} bytes, weights {} bytes",
            graph.config.tile_w,
            graph.config.tile_h,
            graph.arena.byte_size(),
            graph.weights.byte_size()
        );
        Ok(graph)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn spec(&self) -> &UNetSpec {
        &self.config.spec
    }

    /// Tensor extent `(h, w)` of one tile
    pub fn tile_size(&self) -> (usize, usize) {
        (self.config.tile_h, self.config.tile_w)
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena.byte_size()
    }

    pub fn weight_bytes(&self) -> usize {
        self.weights.byte_size()
    }

    fn autoexposure_op(&mut self) -> DenoiseResult<&mut Box<dyn AutoexposureOp>> {
        match &mut self.nodes[AUTOEXPOSURE] {
            Node::Autoexposure(op) => Ok(op),
            _ => Err(logic_error!("graph has no autoexposure node")),
        }
    }

    fn input_op(&mut self) -> DenoiseResult<&mut Box<dyn InputProcessOp>> {
        match &mut self.nodes[INPUT_PROCESS] {
            Node::Input(op) => Ok(op),
            _ => Err(logic_error!("graph has no input node")),
        }
    }

    fn output_op(&mut self) -> DenoiseResult<&mut Box<dyn OutputProcessOp>> {
        match &mut self.nodes[OUTPUT_PROCESS] {
            Node::Output(op) => Ok(op),
            _ => Err(logic_error!("graph has no output node")),
        }
    }

    /// Update transfer function, mode flags and the exposure target
    pub fn set_params(&mut self, params: ProcessParams) -> DenoiseResult<()> {
        let exposure = Arc::clone(params.transfer.exposure());
        self.autoexposure_op()?.set_dst(exposure);
        self.input_op()?.set_params(params.clone());
        self.output_op()?.set_params(params);
        Ok(())
    }

    /// Enqueue autoexposure over the full color image
    pub fn submit_autoexposure(&mut self, color: &Arc<Image>) -> DenoiseResult<()> {
        let op = self.autoexposure_op()?;
        op.set_src(Arc::clone(color));
        op.finalize()?;
        op.submit()
    }

    /// Enqueue the full network for one tile
    ///
    /// `input_tile` maps image pixels into the input tensor, `output_tile`
    /// maps output tensor pixels into the output image.
    pub fn submit_tile(&mut self, images: &TileImages, input_tile: Tile, output_tile: Tile) -> DenoiseResult<()> {
        let input = self.input_op()?;
        input.set_src(Some(Arc::clone(&images.color)), images.albedo.clone(), images.normal.clone());
        input.set_tile(input_tile);

        let output = self.output_op()?;
        output.set_dst(Arc::clone(&images.output));
        output.set_tile(output_tile);

        for node in self.nodes.iter().skip(INPUT_PROCESS) {
            dispatch!(node, op => op.submit())?;
        }
        Ok(())
    }
}
