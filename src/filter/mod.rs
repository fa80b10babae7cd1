//! Filters
//!
//! A [`Filter`] binds images to named roles and scalar parameters to a
//! network graph on one engine. Changes mark the filter dirty;
//! [`Filter::commit`] validates the recipe, plans tiles under the memory
//! budget and builds a new graph only when its shape changed. Execution
//! walks the tile plan in row-major order, reporting progress between tiles.

pub mod progress;
pub mod settings;
pub mod tiling;

pub use progress::{ProgressCallback, ProgressMonitor};
pub use settings::{FilterKind, FilterSettings, DEFAULT_MAX_MEMORY_MB};
pub use tiling::{plan_tiles, plan_with_tile_size, TilePlan, TileRegion, MIN_TILE_SIZE, TILE_ALIGNMENT, TILE_OVERLAP};

use crate::backend::{Engine, SyncMode};
use crate::device::Device;
use crate::error::DenoiseResult;
use crate::memory::{Buffer, Storage};
use crate::network::{builtin_weights, GraphConfig, NetworkGraph, TileImages, UNetSpec, Weights};
use crate::ops::{ExposureCell, ImageCopyOp, ProcessParams, TransferFunction, TransferKind};
use crate::tensor::{Image, ImageDesc, Tile};
use crate::{invalid_argument, invalid_operation, logic_error};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const MIB: usize = 1024 * 1024;

/// Counters that make graph reuse observable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Commits that built a new graph
    pub graph_builds: usize,
    /// Commits that reused the existing graph
    pub param_updates: usize,
    /// Tiles in the current plan
    pub tile_count: usize,
    /// Arena bytes of the current graph
    pub arena_bytes: usize,
    pub executions: usize,
}

/// Images bound to the filter roles
#[derive(Debug, Clone, Default)]
struct ImageBindings {
    color: Option<Arc<Image>>,
    albedo: Option<Arc<Image>>,
    normal: Option<Arc<Image>>,
    output: Option<Arc<Image>>,
}

impl ImageBindings {
    fn slot(&mut self, role: &str) -> Option<&mut Option<Arc<Image>>> {
        match role {
            "color" => Some(&mut self.color),
            "albedo" => Some(&mut self.albedo),
            "normal" => Some(&mut self.normal),
            "output" => Some(&mut self.output),
            _ => None,
        }
    }

    fn get(&self, role: &str) -> Option<&Arc<Image>> {
        match role {
            "color" => self.color.as_ref(),
            "albedo" => self.albedo.as_ref(),
            "normal" => self.normal.as_ref(),
            "output" => self.output.as_ref(),
            _ => None,
        }
    }
}

/// Where the network weights come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeightsId {
    Builtin { clean_aux: bool },
    User { hash: u64, len: usize },
}

/// Everything that requires a new graph when it changes
#[derive(Debug, Clone, PartialEq, Eq)]
struct GraphKey {
    spec: UNetSpec,
    tile_h: usize,
    tile_w: usize,
    width: usize,
    height: usize,
    weights: WeightsId,
}

/// Copy of an input that overlaps the output
struct InPlaceCopy {
    op: Box<dyn ImageCopyOp>,
    temp: Arc<Image>,
}

struct Committed {
    key: GraphKey,
    graph: NetworkGraph,
    plan: TilePlan,
    color: Arc<Image>,
    albedo: Option<Arc<Image>>,
    normal: Option<Arc<Image>>,
    output: Arc<Image>,
    /// Per input role (color, albedo, normal)
    copies: [Option<InPlaceCopy>; 3],
    auto_exposure: bool,
}

impl Committed {
    /// Every bound image and in-place temporary must still address memory
    fn validate_images(&self) -> DenoiseResult<()> {
        let bound = [Some(&self.color), self.albedo.as_ref(), self.normal.as_ref(), Some(&self.output)];
        let temps = self.copies.iter().flatten().map(|copy| &copy.temp);
        for image in bound.into_iter().flatten().chain(temps) {
            image.validate()?;
        }
        Ok(())
    }
}

/// Validated recipe of one commit
struct Recipe {
    color: Arc<Image>,
    albedo: Option<Arc<Image>>,
    normal: Option<Arc<Image>>,
    output: Arc<Image>,
}

impl Recipe {
    fn in_channels(&self) -> usize {
        3 + 3 * usize::from(self.albedo.is_some()) + 3 * usize::from(self.normal.is_some())
    }
}

/// A denoising filter
pub struct Filter {
    device: Arc<Device>,
    kind: FilterKind,
    settings: FilterSettings,
    images: ImageBindings,
    user_weights: Option<Arc<Vec<u8>>>,
    progress: Option<ProgressCallback>,
    exposure: Arc<ExposureCell>,
    dirty: bool,
    committed: Option<Committed>,
    stats: FilterStats,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("kind", &self.kind)
            .field("settings", &self.settings)
            .field("dirty", &self.dirty)
            .field("committed", &self.committed.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Filter {
    /// Create a filter of type `"RT"` or `"RTLightmap"` on a committed device
    pub fn new(device: &Arc<Device>, type_name: &str) -> DenoiseResult<Self> {
        device.check_committed()?;
        let kind = FilterKind::from_name(type_name)?;
        debug!("created {} filter", kind.name());
        Ok(Self {
            device: Arc::clone(device),
            kind,
            settings: FilterSettings::default(),
            images: ImageBindings::default(),
            user_weights: None,
            progress: None,
            exposure: Arc::new(ExposureCell::default()),
            dirty: true,
            committed: None,
            stats: FilterStats::default(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Committed with no pending changes
    pub fn is_committed(&self) -> bool {
        self.committed.is_some() && !self.dirty
    }

    fn role_slot(&mut self, role: &str) -> DenoiseResult<&mut Option<Arc<Image>>> {
        if !self.kind.has_role(role) {
            return Err(invalid_argument!("unknown {} filter image '{}'", self.kind.name(), role));
        }
        self.images
            .slot(role)
            .ok_or_else(|| invalid_argument!("unknown filter image '{}'", role))
    }

    /// Bind an image to a role
    pub fn set_image(&mut self, role: &str, image: Arc<Image>) -> DenoiseResult<()> {
        if image.format().channels() == 0 {
            return Err(invalid_argument!("image '{}' has an undefined format", role));
        }
        if image.buffer().is_none() && !self.device.capabilities().system_memory_supported {
            return Err(invalid_argument!(
                "image '{}' uses system memory, which the device cannot access",
                role
            ));
        }
        *self.role_slot(role)? = Some(image);
        self.dirty = true;
        Ok(())
    }

    /// Remove the image bound to a role
    pub fn unset_image(&mut self, role: &str) -> DenoiseResult<()> {
        let slot = self.role_slot(role)?;
        if slot.take().is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn image(&self, role: &str) -> Option<&Arc<Image>> {
        self.images.get(role)
    }

    /// Set an opaque data parameter; only `"weights"` is recognized
    ///
    /// `None` removes the override. The bytes are copied and only parsed at
    /// commit.
    pub fn set_data(&mut self, name: &str, data: Option<&[u8]>) -> DenoiseResult<()> {
        if name != "weights" {
            warn!("unknown {} filter data '{}'", self.kind.name(), name);
            return Ok(());
        }
        self.user_weights = data.map(|bytes| Arc::new(bytes.to_vec()));
        self.dirty = true;
        Ok(())
    }

    pub fn unset_data(&mut self, name: &str) -> DenoiseResult<()> {
        self.set_data(name, None)
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> DenoiseResult<()> {
        if self.settings.set_int(self.kind, name, value)? {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn get_int(&self, name: &str) -> DenoiseResult<i32> {
        self.settings.get_int(self.kind, name)
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> DenoiseResult<()> {
        self.set_int(name, i32::from(value))
    }

    pub fn get_bool(&self, name: &str) -> DenoiseResult<bool> {
        self.get_int(name).map(|v| v != 0)
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> DenoiseResult<()> {
        if self.settings.set_float(self.kind, name, value)? {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn get_float(&self, name: &str) -> DenoiseResult<f32> {
        self.settings.get_float(self.kind, name)
    }

    /// Install or remove the progress callback; takes effect on the next run
    pub fn set_progress_monitor(&mut self, callback: Option<ProgressCallback>) {
        self.progress = callback;
    }

    fn validate_recipe(&self) -> DenoiseResult<Recipe> {
        let color = self
            .images
            .color
            .clone()
            .ok_or_else(|| invalid_operation!("color image not specified"))?;
        let output = self
            .images
            .output
            .clone()
            .ok_or_else(|| invalid_operation!("output image not specified"))?;
        let albedo = self.images.albedo.clone();
        let normal = self.images.normal.clone();

        if normal.is_some() && albedo.is_none() {
            return Err(invalid_operation!("normal image requires an albedo image"));
        }
        if self.kind == FilterKind::Rt && self.settings.hdr && self.settings.srgb {
            return Err(invalid_operation!("hdr and srgb modes cannot be enabled at the same time"));
        }

        let (width, height) = (output.width(), output.height());
        for (role, image) in [
            ("color", Some(&color)),
            ("albedo", albedo.as_ref()),
            ("normal", normal.as_ref()),
            ("output", Some(&output)),
        ] {
            let Some(image) = image else { continue };
            if image.format().channels() != 3 {
                return Err(invalid_operation!(
                    "image '{}' has unsupported format {:?}",
                    role,
                    image.format()
                ));
            }
            if image.width() != width || image.height() != height {
                return Err(invalid_operation!(
                    "image '{}' is {}x{}, output is {}x{}",
                    role,
                    image.width(),
                    image.height(),
                    width,
                    height
                ));
            }
        }

        Ok(Recipe {
            color,
            albedo,
            normal,
            output,
        })
    }

    /// Network shape and, for user blobs, the parsed weights
    fn resolve_weights(&self, in_channels: usize) -> DenoiseResult<(UNetSpec, WeightsId, Option<Weights>)> {
        match &self.user_weights {
            Some(bytes) => {
                let weights = Weights::parse(bytes)?;
                let spec = UNetSpec::from_weights(&weights, in_channels)?;
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                let id = WeightsId::User {
                    hash: hasher.finish(),
                    len: bytes.len(),
                };
                Ok((spec, id, Some(weights)))
            }
            None => Ok((
                UNetSpec::for_quality(self.settings.quality, in_channels),
                WeightsId::Builtin {
                    clean_aux: self.settings.clean_aux,
                },
                None,
            )),
        }
    }

    fn process_params(&self) -> ProcessParams {
        let hdr = self.settings.is_hdr(self.kind);
        let snorm = self.settings.is_snorm(self.kind);
        let kind = if hdr {
            TransferKind::Log
        } else if snorm || self.settings.srgb {
            TransferKind::Linear
        } else {
            TransferKind::Srgb
        };
        ProcessParams {
            transfer: TransferFunction::new(kind, Arc::clone(&self.exposure)),
            hdr,
            snorm,
        }
    }

    /// Temporary copies of inputs that overlap the output
    fn plan_copies(
        engine: &Arc<dyn Engine>,
        recipe: &Recipe,
        tile_count: usize,
    ) -> DenoiseResult<[Option<InPlaceCopy>; 3]> {
        let mut copies: [Option<InPlaceCopy>; 3] = [None, None, None];
        if tile_count <= 1 {
            return Ok(copies);
        }
        let inputs = [Some(&recipe.color), recipe.albedo.as_ref(), recipe.normal.as_ref()];
        for (slot, input) in copies.iter_mut().zip(inputs) {
            let Some(input) = input else { continue };
            if !input.overlaps(&recipe.output) {
                continue;
            }
            let desc = ImageDesc::new(input.format(), input.width(), input.height(), 0, 0)?;
            let buffer = Buffer::new(Arc::clone(engine), desc.byte_size(), Storage::Device)?;
            let temp = Image::from_buffer(&buffer, desc, 0)?;
            let mut op = engine.new_image_copy()?;
            op.set_src(Arc::clone(input));
            op.set_dst(Arc::clone(&temp));
            op.finalize()?;
            *slot = Some(InPlaceCopy { op, temp });
        }
        Ok(copies)
    }

    /// Validate the bindings and build or update the graph
    ///
    /// On failure the previously committed state is kept.
    pub fn commit(&mut self) -> DenoiseResult<()> {
        let engine = self.device.engine()?;
        // work still in flight may use the current graph
        if let Err(err) = engine.wait() {
            self.device.record_error(&err);
        }

        let recipe = self.validate_recipe()?;
        let in_channels = recipe.in_channels();
        let (spec, weights_id, user_weights) = self.resolve_weights(in_channels)?;
        let (width, height) = (recipe.output.width(), recipe.output.height());

        let color_desc = *recipe.color.desc();
        let budget = self.settings.max_memory_mb.saturating_mul(MIB);
        let plan = plan_tiles(height, width, budget, |tile_h, tile_w| {
            NetworkGraph::estimate_bytes(&engine, &GraphConfig::new(spec, tile_h, tile_w, color_desc))
        })?;

        let key = GraphKey {
            spec,
            tile_h: plan.tile_h,
            tile_w: plan.tile_w,
            width,
            height,
            weights: weights_id,
        };
        let copies = Self::plan_copies(&engine, &recipe, plan.len())?;
        let params = self.process_params();
        let auto_exposure = self.settings.auto_exposure(self.kind);

        let reuse = self.committed.as_ref().is_some_and(|c| c.key == key);
        let graph = if reuse {
            None
        } else {
            let weights = match user_weights {
                Some(weights) => weights,
                None => builtin_weights(self.settings.quality, in_channels, self.settings.clean_aux)?,
            };
            let config = GraphConfig::new(spec, plan.tile_h, plan.tile_w, color_desc);
            Some(NetworkGraph::new(&engine, config, &weights, params.clone())?)
        };

        let tile_count = plan.len();
        let Recipe {
            color,
            albedo,
            normal,
            output,
        } = recipe;
        let arena_bytes = if let Some(graph) = graph {
            debug!(
                "{} filter committed: {} quality, {} input channels, {} tile(s)",
                self.kind.name(),
                self.settings.quality,
                in_channels,
                tile_count
            );
            let arena_bytes = graph.arena_bytes();
            self.committed = Some(Committed {
                key,
                graph,
                plan,
                color,
                albedo,
                normal,
                output,
                copies,
                auto_exposure,
            });
            self.stats.graph_builds += 1;
            arena_bytes
        } else {
            let committed = self
                .committed
                .as_mut()
                .ok_or_else(|| logic_error!("graph reuse without a committed graph"))?;
            committed.graph.set_params(params)?;
            committed.plan = plan;
            committed.color = color;
            committed.albedo = albedo;
            committed.normal = normal;
            committed.output = output;
            committed.copies = copies;
            committed.auto_exposure = auto_exposure;
            self.stats.param_updates += 1;
            debug!("{} filter committed (graph reused)", self.kind.name());
            committed.graph.arena_bytes()
        };

        if !auto_exposure {
            let scale = self.settings.input_scale;
            self.exposure.set(if scale.is_nan() { 1.0 } else { scale });
        }
        self.stats.arena_bytes = arena_bytes;
        self.stats.tile_count = tile_count;
        self.dirty = false;
        Ok(())
    }

    /// Run the filter
    ///
    /// In [`SyncMode::Sync`] the call returns after the output is written and
    /// the progress callback runs on the calling thread. In
    /// [`SyncMode::Async`] the work and the progress reports are only
    /// enqueued; errors, including cancellation, surface on device sync.
    pub fn execute(&mut self, mode: SyncMode) -> DenoiseResult<()> {
        if self.dirty {
            return Err(invalid_operation!("changes to the filter are not committed"));
        }
        let Filter {
            device,
            progress,
            committed,
            stats,
            ..
        } = self;
        let committed = committed
            .as_mut()
            .ok_or_else(|| invalid_operation!("filter is not committed"))?;
        let engine = device.engine()?;
        committed.validate_images()?;
        let monitor = Arc::new(ProgressMonitor::new(progress.clone(), committed.plan.len()));

        match mode {
            SyncMode::Sync => monitor.start()?,
            SyncMode::Async => {
                let monitor = Arc::clone(&monitor);
                engine.submit_host_func(Box::new(move || -> DenoiseResult<()> { monitor.start() }));
            }
        }

        let source = |copy: &Option<InPlaceCopy>, image: &Arc<Image>| -> DenoiseResult<Arc<Image>> {
            match copy {
                Some(copy) => {
                    copy.op.submit()?;
                    Ok(Arc::clone(&copy.temp))
                }
                None => Ok(Arc::clone(image)),
            }
        };
        let color = source(&committed.copies[0], &committed.color)?;
        let albedo = match &committed.albedo {
            Some(albedo) => Some(source(&committed.copies[1], albedo)?),
            None => None,
        };
        let normal = match &committed.normal {
            Some(normal) => Some(source(&committed.copies[2], normal)?),
            None => None,
        };
        let output = Arc::clone(&committed.output);

        if committed.auto_exposure {
            committed.graph.submit_autoexposure(&committed.color)?;
        }

        for (index, region) in committed.plan.tiles.iter().enumerate() {
            trace!("tile {}/{}: {:?}", index + 1, committed.plan.len(), region);
            let input = region.input;
            let out = region.output;
            let sub = |image: &Arc<Image>| image.sub_image(input.h_src_begin, input.w_src_begin, input.h, input.w);
            let images = TileImages {
                color: sub(&color)?,
                albedo: albedo.as_ref().map(sub).transpose()?,
                normal: normal.as_ref().map(sub).transpose()?,
                output: output.sub_image(out.h_dst_begin, out.w_dst_begin, out.h, out.w)?,
            };
            let input_tile = Tile::full(input.h, input.w);
            let output_tile = Tile {
                h_dst_begin: 0,
                w_dst_begin: 0,
                ..out
            };
            committed.graph.submit_tile(&images, input_tile, output_tile)?;

            match mode {
                SyncMode::Sync => {
                    engine.wait()?;
                    monitor.advance()?;
                }
                SyncMode::Async => {
                    let monitor = Arc::clone(&monitor);
                    engine.submit_host_func(Box::new(move || -> DenoiseResult<()> { monitor.advance() }));
                }
            }
        }

        if mode == SyncMode::Sync {
            engine.wait()?;
        }
        stats.executions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceType;
    use crate::error::ErrorCode;
    use crate::tensor::Format;

    fn device() -> Arc<Device> {
        let device = Device::new(DeviceType::Cpu).unwrap();
        device.set_int("numThreads", 2).unwrap();
        device.commit().unwrap();
        device
    }

    fn image(device: &Arc<Device>, format: Format, w: usize, h: usize, value: f32) -> Arc<Image> {
        let desc = ImageDesc::new(format, w, h, 0, 0).unwrap();
        let buffer = device.new_buffer(desc.byte_size(), Storage::Host).unwrap();
        if format == Format::Float3 {
            let values = vec![value; w * h * 3];
            buffer.write(0, bytemuck::cast_slice(&values)).unwrap();
        }
        Image::from_buffer(&buffer, desc, 0).unwrap()
    }

    #[test]
    fn test_filter_requires_committed_device() {
        let device = Device::new(DeviceType::Cpu).unwrap();
        assert_eq!(
            Filter::new(&device, "RT").unwrap_err().code(),
            ErrorCode::InvalidOperation
        );
    }

    #[test]
    fn test_recipe_validation() {
        let device = device();
        let mut filter = device.new_filter("RT").unwrap();
        assert_eq!(filter.commit().unwrap_err().code(), ErrorCode::InvalidOperation);

        filter.set_image("color", image(&device, Format::Float3, 8, 8, 0.5)).unwrap();
        filter.set_image("output", image(&device, Format::Float3, 8, 8, 0.0)).unwrap();
        filter.set_image("normal", image(&device, Format::Float3, 8, 8, 0.0)).unwrap();
        assert_eq!(filter.commit().unwrap_err().code(), ErrorCode::InvalidOperation);
        filter.unset_image("normal").unwrap();

        filter.set_bool("hdr", true).unwrap();
        filter.set_bool("srgb", true).unwrap();
        assert_eq!(filter.commit().unwrap_err().code(), ErrorCode::InvalidOperation);
        filter.set_bool("srgb", false).unwrap();

        filter.set_image("albedo", image(&device, Format::Float3, 4, 8, 0.0)).unwrap();
        assert_eq!(filter.commit().unwrap_err().code(), ErrorCode::InvalidOperation);
        filter.unset_image("albedo").unwrap();

        filter.commit().unwrap();
        assert!(filter.is_committed());
    }

    #[test]
    fn test_unknown_roles_and_types() {
        let device = device();
        assert_eq!(device.new_filter("NL").unwrap_err().code(), ErrorCode::InvalidArgument);
        let mut filter = device.new_filter("RTLightmap").unwrap();
        let albedo = image(&device, Format::Float3, 4, 4, 0.0);
        assert_eq!(filter.set_image("albedo", albedo).unwrap_err().code(), ErrorCode::InvalidArgument);
        assert_eq!(filter.unset_image("beauty").unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_execute_before_commit() {
        let device = device();
        let mut filter = device.new_filter("RT").unwrap();
        assert_eq!(filter.execute(SyncMode::Sync).unwrap_err().code(), ErrorCode::InvalidOperation);
    }

    #[test]
    fn test_param_change_reuses_graph() {
        let device = device();
        let mut filter = device.new_filter("RT").unwrap();
        filter.set_image("color", image(&device, Format::Float3, 16, 16, 0.5)).unwrap();
        filter.set_image("output", image(&device, Format::Float3, 16, 16, 0.0)).unwrap();
        filter.commit().unwrap();
        filter.set_bool("srgb", true).unwrap();
        assert!(!filter.is_committed());
        filter.commit().unwrap();
        let stats = filter.stats();
        assert_eq!((stats.graph_builds, stats.param_updates), (1, 1));

        filter.set_int("quality", 4).unwrap();
        filter.commit().unwrap();
        assert_eq!(filter.stats().graph_builds, 2);
        filter.execute(SyncMode::Sync).unwrap();
        assert_eq!(filter.stats().executions, 1);
    }

    #[test]
    fn test_invalid_weights_keep_previous_commit() {
        let device = device();
        let mut filter = device.new_filter("RT").unwrap();
        filter.set_image("color", image(&device, Format::Float3, 8, 8, 0.5)).unwrap();
        filter.set_image("output", image(&device, Format::Float3, 8, 8, 0.0)).unwrap();
        filter.commit().unwrap();

        filter.set_data("weights", Some(b"not a weight blob")).unwrap();
        assert_eq!(filter.commit().unwrap_err().code(), ErrorCode::InvalidOperation);
        assert_eq!(filter.stats().graph_builds, 1);

        filter.unset_data("weights").unwrap();
        filter.commit().unwrap();
        filter.execute(SyncMode::Sync).unwrap();
    }
}
