//! Devices
//!
//! A [`Device`] composes a backend (capabilities, engine creation) with the
//! state every backend shares: the one-shot commit, named parameters and the
//! sticky error slot. Everything that needs a finalized configuration goes
//! through [`Device::check_committed`].

pub mod errors;
pub mod physical;

pub use errors::{record_global_error, take_global_error, ErrorCallback, ErrorState};
pub use physical::{num_physical_devices, physical_device, physical_devices, PciAddress, PhysicalDevice};

use crate::backend::{create_backend, DeviceBackend, DeviceCapabilities, DeviceType, Engine};
use crate::config::DeviceConfig;
use crate::error::{DenoiseError, DenoiseResult, ErrorCode};
use crate::filter::Filter;
use crate::logging;
use crate::memory::{Buffer, Storage};
use crate::{invalid_argument, invalid_operation};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const fn parse_version(s: &str) -> i32 {
    let bytes = s.as_bytes();
    let mut value = 0i32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as i32;
        i += 1;
    }
    value
}

pub const VERSION_MAJOR: i32 = parse_version(env!("CARGO_PKG_VERSION_MAJOR"));
pub const VERSION_MINOR: i32 = parse_version(env!("CARGO_PKG_VERSION_MINOR"));
pub const VERSION_PATCH: i32 = parse_version(env!("CARGO_PKG_VERSION_PATCH"));
/// Packed version: major * 10000 + minor * 100 + patch
pub const VERSION: i32 = VERSION_MAJOR * 10000 + VERSION_MINOR * 100 + VERSION_PATCH;

#[derive(Debug, Default)]
struct DeviceState {
    committed: bool,
    config: DeviceConfig,
    engines: Vec<Arc<dyn Engine>>,
}

/// A compute device
#[derive(Debug)]
pub struct Device {
    backend: Box<dyn DeviceBackend>,
    capabilities: DeviceCapabilities,
    state: Mutex<DeviceState>,
    errors: ErrorState,
}

impl Device {
    /// Create an uncommitted device of the given type
    pub fn new(device_type: DeviceType) -> DenoiseResult<Arc<Self>> {
        let backend = create_backend(device_type)?;
        let capabilities = backend.capabilities();
        debug!("created {} device", backend.device_type());
        Ok(Arc::new(Self {
            backend,
            capabilities,
            state: Mutex::new(DeviceState::default()),
            errors: ErrorState::default(),
        }))
    }

    /// Create an uncommitted device for a physical device index
    pub fn from_physical(id: usize) -> DenoiseResult<Arc<Self>> {
        let physical = physical_device(id)?;
        Self::new(physical.device_type())
    }

    pub fn device_type(&self) -> DeviceType {
        self.backend.device_type()
    }

    pub fn name(&self) -> String {
        self.backend.name()
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().map(|s| s.committed).unwrap_or(false)
    }

    /// Set an integer parameter
    ///
    /// Unknown names and changes after commit are ignored with a warning.
    pub fn set_int(&self, name: &str, value: i32) -> DenoiseResult<()> {
        let mut state = self.state.lock()?;
        if state.committed {
            warn!("device parameter '{}' cannot be changed after commit", name);
            return Ok(());
        }
        match name {
            "verbose" => state.config.verbose = value.max(0) as u32,
            "numThreads" => state.config.num_threads = value.max(0) as usize,
            "setAffinity" => state.config.set_affinity = value != 0,
            _ => warn!("unknown device parameter '{}'", name),
        }
        Ok(())
    }

    pub fn set_bool(&self, name: &str, value: bool) -> DenoiseResult<()> {
        self.set_int(name, i32::from(value))
    }

    /// Read an integer parameter
    pub fn get_int(&self, name: &str) -> DenoiseResult<i32> {
        let state = self.state.lock()?;
        let caps = &self.capabilities;
        match name {
            "type" => Ok(self.device_type().as_raw()),
            "version" => Ok(VERSION),
            "versionMajor" => Ok(VERSION_MAJOR),
            "versionMinor" => Ok(VERSION_MINOR),
            "versionPatch" => Ok(VERSION_PATCH),
            "systemMemorySupported" => Ok(i32::from(caps.system_memory_supported)),
            "managedMemorySupported" => Ok(i32::from(caps.managed_memory_supported)),
            "externalMemoryTypes" => Ok(caps.external_memory_types as i32),
            "verbose" => Ok(state.config.verbose as i32),
            "numThreads" | "setAffinity" => {
                if !state.committed {
                    return Err(invalid_operation!(
                        "device parameter '{}' can be read only after commit",
                        name
                    ));
                }
                Ok(match name {
                    "numThreads" => state.config.effective_num_threads() as i32,
                    _ => i32::from(state.config.set_affinity),
                })
            }
            _ => Err(invalid_argument!("unknown device parameter '{}'", name)),
        }
    }

    pub fn get_bool(&self, name: &str) -> DenoiseResult<bool> {
        self.get_int(name).map(|v| v != 0)
    }

    /// Finalize the configuration and create the engines
    ///
    /// A device can be committed once. A failed commit leaves the device
    /// uncommitted.
    pub fn commit(&self) -> DenoiseResult<()> {
        let mut state = self.state.lock()?;
        if state.committed {
            return Err(invalid_operation!("device can be committed only once"));
        }

        let mut config = state.config.clone();
        config.apply_env_overrides();
        let engines = self.backend.init(&config)?;

        if config.verbose > 0 {
            logging::init_for_verbose(config.verbose);
            info!(
                "denoiseforge {}.{}.{} on {} device '{}' ({} engine(s))",
                VERSION_MAJOR,
                VERSION_MINOR,
                VERSION_PATCH,
                self.device_type(),
                self.backend.name(),
                engines.len()
            );
        }

        state.config = config;
        state.engines = engines;
        state.committed = true;
        Ok(())
    }

    pub fn check_committed(&self) -> DenoiseResult<()> {
        if !self.is_committed() {
            return Err(invalid_operation!("changes to the device are not committed"));
        }
        Ok(())
    }

    /// Primary engine of a committed device
    pub fn engine(&self) -> DenoiseResult<Arc<dyn Engine>> {
        let state = self.state.lock()?;
        if !state.committed {
            return Err(invalid_operation!("changes to the device are not committed"));
        }
        state
            .engines
            .first()
            .cloned()
            .ok_or_else(|| DenoiseError::UnsupportedHardware("device has no engines".into()))
    }

    /// Allocate a buffer on the primary engine
    pub fn new_buffer(&self, byte_size: usize, storage: Storage) -> DenoiseResult<Arc<Buffer>> {
        let engine = self.engine()?;
        Buffer::new(engine, byte_size, storage)
    }

    /// Create a filter of the named type (`"RT"` or `"RTLightmap"`)
    pub fn new_filter(self: &Arc<Self>, type_name: &str) -> DenoiseResult<Filter> {
        self.check_committed()?;
        Filter::new(self, type_name)
    }

    /// Block until every engine has drained its stream
    pub fn sync(&self) -> DenoiseResult<()> {
        let engines = self.state.lock()?.engines.clone();
        for engine in engines {
            engine.wait()?;
        }
        Ok(())
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.errors.set_callback(callback);
    }

    /// Record an error in the sticky slot (and notify the callback)
    pub fn record_error(&self, err: &DenoiseError) {
        self.errors.record(err);
    }

    /// Return and clear the pending error
    pub fn take_error(&self) -> (ErrorCode, Option<String>) {
        self.errors.take()
    }
}
