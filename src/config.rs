//! Device configuration
//!
//! [`DeviceConfig`] collects the parameters a device consumes at commit time.
//! Values set through named device parameters can be overridden from the
//! environment, which is how deployments pin thread counts without touching
//! application code.

use tracing::warn;

/// Environment override for the device verbosity level
pub const VERBOSE_ENV: &str = "DENOISE_VERBOSE";

/// Environment override for the worker thread count
pub const NUM_THREADS_ENV: &str = "DENOISE_NUM_THREADS";

/// Environment override for thread pinning
pub const SET_AFFINITY_ENV: &str = "DENOISE_SET_AFFINITY";

/// Configuration consumed by a device backend when it is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Verbosity level (0 = warnings only)
    pub verbose: u32,

    /// Worker thread count for host engines (0 = one per logical core)
    pub num_threads: usize,

    /// Pin worker threads to cores
    pub set_affinity: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            verbose: 0,
            num_threads: 0,
            set_affinity: true,
        }
    }
}

impl DeviceConfig {
    /// Create a new device config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level
    pub fn with_verbose(mut self, verbose: u32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set worker thread count
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Enable or disable thread pinning
    pub fn with_set_affinity(mut self, set_affinity: bool) -> Self {
        self.set_affinity = set_affinity;
        self
    }

    /// Worker thread count after resolving 0 to the available parallelism
    pub fn effective_num_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Apply `DENOISE_*` environment overrides
    ///
    /// Environment values win over values set programmatically. Unparsable
    /// values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(VERBOSE_ENV) {
            match value.trim().parse::<u32>() {
                Ok(verbose) => self.verbose = verbose,
                Err(_) => warn!("ignoring invalid {}={:?}", VERBOSE_ENV, value),
            }
        }

        if let Some(value) = lookup(NUM_THREADS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) => self.num_threads = n,
                Err(_) => warn!("ignoring invalid {}={:?}", NUM_THREADS_ENV, value),
            }
        }

        if let Some(value) = lookup(SET_AFFINITY_ENV) {
            match parse_bool(&value) {
                Some(flag) => self.set_affinity = flag,
                None => warn!("ignoring invalid {}={:?}", SET_AFFINITY_ENV, value),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
