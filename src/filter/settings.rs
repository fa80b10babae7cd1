//! Filter parameters

use crate::error::DenoiseResult;
use crate::invalid_argument;
use crate::network::Quality;
use tracing::warn;

/// Default memory budget in MiB
pub const DEFAULT_MAX_MEMORY_MB: usize = 3000;

/// Filter variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// Ray traced images with optional auxiliary features
    Rt,
    /// Lightmaps, HDR or directional
    RtLightmap,
}

impl FilterKind {
    pub fn from_name(name: &str) -> DenoiseResult<Self> {
        match name {
            "RT" => Ok(FilterKind::Rt),
            "RTLightmap" => Ok(FilterKind::RtLightmap),
            _ => Err(invalid_argument!("unknown filter type '{}'", name)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Rt => "RT",
            FilterKind::RtLightmap => "RTLightmap",
        }
    }

    /// Image roles this filter accepts
    pub fn roles(self) -> &'static [&'static str] {
        match self {
            FilterKind::Rt => &["color", "albedo", "normal", "output"],
            FilterKind::RtLightmap => &["color", "output"],
        }
    }

    pub fn has_role(self, role: &str) -> bool {
        self.roles().contains(&role)
    }
}

/// Scalar parameters of a filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSettings {
    pub quality: Quality,
    pub hdr: bool,
    pub srgb: bool,
    pub clean_aux: bool,
    pub directional: bool,
    /// NaN selects autoexposure in HDR mode
    pub input_scale: f32,
    /// 0 forces the smallest tiles
    pub max_memory_mb: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            quality: Quality::High,
            hdr: false,
            srgb: false,
            clean_aux: false,
            directional: false,
            input_scale: f32::NAN,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
        }
    }
}

impl FilterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_hdr(mut self, hdr: bool) -> Self {
        self.hdr = hdr;
        self
    }

    pub fn with_max_memory_mb(mut self, max_memory_mb: usize) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    /// Whether this filter kind has an integer or boolean parameter `name`
    fn has_int(kind: FilterKind, name: &str) -> bool {
        match name {
            "quality" | "maxMemoryMB" => true,
            "hdr" | "srgb" | "cleanAux" => kind == FilterKind::Rt,
            "directional" => kind == FilterKind::RtLightmap,
            _ => false,
        }
    }

    /// Set an integer parameter; returns whether anything changed
    ///
    /// Unknown names are ignored with a warning. Out-of-range values are
    /// InvalidArgument.
    pub fn set_int(&mut self, kind: FilterKind, name: &str, value: i32) -> DenoiseResult<bool> {
        if !Self::has_int(kind, name) {
            warn!("unknown {} filter parameter '{}'", kind.name(), name);
            return Ok(false);
        }
        let before = self.clone();
        match name {
            "quality" => {
                self.quality = Quality::from_raw(value)
                    .ok_or_else(|| invalid_argument!("invalid filter quality: {}", value))?
            }
            "maxMemoryMB" => {
                if value < 0 {
                    return Err(invalid_argument!("invalid maxMemoryMB: {}", value));
                }
                self.max_memory_mb = value as usize;
            }
            "hdr" => self.hdr = value != 0,
            "srgb" => self.srgb = value != 0,
            "cleanAux" => self.clean_aux = value != 0,
            _ => self.directional = value != 0,
        }
        Ok(*self != before)
    }

    pub fn get_int(&self, kind: FilterKind, name: &str) -> DenoiseResult<i32> {
        if !Self::has_int(kind, name) {
            return Err(invalid_argument!("unknown {} filter parameter '{}'", kind.name(), name));
        }
        Ok(match name {
            "quality" => self.quality.as_raw(),
            "maxMemoryMB" => self.max_memory_mb.min(i32::MAX as usize) as i32,
            "hdr" => i32::from(self.hdr),
            "srgb" => i32::from(self.srgb),
            "cleanAux" => i32::from(self.clean_aux),
            _ => i32::from(self.directional),
        })
    }

    pub fn set_float(&mut self, kind: FilterKind, name: &str, value: f32) -> DenoiseResult<bool> {
        match name {
            "inputScale" => {
                let changed = self.input_scale.to_bits() != value.to_bits();
                self.input_scale = value;
                Ok(changed)
            }
            _ => {
                warn!("unknown {} filter parameter '{}'", kind.name(), name);
                Ok(false)
            }
        }
    }

    pub fn get_float(&self, kind: FilterKind, name: &str) -> DenoiseResult<f32> {
        match name {
            "inputScale" => Ok(self.input_scale),
            _ => Err(invalid_argument!("unknown {} filter parameter '{}'", kind.name(), name)),
        }
    }

    /// Color values are HDR for this kind
    pub fn is_hdr(&self, kind: FilterKind) -> bool {
        match kind {
            FilterKind::Rt => self.hdr,
            FilterKind::RtLightmap => !self.directional,
        }
    }

    /// Color values are signed-normalized for this kind
    pub fn is_snorm(&self, kind: FilterKind) -> bool {
        kind == FilterKind::RtLightmap && self.directional
    }

    /// Input scale is computed from the image
    pub fn auto_exposure(&self, kind: FilterKind) -> bool {
        self.is_hdr(kind) && self.input_scale.is_nan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_filter_kinds() {
        assert_eq!(FilterKind::from_name("RT").unwrap(), FilterKind::Rt);
        assert_eq!(FilterKind::from_name("RTLightmap").unwrap().name(), "RTLightmap");
        assert_eq!(FilterKind::from_name("rt").unwrap_err().code(), ErrorCode::InvalidArgument);
        assert!(FilterKind::Rt.has_role("albedo"));
        assert!(!FilterKind::RtLightmap.has_role("normal"));
    }

    #[test]
    fn test_int_params_report_changes() {
        let mut s = FilterSettings::new();
        assert!(s.set_int(FilterKind::Rt, "hdr", 1).unwrap());
        assert!(!s.set_int(FilterKind::Rt, "hdr", 1).unwrap());
        assert!(s.set_int(FilterKind::Rt, "quality", 4).unwrap());
        assert_eq!(s.get_int(FilterKind::Rt, "quality").unwrap(), 4);
        assert!(s.set_int(FilterKind::Rt, "quality", 2).is_err());
        assert!(s.set_int(FilterKind::Rt, "maxMemoryMB", -1).is_err());
        assert_eq!(s.get_int(FilterKind::Rt, "maxMemoryMB").unwrap(), 3000);
    }

    #[test]
    fn test_params_depend_on_kind() {
        let mut s = FilterSettings::new();
        // ignored, not an error
        assert!(!s.set_int(FilterKind::RtLightmap, "hdr", 0).unwrap());
        assert!(s.get_int(FilterKind::RtLightmap, "hdr").is_err());
        assert!(s.is_hdr(FilterKind::RtLightmap));
        s.set_int(FilterKind::RtLightmap, "directional", 1).unwrap();
        assert!(!s.is_hdr(FilterKind::RtLightmap));
        assert!(s.is_snorm(FilterKind::RtLightmap));
        assert!(s.get_int(FilterKind::Rt, "directional").is_err());
    }

    #[test]
    fn test_input_scale_selects_autoexposure() {
        let mut s = FilterSettings::new().with_hdr(true);
        assert!(s.auto_exposure(FilterKind::Rt));
        assert!(s.set_float(FilterKind::Rt, "inputScale", 2.0).unwrap());
        assert!(!s.auto_exposure(FilterKind::Rt));
        assert_eq!(s.get_float(FilterKind::Rt, "inputScale").unwrap(), 2.0);
        assert!(!s.set_float(FilterKind::Rt, "inputScale", 2.0).unwrap());
        assert!(s.get_float(FilterKind::Rt, "bogus").is_err());
    }
}
