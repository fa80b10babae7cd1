//! Host CPU identification
//!
//! Detected once and cached. The brand string names the CPU physical device;
//! the SIMD flags are reported in the engine banner.

use once_cell::sync::Lazy;
#[cfg(target_arch = "x86_64")]
use raw_cpuid::CpuId;
use std::fmt;

static CPU_INFO: Lazy<CpuInfo> = Lazy::new(CpuInfo::detect);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Other,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86_64 => write!(f, "x86_64"),
            CpuArch::Aarch64 => write!(f, "aarch64"),
            CpuArch::Other => write!(f, "unknown"),
        }
    }
}

/// Name and vector capabilities of the host CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub brand: String,
    pub arch: CpuArch,
    pub avx512f: bool,
    pub avx2: bool,
    pub sse41: bool,
    pub neon: bool,
}

impl CpuInfo {
    /// Cached detection result
    pub fn get() -> &'static CpuInfo {
        &CPU_INFO
    }

    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::detect_x86_64()
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let arch = if cfg!(target_arch = "aarch64") {
                CpuArch::Aarch64
            } else {
                CpuArch::Other
            };
            Self {
                brand: String::new(),
                arch,
                avx512f: false,
                avx2: false,
                sse41: false,
                neon: arch == CpuArch::Aarch64,
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn detect_x86_64() -> Self {
        let cpuid = CpuId::new();

        let brand = cpuid
            .get_processor_brand_string()
            .map(|b| b.as_str().trim().to_string())
            .or_else(|| cpuid.get_vendor_info().map(|v| v.as_str().to_string()))
            .unwrap_or_default();

        let extended = cpuid.get_extended_feature_info();
        let avx512f = extended.as_ref().map(|i| i.has_avx512f()).unwrap_or(false);
        let avx2 = extended.as_ref().map(|i| i.has_avx2()).unwrap_or(false);
        let sse41 = cpuid
            .get_feature_info()
            .map(|i| i.has_sse41())
            .unwrap_or(false);

        Self {
            brand,
            arch: CpuArch::X86_64,
            avx512f,
            avx2,
            sse41,
            neon: false,
        }
    }

    /// Device name shown to users; falls back to a generic name when the CPU
    /// does not report a brand
    pub fn device_name(&self) -> String {
        if self.brand.is_empty() {
            format!("CPU ({})", self.arch)
        } else {
            self.brand.clone()
        }
    }

    /// Widest native f32 vector, in lanes
    pub fn f32_lanes(&self) -> usize {
        if self.avx512f {
            16
        } else if self.avx2 {
            8
        } else if self.sse41 || self.neon {
            4
        } else {
            1
        }
    }
}

impl fmt::Display for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.device_name(), self.arch)?;
        if self.avx512f {
            write!(f, " +AVX512F")?;
        }
        if self.avx2 {
            write!(f, " +AVX2")?;
        }
        if self.sse41 {
            write!(f, " +SSE4.1")?;
        }
        if self.neon {
            write!(f, " +NEON")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_cached() {
        assert_eq!(CpuInfo::get(), CpuInfo::get());
        assert!(!CpuInfo::get().device_name().is_empty());
    }

    #[test]
    fn test_lane_width() {
        let mut info = CpuInfo {
            brand: String::new(),
            arch: CpuArch::Other,
            avx512f: false,
            avx2: false,
            sse41: false,
            neon: false,
        };
        assert_eq!(info.f32_lanes(), 1);
        assert_eq!(info.device_name(), "CPU (unknown)");
        info.avx2 = true;
        assert_eq!(info.f32_lanes(), 8);
        info.avx512f = true;
        assert_eq!(info.f32_lanes(), 16);
        assert!(info.to_string().contains("+AVX512F"));
    }
}
