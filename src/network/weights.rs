//! Weight blob container
//!
//! Layout (little-endian):
//!
//! ```text
//! magic    "DNWT"
//! version  u16
//! count    u32
//! count x {
//!     name_len u16, name (UTF-8)
//!     rank u8, dims u32 x rank
//!     dtype u8 (0 = f32, 1 = f16)
//!     data  (product of dims) x dtype size
//! }
//! ```
//!
//! Parsing failures are reported as InvalidOperation because blobs are only
//! interpreted at filter commit.

use crate::error::{io_context, DenoiseResult};
use crate::invalid_operation;
use half::f16;
use std::collections::BTreeMap;
use std::path::Path;

pub const WEIGHTS_MAGIC: &[u8; 4] = b"DNWT";
pub const WEIGHTS_VERSION: u16 = 1;

/// Storage precision of a serialized tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDataType {
    F32,
    F16,
}

impl WeightDataType {
    fn from_tag(tag: u8) -> DenoiseResult<Self> {
        match tag {
            0 => Ok(WeightDataType::F32),
            1 => Ok(WeightDataType::F16),
            _ => Err(invalid_operation!("invalid weights: unknown data type tag {}", tag)),
        }
    }

    fn tag(self) -> u8 {
        match self {
            WeightDataType::F32 => 0,
            WeightDataType::F16 => 1,
        }
    }

    fn size(self) -> usize {
        match self {
            WeightDataType::F32 => 4,
            WeightDataType::F16 => 2,
        }
    }
}

/// A named weight tensor, always held in single precision
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

/// Set of named weight tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Weights {
    tensors: BTreeMap<String, WeightTensor>,
}

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor; the value count must match the dims
    pub fn insert(&mut self, name: &str, dims: Vec<usize>, values: Vec<f32>) -> DenoiseResult<()> {
        let expected: usize = dims.iter().product();
        if expected != values.len() {
            return Err(invalid_operation!(
                "invalid weights: tensor '{}' has {} values for dims {:?}",
                name,
                values.len(),
                dims
            ));
        }
        self.tensors
            .insert(name.to_string(), WeightTensor { dims, values });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.get(name)
    }

    /// Tensor with the given dims, or InvalidOperation naming the problem
    pub fn expect(&self, name: &str, dims: &[usize]) -> DenoiseResult<&WeightTensor> {
        let tensor = self
            .get(name)
            .ok_or_else(|| invalid_operation!("invalid weights: missing tensor '{}'", name))?;
        if tensor.dims != dims {
            return Err(invalid_operation!(
                "invalid weights: tensor '{}' has dims {:?}, expected {:?}",
                name,
                tensor.dims,
                dims
            ));
        }
        Ok(tensor)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    /// Total number of weight values
    pub fn num_values(&self) -> usize {
        self.tensors.values().map(|t| t.values.len()).sum()
    }

    /// Parse a blob
    pub fn parse(bytes: &[u8]) -> DenoiseResult<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != WEIGHTS_MAGIC {
            return Err(invalid_operation!("invalid weights: bad magic"));
        }
        let version = reader.u16()?;
        if version != WEIGHTS_VERSION {
            return Err(invalid_operation!("invalid weights: unsupported version {}", version));
        }

        let count = reader.u32()? as usize;
        let mut weights = Weights::new();
        for _ in 0..count {
            let name_len = reader.u16()? as usize;
            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| invalid_operation!("invalid weights: tensor name is not UTF-8"))?
                .to_string();
            let rank = reader.u8()? as usize;
            let dims = (0..rank)
                .map(|_| reader.u32().map(|d| d as usize))
                .collect::<DenoiseResult<Vec<_>>>()?;
            let dtype = WeightDataType::from_tag(reader.u8()?)?;
            let num_values = dims
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| invalid_operation!("invalid weights: tensor '{}' is too large", name))?;
            let byte_len = num_values
                .checked_mul(dtype.size())
                .ok_or_else(|| invalid_operation!("invalid weights: tensor '{}' is too large", name))?;
            let data = reader.take(byte_len)?;

            let values = match dtype {
                WeightDataType::F32 => data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                WeightDataType::F16 => data
                    .chunks_exact(2)
                    .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect(),
            };
            if weights.tensors.contains_key(&name) {
                return Err(invalid_operation!("invalid weights: duplicate tensor '{}'", name));
            }
            weights.insert(&name, dims, values)?;
        }

        if reader.pos != bytes.len() {
            return Err(invalid_operation!(
                "invalid weights: {} trailing bytes",
                bytes.len() - reader.pos
            ));
        }
        Ok(weights)
    }

    /// Serialize all tensors with the given precision
    pub fn to_bytes(&self, dtype: WeightDataType) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.num_values() * dtype.size());
        out.extend_from_slice(WEIGHTS_MAGIC);
        out.extend_from_slice(&WEIGHTS_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u32).to_le_bytes());
        for (name, tensor) in &self.tensors {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(tensor.dims.len() as u8);
            for &d in &tensor.dims {
                out.extend_from_slice(&(d as u32).to_le_bytes());
            }
            out.push(dtype.tag());
            match dtype {
                WeightDataType::F32 => {
                    for v in &tensor.values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                WeightDataType::F16 => {
                    for v in &tensor.values {
                        out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
                    }
                }
            }
        }
        out
    }

    pub fn load(path: &Path) -> DenoiseResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| io_context(e, &format!("failed to read weights '{}'", path.display())))?;
        Self::parse(&bytes)
    }

    pub fn save(&self, path: &Path, dtype: WeightDataType) -> DenoiseResult<()> {
        std::fs::write(path, self.to_bytes(dtype))
            .map_err(|e| io_context(e, &format!("failed to write weights '{}'", path.display())))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> DenoiseResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| invalid_operation!("invalid weights: unexpected end of data"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> DenoiseResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DenoiseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> DenoiseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
