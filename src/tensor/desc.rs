//! Shape, layout and stride descriptors

use crate::error::DenoiseResult;
use crate::invalid_argument;

/// Largest supported image width or height
pub const MAX_IMAGE_DIM: usize = 65536;

/// Element type of a tensor or image channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float16,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
        }
    }
}

/// Pixel format of an image
///
/// Raw values follow the handle-level encoding: single precision formats
/// start at 1, half precision formats at 257.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Undefined,
    Float,
    Float2,
    Float3,
    Float4,
    Half,
    Half2,
    Half3,
    Half4,
}

impl Format {
    /// Convert from the raw integer representation
    pub fn from_raw(value: i32) -> DenoiseResult<Self> {
        match value {
            0 => Ok(Format::Undefined),
            1 => Ok(Format::Float),
            2 => Ok(Format::Float2),
            3 => Ok(Format::Float3),
            4 => Ok(Format::Float4),
            257 => Ok(Format::Half),
            258 => Ok(Format::Half2),
            259 => Ok(Format::Half3),
            260 => Ok(Format::Half4),
            _ => Err(invalid_argument!("invalid image format: {}", value)),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Format::Undefined => 0,
            Format::Float => 1,
            Format::Float2 => 2,
            Format::Float3 => 3,
            Format::Float4 => 4,
            Format::Half => 257,
            Format::Half2 => 258,
            Format::Half3 => 259,
            Format::Half4 => 260,
        }
    }

    /// Number of channels (0 for `Undefined`)
    pub fn channels(self) -> usize {
        match self {
            Format::Undefined => 0,
            Format::Float | Format::Half => 1,
            Format::Float2 | Format::Half2 => 2,
            Format::Float3 | Format::Half3 => 3,
            Format::Float4 | Format::Half4 => 4,
        }
    }

    pub fn data_type(self) -> Option<DataType> {
        match self {
            Format::Undefined => None,
            Format::Float | Format::Float2 | Format::Float3 | Format::Float4 => {
                Some(DataType::Float32)
            }
            Format::Half | Format::Half2 | Format::Half3 | Format::Half4 => Some(DataType::Float16),
        }
    }

    /// Natural size of one pixel in bytes
    pub fn byte_size(self) -> usize {
        self.data_type()
            .map(|dt| dt.size() * self.channels())
            .unwrap_or(0)
    }
}

/// Memory order of tensor elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorLayout {
    /// Flat vector (biases)
    X,
    /// Channel-major feature map
    Chw,
    /// Convolution weights: output channel, input channel, kernel rows, kernel columns
    Oihw,
}

impl TensorLayout {
    pub fn rank(self) -> usize {
        match self {
            TensorLayout::X => 1,
            TensorLayout::Chw => 3,
            TensorLayout::Oihw => 4,
        }
    }
}

/// Dense tensor descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub layout: TensorLayout,
    pub data_type: DataType,
}

impl TensorDesc {
    pub fn new(dims: Vec<usize>, layout: TensorLayout, data_type: DataType) -> DenoiseResult<Self> {
        if dims.len() != layout.rank() {
            return Err(invalid_argument!(
                "{:?} tensor needs {} dims, got {:?}",
                layout,
                layout.rank(),
                dims
            ));
        }
        Ok(Self {
            dims,
            layout,
            data_type,
        })
    }

    /// Single precision CHW feature map
    pub fn chw(c: usize, h: usize, w: usize) -> Self {
        Self {
            dims: vec![c, h, w],
            layout: TensorLayout::Chw,
            data_type: DataType::Float32,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
    }

    pub fn byte_size(&self) -> usize {
        self.num_elements().saturating_mul(self.data_type.size())
    }

    /// Channel count of a CHW tensor (or output channels of OIHW)
    pub fn channels(&self) -> usize {
        self.dims[0]
    }

    pub fn height(&self) -> usize {
        match self.layout {
            TensorLayout::Chw => self.dims[1],
            TensorLayout::Oihw => self.dims[2],
            TensorLayout::X => 1,
        }
    }

    pub fn width(&self) -> usize {
        match self.layout {
            TensorLayout::Chw => self.dims[2],
            TensorLayout::Oihw => self.dims[3],
            TensorLayout::X => self.dims[0],
        }
    }
}

/// Strided 2D image descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageDesc {
    pub format: Format,
    pub width: usize,
    pub height: usize,
    /// Bytes between horizontally adjacent pixels
    pub pixel_byte_stride: usize,
    /// Bytes between vertically adjacent pixels
    pub row_byte_stride: usize,
}

impl ImageDesc {
    /// Build and validate a descriptor; zero strides select the packed defaults
    pub fn new(
        format: Format,
        width: usize,
        height: usize,
        pixel_byte_stride: usize,
        row_byte_stride: usize,
    ) -> DenoiseResult<Self> {
        if format == Format::Undefined {
            return Err(invalid_argument!("image format is undefined"));
        }
        if width > MAX_IMAGE_DIM || height > MAX_IMAGE_DIM {
            return Err(invalid_argument!(
                "image size {}x{} exceeds the maximum of {}",
                width,
                height,
                MAX_IMAGE_DIM
            ));
        }
        let element_count = width * height * format.channels();
        if element_count > i32::MAX as usize {
            return Err(invalid_argument!("image size is too large"));
        }

        let pixel_size = format.byte_size();
        let pixel_byte_stride = if pixel_byte_stride != 0 {
            if pixel_byte_stride < pixel_size {
                return Err(invalid_argument!(
                    "pixel stride {} is smaller than the pixel size {}",
                    pixel_byte_stride,
                    pixel_size
                ));
            }
            pixel_byte_stride
        } else {
            pixel_size
        };

        let min_row = width
            .checked_mul(pixel_byte_stride)
            .ok_or_else(|| invalid_argument!("pixel stride {} overflows the row size", pixel_byte_stride))?;
        let row_byte_stride = if row_byte_stride != 0 {
            if row_byte_stride < min_row {
                return Err(invalid_argument!(
                    "row stride {} is smaller than width * pixel stride {}",
                    row_byte_stride,
                    min_row
                ));
            }
            row_byte_stride
        } else {
            min_row
        };

        let desc = Self {
            format,
            width,
            height,
            pixel_byte_stride,
            row_byte_stride,
        };
        if desc.checked_byte_size().is_none() {
            return Err(invalid_argument!(
                "image strides {}/{} overflow the addressable range",
                pixel_byte_stride,
                row_byte_stride
            ));
        }
        Ok(desc)
    }

    fn checked_byte_size(&self) -> Option<usize> {
        if self.width == 0 || self.height == 0 {
            return Some(0);
        }
        let rows = (self.height - 1).checked_mul(self.row_byte_stride)?;
        let cols = (self.width - 1).checked_mul(self.pixel_byte_stride)?;
        rows.checked_add(cols)?
            .checked_add(self.format.byte_size())
            .filter(|&size| size <= isize::MAX as usize)
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// Bytes actually spanned by the strided layout; saturates for
    /// descriptors not built through `new`
    pub fn byte_size(&self) -> usize {
        self.checked_byte_size().unwrap_or(usize::MAX)
    }

    /// Byte offset of pixel (h, w) from the image origin
    pub fn pixel_offset(&self, h: usize, w: usize) -> usize {
        h * self.row_byte_stride + w * self.pixel_byte_stride
    }

    /// Same strides and format, smaller extent
    pub fn with_extent(&self, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_roundtrip_and_sizes() {
        for raw in [1, 2, 3, 4, 257, 258, 259, 260] {
            let format = Format::from_raw(raw).unwrap();
            assert_eq!(format.as_raw(), raw);
        }
        assert!(Format::from_raw(5).is_err());
        assert!(Format::from_raw(-1).is_err());
        assert_eq!(Format::Float3.byte_size(), 12);
        assert_eq!(Format::Half3.byte_size(), 6);
        assert_eq!(Format::Half4.channels(), 4);
    }

    #[test]
    fn test_default_strides() {
        let desc = ImageDesc::new(Format::Float3, 257, 89, 0, 0).unwrap();
        assert_eq!(desc.pixel_byte_stride, 12);
        assert_eq!(desc.row_byte_stride, 257 * 12);
        assert_eq!(desc.byte_size(), 257 * 89 * 12);
    }

    #[test]
    fn test_strided_byte_size_is_not_dense_size() {
        let desc = ImageDesc::new(Format::Float3, 10, 4, 16, 200).unwrap();
        assert_eq!(desc.byte_size(), 3 * 200 + 9 * 16 + 12);
    }

    #[test]
    fn test_zero_extent_has_zero_size() {
        assert_eq!(ImageDesc::new(Format::Float3, 0, 5, 0, 0).unwrap().byte_size(), 0);
        assert_eq!(ImageDesc::new(Format::Float3, 5, 0, 0, 0).unwrap().byte_size(), 0);
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(ImageDesc::new(Format::Undefined, 4, 4, 0, 0).is_err());
        assert!(ImageDesc::new(Format::Float3, MAX_IMAGE_DIM + 1, 1, 0, 0).is_err());
        assert!(ImageDesc::new(Format::Float3, 4, 4, 8, 0).is_err());
        assert!(ImageDesc::new(Format::Float3, 4, 4, 0, 40).is_err());
        assert!(ImageDesc::new(Format::Float4, 65536, 65536, 0, 0).is_err());
    }

    #[test]
    fn test_overflowing_strides_are_rejected() {
        for (pixel, row) in [
            (0, usize::MAX / 2),
            (usize::MAX / 2, 0),
            (usize::MAX / 3, 0),
            (16, usize::MAX / 3),
        ] {
            let err = ImageDesc::new(Format::Float3, 4, 4, pixel, row).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
        }
        // a huge stride on a single row/column is still addressable
        let desc = ImageDesc::new(Format::Float3, 4, 1, 0, usize::MAX / 4).unwrap();
        assert_eq!(desc.byte_size(), 48);
    }

    #[test]
    fn test_tensor_desc() {
        let desc = TensorDesc::chw(8, 16, 32);
        assert_eq!(desc.byte_size(), 8 * 16 * 32 * 4);
        assert_eq!((desc.channels(), desc.height(), desc.width()), (8, 16, 32));

        let weight =
            TensorDesc::new(vec![8, 3, 3, 3], TensorLayout::Oihw, DataType::Float16).unwrap();
        assert_eq!(weight.byte_size(), 8 * 3 * 9 * 2);
        assert!(TensorDesc::new(vec![8, 3], TensorLayout::Chw, DataType::Float32).is_err());
    }
}
