//! Element types and the minimal memory descriptor post-ops need.

use std::fmt;

/// Element data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    Bf16,
    F16,
    S32,
    S8,
    U8,
}

impl DataType {
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::Bf16 | DataType::F16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    /// Storing into this type does not round to an integer, so quantized
    /// values must be rounded explicitly before the store. Half-precision
    /// destinations keep the value the down-conversion produces.
    pub const fn requires_explicit_rounding(self) -> bool {
        matches!(self, DataType::F32)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::Bf16 => "bf16",
            DataType::F16 => "f16",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(s)
    }
}

/// Physical layout of a `[N, C, spatial...]` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    /// Not decided yet; post-ops cannot be planned against it.
    Any,
    /// Channels before spatial dims (`nchw`, `ncdhw`, `nc`...).
    Ncsp,
    /// Channels innermost (`nhwc`, `ndhwc`...).
    Nspc,
}

/// Dense tensor descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    pub dims: Vec<usize>,
    pub data_type: DataType,
    pub format: FormatKind,
}

impl MemoryDesc {
    pub fn new(dims: &[usize], data_type: DataType, format: FormatKind) -> Self {
        MemoryDesc {
            dims: dims.to_vec(),
            data_type,
            format,
        }
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Minibatch extent, 1 for rank-0 descriptors.
    pub fn mb(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Channel extent, 1 below rank 2.
    pub fn channels(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(1)
    }

    /// Product of all dims after the channel dim.
    pub fn spatial(&self) -> usize {
        self.dims.iter().skip(2).product()
    }

    pub fn is_defined(&self) -> bool {
        self.format != FormatKind::Any
    }
}
