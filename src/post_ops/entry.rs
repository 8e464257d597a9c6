//! Post-op entries.

use crate::types::{DataType, MemoryDesc};

/// Per-channel buffers are padded to this many f32 lanes so a full-width
/// vector read at any channel block stays inside the buffer.
pub const PARAM_ALIGN: usize = 16;

#[inline]
pub(crate) fn pad_channels(channels: usize) -> usize {
    channels.div_ceil(PARAM_ALIGN).max(1) * PARAM_ALIGN
}

/// Discriminant of a [`PostOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PostOpKind {
    Sum,
    Eltwise,
    Binary,
    Prelu,
    Depthwise,
    Quantization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseAlg {
    /// x > 0 ? x : alpha * x
    Relu,
    /// x > 0 ? x : alpha * (e^x - 1)
    Elu,
    Tanh,
    Logistic,
    Exp,
    Log,
    Sqrt,
    Square,
    Abs,
    /// alpha * x + beta
    Linear,
    /// clamp(x, alpha, beta)
    Clip,
    /// x * logistic(alpha * x)
    Swish,
    GeluTanh,
    GeluErf,
    /// x * clamp(alpha * x + beta, 0, 1)
    HardSwish,
    /// Nearest, ties to even.
    Round,
}

impl EltwiseAlg {
    pub const ALL: [EltwiseAlg; 16] = [
        EltwiseAlg::Relu,
        EltwiseAlg::Elu,
        EltwiseAlg::Tanh,
        EltwiseAlg::Logistic,
        EltwiseAlg::Exp,
        EltwiseAlg::Log,
        EltwiseAlg::Sqrt,
        EltwiseAlg::Square,
        EltwiseAlg::Abs,
        EltwiseAlg::Linear,
        EltwiseAlg::Clip,
        EltwiseAlg::Swish,
        EltwiseAlg::GeluTanh,
        EltwiseAlg::GeluErf,
        EltwiseAlg::HardSwish,
        EltwiseAlg::Round,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EltwiseParams {
    pub alg: EltwiseAlg,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryAlg {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    /// Comparisons produce 1.0 where true, 0.0 elsewhere.
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryParams {
    pub alg: BinaryAlg,
    pub src1_desc: MemoryDesc,
}

/// Learned negative slope; bit `i` of `mask` set means the weights vary
/// along destination dim `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreluParams {
    pub mask: u32,
}

impl PreluParams {
    /// Descriptor of the weights tensor for destination `dst`.
    pub fn weights_desc(&self, dst: &MemoryDesc) -> MemoryDesc {
        let dims: Vec<usize> = dst
            .dims
            .iter()
            .enumerate()
            .map(|(i, &d)| if self.mask >> i & 1 == 1 { d } else { 1 })
            .collect();
        MemoryDesc::new(&dims, DataType::F32, dst.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthwiseAlg {
    /// x * w[c] + b[c]
    ScaleShift,
    /// x > 0 ? x : x * w[c]
    Prelu,
}

/// Per-channel transform backed by one buffer `[weights | bias]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseParams {
    pub alg: DepthwiseAlg,
    pub channels: usize,
    /// Element offset of the bias array inside the buffer.
    pub bias_offset: usize,
}

impl DepthwiseParams {
    pub fn new(alg: DepthwiseAlg, channels: usize) -> Self {
        DepthwiseParams {
            alg,
            channels,
            bias_offset: pad_channels(channels),
        }
    }

    /// Elements the caller must provide.
    pub fn buffer_len(&self) -> usize {
        self.bias_offset + pad_channels(self.channels)
    }

    /// Lay out `weights` and `bias` (may be empty for prelu).
    pub fn pack(&self, weights: &[f32], bias: &[f32]) -> Vec<f32> {
        let mut buf = vec![0.0; self.buffer_len()];
        buf[..weights.len()].copy_from_slice(weights);
        buf[self.bias_offset..self.bias_offset + bias.len()].copy_from_slice(bias);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizationAlg {
    Quantize,
    QuantizeDequantize,
}

/// The six parameter arrays of a quantization entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantField {
    CropLow = 0,
    CropHigh = 1,
    InputScale = 2,
    InputShift = 3,
    OutputScale = 4,
    OutputShift = 5,
}

impl QuantField {
    pub const ALL: [QuantField; 6] = [
        QuantField::CropLow,
        QuantField::CropHigh,
        QuantField::InputScale,
        QuantField::InputShift,
        QuantField::OutputScale,
        QuantField::OutputShift,
    ];
}

/// Fake-quantize: crop, scale/shift in, round, optionally scale/shift out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationParams {
    pub alg: QuantizationAlg,
    /// Field varies per channel (otherwise one scalar).
    pub per_channel: [bool; 6],
    /// Element offset of each field inside the entry's buffer.
    pub offsets: [usize; 6],
}

impl QuantizationParams {
    /// Contiguous layout: per-channel fields take `channels` padded slots,
    /// scalar fields one padded slot.
    pub fn new(alg: QuantizationAlg, per_channel: [bool; 6], channels: usize) -> Self {
        let mut offsets = [0usize; 6];
        let mut at = 0;
        for field in QuantField::ALL {
            offsets[field as usize] = at;
            at += if per_channel[field as usize] {
                pad_channels(channels)
            } else {
                PARAM_ALIGN
            };
        }
        QuantizationParams {
            alg,
            per_channel,
            offsets,
        }
    }

    pub fn is_per_channel(&self, field: QuantField) -> bool {
        self.per_channel[field as usize]
    }

    pub fn offset(&self, field: QuantField) -> usize {
        self.offsets[field as usize]
    }

    pub fn is_dequantize(&self) -> bool {
        self.alg == QuantizationAlg::QuantizeDequantize
    }

    pub fn buffer_len(&self, channels: usize) -> usize {
        QuantField::ALL
            .iter()
            .map(|&f| {
                self.offset(f)
                    + if self.is_per_channel(f) {
                        pad_channels(channels)
                    } else {
                        PARAM_ALIGN
                    }
            })
            .max()
            .unwrap_or(0)
    }

    /// Lay out the six fields in `QuantField` order; scalar fields take the
    /// first element of their slice.
    pub fn pack(&self, channels: usize, fields: [&[f32]; 6]) -> Vec<f32> {
        let mut buf = vec![0.0; self.buffer_len(channels)];
        for field in QuantField::ALL {
            let src = fields[field as usize];
            let n = if self.is_per_channel(field) {
                src.len().min(channels)
            } else {
                src.len().min(1)
            };
            let at = self.offset(field);
            buf[at..at + n].copy_from_slice(&src[..n]);
        }
        buf
    }
}

/// One entry of a post-op chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// dst = result + scale * (dst_prev - zero_point)
    Sum { scale: f32, zero_point: i32 },
    Eltwise(EltwiseParams),
    Binary(BinaryParams),
    Prelu(PreluParams),
    Depthwise(DepthwiseParams),
    Quantization(QuantizationParams),
}

impl PostOp {
    pub fn kind(&self) -> PostOpKind {
        match self {
            PostOp::Sum { .. } => PostOpKind::Sum,
            PostOp::Eltwise(_) => PostOpKind::Eltwise,
            PostOp::Binary(_) => PostOpKind::Binary,
            PostOp::Prelu(_) => PostOpKind::Prelu,
            PostOp::Depthwise(_) => PostOpKind::Depthwise,
            PostOp::Quantization(_) => PostOpKind::Quantization,
        }
    }

    /// Binary and prelu both read a second operand through the rhs pointer
    /// vector.
    pub fn is_like_binary(&self) -> bool {
        matches!(self, PostOp::Binary(_) | PostOp::Prelu(_))
    }

    /// Depthwise and quantization read their parameters through the
    /// auxiliary pointer table.
    pub fn uses_aux_table(&self) -> bool {
        matches!(self, PostOp::Depthwise(_) | PostOp::Quantization(_))
    }

    /// Operand-1 descriptor of a binary-like entry against `dst`.
    pub fn src1_desc(&self, dst: &MemoryDesc) -> Option<MemoryDesc> {
        match self {
            PostOp::Binary(b) => Some(b.src1_desc.clone()),
            PostOp::Prelu(p) => Some(p.weights_desc(dst)),
            _ => None,
        }
    }
}
