//! ISA tiers, vector widths and the superset relation between them.
//!
//! Tiers are feature bitsets, so `is_superset` is plain inclusion. Along each
//! lineage this is a total order; `avx2_vnni_2` and `avx512_core` are
//! incomparable and both are covered by `avx512_core_fp16`.

use std::fmt;
use std::str::FromStr;

pub(crate) mod feat {
    pub const SSE41: u32 = 1 << 0;
    pub const AVX: u32 = 1 << 1;
    pub const AVX2: u32 = 1 << 2;
    pub const AVX_VNNI: u32 = 1 << 3;
    pub const AVX_NE_CONVERT: u32 = 1 << 4;
    pub const AVX512_CORE: u32 = 1 << 5;
    pub const AVX512_VNNI: u32 = 1 << 6;
    pub const AVX512_BF16: u32 = 1 << 7;
    pub const AVX512_FP16: u32 = 1 << 8;
}

/// A named instruction-set capability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CpuIsa {
    Sse41,
    Avx,
    Avx2,
    Avx2Vnni2,
    Avx512Core,
    Avx512CoreBf16,
    Avx512CoreFp16,
}

impl CpuIsa {
    pub const ALL: [CpuIsa; 7] = [
        CpuIsa::Sse41,
        CpuIsa::Avx,
        CpuIsa::Avx2,
        CpuIsa::Avx2Vnni2,
        CpuIsa::Avx512Core,
        CpuIsa::Avx512CoreBf16,
        CpuIsa::Avx512CoreFp16,
    ];

    /// Feature bits this tier requires.
    pub const fn features(self) -> u32 {
        use feat::*;
        let sse41 = SSE41;
        let avx = sse41 | AVX;
        let avx2 = avx | AVX2;
        let avx512_core = avx2 | AVX512_CORE;
        let avx512_core_bf16 = avx512_core | AVX512_VNNI | AVX512_BF16;
        match self {
            CpuIsa::Sse41 => sse41,
            CpuIsa::Avx => avx,
            CpuIsa::Avx2 => avx2,
            CpuIsa::Avx2Vnni2 => avx2 | AVX_VNNI | AVX_NE_CONVERT,
            CpuIsa::Avx512Core => avx512_core,
            CpuIsa::Avx512CoreBf16 => avx512_core_bf16,
            CpuIsa::Avx512CoreFp16 => {
                avx512_core_bf16 | AVX_VNNI | AVX_NE_CONVERT | AVX512_FP16
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CpuIsa::Sse41 => "sse41",
            CpuIsa::Avx => "avx",
            CpuIsa::Avx2 => "avx2",
            CpuIsa::Avx2Vnni2 => "avx2_vnni_2",
            CpuIsa::Avx512Core => "avx512_core",
            CpuIsa::Avx512CoreBf16 => "avx512_core_bf16",
            CpuIsa::Avx512CoreFp16 => "avx512_core_fp16",
        }
    }

    /// EVEX-encoded tiers: 32 vector registers and opmasks.
    pub const fn is_avx512(self) -> bool {
        self.features() & feat::AVX512_CORE != 0
    }

    pub const fn n_vregs(self) -> usize {
        if self.is_avx512() {
            32
        } else {
            16
        }
    }

    pub const fn has_opmask(self) -> bool {
        self.is_avx512()
    }

    /// sse41 `blendvps` reads its mask from xmm0.
    pub const fn blend_uses_implicit_mask(self) -> bool {
        matches!(self, CpuIsa::Sse41)
    }

    pub const fn max_width(self) -> VecWidth {
        match self {
            CpuIsa::Sse41 => VecWidth::Xmm,
            CpuIsa::Avx | CpuIsa::Avx2 | CpuIsa::Avx2Vnni2 => VecWidth::Ymm,
            _ => VecWidth::Zmm,
        }
    }

    pub fn supports_width(self, width: VecWidth) -> bool {
        width.bytes() <= self.max_width().bytes()
    }
}

/// `a` offers everything `b` offers.
pub const fn is_superset(a: CpuIsa, b: CpuIsa) -> bool {
    a.features() & b.features() == b.features()
}

impl fmt::Display for CpuIsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CpuIsa {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        CpuIsa::ALL
            .iter()
            .copied()
            .find(|isa| isa.name() == lower)
            .ok_or_else(|| format!("unknown ISA tier '{s}'"))
    }
}

/// Vector register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecWidth {
    Xmm,
    Ymm,
    Zmm,
}

impl VecWidth {
    pub const fn bytes(self) -> usize {
        match self {
            VecWidth::Xmm => 16,
            VecWidth::Ymm => 32,
            VecWidth::Zmm => 64,
        }
    }

    /// Number of 32-bit lanes.
    pub const fn lanes(self) -> usize {
        self.bytes() / 4
    }
}

/// A concrete tier + width instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsaVariant {
    pub isa: CpuIsa,
    pub width: VecWidth,
}

impl IsaVariant {
    pub fn new(isa: CpuIsa, width: VecWidth) -> Self {
        assert!(
            isa.supports_width(width),
            "{isa} cannot address {width:?} registers"
        );
        IsaVariant { isa, width }
    }

    #[inline]
    pub fn lanes(&self) -> usize {
        self.width.lanes()
    }

    #[inline]
    pub fn vlen(&self) -> usize {
        self.width.bytes()
    }

    #[inline]
    pub fn n_vregs(&self) -> usize {
        self.isa.n_vregs()
    }

    #[inline]
    pub fn has_opmask(&self) -> bool {
        self.isa.has_opmask()
    }
}

impl fmt::Display for IsaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.isa, self.width)
    }
}
