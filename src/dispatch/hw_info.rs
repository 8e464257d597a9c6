//! CPU capability probe.
//!
//! Collects the feature bits relevant to tier selection into a `CpuCaps`.
//! Core features come from `is_x86_feature_detected!` (which also checks OS
//! register-state support); the newer AVX-512/VNNI extensions are read from
//! CPUID leaf 7 directly and only trusted when their base feature is usable.

use std::fmt;

use super::isa::{feat, CpuIsa};

/// Feature set of the running (or a simulated) CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuCaps {
    bits: u32,
}

impl CpuCaps {
    /// Probe the current machine.
    pub fn detect() -> Self {
        CpuCaps {
            bits: detect_feature_bits(),
        }
    }

    /// A CPU that offers exactly `isa` and everything below it.
    pub const fn with_isa(isa: CpuIsa) -> Self {
        CpuCaps {
            bits: isa.features(),
        }
    }

    /// A CPU with no vector extensions at all.
    pub const fn none() -> Self {
        CpuCaps { bits: 0 }
    }

    pub const fn may_use(&self, isa: CpuIsa) -> bool {
        self.bits & isa.features() == isa.features()
    }

    /// Drop every feature not offered by `max`.
    pub const fn capped(self, max: CpuIsa) -> Self {
        CpuCaps {
            bits: self.bits & max.features(),
        }
    }

    /// Widest usable tier in `CpuIsa::ALL` order, if any.
    pub fn best_isa(&self) -> Option<CpuIsa> {
        CpuIsa::ALL
            .iter()
            .rev()
            .copied()
            .find(|isa| self.may_use(*isa))
    }
}

impl fmt::Display for CpuCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 9] = [
            (feat::SSE41, "SSE4.1"),
            (feat::AVX, "AVX"),
            (feat::AVX2, "AVX2"),
            (feat::AVX_VNNI, "AVX-VNNI"),
            (feat::AVX_NE_CONVERT, "AVX-NE-CONVERT"),
            (feat::AVX512_CORE, "AVX-512"),
            (feat::AVX512_VNNI, "VNNI"),
            (feat::AVX512_BF16, "BF16"),
            (feat::AVX512_FP16, "FP16"),
        ];
        let feats: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.bits & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if feats.is_empty() {
            return f.write_str("Scalar");
        }
        write!(f, "{}", feats.join("+"))
    }
}

// ── feature detection ───────────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
fn detect_feature_bits() -> u32 {
    use std::arch::x86_64::{__cpuid, __cpuid_count};

    let mut bits = 0;
    if is_x86_feature_detected!("sse4.1") {
        bits |= feat::SSE41;
    }
    if is_x86_feature_detected!("avx") {
        bits |= feat::AVX;
    }
    let avx2 = is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma");
    if avx2 {
        bits |= feat::AVX2;
    }
    let avx512_core = is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512bw")
        && is_x86_feature_detected!("avx512vl")
        && is_x86_feature_detected!("avx512dq");
    if avx512_core {
        bits |= feat::AVX512_CORE;
    }

    #[allow(unused_unsafe)]
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf < 7 || !avx2 {
        return bits;
    }
    #[allow(unused_unsafe)]
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    #[allow(unused_unsafe)]
    let leaf7_1 = if leaf7.eax >= 1 {
        Some(unsafe { __cpuid_count(7, 1) })
    } else {
        None
    };

    if let Some(sub1) = leaf7_1 {
        if sub1.eax & (1 << 4) != 0 {
            bits |= feat::AVX_VNNI;
        }
        if sub1.edx & (1 << 5) != 0 {
            bits |= feat::AVX_NE_CONVERT;
        }
    }
    if avx512_core {
        if leaf7.ecx & (1 << 11) != 0 {
            bits |= feat::AVX512_VNNI;
        }
        if leaf7.edx & (1 << 23) != 0 {
            bits |= feat::AVX512_FP16;
        }
        if let Some(sub1) = leaf7_1 {
            if sub1.eax & (1 << 5) != 0 {
                bits |= feat::AVX512_BF16;
            }
        }
    }
    bits
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_feature_bits() -> u32 {
    0
}
