//! Transcendental approximations shared by the eltwise injector.
//!
//! Constants are read from the injector's table through a base register
//! rather than materialized per use, so one broadcast load replaces a
//! move/broadcast pair. All approximations target f32 precision (a few ULP
//! for exp/log/tanh).

use crate::codegen::asm::{Address, Gpr, VecAsm, Vmm, VUnOp};
use crate::error::CodegenResult;
use crate::types::DataType;

// ── Exp (Cephes degree-5) ──────────────────────────────────────────────────

pub const EXP_CLAMP_LO: f32 = -88.376;
pub const EXP_CLAMP_HI: f32 = 88.376;
pub const EXP_LOG2E: f32 = 1.442_695;
/// Cody-Waite split of -ln(2).
pub const EXP_C1: f32 = -0.693_359_375;
pub const EXP_C2: f32 = 2.121_944_4e-4;
pub const EXP_P0: f32 = 1.987_569_2e-4;
pub const EXP_P1: f32 = 1.398_2e-3;
pub const EXP_P2: f32 = 8.333_452e-3;
pub const EXP_P3: f32 = 4.166_579_6e-2;
pub const EXP_P4: f32 = 1.666_666_5e-1;
pub const EXP_P5: f32 = 5.000_000_1e-1;

// ── Log (atanh series on the mantissa) ─────────────────────────────────────

pub const LOG_MANTISSA_MASK: u32 = 0x007F_FFFF;
pub const LOG_LN2: f32 = std::f32::consts::LN_2;

// ── Gelu / erf (Abramowitz-Stegun 7.1.26) ─────────────────────────────────

pub const GELU_TANH_C: f32 = 0.044_715;
pub const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6;
pub const ERF_P: f32 = 0.327_591_1;
pub const ERF_A: [f32; 5] = [
    0.254_829_6,
    -0.284_496_74,
    1.421_413_8,
    -1.453_152_1,
    1.061_405_4,
];

/// Slots of the per-injector constant table, in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Key {
    One,
    Half,
    Two,
    AbsMask,
    SignMask,
    Bias127I32,
    Bias127F32,
    ExpLo,
    ExpHi,
    Log2e,
    ExpC1,
    ExpC2,
    ExpP0,
    ExpP1,
    ExpP2,
    ExpP3,
    ExpP4,
    ExpP5,
    MantMask,
    Ln2,
    Inv3,
    Inv5,
    Inv7,
    Inv9,
    Inv11,
    GeluC,
    GeluSqrt2Pi,
    InvSqrt2,
    ErfP,
    ErfA1,
    ErfA2,
    ErfA3,
    ErfA4,
    ErfA5,
    Alpha,
    Beta,
}

pub const TABLE_WORDS: usize = Key::Beta as usize + 1;

/// Table contents for an entry with the given alpha/beta.
pub fn table_words(alpha: f32, beta: f32) -> Vec<u32> {
    use Key::*;
    let word = |k: Key| -> u32 {
        match k {
            One => 1.0f32.to_bits(),
            Half => 0.5f32.to_bits(),
            Two => 2.0f32.to_bits(),
            AbsMask => 0x7FFF_FFFF,
            SignMask => 0x8000_0000,
            Bias127I32 => 127,
            Bias127F32 => 127.0f32.to_bits(),
            ExpLo => EXP_CLAMP_LO.to_bits(),
            ExpHi => EXP_CLAMP_HI.to_bits(),
            Log2e => EXP_LOG2E.to_bits(),
            ExpC1 => EXP_C1.to_bits(),
            ExpC2 => EXP_C2.to_bits(),
            ExpP0 => EXP_P0.to_bits(),
            ExpP1 => EXP_P1.to_bits(),
            ExpP2 => EXP_P2.to_bits(),
            ExpP3 => EXP_P3.to_bits(),
            ExpP4 => EXP_P4.to_bits(),
            ExpP5 => EXP_P5.to_bits(),
            MantMask => LOG_MANTISSA_MASK,
            Ln2 => LOG_LN2.to_bits(),
            Inv3 => (1.0f32 / 3.0).to_bits(),
            Inv5 => (1.0f32 / 5.0).to_bits(),
            Inv7 => (1.0f32 / 7.0).to_bits(),
            Inv9 => (1.0f32 / 9.0).to_bits(),
            Inv11 => (1.0f32 / 11.0).to_bits(),
            GeluC => GELU_TANH_C.to_bits(),
            GeluSqrt2Pi => GELU_SQRT_2_OVER_PI.to_bits(),
            InvSqrt2 => std::f32::consts::FRAC_1_SQRT_2.to_bits(),
            ErfP => ERF_P.to_bits(),
            ErfA1 => ERF_A[0].to_bits(),
            ErfA2 => ERF_A[1].to_bits(),
            ErfA3 => ERF_A[2].to_bits(),
            ErfA4 => ERF_A[3].to_bits(),
            ErfA5 => ERF_A[4].to_bits(),
            Alpha => alpha.to_bits(),
            Beta => beta.to_bits(),
        }
    };
    const ORDER: [Key; TABLE_WORDS] = [
        One, Half, Two, AbsMask, SignMask, Bias127I32, Bias127F32, ExpLo, ExpHi, Log2e, ExpC1,
        ExpC2, ExpP0, ExpP1, ExpP2, ExpP3, ExpP4, ExpP5, MantMask, Ln2, Inv3, Inv5, Inv7, Inv9,
        Inv11, GeluC, GeluSqrt2Pi, InvSqrt2, ErfP, ErfA1, ErfA2, ErfA3, ErfA4, ErfA5, Alpha, Beta,
    ];
    ORDER.iter().map(|&k| word(k)).collect()
}

/// A constant table addressed through a general register.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub base: Gpr,
}

impl Table {
    #[inline]
    pub fn addr(&self, key: Key) -> Address {
        Address::disp(self.base, (key as usize * 4) as i32)
    }

    /// Broadcast `key` into every lane of `dst`.
    #[inline]
    pub fn load<E: VecAsm>(&self, e: &mut E, dst: Vmm, key: Key) -> CodegenResult<()> {
        e.vbroadcast(dst, self.addr(key), DataType::F32)
    }
}

// ── Generic emit functions ─────────────────────────────────────────────────

/// exp(x): clamp, k = round(x·log2e), r = x - k·ln2 (Cody-Waite), degree-5
/// Horner, then scale by 2^k built in the exponent field.
///
/// `dst` may equal `src`; `s` must not overlap either.
pub fn emit_exp<E: VecAsm>(
    e: &mut E,
    t: &Table,
    dst: Vmm,
    src: Vmm,
    s: [Vmm; 3],
) -> CodegenResult<()> {
    t.load(e, s[1], Key::ExpHi)?;
    e.vmin(s[0], src, s[1])?;
    t.load(e, s[1], Key::ExpLo)?;
    e.vmax(s[0], s[0], s[1])?;

    t.load(e, s[1], Key::Log2e)?;
    e.vmul(s[1], s[0], s[1])?;
    e.vround(s[2], s[1], crate::codegen::RoundMode::NearestEven)?;

    t.load(e, s[1], Key::ExpC1)?;
    e.vfmadd231(s[0], s[2], s[1])?;
    t.load(e, s[1], Key::ExpC2)?;
    e.vfmadd231(s[0], s[2], s[1])?;

    t.load(e, dst, Key::ExpP0)?;
    for key in [Key::ExpP1, Key::ExpP2, Key::ExpP3, Key::ExpP4, Key::ExpP5] {
        t.load(e, s[1], key)?;
        e.vfmadd213(dst, s[0], s[1])?;
    }
    e.vmul(dst, dst, s[0])?;
    e.vmul(dst, dst, s[0])?;
    e.vadd(dst, dst, s[0])?;
    t.load(e, s[1], Key::One)?;
    e.vadd(dst, dst, s[1])?;

    e.vunary(VUnOp::CvtF32I32, s[1], s[2])?;
    t.load(e, s[2], Key::Bias127I32)?;
    e.vbinary(crate::codegen::VBinOp::AddI32, s[1], s[1], s[2])?;
    e.vunary(VUnOp::ShlI32(23), s[1], s[1])?;
    e.vmul(dst, dst, s[1])
}

/// tanh(x) = 2 / (1 + e^(-2x)) - 1.
pub fn emit_tanh<E: VecAsm>(
    e: &mut E,
    t: &Table,
    dst: Vmm,
    src: Vmm,
    s: [Vmm; 3],
) -> CodegenResult<()> {
    t.load(e, s[1], Key::Two)?;
    e.vmul(s[0], src, s[1])?;
    t.load(e, s[1], Key::SignMask)?;
    e.vxor(s[0], s[0], s[1])?;
    emit_exp(e, t, dst, s[0], s)?;
    t.load(e, s[1], Key::One)?;
    e.vadd(dst, dst, s[1])?;
    t.load(e, s[2], Key::Two)?;
    e.vdiv(dst, s[2], dst)?;
    e.vsub(dst, dst, s[1])
}

/// logistic(x) = 1 / (1 + e^(-x)).
pub fn emit_logistic<E: VecAsm>(
    e: &mut E,
    t: &Table,
    dst: Vmm,
    src: Vmm,
    s: [Vmm; 3],
) -> CodegenResult<()> {
    t.load(e, s[1], Key::SignMask)?;
    e.vxor(s[0], src, s[1])?;
    emit_exp(e, t, dst, s[0], s)?;
    t.load(e, s[1], Key::One)?;
    e.vadd(dst, dst, s[1])?;
    e.vdiv(dst, s[1], dst)
}

/// ln(x) for positive normal x.
///
/// x = 2^k · m with m in [1, 2); ln(m) = 2·atanh(u), u = (m-1)/(m+1) in
/// [0, 1/3), evaluated as 2u·(1 + z/3 + z²/5 + ... + z⁵/11) with z = u².
pub fn emit_log<E: VecAsm>(
    e: &mut E,
    t: &Table,
    dst: Vmm,
    src: Vmm,
    s: [Vmm; 4],
) -> CodegenResult<()> {
    e.vunary(VUnOp::ShrI32(23), s[0], src)?;
    e.vunary(VUnOp::CvtI32F32, s[0], s[0])?;
    t.load(e, s[2], Key::Bias127F32)?;
    e.vsub(s[0], s[0], s[2])?;

    t.load(e, s[2], Key::MantMask)?;
    e.vand(s[1], src, s[2])?;
    t.load(e, s[2], Key::One)?;
    e.vor(s[1], s[1], s[2])?;

    e.vadd(dst, s[1], s[2])?;
    e.vsub(s[1], s[1], s[2])?;
    e.vdiv(s[1], s[1], dst)?;
    e.vmul(dst, s[1], s[1])?;

    t.load(e, s[2], Key::Inv11)?;
    for key in [Key::Inv9, Key::Inv7, Key::Inv5, Key::Inv3, Key::One] {
        t.load(e, s[3], key)?;
        e.vfmadd213(s[2], dst, s[3])?;
    }
    e.vmul(s[2], s[2], s[1])?;
    t.load(e, s[3], Key::Two)?;
    e.vmul(s[2], s[2], s[3])?;

    t.load(e, s[3], Key::Ln2)?;
    e.vmov(dst, s[2])?;
    e.vfmadd231(dst, s[0], s[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout_matches_keys() {
        let words = table_words(0.25, -3.0);
        assert_eq!(words.len(), TABLE_WORDS);
        assert_eq!(words[Key::One as usize], 1.0f32.to_bits());
        assert_eq!(words[Key::Bias127I32 as usize], 127);
        assert_eq!(f32::from_bits(words[Key::Alpha as usize]), 0.25);
        assert_eq!(f32::from_bits(words[Key::Beta as usize]), -3.0);
        assert_eq!(words[Key::ErfA5 as usize], ERF_A[4].to_bits());
    }

    #[test]
    fn test_exp_scalar_model() {
        // Same steps as emit_exp, replayed in scalar f32 arithmetic.
        for &x in &[-20.0f32, -1.5, 0.0, 0.3, 1.0, 10.0, 80.0] {
            let xc = x.clamp(EXP_CLAMP_LO, EXP_CLAMP_HI);
            let k = (xc * EXP_LOG2E).round_ties_even();
            let r = k.mul_add(EXP_C2, k.mul_add(EXP_C1, xc));
            let mut p = EXP_P0;
            for c in [EXP_P1, EXP_P2, EXP_P3, EXP_P4, EXP_P5] {
                p = p.mul_add(r, c);
            }
            let y = p * r * r + r + 1.0;
            let scale = f32::from_bits(((k as i32 + 127) as u32) << 23);
            let got = y * scale;
            let want = x.exp();
            assert!((got - want).abs() <= want * 2e-6, "exp({x}) = {got}, want {want}");
        }
    }
}
