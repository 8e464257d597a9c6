//! Eltwise injector: unary activations applied in place.
//!
//! Scratch registers are chosen at emission time from the lowest indices
//! outside the compute set. With `save_state` they are spilled around the
//! body, so the caller does not have to reserve them; it only has to leave
//! enough of the file outside the compute set (see [`aux_vecs_count`]).

use super::math_approx::{self, Key, Table};
use super::VmmIndexSet;
use crate::codegen::asm::{CmpPred, DataLabel, Gpr, Opmask, RoundMode, VecAsm, Vmm};
use crate::dispatch::{is_superset, CpuIsa, IsaVariant};
use crate::error::CodegenResult;
use crate::post_ops::{EltwiseAlg, EltwiseParams};
use crate::types::DataType;

/// Build-time configuration shared by every eltwise entry of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltwiseStaticParams {
    /// Spill scratch registers (and the table pointer) around each call.
    pub save_state: bool,
    /// Holds the constant table address during a call.
    pub p_table: Gpr,
    /// Scratch opmask for compare/blend on masked ISAs.
    pub k_mask: Opmask,
    pub is_fwd: bool,
    pub preserve_vmm: bool,
    pub preserve_p_table: bool,
}

impl Default for EltwiseStaticParams {
    fn default() -> Self {
        EltwiseStaticParams {
            save_state: true,
            p_table: Gpr::Rax,
            k_mask: Opmask(1),
            is_fwd: true,
            preserve_vmm: true,
            preserve_p_table: true,
        }
    }
}

/// `alg` can be emitted on `isa` at data type `dt`.
pub fn is_supported(isa: CpuIsa, alg: EltwiseAlg, dt: DataType) -> bool {
    if dt != DataType::F32 {
        return false;
    }
    match alg {
        // integer lane shifts at full width and FMA-heavy polynomials
        EltwiseAlg::Log | EltwiseAlg::GeluErf => is_superset(isa, CpuIsa::Avx2),
        _ => true,
    }
}

/// An algorithm that selects between two values per lane.
fn needs_blend(alg: EltwiseAlg, alpha: f32) -> bool {
    match alg {
        EltwiseAlg::Relu => alpha != 0.0,
        EltwiseAlg::Elu => true,
        _ => false,
    }
}

/// Reads the constant table.
fn needs_table(alg: EltwiseAlg) -> bool {
    !matches!(alg, EltwiseAlg::Sqrt | EltwiseAlg::Square | EltwiseAlg::Round)
}

/// Scratch vector registers `alg` needs on `isa`. Only forward kernels are
/// generated; `is_fwd` is accepted for callers sizing either direction.
pub fn aux_vecs_count(alg: EltwiseAlg, isa: CpuIsa, is_fwd: bool, alpha: f32) -> usize {
    debug_assert!(is_fwd, "backward eltwise is not generated");
    let masked = isa.has_opmask();
    match alg {
        EltwiseAlg::Relu => {
            if alpha == 0.0 {
                1
            } else {
                2
            }
        }
        EltwiseAlg::Elu => {
            if masked {
                4
            } else {
                5
            }
        }
        EltwiseAlg::Tanh | EltwiseAlg::Logistic | EltwiseAlg::Exp => 3,
        EltwiseAlg::Log | EltwiseAlg::Swish | EltwiseAlg::GeluTanh => 4,
        EltwiseAlg::GeluErf => 6,
        EltwiseAlg::HardSwish => 3,
        EltwiseAlg::Linear => 2,
        EltwiseAlg::Abs | EltwiseAlg::Clip => 1,
        EltwiseAlg::Sqrt | EltwiseAlg::Square | EltwiseAlg::Round => 0,
    }
}

#[derive(Debug, Clone)]
pub struct EltwiseInjector {
    variant: IsaVariant,
    params: EltwiseParams,
    sp: EltwiseStaticParams,
    table_label: DataLabel,
}

impl EltwiseInjector {
    pub fn new<E: VecAsm>(
        asm: &mut E,
        variant: IsaVariant,
        params: EltwiseParams,
        sp: EltwiseStaticParams,
    ) -> Self {
        assert!(sp.is_fwd, "backward eltwise is not generated");
        assert!(
            is_supported(variant.isa, params.alg, DataType::F32),
            "eltwise {:?} is not supported on {}",
            params.alg,
            variant.isa
        );
        EltwiseInjector {
            variant,
            params,
            sp,
            table_label: asm.new_data_label(),
        }
    }

    pub fn params(&self) -> &EltwiseParams {
        &self.params
    }

    pub fn aux_vecs_count(&self) -> usize {
        aux_vecs_count(self.params.alg, self.variant.isa, self.sp.is_fwd, self.params.alpha)
    }

    /// Emit the constant table. Call once per kernel, after the code; with
    /// `gen_table == false` the caller shares a table emitted elsewhere.
    pub fn prepare_table<E: VecAsm>(&self, asm: &mut E, gen_table: bool) -> CodegenResult<()> {
        if !gen_table || !needs_table(self.params.alg) {
            return Ok(());
        }
        let words = math_approx::table_words(self.params.alpha, self.params.beta);
        asm.emit_data(self.table_label, &words)
    }

    /// Lowest-index free registers outside `idxs`.
    fn pick_aux(&self, idxs: &VmmIndexSet) -> Vec<Vmm> {
        let need = self.aux_vecs_count();
        let aux: Vec<Vmm> = (0..self.variant.n_vregs())
            .filter(|i| !idxs.contains(i))
            .take(need)
            .map(Vmm::from)
            .collect();
        assert!(
            aux.len() == need,
            "eltwise {:?} needs {need} scratch registers, {} free on {}",
            self.params.alg,
            aux.len(),
            self.variant
        );
        if !self.variant.has_opmask()
            && self.variant.isa.blend_uses_implicit_mask()
            && needs_blend(self.params.alg, self.params.alpha)
        {
            assert!(
                aux[0] == Vmm(0),
                "eltwise {:?} on {} blends through vmm0, which is in the compute set",
                self.params.alg,
                self.variant.isa
            );
        }
        aux
    }

    pub fn compute_vector_range<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
    ) -> CodegenResult<()> {
        if idxs.is_empty() {
            return Ok(());
        }
        let aux = self.pick_aux(idxs);
        let uses_table = needs_table(self.params.alg);
        let save_table = uses_table && self.sp.save_state && self.sp.preserve_p_table;
        let save_vmms = self.sp.save_state && self.sp.preserve_vmm;

        if save_table {
            asm.push(self.sp.p_table)?;
        }
        if save_vmms {
            asm.spill_vmms(&aux)?;
        }
        if uses_table {
            asm.lea_data(self.sp.p_table, self.table_label)?;
        }

        let t = Table {
            base: self.sp.p_table,
        };
        for &idx in idxs {
            self.compute_body(asm, &t, Vmm::from(idx), &aux)?;
        }

        if save_vmms {
            asm.restore_vmms(&aux)?;
        }
        if save_table {
            asm.pop(self.sp.p_table)?;
        }
        Ok(())
    }

    pub fn compute_vector<E: VecAsm>(&self, asm: &mut E, idx: usize) -> CodegenResult<()> {
        self.compute_vector_range(asm, &VmmIndexSet::from([idx]))
    }

    fn compute_body<E: VecAsm>(
        &self,
        e: &mut E,
        t: &Table,
        x: Vmm,
        a: &[Vmm],
    ) -> CodegenResult<()> {
        let masked = self.variant.has_opmask();
        let k = self.sp.k_mask;
        match self.params.alg {
            EltwiseAlg::Relu if self.params.alpha == 0.0 => {
                e.vzero(a[0])?;
                e.vmax(x, x, a[0])
            }
            EltwiseAlg::Relu => {
                e.vzero(a[0])?;
                t.load(e, a[1], Key::Alpha)?;
                e.vmul(a[1], a[1], x)?;
                if masked {
                    e.vcmp_mask(CmpPred::Gt, k, x, a[0])?;
                    e.vblendm(x, a[1], x, k)
                } else {
                    e.vcmp(CmpPred::Gt, a[0], x, a[0])?;
                    e.vblendv(x, a[1], x, a[0])
                }
            }
            EltwiseAlg::Elu => {
                // a[0] is the blend mask on unmasked ISAs
                let (r, s) = if masked {
                    (a[0], [a[1], a[2], a[3]])
                } else {
                    (a[1], [a[2], a[3], a[4]])
                };
                math_approx::emit_exp(e, t, r, x, s)?;
                t.load(e, s[0], Key::One)?;
                e.vsub(r, r, s[0])?;
                t.load(e, s[0], Key::Alpha)?;
                e.vmul(r, r, s[0])?;
                if masked {
                    e.vzero(s[0])?;
                    e.vcmp_mask(CmpPred::Gt, k, x, s[0])?;
                    e.vblendm(x, r, x, k)
                } else {
                    e.vzero(a[0])?;
                    e.vcmp(CmpPred::Gt, a[0], x, a[0])?;
                    e.vblendv(x, r, x, a[0])
                }
            }
            EltwiseAlg::Tanh => math_approx::emit_tanh(e, t, x, x, [a[0], a[1], a[2]]),
            EltwiseAlg::Logistic => math_approx::emit_logistic(e, t, x, x, [a[0], a[1], a[2]]),
            EltwiseAlg::Exp => math_approx::emit_exp(e, t, x, x, [a[0], a[1], a[2]]),
            EltwiseAlg::Log => math_approx::emit_log(e, t, x, x, [a[0], a[1], a[2], a[3]]),
            EltwiseAlg::Sqrt => e.vunary(crate::codegen::VUnOp::Sqrt, x, x),
            EltwiseAlg::Square => e.vmul(x, x, x),
            EltwiseAlg::Abs => {
                t.load(e, a[0], Key::AbsMask)?;
                e.vand(x, x, a[0])
            }
            EltwiseAlg::Linear => {
                t.load(e, a[0], Key::Alpha)?;
                t.load(e, a[1], Key::Beta)?;
                e.vfmadd213(x, a[0], a[1])
            }
            EltwiseAlg::Clip => {
                t.load(e, a[0], Key::Alpha)?;
                e.vmax(x, x, a[0])?;
                t.load(e, a[0], Key::Beta)?;
                e.vmin(x, x, a[0])
            }
            EltwiseAlg::Swish => {
                e.vmov(a[0], x)?;
                t.load(e, a[1], Key::Alpha)?;
                e.vmul(x, x, a[1])?;
                math_approx::emit_logistic(e, t, x, x, [a[1], a[2], a[3]])?;
                e.vmul(x, x, a[0])
            }
            EltwiseAlg::GeluTanh => {
                e.vmov(a[0], x)?;
                e.vmul(a[1], x, x)?;
                t.load(e, a[2], Key::GeluC)?;
                e.vmul(a[1], a[1], a[2])?;
                t.load(e, a[2], Key::One)?;
                e.vadd(a[1], a[1], a[2])?;
                e.vmul(x, x, a[1])?;
                t.load(e, a[1], Key::GeluSqrt2Pi)?;
                e.vmul(x, x, a[1])?;
                math_approx::emit_tanh(e, t, x, x, [a[1], a[2], a[3]])?;
                t.load(e, a[1], Key::One)?;
                e.vadd(x, x, a[1])?;
                t.load(e, a[1], Key::Half)?;
                e.vmul(x, x, a[1])?;
                e.vmul(x, x, a[0])
            }
            EltwiseAlg::GeluErf => self.gelu_erf(e, t, x, a),
            EltwiseAlg::HardSwish => {
                e.vmov(a[0], x)?;
                t.load(e, a[1], Key::Alpha)?;
                t.load(e, a[2], Key::Beta)?;
                e.vfmadd213(x, a[1], a[2])?;
                e.vzero(a[1])?;
                e.vmax(x, x, a[1])?;
                t.load(e, a[1], Key::One)?;
                e.vmin(x, x, a[1])?;
                e.vmul(x, x, a[0])
            }
            EltwiseAlg::Round => e.vround(x, x, RoundMode::NearestEven),
        }
    }

    /// 0.5·x·(1 + erf(x/√2)), erf from Abramowitz-Stegun 7.1.26.
    fn gelu_erf<E: VecAsm>(&self, e: &mut E, t: &Table, x: Vmm, a: &[Vmm]) -> CodegenResult<()> {
        e.vmov(a[0], x)?;
        t.load(e, a[1], Key::InvSqrt2)?;
        e.vmul(x, x, a[1])?;
        t.load(e, a[1], Key::SignMask)?;
        e.vand(a[1], a[1], x)?;
        t.load(e, a[2], Key::AbsMask)?;
        e.vand(x, x, a[2])?;

        e.vmul(a[2], x, x)?;
        t.load(e, a[3], Key::SignMask)?;
        e.vxor(a[2], a[2], a[3])?;
        math_approx::emit_exp(e, t, a[2], a[2], [a[3], a[4], a[5]])?;

        t.load(e, a[4], Key::One)?;
        t.load(e, a[3], Key::ErfP)?;
        e.vfmadd213(a[3], x, a[4])?;
        e.vdiv(a[3], a[4], a[3])?;

        t.load(e, x, Key::ErfA5)?;
        for key in [Key::ErfA4, Key::ErfA3, Key::ErfA2, Key::ErfA1] {
            t.load(e, a[4], key)?;
            e.vfmadd213(x, a[3], a[4])?;
        }
        e.vmul(x, x, a[3])?;
        e.vmul(x, x, a[2])?;
        t.load(e, a[4], Key::One)?;
        e.vsub(x, a[4], x)?;
        e.vor(x, x, a[1])?;
        e.vadd(x, x, a[4])?;
        t.load(e, a[4], Key::Half)?;
        e.vmul(x, x, a[4])?;
        e.vmul(x, x, a[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::VecWidth;
    use crate::injectors::test_util::run_on_vector;

    fn reference(alg: EltwiseAlg, x: f32, alpha: f32, beta: f32) -> f32 {
        let logistic = |v: f32| 1.0 / (1.0 + (-v).exp());
        match alg {
            EltwiseAlg::Relu => if x > 0.0 { x } else { alpha * x },
            EltwiseAlg::Elu => if x > 0.0 { x } else { alpha * (x.exp() - 1.0) },
            EltwiseAlg::Tanh => x.tanh(),
            EltwiseAlg::Logistic => logistic(x),
            EltwiseAlg::Exp => x.exp(),
            EltwiseAlg::Log => x.ln(),
            EltwiseAlg::Sqrt => x.sqrt(),
            EltwiseAlg::Square => x * x,
            EltwiseAlg::Abs => x.abs(),
            EltwiseAlg::Linear => alpha * x + beta,
            EltwiseAlg::Clip => x.max(alpha).min(beta),
            EltwiseAlg::Swish => x * logistic(alpha * x),
            EltwiseAlg::GeluTanh => {
                let g = (2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x);
                0.5 * x * (1.0 + g.tanh())
            }
            EltwiseAlg::GeluErf => {
                // erf via f64 series for the oracle
                let z = x as f64 / std::f64::consts::SQRT_2;
                0.5 * x * (1.0 + erf64(z) as f32)
            }
            EltwiseAlg::HardSwish => x * (alpha * x + beta).clamp(0.0, 1.0),
            EltwiseAlg::Round => x.round_ties_even(),
        }
    }

    fn erf64(z: f64) -> f64 {
        // Taylor series converges quickly for |z| < 3
        let mut sum = 0.0;
        let mut term = z;
        let mut n = 0;
        while n < 60 {
            sum += term / (2 * n + 1) as f64;
            n += 1;
            term *= -z * z / n as f64;
        }
        sum * 2.0 / std::f64::consts::PI.sqrt()
    }

    fn inputs(alg: EltwiseAlg, lanes: usize) -> Vec<f32> {
        (0..lanes)
            .map(|i| {
                let t = i as f32 / lanes as f32;
                match alg {
                    EltwiseAlg::Log | EltwiseAlg::Sqrt => 0.01 + 9.0 * t,
                    _ => -4.0 + 8.0 * t + 0.1,
                }
            })
            .collect()
    }

    fn check(variant: IsaVariant, params: EltwiseParams) {
        let lanes = variant.lanes();
        let x = inputs(params.alg, lanes);
        let out = run_on_vector(variant, &x, |asm, v| {
            let inj = EltwiseInjector::new(asm, variant, params, EltwiseStaticParams::default());
            inj.compute_vector(asm, v)?;
            inj.prepare_table(asm, true)
        });
        for (i, (&xi, &yi)) in x.iter().zip(&out).enumerate() {
            let want = reference(params.alg, xi, params.alpha, params.beta);
            let tol = 2e-5 * want.abs().max(1.0);
            assert!(
                (yi - want).abs() <= tol,
                "{:?} on {variant} lane {i}: f({xi}) = {yi}, want {want}",
                params.alg
            );
        }
    }

    fn params(alg: EltwiseAlg) -> EltwiseParams {
        let (alpha, beta) = match alg {
            EltwiseAlg::Relu => (0.1, 0.0),
            EltwiseAlg::Elu => (0.7, 0.0),
            EltwiseAlg::Linear => (1.5, -0.25),
            EltwiseAlg::Clip => (-1.0, 2.0),
            EltwiseAlg::Swish => (1.2, 0.0),
            EltwiseAlg::HardSwish => (1.0 / 6.0, 0.5),
            _ => (0.0, 0.0),
        };
        EltwiseParams { alg, alpha, beta }
    }

    #[test]
    fn test_all_algorithms_avx512() {
        let v = IsaVariant::new(CpuIsa::Avx512Core, VecWidth::Zmm);
        for alg in EltwiseAlg::ALL {
            check(v, params(alg));
        }
    }

    #[test]
    fn test_all_algorithms_avx2() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        for alg in EltwiseAlg::ALL {
            check(v, params(alg));
        }
    }

    #[test]
    fn test_supported_algorithms_sse41() {
        let v = IsaVariant::new(CpuIsa::Sse41, VecWidth::Xmm);
        for alg in EltwiseAlg::ALL {
            if is_supported(CpuIsa::Sse41, alg, DataType::F32) {
                check(v, params(alg));
            }
        }
    }

    #[test]
    fn test_relu_zero_slope() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        check(v, EltwiseParams { alg: EltwiseAlg::Relu, alpha: 0.0, beta: 0.0 });
    }

    #[test]
    fn test_is_supported_depends_on_isa() {
        assert!(!is_supported(CpuIsa::Sse41, EltwiseAlg::Log, DataType::F32));
        assert!(!is_supported(CpuIsa::Avx, EltwiseAlg::GeluErf, DataType::F32));
        assert!(is_supported(CpuIsa::Avx2, EltwiseAlg::Log, DataType::F32));
        assert!(!is_supported(CpuIsa::Avx512Core, EltwiseAlg::Relu, DataType::Bf16));
    }

    #[test]
    fn test_aux_counts() {
        assert_eq!(aux_vecs_count(EltwiseAlg::Relu, CpuIsa::Avx2, true, 0.0), 1);
        assert_eq!(aux_vecs_count(EltwiseAlg::Elu, CpuIsa::Avx2, true, 1.0), 5);
        assert_eq!(aux_vecs_count(EltwiseAlg::Elu, CpuIsa::Avx512Core, true, 1.0), 4);
        assert_eq!(aux_vecs_count(EltwiseAlg::Square, CpuIsa::Sse41, true, 0.0), 0);
    }

    #[test]
    #[should_panic(expected = "scratch registers")]
    fn test_register_budget_overflow_panics() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        let mut asm = crate::codegen::ProgramAssembler::new(VecWidth::Ymm);
        let p = EltwiseParams { alg: EltwiseAlg::GeluErf, alpha: 0.0, beta: 0.0 };
        let inj = EltwiseInjector::new(&mut asm, v, p, EltwiseStaticParams::default());
        let all: VmmIndexSet = (0..12).collect();
        let _ = inj.compute_vector_range(&mut asm, &all);
    }

    #[test]
    #[should_panic(expected = "vmm0")]
    fn test_sse41_blend_needs_vmm0() {
        let v = IsaVariant::new(CpuIsa::Sse41, VecWidth::Xmm);
        let mut asm = crate::codegen::ProgramAssembler::new(VecWidth::Xmm);
        let p = EltwiseParams { alg: EltwiseAlg::Relu, alpha: 0.5, beta: 0.0 };
        let inj = EltwiseInjector::new(&mut asm, v, p, EltwiseStaticParams::default());
        let _ = inj.compute_vector(&mut asm, 0);
    }

    #[test]
    fn test_save_state_balances_stack() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        let mut asm = crate::codegen::ProgramAssembler::new(VecWidth::Ymm);
        let p = params(EltwiseAlg::Tanh);
        let inj = EltwiseInjector::new(&mut asm, v, p, EltwiseStaticParams::default());
        inj.compute_vector(&mut asm, 5).unwrap();
        let subs = asm
            .insns()
            .iter()
            .filter(|i| matches!(i, crate::codegen::Insn::AluImm { op: crate::codegen::AluOp::Sub, dst: Gpr::Rsp, .. }))
            .count();
        let adds = asm
            .insns()
            .iter()
            .filter(|i| matches!(i, crate::codegen::Insn::AluImm { op: crate::codegen::AluOp::Add, dst: Gpr::Rsp, .. }))
            .count();
        assert_eq!(subs, 2);
        assert_eq!(adds, 2);
    }
}
