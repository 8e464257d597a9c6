//! Depthwise injector: per-channel scale/shift and prelu.

use super::VmmIndexSet;
use crate::codegen::asm::{Address, AluOp, CmpPred, Gpr, Opmask, VecAsm, Vmm};
use crate::dispatch::IsaVariant;
use crate::error::CodegenResult;
use crate::post_ops::{DepthwiseAlg, DepthwiseParams};
use crate::types::DataType;

/// Run-time channel offset in bytes, held in a register or in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcOffset {
    Reg(Gpr),
    Addr(Address),
}

impl OcOffset {
    /// `dst += channel offset`.
    pub(crate) fn add_to<E: VecAsm>(self, asm: &mut E, dst: Gpr) -> CodegenResult<()> {
        match self {
            OcOffset::Reg(r) => asm.alu(AluOp::Add, dst, r),
            OcOffset::Addr(a) => asm.alu_mem(AluOp::Add, dst, a),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseStaticParams {
    pub vmm_weights: Vmm,
    pub vmm_bias: Vmm,
    /// Comparison mask for prelu on masked ISAs.
    pub k_mask: Opmask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseDynamicParams {
    pub reg_weights: Gpr,
    pub reg_bias: Gpr,
    pub oc_off: OcOffset,
}

#[derive(Debug, Clone)]
pub struct DepthwiseInjector {
    variant: IsaVariant,
    params: DepthwiseParams,
    sp: DepthwiseStaticParams,
}

impl DepthwiseInjector {
    /// Bytes of auxiliary table one entry consumes.
    pub const MEMORY_STEP: usize = 8;

    pub fn new(variant: IsaVariant, params: DepthwiseParams, sp: DepthwiseStaticParams) -> Self {
        assert!(
            sp.vmm_weights != sp.vmm_bias,
            "depthwise weights and bias registers alias"
        );
        DepthwiseInjector {
            variant,
            params,
            sp,
        }
    }

    pub fn memory_step(&self) -> usize {
        Self::MEMORY_STEP
    }

    /// On ISAs whose variable blend reads its mask from vmm0, prelu must
    /// borrow that register.
    pub fn need_to_preserve(&self) -> bool {
        self.params.alg == DepthwiseAlg::Prelu && self.variant.isa.blend_uses_implicit_mask()
    }

    /// `ptr_slot` is the auxiliary-table slot holding this entry's buffer.
    pub fn compute_vector_range<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        ptr_slot: Address,
        dp: &DepthwiseDynamicParams,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        if idxs.is_empty() {
            return Ok(());
        }
        let (vw, vb) = (self.sp.vmm_weights, self.sp.vmm_bias);
        for r in [vw, vb] {
            assert!(
                !idxs.contains(&r.idx()),
                "depthwise scratch {r:?} is in the compute set"
            );
        }

        asm.load(dp.reg_weights, ptr_slot)?;
        dp.oc_off.add_to(asm, dp.reg_weights)?;
        if self.params.alg == DepthwiseAlg::ScaleShift {
            asm.mov(dp.reg_bias, dp.reg_weights)?;
            asm.add_imm(dp.reg_bias, (self.params.bias_offset * 4) as i64)?;
        }

        let preserve = self.need_to_preserve();
        if preserve {
            assert!(
                !idxs.contains(&0),
                "depthwise prelu on {} needs vmm0 outside the compute set",
                self.variant.isa
            );
            asm.spill_vmms(&[Vmm(0)])?;
        }

        for &idx in idxs {
            let x = Vmm::from(idx);
            self.load(asm, vw, Address::base(dp.reg_weights), is_broadcast)?;
            match self.params.alg {
                DepthwiseAlg::ScaleShift => {
                    self.load(asm, vb, Address::base(dp.reg_bias), is_broadcast)?;
                    asm.vfmadd213(x, vw, vb)?;
                }
                DepthwiseAlg::Prelu => self.prelu(asm, x, vw, vb)?,
            }
        }

        if preserve {
            asm.restore_vmms(&[Vmm(0)])?;
        }
        Ok(())
    }

    fn load<E: VecAsm>(
        &self,
        asm: &mut E,
        dst: Vmm,
        addr: Address,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        if is_broadcast {
            asm.vbroadcast(dst, addr, DataType::F32)
        } else {
            asm.vload(dst, addr, DataType::F32, crate::codegen::LaneMask::None)
        }
    }

    /// x > 0 ? x : x * w
    fn prelu<E: VecAsm>(&self, asm: &mut E, x: Vmm, vw: Vmm, vb: Vmm) -> CodegenResult<()> {
        asm.vmul(vw, vw, x)?;
        asm.vzero(vb)?;
        if self.variant.has_opmask() {
            asm.vcmp_mask(CmpPred::Gt, self.sp.k_mask, x, vb)?;
            asm.vblendm(x, vw, x, self.sp.k_mask)
        } else {
            let mask = if self.variant.isa.blend_uses_implicit_mask() {
                Vmm(0)
            } else {
                vb
            };
            asm.vcmp(CmpPred::Gt, mask, x, vb)?;
            asm.vblendv(x, vw, x, mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::LaneMask;
    use crate::dispatch::{CpuIsa, VecWidth};
    use crate::injectors::test_util::run_program;

    /// Registers 1.. hold `x`; the table slot at `[rdi]` points at `buf`,
    /// `[rdi + 8]` holds the channel byte offset.
    fn run(
        variant: IsaVariant,
        params: DepthwiseParams,
        x: &[f32],
        buf: &[f32],
        oc: usize,
        is_broadcast: bool,
        oc_in_reg: bool,
    ) -> (Vec<f32>, crate::codegen::ExecStats) {
        let lanes = variant.lanes();
        let mut out = x.to_vec();
        let args = [buf.as_ptr() as u64, (oc * 4) as u64, out.as_mut_ptr() as u64];
        let sp = DepthwiseStaticParams {
            vmm_weights: Vmm(10),
            vmm_bias: Vmm(11),
            k_mask: Opmask(2),
        };
        let inj = DepthwiseInjector::new(variant, params, sp);
        let oc_off = if oc_in_reg {
            OcOffset::Reg(Gpr::R9)
        } else {
            OcOffset::Addr(Address::disp(Gpr::Rdi, 8))
        };
        let dp = DepthwiseDynamicParams {
            reg_weights: Gpr::R14,
            reg_bias: Gpr::R15,
            oc_off,
        };
        let stats = run_program(variant.width, &args, |asm| {
            asm.load(Gpr::R9, Address::disp(Gpr::Rdi, 8))?;
            asm.load(Gpr::Rdx, Address::disp(Gpr::Rdi, 16))?;
            asm.vload(Vmm(1), Address::base(Gpr::Rdx), DataType::F32, LaneMask::None)?;
            inj.compute_vector_range(asm, &VmmIndexSet::from([1]), Address::base(Gpr::Rdi), &dp, is_broadcast)?;
            asm.vstore(Address::base(Gpr::Rdx), Vmm(1), LaneMask::None)
        });
        assert_eq!(out.len(), lanes);
        (out, stats)
    }

    #[test]
    fn test_scale_shift_broadcast_channel() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        let p = DepthwiseParams::new(DepthwiseAlg::ScaleShift, 4);
        let buf = p.pack(&[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0, 30.0, 40.0]);
        let x: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let (got, _) = run(v, p, &x, &buf, 2, true, true);
        let want: Vec<f32> = x.iter().map(|&x| x * 3.0 + 30.0).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_scale_shift_vector_channels_from_memory_offset() {
        let v = IsaVariant::new(CpuIsa::Sse41, VecWidth::Xmm);
        let p = DepthwiseParams::new(DepthwiseAlg::ScaleShift, 8);
        let w: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let b = vec![1.0; 8];
        let buf = p.pack(&w, &b);
        let x = vec![2.0; 4];
        let (got, _) = run(v, p, &x, &buf, 4, false, false);
        assert_eq!(got, vec![9.0, 11.0, 13.0, 15.0]);
    }

    #[test]
    fn test_prelu_all_isas() {
        let p = DepthwiseParams::new(DepthwiseAlg::Prelu, 2);
        let buf = p.pack(&[0.5, 0.25], &[]);
        for (isa, width) in [
            (CpuIsa::Avx512Core, VecWidth::Zmm),
            (CpuIsa::Avx2, VecWidth::Ymm),
            (CpuIsa::Sse41, VecWidth::Xmm),
        ] {
            let v = IsaVariant::new(isa, width);
            let x: Vec<f32> = (0..v.lanes()).map(|i| i as f32 - 2.0).collect();
            let (got, stats) = run(v, p, &x, &buf, 1, true, true);
            let want: Vec<f32> = x.iter().map(|&x| if x > 0.0 { x } else { x * 0.25 }).collect();
            assert_eq!(got, want, "{isa}");
            if isa == CpuIsa::Sse41 {
                assert_eq!(stats.stack_reserved_bytes, 16);
                assert_eq!(stats.stack_released_bytes, 16);
            } else {
                assert_eq!(stats.stack_reserved_bytes, 0);
            }
        }
    }

    #[test]
    fn test_need_to_preserve_only_for_implicit_blend() {
        let prelu = DepthwiseParams::new(DepthwiseAlg::Prelu, 4);
        let ss = DepthwiseParams::new(DepthwiseAlg::ScaleShift, 4);
        let sp = DepthwiseStaticParams {
            vmm_weights: Vmm(14),
            vmm_bias: Vmm(15),
            k_mask: Opmask(2),
        };
        let sse = IsaVariant::new(CpuIsa::Sse41, VecWidth::Xmm);
        let avx = IsaVariant::new(CpuIsa::Avx, VecWidth::Xmm);
        assert!(DepthwiseInjector::new(sse, prelu, sp).need_to_preserve());
        assert!(!DepthwiseInjector::new(sse, ss, sp).need_to_preserve());
        assert!(!DepthwiseInjector::new(avx, prelu, sp).need_to_preserve());
        assert_eq!(DepthwiseInjector::new(avx, ss, sp).memory_step(), 8);
    }
}
