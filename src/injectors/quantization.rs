//! Quantization injector: fake-quantize with optional dequantize.
//!
//! Per group of registers sharing a lane byte offset:
//! crop to `[low, high]`, `x = x * in_scale + in_shift`, round to nearest
//! even when required, and for `quantize_dequantize`
//! `x = x * out_scale + out_shift`.

use std::collections::BTreeMap;

use super::depthwise::OcOffset;
use super::VmmIndexSet;
use crate::codegen::asm::{Address, Gpr, LaneMask, RoundMode, VecAsm, Vmm};
use crate::error::CodegenResult;
use crate::post_ops::{QuantField, QuantizationParams};
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationStaticParams {
    pub vmm_a: Vmm,
    pub vmm_b: Vmm,
    /// Holds the entry's parameter buffer.
    pub reg_ptr: Gpr,
    /// Holds the channel byte offset.
    pub reg_oc: Gpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationDynamicParams {
    pub oc_off: OcOffset,
    /// Extra byte offset of per-channel fields for a register; registers not
    /// listed use 0.
    pub vmm_idx_off: BTreeMap<usize, usize>,
    pub dst_dt: DataType,
}

impl QuantizationDynamicParams {
    pub fn new(oc_off: OcOffset, dst_dt: DataType) -> Self {
        QuantizationDynamicParams {
            oc_off,
            vmm_idx_off: BTreeMap::new(),
            dst_dt,
        }
    }

    /// Split `idxs` into groups that share a lane byte offset.
    pub fn group(&self, idxs: &VmmIndexSet) -> BTreeMap<usize, VmmIndexSet> {
        let mut groups: BTreeMap<usize, VmmIndexSet> = BTreeMap::new();
        for &idx in idxs {
            let off = self.vmm_idx_off.get(&idx).copied().unwrap_or(0);
            groups.entry(off).or_default().insert(idx);
        }
        groups
    }
}

/// Rounding is applied before output scale/shift when dequantizing, when the
/// destination is a float type, or when the entry is not the chain's last.
pub fn do_rounding(params: &QuantizationParams, dst_dt: DataType, is_last: bool) -> bool {
    params.is_dequantize() || dst_dt.requires_explicit_rounding() || !is_last
}

#[derive(Debug, Clone)]
pub struct QuantizationInjector {
    params: QuantizationParams,
    sp: QuantizationStaticParams,
}

impl QuantizationInjector {
    pub const MEMORY_STEP: usize = 8;

    pub fn new(params: QuantizationParams, sp: QuantizationStaticParams) -> Self {
        assert!(sp.vmm_a != sp.vmm_b, "quantization scratch registers alias");
        assert!(sp.reg_ptr != sp.reg_oc, "quantization address registers alias");
        QuantizationInjector { params, sp }
    }

    pub fn params(&self) -> &QuantizationParams {
        &self.params
    }

    pub fn memory_step(&self) -> usize {
        Self::MEMORY_STEP
    }

    /// Load this entry's pointer from `ptr_slot` and the channel offset.
    pub fn init_ptrs<E: VecAsm>(
        &self,
        asm: &mut E,
        ptr_slot: Address,
        oc_off: OcOffset,
    ) -> CodegenResult<()> {
        asm.load(self.sp.reg_ptr, ptr_slot)?;
        match oc_off {
            OcOffset::Reg(r) => asm.mov(self.sp.reg_oc, r),
            OcOffset::Addr(a) => asm.load(self.sp.reg_oc, a),
        }
    }

    fn field_addr(&self, field: QuantField, vmm_off: usize) -> Address {
        let disp = (self.params.offset(field) * 4) as i32;
        if self.params.is_per_channel(field) {
            Address {
                base: self.sp.reg_ptr,
                index: Some(self.sp.reg_oc),
                scale: 1,
                disp: disp + vmm_off as i32,
            }
        } else {
            Address::disp(self.sp.reg_ptr, disp)
        }
    }

    fn load_field<E: VecAsm>(
        &self,
        asm: &mut E,
        dst: Vmm,
        field: QuantField,
        vmm_off: usize,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        let addr = self.field_addr(field, vmm_off);
        if is_broadcast || !self.params.is_per_channel(field) {
            asm.vbroadcast(dst, addr, DataType::F32)
        } else {
            asm.vload(dst, addr, DataType::F32, LaneMask::None)
        }
    }

    fn check_scratch(&self, idxs: &VmmIndexSet) {
        for r in [self.sp.vmm_a, self.sp.vmm_b] {
            assert!(
                !idxs.contains(&r.idx()),
                "quantization scratch {r:?} is in the compute set"
            );
        }
    }

    pub fn compute_crop<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        vmm_off: usize,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        self.check_scratch(idxs);
        let (a, b) = (self.sp.vmm_a, self.sp.vmm_b);
        self.load_field(asm, a, QuantField::CropLow, vmm_off, is_broadcast)?;
        self.load_field(asm, b, QuantField::CropHigh, vmm_off, is_broadcast)?;
        for &idx in idxs {
            let x = Vmm::from(idx);
            asm.vmax(x, x, a)?;
            asm.vmin(x, x, b)?;
        }
        Ok(())
    }

    pub fn compute_input_scale_shift<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        vmm_off: usize,
        do_rounding: bool,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        self.check_scratch(idxs);
        let (a, b) = (self.sp.vmm_a, self.sp.vmm_b);
        self.load_field(asm, a, QuantField::InputScale, vmm_off, is_broadcast)?;
        self.load_field(asm, b, QuantField::InputShift, vmm_off, is_broadcast)?;
        for &idx in idxs {
            let x = Vmm::from(idx);
            asm.vfmadd213(x, a, b)?;
            if do_rounding {
                asm.vround(x, x, RoundMode::NearestEven)?;
            }
        }
        Ok(())
    }

    pub fn compute_output_scale_shift<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        vmm_off: usize,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        if !self.params.is_dequantize() {
            return Ok(());
        }
        self.check_scratch(idxs);
        let (a, b) = (self.sp.vmm_a, self.sp.vmm_b);
        self.load_field(asm, a, QuantField::OutputScale, vmm_off, is_broadcast)?;
        self.load_field(asm, b, QuantField::OutputShift, vmm_off, is_broadcast)?;
        for &idx in idxs {
            asm.vfmadd213(Vmm::from(idx), a, b)?;
        }
        Ok(())
    }

    /// All three stages for one group.
    pub fn compute_group<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        vmm_off: usize,
        do_rounding: bool,
        is_broadcast: bool,
    ) -> CodegenResult<()> {
        self.compute_crop(asm, idxs, vmm_off, is_broadcast)?;
        self.compute_input_scale_shift(asm, idxs, vmm_off, do_rounding, is_broadcast)?;
        self.compute_output_scale_shift(asm, idxs, vmm_off, is_broadcast)
    }
}
