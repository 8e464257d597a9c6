//! Binary and prelu injector: `dst = dst op src1` against a second operand
//! read through the kernel's rhs pointer vector.
//!
//! The operand-1 element a lane reads is derived from the destination element
//! offset of that lane, computed at run time from the output pointer the
//! caller hands in per register (`RhsArgDynamicParams`), and the broadcast
//! strategy detected from the operand-1 and destination descriptors.

use std::collections::{BTreeSet, HashMap};

use super::VmmIndexSet;
use crate::codegen::asm::{
    Address, AluOp, CmpPred, Gpr, LaneMask, Opmask, VBinOp, VecAsm, Vmm,
};
use crate::dispatch::{is_superset, CpuIsa, IsaVariant};
use crate::error::CodegenResult;
use crate::post_ops::{BinaryAlg, PostOp};
use crate::types::{DataType, FormatKind, MemoryDesc};

/// How operand 1 expands over the destination `[N, C, spatial...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BroadcastStrategy {
    NoBroadcast,
    Scalar,
    /// `[1, C, 1, ...]`
    PerOc,
    /// `[1, C, S...]`, broadcast over the minibatch.
    PerOcSpatial,
    /// `[N, 1, S...]`
    PerMbSpatial,
    Unsupported,
}

pub type BroadcastSet = BTreeSet<BroadcastStrategy>;

/// Strategies enabled unless the caller narrows or widens the set.
pub fn default_strategies() -> BroadcastSet {
    BroadcastSet::from([
        BroadcastStrategy::Scalar,
        BroadcastStrategy::PerOc,
        BroadcastStrategy::PerOcSpatial,
        BroadcastStrategy::NoBroadcast,
    ])
}

/// Detect the strategy of `src1` against `dst`, restricted to `supported`.
pub fn get_rhs_arg_broadcasting_strategy(
    src1: &MemoryDesc,
    dst: &MemoryDesc,
    supported: &BroadcastSet,
) -> BroadcastStrategy {
    let strategy = detect_strategy(src1, dst);
    if supported.contains(&strategy) {
        strategy
    } else {
        BroadcastStrategy::Unsupported
    }
}

fn detect_strategy(src1: &MemoryDesc, dst: &MemoryDesc) -> BroadcastStrategy {
    if src1.ndims() != dst.ndims() || dst.ndims() == 0 {
        return BroadcastStrategy::Unsupported;
    }
    if src1.dims == dst.dims {
        return BroadcastStrategy::NoBroadcast;
    }
    if src1.dims.iter().all(|&d| d == 1) {
        return BroadcastStrategy::Scalar;
    }
    if dst.ndims() < 2 {
        return BroadcastStrategy::Unsupported;
    }
    let spatial_ones = src1.dims[2..].iter().all(|&d| d == 1);
    let spatial_same = src1.dims[2..] == dst.dims[2..];
    let (n, c) = (src1.dims[0], src1.dims[1]);
    if n == 1 && c == dst.dims[1] && spatial_ones {
        BroadcastStrategy::PerOc
    } else if n == 1 && c == dst.dims[1] && spatial_same && dst.ndims() > 2 {
        BroadcastStrategy::PerOcSpatial
    } else if n == dst.dims[0] && c == 1 && spatial_same && dst.ndims() > 2 {
        BroadcastStrategy::PerMbSpatial
    } else {
        BroadcastStrategy::Unsupported
    }
}

/// Operand-1 data type can be loaded on `isa`.
pub fn is_data_supported(isa: CpuIsa, dt: DataType) -> bool {
    match dt {
        DataType::F32 | DataType::S32 | DataType::S8 | DataType::U8 => true,
        DataType::Bf16 => {
            is_superset(isa, CpuIsa::Avx512Core) || is_superset(isa, CpuIsa::Avx2Vnni2)
        }
        DataType::F16 => {
            is_superset(isa, CpuIsa::Avx512CoreFp16) || is_superset(isa, CpuIsa::Avx2Vnni2)
        }
    }
}

/// Operand 1 of layout `src1` can be applied to `dst` on `isa`.
pub fn is_supported(
    isa: CpuIsa,
    src1: &MemoryDesc,
    dst: &MemoryDesc,
    supported: &BroadcastSet,
) -> bool {
    if dst.format == FormatKind::Any || !src1.is_defined() {
        return false;
    }
    if !is_data_supported(isa, src1.data_type) {
        return false;
    }
    let strategy = get_rhs_arg_broadcasting_strategy(src1, dst, supported);
    let layout_ok = match strategy {
        BroadcastStrategy::Unsupported => false,
        // full-rank operands are addressed with the destination's layout
        BroadcastStrategy::NoBroadcast
        | BroadcastStrategy::PerOcSpatial
        | BroadcastStrategy::PerMbSpatial => src1.format == dst.format,
        BroadcastStrategy::Scalar | BroadcastStrategy::PerOc => true,
    };
    if !layout_ok {
        return false;
    }
    // channels-last: one register must hold whole channel blocks
    if indexes_within_channel_block(strategy, dst.format) {
        let lanes = isa.max_width().lanes();
        if dst.channels() % lanes != 0 {
            log::debug!(
                "binary: {strategy:?} on nspc needs channels ({}) divisible by {lanes} lanes on {isa}",
                dst.channels()
            );
            return false;
        }
    }
    true
}

/// Operand-1 index of `strategy` depends on the position inside one
/// channels-last pixel.
fn indexes_within_channel_block(strategy: BroadcastStrategy, format: FormatKind) -> bool {
    format == FormatKind::Nspc
        && matches!(strategy, BroadcastStrategy::PerOc | BroadcastStrategy::PerMbSpatial)
}

/// Destination span inside which one register may be addressed from its
/// first lane: the operand-1 index either stays constant or advances with
/// the destination index. A register crossing a span boundary reads the
/// wrong operand elements. `None` when every span works.
pub fn contiguous_span(strategy: BroadcastStrategy, dst: &MemoryDesc) -> Option<usize> {
    let c = dst.channels();
    let s = dst.spatial().max(1);
    match strategy {
        BroadcastStrategy::NoBroadcast
        | BroadcastStrategy::Scalar
        | BroadcastStrategy::Unsupported => None,
        _ if indexes_within_channel_block(strategy, dst.format) => Some(c),
        BroadcastStrategy::PerOcSpatial => Some(c * s),
        BroadcastStrategy::PerOc | BroadcastStrategy::PerMbSpatial => Some(s),
    }
}

/// Registers and argument-block layout the rhs address computation uses.
#[derive(Debug, Clone, PartialEq)]
pub struct RhsArgStaticParams {
    /// Holds the loaded operand 1.
    pub rhs_dt_helper_vmm_idx: usize,
    pub rhs_addr_reg: Gpr,
    pub rhs_helper_reg: Gpr,
    pub rhs_addr_cache_reg: Gpr,
    pub preserve_gpr_helpers: bool,
    pub preserve_vmm_helper: bool,
    /// Byte offset of the rhs pointer vector inside the argument block.
    pub abi_param_offset: i32,
    /// Byte offset of the original destination pointer inside the block.
    pub dst_orig_offset: i32,
    pub dst_desc: MemoryDesc,
    /// Active lanes of a tail register.
    pub tail_size: usize,
    pub tail_opmask: Option<Opmask>,
    pub tail_mask_vmm: Option<Vmm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryStaticParams {
    /// Argument block register.
    pub param1: Gpr,
    pub rhs_arg_static_params: RhsArgStaticParams,
    pub supported_strategies: BroadcastSet,
    /// Scratch register for prelu; required when the chain has prelu.
    pub prelu_tmp_vmm_idx: Option<usize>,
}

/// Per-call register-to-output mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RhsArgDynamicParams {
    /// Register holding the address of the destination block a vector
    /// register will be stored to.
    pub vmm_idx_to_out_reg: HashMap<usize, Gpr>,
    /// Element offset of the register's first lane from that address.
    pub vmm_idx_to_out_elem_off_val: HashMap<usize, usize>,
    /// Registers holding a partial vector.
    pub vmm_tail_idx: BTreeSet<usize>,
}

impl RhsArgDynamicParams {
    pub fn is_tail(&self, idx: usize) -> bool {
        self.vmm_tail_idx.contains(&idx)
    }
}

/// One injector serves every binary-like entry of a chain.
#[derive(Debug, Clone)]
pub struct BinaryInjector {
    variant: IsaVariant,
    sp: BinaryStaticParams,
}

impl BinaryInjector {
    pub fn new(variant: IsaVariant, sp: BinaryStaticParams) -> Self {
        assert!(
            sp.rhs_arg_static_params.rhs_dt_helper_vmm_idx < variant.n_vregs(),
            "binary helper register out of range on {variant}"
        );
        BinaryInjector { variant, sp }
    }

    pub fn static_params(&self) -> &BinaryStaticParams {
        &self.sp
    }

    pub fn strategy(&self, entry: &PostOp) -> BroadcastStrategy {
        let dst = &self.sp.rhs_arg_static_params.dst_desc;
        entry
            .src1_desc(dst)
            .map(|src1| get_rhs_arg_broadcasting_strategy(&src1, dst, &self.sp.supported_strategies))
            .unwrap_or(BroadcastStrategy::Unsupported)
    }

    /// Apply `entry` to every register of `idxs`. `rhs_arg_idx` selects the
    /// operand-1 pointer among the chain's binary-like entries.
    pub fn compute_vector_range<E: VecAsm>(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        rhs_arg_idx: usize,
        entry: &PostOp,
        dyn_params: &RhsArgDynamicParams,
    ) -> CodegenResult<()> {
        if idxs.is_empty() {
            return Ok(());
        }
        let rs = &self.sp.rhs_arg_static_params;
        let strategy = self.strategy(entry);
        assert!(
            strategy != BroadcastStrategy::Unsupported,
            "binary operand layout is not supported: {entry:?}"
        );
        let src1 = entry
            .src1_desc(&rs.dst_desc)
            .unwrap_or_else(|| panic!("not a binary-like entry: {entry:?}"));
        let helper = Vmm::from(rs.rhs_dt_helper_vmm_idx);
        assert!(
            !idxs.contains(&rs.rhs_dt_helper_vmm_idx),
            "binary helper register {helper:?} is in the compute set"
        );
        let gprs = [rs.rhs_addr_reg, rs.rhs_helper_reg, rs.rhs_addr_cache_reg];

        if rs.preserve_gpr_helpers {
            for r in gprs {
                asm.push(r)?;
            }
        }
        if rs.preserve_vmm_helper {
            asm.spill_vmms(&[helper])?;
        }

        if strategy == BroadcastStrategy::Scalar {
            self.load_rhs_ptr(asm, rhs_arg_idx)?;
            asm.vbroadcast(helper, Address::base(rs.rhs_addr_reg), src1.data_type)?;
            for &idx in idxs {
                self.apply(asm, entry, Vmm::from(idx), helper)?;
            }
        } else {
            for &idx in idxs {
                self.load_rhs_ptr(asm, rhs_arg_idx)?;
                self.calculate_rhs_addr(asm, idx, strategy, &src1, dyn_params)?;
                self.load_rhs(asm, idx, helper, strategy, &src1, dyn_params)?;
                self.apply(asm, entry, Vmm::from(idx), helper)?;
            }
        }

        if rs.preserve_vmm_helper {
            asm.restore_vmms(&[helper])?;
        }
        if rs.preserve_gpr_helpers {
            for r in gprs.into_iter().rev() {
                asm.pop(r)?;
            }
        }
        Ok(())
    }

    fn load_rhs_ptr<E: VecAsm>(&self, asm: &mut E, rhs_arg_idx: usize) -> CodegenResult<()> {
        let rs = &self.sp.rhs_arg_static_params;
        asm.load(rs.rhs_addr_reg, Address::disp(self.sp.param1, rs.abi_param_offset))?;
        asm.load(
            rs.rhs_addr_reg,
            Address::disp(rs.rhs_addr_reg, (rhs_arg_idx * 8) as i32),
        )
    }

    /// rhs_addr_reg += element index of operand 1 for register `idx`.
    fn calculate_rhs_addr<E: VecAsm>(
        &self,
        asm: &mut E,
        idx: usize,
        strategy: BroadcastStrategy,
        src1: &MemoryDesc,
        dyn_params: &RhsArgDynamicParams,
    ) -> CodegenResult<()> {
        let rs = &self.sp.rhs_arg_static_params;
        let dst = &rs.dst_desc;
        let out_reg = *dyn_params
            .vmm_idx_to_out_reg
            .get(&idx)
            .unwrap_or_else(|| panic!("no output register for vmm{idx}"));
        let elem_off = dyn_params
            .vmm_idx_to_out_elem_off_val
            .get(&idx)
            .copied()
            .unwrap_or(0);
        let h = rs.rhs_helper_reg;
        let cache = rs.rhs_addr_cache_reg;
        let c = dst.channels() as i64;
        let s = dst.spatial() as i64;

        // destination element offset
        asm.mov(h, out_reg)?;
        asm.alu_mem(AluOp::Sub, h, Address::disp(self.sp.param1, rs.dst_orig_offset))?;
        let shift = dst.data_type.size().trailing_zeros() as i64;
        if shift != 0 {
            asm.alu_imm(AluOp::Shr, h, shift)?;
        }
        if elem_off != 0 {
            asm.add_imm(h, elem_off as i64)?;
        }

        match (strategy, dst.format) {
            (BroadcastStrategy::NoBroadcast, _) => {}
            (BroadcastStrategy::PerOc, FormatKind::Nspc) => {
                asm.alu_imm(AluOp::URem, h, c)?;
            }
            (BroadcastStrategy::PerOc, _) => {
                asm.alu_imm(AluOp::UDiv, h, s)?;
                asm.alu_imm(AluOp::URem, h, c)?;
            }
            (BroadcastStrategy::PerOcSpatial, _) => {
                asm.alu_imm(AluOp::URem, h, c * s)?;
            }
            (BroadcastStrategy::PerMbSpatial, FormatKind::Nspc) => {
                asm.alu_imm(AluOp::UDiv, h, c)?;
            }
            (BroadcastStrategy::PerMbSpatial, _) => {
                asm.mov(cache, h)?;
                asm.alu_imm(AluOp::UDiv, cache, c * s)?;
                asm.alu_imm(AluOp::Imul, cache, s)?;
                asm.alu_imm(AluOp::URem, h, s)?;
                asm.alu(AluOp::Add, h, cache)?;
            }
            (BroadcastStrategy::Scalar | BroadcastStrategy::Unsupported, _) => {
                unreachable!("strategy {strategy:?} has no per-lane address")
            }
        }
        asm.lea(
            rs.rhs_addr_reg,
            Address::indexed(rs.rhs_addr_reg, h, src1.data_type.size() as u8),
        )
    }

    fn load_rhs<E: VecAsm>(
        &self,
        asm: &mut E,
        idx: usize,
        helper: Vmm,
        strategy: BroadcastStrategy,
        src1: &MemoryDesc,
        dyn_params: &RhsArgDynamicParams,
    ) -> CodegenResult<()> {
        let rs = &self.sp.rhs_arg_static_params;
        let addr = Address::base(rs.rhs_addr_reg);
        let dt = src1.data_type;
        let broadcast = match (strategy, rs.dst_desc.format) {
            (BroadcastStrategy::PerOc, FormatKind::Nspc) => false,
            (BroadcastStrategy::PerOc, _) => true,
            (BroadcastStrategy::PerMbSpatial, FormatKind::Nspc) => true,
            _ => false,
        };
        if broadcast {
            return asm.vbroadcast(helper, addr, dt);
        }
        let mask = if dyn_params.is_tail(idx) {
            self.tail_mask()
        } else {
            LaneMask::None
        };
        asm.vload(helper, addr, dt, mask)
    }

    fn tail_mask(&self) -> LaneMask {
        let rs = &self.sp.rhs_arg_static_params;
        if self.variant.has_opmask() {
            let k = rs
                .tail_opmask
                .unwrap_or_else(|| panic!("tail load on {} needs a tail opmask", self.variant));
            LaneMask::Opmask(k)
        } else {
            let v = rs
                .tail_mask_vmm
                .unwrap_or_else(|| panic!("tail load on {} needs a tail mask register", self.variant));
            LaneMask::Vector(v)
        }
    }

    fn apply<E: VecAsm>(&self, asm: &mut E, entry: &PostOp, x: Vmm, h: Vmm) -> CodegenResult<()> {
        match entry {
            PostOp::Binary(b) => self.apply_binary(asm, b.alg, x, h),
            PostOp::Prelu(_) => {
                let tmp = Vmm::from(
                    self.sp
                        .prelu_tmp_vmm_idx
                        .unwrap_or_else(|| panic!("prelu needs a temporary register")),
                );
                asm.vzero(tmp)?;
                asm.vmin(tmp, x, tmp)?;
                asm.vmul(tmp, tmp, h)?;
                asm.vzero(h)?;
                asm.vmax(x, x, h)?;
                asm.vadd(x, x, tmp)
            }
            other => panic!("binary injector got {:?}", other.kind()),
        }
    }

    fn apply_binary<E: VecAsm>(
        &self,
        asm: &mut E,
        alg: BinaryAlg,
        x: Vmm,
        h: Vmm,
    ) -> CodegenResult<()> {
        let op = match alg {
            BinaryAlg::Add => Some(VBinOp::Add),
            BinaryAlg::Sub => Some(VBinOp::Sub),
            BinaryAlg::Mul => Some(VBinOp::Mul),
            BinaryAlg::Div => Some(VBinOp::Div),
            BinaryAlg::Max => Some(VBinOp::Max),
            BinaryAlg::Min => Some(VBinOp::Min),
            _ => None,
        };
        if let Some(op) = op {
            return asm.vbinary(op, x, x, h);
        }
        let pred = match alg {
            BinaryAlg::Ge => CmpPred::Ge,
            BinaryAlg::Gt => CmpPred::Gt,
            BinaryAlg::Le => CmpPred::Le,
            BinaryAlg::Lt => CmpPred::Lt,
            BinaryAlg::Eq => CmpPred::Eq,
            _ => CmpPred::Ne,
        };
        asm.vcmp(pred, h, x, h)?;
        asm.vbroadcast_const(x, self.sp.rhs_arg_static_params.rhs_helper_reg, 1.0)?;
        asm.vand(x, x, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::VecWidth;
    use crate::injectors::test_util::run_program;
    use crate::post_ops::{BinaryParams, PreluParams};

    fn desc(dims: &[usize], fmt: FormatKind) -> MemoryDesc {
        MemoryDesc::new(dims, DataType::F32, fmt)
    }

    #[test]
    fn test_strategy_detection() {
        let dst = desc(&[2, 8, 4, 4], FormatKind::Ncsp);
        let all = default_strategies();
        let cases = [
            (vec![2, 8, 4, 4], BroadcastStrategy::NoBroadcast),
            (vec![1, 1, 1, 1], BroadcastStrategy::Scalar),
            (vec![1, 8, 1, 1], BroadcastStrategy::PerOc),
            (vec![1, 8, 4, 4], BroadcastStrategy::PerOcSpatial),
            (vec![2, 1, 4, 4], BroadcastStrategy::Unsupported),
            (vec![1, 4, 1, 1], BroadcastStrategy::Unsupported),
        ];
        for (dims, want) in cases {
            let src1 = desc(&dims, FormatKind::Ncsp);
            assert_eq!(get_rhs_arg_broadcasting_strategy(&src1, &dst, &all), want, "{dims:?}");
        }
        let mut wide = all.clone();
        wide.insert(BroadcastStrategy::PerMbSpatial);
        let src1 = desc(&[2, 1, 4, 4], FormatKind::Ncsp);
        assert_eq!(
            get_rhs_arg_broadcasting_strategy(&src1, &dst, &wide),
            BroadcastStrategy::PerMbSpatial
        );
    }

    #[test]
    fn test_data_type_support() {
        assert!(is_data_supported(CpuIsa::Sse41, DataType::S8));
        assert!(!is_data_supported(CpuIsa::Avx2, DataType::Bf16));
        assert!(is_data_supported(CpuIsa::Avx2Vnni2, DataType::Bf16));
        assert!(is_data_supported(CpuIsa::Avx512Core, DataType::Bf16));
        assert!(!is_data_supported(CpuIsa::Avx512CoreBf16, DataType::F16));
        assert!(is_data_supported(CpuIsa::Avx512CoreFp16, DataType::F16));
    }

    #[test]
    fn test_is_supported_rejects_any_format_and_layout_mismatch() {
        let all = default_strategies();
        let dst_any = desc(&[1, 8, 4], FormatKind::Any);
        assert!(!is_supported(CpuIsa::Avx2, &desc(&[1, 8, 1], FormatKind::Ncsp), &dst_any, &all));
        let dst = desc(&[1, 8, 4], FormatKind::Ncsp);
        assert!(is_supported(CpuIsa::Avx2, &desc(&[1, 8, 1], FormatKind::Nspc), &dst, &all));
        assert!(!is_supported(CpuIsa::Avx2, &desc(&[1, 8, 4], FormatKind::Nspc), &dst, &all));
    }

    #[test]
    fn test_is_supported_nspc_needs_whole_channel_blocks() {
        let all = default_strategies();
        let per_oc = desc(&[1, 4, 1], FormatKind::Ncsp);
        let dst = desc(&[1, 4, 2], FormatKind::Nspc);
        assert!(!is_supported(CpuIsa::Avx2, &per_oc, &dst, &all));
        assert!(!is_supported(CpuIsa::Avx512Core, &per_oc, &dst, &all));
        assert!(is_supported(CpuIsa::Sse41, &per_oc, &dst, &all));
        // the same operand on a channels-first destination is broadcast
        let dst = desc(&[1, 4, 2], FormatKind::Ncsp);
        assert!(is_supported(CpuIsa::Avx512Core, &per_oc, &dst, &all));
    }

    #[test]
    fn test_contiguous_span() {
        let ncsp = desc(&[2, 3, 5], FormatKind::Ncsp);
        let nspc = desc(&[2, 3, 5], FormatKind::Nspc);
        assert_eq!(contiguous_span(BroadcastStrategy::Scalar, &ncsp), None);
        assert_eq!(contiguous_span(BroadcastStrategy::NoBroadcast, &nspc), None);
        assert_eq!(contiguous_span(BroadcastStrategy::PerOc, &ncsp), Some(5));
        assert_eq!(contiguous_span(BroadcastStrategy::PerOc, &nspc), Some(3));
        assert_eq!(contiguous_span(BroadcastStrategy::PerMbSpatial, &ncsp), Some(5));
        assert_eq!(contiguous_span(BroadcastStrategy::PerMbSpatial, &nspc), Some(3));
        assert_eq!(contiguous_span(BroadcastStrategy::PerOcSpatial, &nspc), Some(15));
    }

    /// dst is `[1, C, S]` in `fmt`; one register covers lanes starting at
    /// element `start`. Returns the transformed lanes.
    fn run_binary(
        variant: IsaVariant,
        entry: PostOp,
        dst_desc: MemoryDesc,
        dst: &[f32],
        rhs: &[f32],
        start: usize,
        tail: bool,
    ) -> Vec<f32> {
        run_binary_with(variant, entry, dst_desc, dst, rhs, start, tail, default_strategies())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_binary_with(
        variant: IsaVariant,
        entry: PostOp,
        dst_desc: MemoryDesc,
        dst: &[f32],
        rhs: &[f32],
        start: usize,
        tail: bool,
        strategies: BroadcastSet,
    ) -> Vec<f32> {
        let lanes = variant.lanes();
        let mut out = dst.to_vec();
        let rhs_vec = [rhs.as_ptr() as u64];
        let base = out.as_mut_ptr();
        // args: [0] rhs ptr vec, [1] dst_orig, [2] current dst
        let args = [
            rhs_vec.as_ptr() as u64,
            base as u64,
            base.wrapping_add(start) as u64,
        ];
        let x = Vmm(3);
        let sp = BinaryStaticParams {
            param1: Gpr::Rdi,
            rhs_arg_static_params: RhsArgStaticParams {
                rhs_dt_helper_vmm_idx: 7,
                rhs_addr_reg: Gpr::R8,
                rhs_helper_reg: Gpr::R9,
                rhs_addr_cache_reg: Gpr::R10,
                preserve_gpr_helpers: true,
                preserve_vmm_helper: true,
                abi_param_offset: 0,
                dst_orig_offset: 8,
                dst_desc,
                tail_size: 3,
                tail_opmask: Some(Opmask(1)),
                tail_mask_vmm: Some(Vmm(0)),
            },
            supported_strategies: strategies,
            prelu_tmp_vmm_idx: Some(6),
        };
        let inj = BinaryInjector::new(variant, sp);
        let mut dp = RhsArgDynamicParams::default();
        dp.vmm_idx_to_out_reg.insert(3, Gpr::Rdx);
        if tail {
            dp.vmm_tail_idx.insert(3);
        }
        let mask_words: Vec<u32> = (0..lanes).map(|i| if i < 3 { u32::MAX } else { 0 }).collect();
        run_program(variant.width, &args, |asm| {
            asm.load(Gpr::Rdx, Address::disp(Gpr::Rdi, 16))?;
            if tail {
                if variant.has_opmask() {
                    asm.mov_imm(Gpr::Rcx, 0b111)?;
                    asm.kmov(Opmask(1), Gpr::Rcx)?;
                } else {
                    let l = asm.new_data_label();
                    asm.emit_data(l, &mask_words)?;
                    asm.lea_data(Gpr::Rcx, l)?;
                    asm.vload(Vmm(0), Address::base(Gpr::Rcx), DataType::F32, LaneMask::None)?;
                }
            }
            asm.vload(x, Address::base(Gpr::Rdx), DataType::F32, LaneMask::None)?;
            inj.compute_vector_range(asm, &VmmIndexSet::from([3]), 0, &entry, &dp)?;
            asm.vstore(Address::base(Gpr::Rdx), x, LaneMask::None)
        });
        out[start..start + lanes].to_vec()
    }

    fn binary(alg: BinaryAlg, dims: &[usize], fmt: FormatKind) -> PostOp {
        PostOp::Binary(BinaryParams {
            alg,
            src1_desc: desc(dims, fmt),
        })
    }

    #[test]
    fn test_per_oc_ncsp_broadcasts_channel() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        let (c, s) = (3, 8);
        let dst: Vec<f32> = (0..c * s).map(|i| i as f32).collect();
        let rhs = vec![100.0, 200.0, 300.0];
        let d = desc(&[1, c, s], FormatKind::Ncsp);
        let got = run_binary(v, binary(BinaryAlg::Add, &[1, c, 1], FormatKind::Ncsp), d, &dst, &rhs, 8, false);
        let want: Vec<f32> = (8..16).map(|i| i as f32 + 200.0).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_per_oc_nspc_loads_channels() {
        let v = IsaVariant::new(CpuIsa::Avx512Core, VecWidth::Ymm);
        let (c, s) = (8, 2);
        let dst = vec![1.0f32; c * s];
        let rhs: Vec<f32> = (0..c).map(|i| i as f32).collect();
        let d = desc(&[1, c, s], FormatKind::Nspc);
        let got = run_binary(v, binary(BinaryAlg::Mul, &[1, c, 1], FormatKind::Nspc), d, &dst, &rhs, 8, false);
        assert_eq!(got, rhs);
    }

    #[test]
    fn test_no_broadcast_tail_masks_rhs_load() {
        let v = IsaVariant::new(CpuIsa::Avx2, VecWidth::Ymm);
        let n = 11;
        let dst = vec![1.0f32; 16];
        let rhs: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let d = desc(&[1, 1, n], FormatKind::Ncsp);
        let got = run_binary(v, binary(BinaryAlg::Sub, &[1, 1, n], FormatKind::Ncsp), d, &dst, &rhs, 8, true);
        // inactive lanes read operand 1 as zero
        assert_eq!(&got[..3], &[1.0 - 8.0, 1.0 - 9.0, 1.0 - 10.0]);
        assert!(got[3..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_comparison_yields_one_or_zero() {
        let v = IsaVariant::new(CpuIsa::Sse41, VecWidth::Xmm);
        let dst = vec![-1.0, 0.5, 2.0, 0.5];
        let d = desc(&[1, 1, 4], FormatKind::Ncsp);
        let got = run_binary(v, binary(BinaryAlg::Ge, &[1, 1, 1], FormatKind::Ncsp), d, &dst, &[0.5], 0, false);
        assert_eq!(got, vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_prelu_per_oc() {
        let v = IsaVariant::new(CpuIsa::Avx512Core, VecWidth::Zmm);
        let (c, s) = (2, 16);
        let dst: Vec<f32> = (0..c * s).map(|i| i as f32 - 20.0).collect();
        let w = vec![0.5, 0.25];
        let d = desc(&[1, c, s], FormatKind::Ncsp);
        let got = run_binary(v, PostOp::Prelu(PreluParams { mask: 0b10 }), d, &dst, &w, 16, false);
        let want: Vec<f32> = dst[16..]
            .iter()
            .map(|&x| if x > 0.0 { x } else { x * 0.25 })
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_per_mb_spatial_ncsp_index() {
        let v = IsaVariant::new(CpuIsa::Avx, VecWidth::Xmm);
        let (n, c, s) = (2, 2, 4);
        let dst = vec![0.0f32; n * c * s];
        let rhs: Vec<f32> = (0..n * s).map(|i| i as f32).collect();
        let d = desc(&[n, c, s], FormatKind::Ncsp);
        let src1 = desc(&[n, 1, s], FormatKind::Ncsp);
        assert!(!is_supported(CpuIsa::Avx, &src1, &d, &default_strategies()));

        let mut wide = default_strategies();
        wide.insert(BroadcastStrategy::PerMbSpatial);
        assert!(is_supported(CpuIsa::Avx, &src1, &d, &wide));
        // element 8 is (n=1, c=0, s=0): operand row 1
        let entry = binary(BinaryAlg::Add, &[n, 1, s], FormatKind::Ncsp);
        let got = run_binary_with(v, entry, d, &dst, &rhs, 8, false, wide);
        assert_eq!(got, vec![4.0, 5.0, 6.0, 7.0]);
    }
}
