//! PpKernel — fused post-processing epilogue of a GEMM-based convolution.
//!
//! One call processes `len` contiguous f32 outputs of one output channel:
//! load, add the channel bias, apply the post-op chain, store. Full-width
//! iterations run the chain unmasked; the remainder runs it once more under a
//! lane mask (an opmask on avx512, a vector mask read from a constant table
//! elsewhere). Rows are independent, so `execute_par` spreads them over the
//! rayon pool.
//!
//! General register assignment of the generated code:
//!
//! | reg | role | reg | role |
//! |-----|------|-----|------|
//! | rdi | argument block | r10 | tail mask bits |
//! | rdx | dst cursor | r11 | eltwise table |
//! | rbx | bias | r12 | mask table |
//! | r8  | remaining length | r13 | mask table shift |
//! | r9  | channel byte offset | r14/r15 | per-channel parameter pointers |
//! | rbp | sum source cursor | rax | auxiliary table copy |
//! | rcx | temporary | k1 | tail opmask |

use std::collections::HashMap;
use std::mem::offset_of;

use rayon::prelude::*;

use crate::codegen::{
    Address, AluOp, CompiledKernel, Cond, ExecStats, Gpr, LaneMask, Opmask, Program,
    ProgramAssembler, VecAsm, Vmm,
};
use crate::dispatch::{cpu_caps, CpuCaps, CpuIsa, IsaVariant, VecWidth};
use crate::error::{CodegenResult, PostOpsError, PostOpsResult};
use crate::injectors::binary::{
    contiguous_span, default_strategies, get_rhs_arg_broadcasting_strategy,
};
use crate::injectors::{
    BinaryStaticParams, DepthwiseDynamicParams, DepthwiseStaticParams, EltwiseStaticParams,
    LambdaInjector, OcOffset, PostOpsDynamicParams, PostOpsInjector, PostOpsStaticParams,
    QuantizationDynamicParams, QuantizationStaticParams, RhsArgDynamicParams, RhsArgStaticParams,
    VmmIndexSet,
};
use crate::post_ops::{post_ops_ok, PostOp, PostOpChain, PostOpKind, PostOpsOkArgs, SumPolicy};
use crate::types::{DataType, MemoryDesc};

/// Post-op kinds the epilogue accepts.
pub const ACCEPTED_KINDS: [PostOpKind; 6] = [
    PostOpKind::Sum,
    PostOpKind::Eltwise,
    PostOpKind::Binary,
    PostOpKind::Prelu,
    PostOpKind::Depthwise,
    PostOpKind::Quantization,
];

/// Instantiations tried by [`PpKernel::create`], widest first.
const CANDIDATES: [(CpuIsa, VecWidth); 3] = [
    (CpuIsa::Avx512Core, VecWidth::Zmm),
    (CpuIsa::Avx2, VecWidth::Ymm),
    (CpuIsa::Sse41, VecWidth::Xmm),
];

const REG_PARAM: Gpr = Gpr::Rdi;
const REG_DST: Gpr = Gpr::Rdx;
const REG_BIAS: Gpr = Gpr::Rbx;
const REG_LEN: Gpr = Gpr::R8;
const REG_OC_OFFSET: Gpr = Gpr::R9;
const REG_SUM_SRC: Gpr = Gpr::Rbp;
const REG_TMP: Gpr = Gpr::Rcx;
const REG_REM_MASK: Gpr = Gpr::R10;
const REG_P_TABLE: Gpr = Gpr::R11;
const REG_MASK_TABLE: Gpr = Gpr::R12;
const REG_SHIFT: Gpr = Gpr::R13;
const REG_D_WEIGHTS: Gpr = Gpr::R14;
const REG_D_BIAS: Gpr = Gpr::R15;
const REG_POST_OPS_DATA: Gpr = Gpr::Rax;
const REG_RHS_ADDR: Gpr = Gpr::Rsi;

const KREG_REM_MASK: Opmask = Opmask(1);
const KREG_ELTWISE: Opmask = Opmask(2);

/// Argument block read by the generated code.
#[repr(C)]
struct KerArgs {
    dst: *mut f32,
    bias: *const f32,
    len: usize,
    oc_offset: usize,
    post_ops_binary_rhs_arg_vec: *const *const u8,
    post_ops_data: *const *const f32,
    dst_orig: *const f32,
    sum_src: *const f32,
}

const OFF_DST: i32 = offset_of!(KerArgs, dst) as i32;
const OFF_BIAS: i32 = offset_of!(KerArgs, bias) as i32;
const OFF_LEN: i32 = offset_of!(KerArgs, len) as i32;
const OFF_OC_OFFSET: i32 = offset_of!(KerArgs, oc_offset) as i32;
const OFF_RHS_ARG_VEC: i32 = offset_of!(KerArgs, post_ops_binary_rhs_arg_vec) as i32;
const OFF_POST_OPS_DATA: i32 = offset_of!(KerArgs, post_ops_data) as i32;
const OFF_DST_ORIG: i32 = offset_of!(KerArgs, dst_orig) as i32;
const OFF_SUM_SRC: i32 = offset_of!(KerArgs, sum_src) as i32;

/// Build-time description of the epilogue.
#[derive(Debug, Clone, PartialEq)]
pub struct PpKernelConf {
    /// Destination tensor (f32). Rows of the epilogue are its channels.
    pub dst_desc: MemoryDesc,
    pub with_bias: bool,
    /// Type the destination is finally stored as; decides quantization
    /// rounding.
    pub dst_dt: DataType,
}

/// Operand-1 buffer of a binary or prelu entry.
#[derive(Debug, Clone, Copy)]
pub enum BinaryOperand<'a> {
    F32(&'a [f32]),
    Bf16(&'a [half::bf16]),
    F16(&'a [half::f16]),
    S32(&'a [i32]),
    S8(&'a [i8]),
    U8(&'a [u8]),
}

impl BinaryOperand<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            BinaryOperand::F32(_) => DataType::F32,
            BinaryOperand::Bf16(_) => DataType::Bf16,
            BinaryOperand::F16(_) => DataType::F16,
            BinaryOperand::S32(_) => DataType::S32,
            BinaryOperand::S8(_) => DataType::S8,
            BinaryOperand::U8(_) => DataType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BinaryOperand::F32(s) => s.len(),
            BinaryOperand::Bf16(s) => s.len(),
            BinaryOperand::F16(s) => s.len(),
            BinaryOperand::S32(s) => s.len(),
            BinaryOperand::S8(s) => s.len(),
            BinaryOperand::U8(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn addr(&self) -> usize {
        match self {
            BinaryOperand::F32(s) => s.as_ptr() as usize,
            BinaryOperand::Bf16(s) => s.as_ptr() as usize,
            BinaryOperand::F16(s) => s.as_ptr() as usize,
            BinaryOperand::S32(s) => s.as_ptr() as usize,
            BinaryOperand::S8(s) => s.as_ptr() as usize,
            BinaryOperand::U8(s) => s.as_ptr() as usize,
        }
    }
}

/// Runtime arguments of one epilogue invocation.
///
/// Row `oc` in `oc_start..oc_start + oc_work` covers
/// `dst[oc * oc_stride..][..len]` and uses channel `oc` of the bias and of
/// every per-channel parameter buffer.
#[derive(Debug)]
pub struct PpCall<'a> {
    pub dst: &'a mut [f32],
    pub bias: Option<&'a [f32]>,
    pub len: usize,
    pub oc_start: usize,
    pub oc_work: usize,
    pub oc_stride: usize,
    /// One operand per binary-like entry, in chain order. Depthwise and
    /// quantization buffers do not take a slot here; they travel in
    /// `post_ops_data`.
    pub binary_rhs: &'a [BinaryOperand<'a>],
    /// One parameter buffer per depthwise or quantization entry, in chain
    /// order.
    pub post_ops_data: &'a [&'a [f32]],
    /// Previous destination values, laid out like `dst`; required when the
    /// chain has a sum.
    pub sum_src: Option<&'a [f32]>,
}

/// Vector registers reserved by the epilogue around the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPlan {
    /// Tail mask on ISAs without opmasks.
    pub vmm_mask: Option<Vmm>,
    pub prelu_tmp: Option<Vmm>,
    pub binary_helper: Option<Vmm>,
    /// Per-channel weights / bias of depthwise and quantization entries.
    pub d_weights: Option<Vmm>,
    pub d_bias: Option<Vmm>,
    pub sum_scale: Option<Vmm>,
    pub dst: Vmm,
    /// Channel bias; reused as the sum operand once the bias is added.
    pub bias: Vmm,
}

impl RegisterPlan {
    pub fn new(variant: IsaVariant, chain: &PostOpChain) -> PostOpsResult<Self> {
        let mut start = 0usize;
        let mut max = variant.n_vregs() - 1;

        let vmm_mask = if variant.has_opmask() {
            None
        } else {
            start += 1;
            Some(Vmm(0))
        };
        let prelu_tmp = if chain.contains(PostOpKind::Prelu) {
            start += 1;
            Some(Vmm::from(start - 1))
        } else {
            None
        };
        let binary_helper = if chain.binary_like_count() > 0 {
            max -= 1;
            Some(Vmm::from(max + 1))
        } else {
            None
        };
        let (d_weights, d_bias) = if !chain.is_empty() && !chain.only_eltwise() {
            max -= 2;
            (Some(Vmm::from(max + 2)), Some(Vmm::from(max + 1)))
        } else {
            (None, None)
        };
        let sum_scale = if chain.contains(PostOpKind::Sum) {
            start += 1;
            Some(Vmm::from(start - 1))
        } else {
            None
        };

        if start + 1 > max {
            return Err(PostOpsError::Unsupported(format!(
                "{variant}: no room for dst and bias registers (first free {start}, last free {max})"
            )));
        }
        Ok(RegisterPlan {
            vmm_mask,
            prelu_tmp,
            binary_helper,
            d_weights,
            d_bias,
            sum_scale,
            dst: Vmm::from(start),
            bias: Vmm::from(start + 1),
        })
    }
}

/// A generated epilogue for one ISA instantiation.
#[derive(Debug)]
pub struct PpKernel {
    variant: IsaVariant,
    conf: PpKernelConf,
    chain: PostOpChain,
    plan: RegisterPlan,
    kernel: CompiledKernel,
    /// `apply_mask` of every chain emission, in program order.
    compute_calls: Vec<bool>,
}

impl PpKernel {
    /// Build for the running CPU. `Ok(None)` means no vectorized variant
    /// accepts the chain and the caller should take its reference path.
    pub fn create(conf: PpKernelConf, chain: PostOpChain) -> PostOpsResult<Option<PpKernel>> {
        Self::create_with_caps(cpu_caps(), conf, chain)
    }

    pub fn create_with_caps(
        caps: &CpuCaps,
        conf: PpKernelConf,
        chain: PostOpChain,
    ) -> PostOpsResult<Option<PpKernel>> {
        if conf.dst_desc.data_type != DataType::F32 {
            return Err(PostOpsError::Unsupported(format!(
                "pp kernel accumulates in f32, got {} destination",
                conf.dst_desc.data_type
            )));
        }
        let sum = SumPolicy {
            requires_same_params: true,
            ..SumPolicy::default()
        };
        for (isa, width) in CANDIDATES {
            if !caps.may_use(isa) {
                continue;
            }
            let args = PostOpsOkArgs::new(isa, &ACCEPTED_KINDS, &chain, Some(&conf.dst_desc))
                .sum_policy(sum);
            if !post_ops_ok(&args) {
                log::debug!("pp kernel: chain rejected on {isa}");
                continue;
            }
            return Self::build(IsaVariant::new(isa, width), conf, chain).map(Some);
        }
        log::warn!(
            "pp kernel: no vectorized variant for {} post-ops on {caps}, fallback: reference path",
            chain.len()
        );
        Ok(None)
    }

    fn build(variant: IsaVariant, conf: PpKernelConf, chain: PostOpChain) -> PostOpsResult<PpKernel> {
        let plan = RegisterPlan::new(variant, &chain)?;
        let (program, compute_calls) = generate(variant, &conf, &chain, &plan)?;
        let kernel = CompiledKernel::new(format!("pp_kernel_{}", variant.isa), program);
        log::info!(
            "pp kernel built for {variant}: {} post-ops, {} instructions",
            chain.len(),
            kernel.code_size()
        );
        Ok(PpKernel {
            variant,
            conf,
            chain,
            plan,
            kernel,
            compute_calls,
        })
    }

    pub fn variant(&self) -> IsaVariant {
        self.variant
    }

    pub fn conf(&self) -> &PpKernelConf {
        &self.conf
    }

    pub fn chain(&self) -> &PostOpChain {
        &self.chain
    }

    pub fn register_plan(&self) -> &RegisterPlan {
        &self.plan
    }

    pub fn kernel(&self) -> &CompiledKernel {
        &self.kernel
    }

    /// `apply_mask` flag of each chain emission: full-width body first, tail
    /// body last.
    pub fn compute_calls(&self) -> &[bool] {
        &self.compute_calls
    }

    /// Run every row of `call` on the calling thread.
    pub fn execute(&self, call: PpCall<'_>) -> PostOpsResult<ExecStats> {
        self.validate(&call)?;
        let frame = Frame::new(&call);
        let mut stats = ExecStats::default();
        for oc in call.oc_start..call.oc_start + call.oc_work {
            stats += self.run_row(&frame, oc)?;
        }
        Ok(stats)
    }

    /// Run the rows of `call` in parallel.
    pub fn execute_par(&self, call: PpCall<'_>) -> PostOpsResult<ExecStats> {
        self.validate(&call)?;
        let frame = Frame::new(&call);
        let rows: Vec<ExecStats> = (call.oc_start..call.oc_start + call.oc_work)
            .into_par_iter()
            .map(|oc| self.run_row(&frame, oc))
            .collect::<PostOpsResult<_>>()?;
        Ok(rows.into_iter().fold(ExecStats::default(), |mut acc, s| {
            acc += s;
            acc
        }))
    }

    fn run_row(&self, frame: &Frame, oc: usize) -> PostOpsResult<ExecStats> {
        let row = oc * frame.oc_stride * 4;
        let args = KerArgs {
            dst: (frame.dst + row) as *mut f32,
            bias: frame.bias as *const f32,
            len: frame.len,
            oc_offset: oc,
            post_ops_binary_rhs_arg_vec: frame.rhs.as_ptr() as *const *const u8,
            post_ops_data: frame.aux.as_ptr() as *const *const f32,
            dst_orig: frame.dst as *const f32,
            sum_src: if frame.sum == 0 {
                std::ptr::null()
            } else {
                (frame.sum + row) as *const f32
            },
        };
        // SAFETY: `validate` checked that the row, the bias, every operand and
        // every parameter buffer cover what the generated code touches, and
        // that no operand-1 register load crosses the operand's span.
        let stats = unsafe { self.kernel.call(&args as *const KerArgs as *const u8) }?;
        Ok(stats)
    }

    fn validate(&self, call: &PpCall<'_>) -> PostOpsResult<()> {
        fn invalid(msg: String) -> PostOpsResult<()> {
            Err(PostOpsError::InvalidArgs(msg))
        }
        if call.oc_work == 0 {
            return Ok(());
        }
        let dst_desc = &self.conf.dst_desc;
        let rows_end = call.oc_start + call.oc_work;
        if rows_end > dst_desc.channels() {
            return invalid(format!(
                "rows {}..{rows_end} exceed {} channels",
                call.oc_start,
                dst_desc.channels()
            ));
        }
        if call.oc_work > 1 && call.oc_stride < call.len {
            return invalid(format!(
                "row stride {} is shorter than the row length {}",
                call.oc_stride, call.len
            ));
        }
        let need = (rows_end - 1) * call.oc_stride + call.len;
        if need > dst_desc.nelems() || need > call.dst.len() {
            return invalid(format!(
                "rows reach element {need}, dst holds {} (descriptor {})",
                call.dst.len(),
                dst_desc.nelems()
            ));
        }
        if self.conf.with_bias {
            match call.bias {
                Some(b) if b.len() >= rows_end => {}
                Some(b) => return invalid(format!("bias holds {} channels, need {rows_end}", b.len())),
                None => return invalid("kernel was built with bias but none was given".into()),
            }
        }
        if self.chain.contains(PostOpKind::Sum) {
            match call.sum_src {
                Some(s) if s.len() >= need => {}
                Some(s) => return invalid(format!("sum source holds {}, need {need}", s.len())),
                None => return invalid("chain has a sum but no sum source was given".into()),
            }
        }

        let strategies = default_strategies();
        let src1: Vec<MemoryDesc> = self.chain.iter().filter_map(|e| e.src1_desc(dst_desc)).collect();
        if call.binary_rhs.len() != src1.len() {
            return invalid(format!(
                "{} binary operands for {} binary-like entries",
                call.binary_rhs.len(),
                src1.len()
            ));
        }
        for (i, (op, desc)) in call.binary_rhs.iter().zip(&src1).enumerate() {
            if op.data_type() != desc.data_type {
                return invalid(format!(
                    "binary operand {i} is {}, entry expects {}",
                    op.data_type(),
                    desc.data_type
                ));
            }
            if op.len() < desc.nelems() {
                return invalid(format!(
                    "binary operand {i} holds {}, dims {:?} need {}",
                    op.len(),
                    desc.dims,
                    desc.nelems()
                ));
            }
            let strategy = get_rhs_arg_broadcasting_strategy(desc, dst_desc, &strategies);
            if let Some(span) = contiguous_span(strategy, dst_desc) {
                self.check_rows_in_span(call, span).map_err(|oc| {
                    PostOpsError::InvalidArgs(format!(
                        "row {oc} ({} elements from {}) crosses a {span}-element span of binary operand {i}",
                        call.len,
                        oc * call.oc_stride
                    ))
                })?;
            }
        }

        let aux: Vec<&PostOp> = self.chain.iter().filter(|e| e.uses_aux_table()).collect();
        if call.post_ops_data.len() != aux.len() {
            return invalid(format!(
                "{} parameter buffers for {} per-channel entries",
                call.post_ops_data.len(),
                aux.len()
            ));
        }
        for (i, (buf, entry)) in call.post_ops_data.iter().zip(aux).enumerate() {
            let need = match entry {
                PostOp::Depthwise(p) => {
                    if p.channels < rows_end {
                        return invalid(format!(
                            "depthwise entry has {} channels, rows need {rows_end}",
                            p.channels
                        ));
                    }
                    p.buffer_len()
                }
                PostOp::Quantization(q) => q.buffer_len(dst_desc.channels()),
                _ => 0,
            };
            if buf.len() < need {
                return invalid(format!("parameter buffer {i} holds {}, need {need}", buf.len()));
            }
        }
        Ok(())
    }

    /// Every register of every row must stay inside one `span` of the
    /// destination. Rows inside a single span pass; longer rows pass when
    /// registers start on span-aligned lane blocks. Returns the first
    /// offending row.
    fn check_rows_in_span(&self, call: &PpCall<'_>, span: usize) -> Result<(), usize> {
        if call.len == 0 {
            return Ok(());
        }
        let lanes = self.variant.lanes();
        for oc in call.oc_start..call.oc_start + call.oc_work {
            let start = oc * call.oc_stride;
            let inside = start % span + call.len <= span;
            let blocked = span % lanes == 0 && start % lanes == 0;
            if !inside && !blocked {
                return Err(oc);
            }
        }
        Ok(())
    }
}

/// Addresses of one call, shared by all rows.
struct Frame {
    dst: usize,
    bias: usize,
    sum: usize,
    len: usize,
    oc_stride: usize,
    rhs: Vec<usize>,
    aux: Vec<usize>,
}

impl Frame {
    fn new(call: &PpCall<'_>) -> Self {
        Frame {
            dst: call.dst.as_ptr() as usize,
            bias: call.bias.map_or(0, |b| b.as_ptr() as usize),
            sum: call.sum_src.map_or(0, |s| s.as_ptr() as usize),
            len: call.len,
            oc_stride: call.oc_stride,
            rhs: call.binary_rhs.iter().map(BinaryOperand::addr).collect(),
            aux: call.post_ops_data.iter().map(|b| b.as_ptr() as usize).collect(),
        }
    }
}

// ── code generation ────────────────────────────────────────────────────────

fn generate(
    variant: IsaVariant,
    conf: &PpKernelConf,
    chain: &PostOpChain,
    plan: &RegisterPlan,
) -> PostOpsResult<(Program, Vec<bool>)> {
    let mut asm = ProgramAssembler::new(variant.width);
    let tail = tail_mask(variant, plan);

    let mut lambdas: HashMap<PostOpKind, LambdaInjector<ProgramAssembler>> = HashMap::new();
    if let Some((scale, zero_point)) = chain.first_sum() {
        let Some(vscale) = plan.sum_scale else {
            return Err(PostOpsError::Unsupported("sum without a scale register".into()));
        };
        lambdas.insert(PostOpKind::Sum, sum_lambda(tail, plan.bias, vscale, scale, zero_point));
    }
    let sp = static_params(variant, conf, plan);
    let injector = PostOpsInjector::with_lambdas(&mut asm, variant, chain.clone(), sp, lambdas);

    let mut emitter = Emitter {
        variant,
        conf,
        plan,
        injector: &injector,
        tail,
        with_sum: chain.contains(PostOpKind::Sum),
        calls: Vec::with_capacity(2),
    };
    emitter.emit(&mut asm)?;
    let calls = emitter.calls;
    Ok((asm.finalize()?, calls))
}

fn tail_mask(variant: IsaVariant, plan: &RegisterPlan) -> LaneMask {
    match plan.vmm_mask {
        Some(m) if !variant.has_opmask() => LaneMask::Vector(m),
        _ => LaneMask::Opmask(KREG_REM_MASK),
    }
}

fn static_params(variant: IsaVariant, conf: &PpKernelConf, plan: &RegisterPlan) -> PostOpsStaticParams {
    let binary = plan.binary_helper.map(|helper| BinaryStaticParams {
        param1: REG_PARAM,
        rhs_arg_static_params: RhsArgStaticParams {
            rhs_dt_helper_vmm_idx: helper.idx(),
            rhs_addr_reg: REG_RHS_ADDR,
            rhs_helper_reg: REG_SHIFT,
            rhs_addr_cache_reg: REG_REM_MASK,
            preserve_gpr_helpers: true,
            preserve_vmm_helper: false,
            abi_param_offset: OFF_RHS_ARG_VEC,
            dst_orig_offset: OFF_DST_ORIG,
            dst_desc: conf.dst_desc.clone(),
            tail_size: 0,
            tail_opmask: variant.has_opmask().then_some(KREG_REM_MASK),
            tail_mask_vmm: plan.vmm_mask,
        },
        supported_strategies: default_strategies(),
        prelu_tmp_vmm_idx: plan.prelu_tmp.map(Vmm::idx),
    });
    let (depthwise, quantization) = match (plan.d_weights, plan.d_bias) {
        (Some(w), Some(b)) => (
            Some(DepthwiseStaticParams {
                vmm_weights: w,
                vmm_bias: b,
                k_mask: KREG_ELTWISE,
            }),
            Some(QuantizationStaticParams {
                vmm_a: w,
                vmm_b: b,
                reg_ptr: REG_D_WEIGHTS,
                reg_oc: REG_D_BIAS,
            }),
        ),
        _ => (None, None),
    };
    PostOpsStaticParams {
        eltwise: EltwiseStaticParams {
            p_table: REG_P_TABLE,
            k_mask: KREG_ELTWISE,
            ..EltwiseStaticParams::default()
        },
        binary,
        depthwise,
        quantization,
        post_ops_data: REG_POST_OPS_DATA,
    }
}

/// `x += scale * (sum_src - zero_point)` for every register of the set.
fn sum_lambda(
    tail: LaneMask,
    vdata: Vmm,
    vscale: Vmm,
    scale: f32,
    zero_point: i32,
) -> LambdaInjector<ProgramAssembler> {
    Box::new(
        move |asm: &mut ProgramAssembler,
              idxs: &VmmIndexSet,
              rhs: &RhsArgDynamicParams|
              -> CodegenResult<()> {
            for &idx in idxs {
                let x = Vmm::from(idx);
                let mask = if rhs.is_tail(idx) { tail } else { LaneMask::None };
                asm.vload(vdata, Address::base(REG_SUM_SRC), DataType::F32, mask)?;
                if zero_point != 0 {
                    asm.vbroadcast_const(vscale, REG_TMP, zero_point as f32)?;
                    asm.vsub(vdata, vdata, vscale)?;
                }
                asm.vbroadcast_const(vscale, REG_TMP, scale)?;
                asm.vfmadd231(x, vdata, vscale)?;
            }
            Ok(())
        },
    )
}

struct Emitter<'a> {
    variant: IsaVariant,
    conf: &'a PpKernelConf,
    plan: &'a RegisterPlan,
    injector: &'a PostOpsInjector<ProgramAssembler>,
    tail: LaneMask,
    with_sum: bool,
    calls: Vec<bool>,
}

impl Emitter<'_> {
    fn emit(&mut self, asm: &mut ProgramAssembler) -> PostOpsResult<()> {
        let lanes = self.variant.lanes() as i64;
        let vlen = self.variant.vlen() as i64;

        asm.load(REG_DST, Address::disp(REG_PARAM, OFF_DST))?;
        if self.conf.with_bias {
            asm.load(REG_BIAS, Address::disp(REG_PARAM, OFF_BIAS))?;
        }
        asm.load(REG_LEN, Address::disp(REG_PARAM, OFF_LEN))?;
        asm.load(REG_OC_OFFSET, Address::disp(REG_PARAM, OFF_OC_OFFSET))?;
        asm.alu_imm(AluOp::Shl, REG_OC_OFFSET, 2)?;
        if self.with_sum {
            asm.load(REG_SUM_SRC, Address::disp(REG_PARAM, OFF_SUM_SRC))?;
        }
        asm.load(REG_POST_OPS_DATA, Address::disp(REG_PARAM, OFF_POST_OPS_DATA))?;
        let reservation =
            self.injector
                .push_post_ops_data_on_stack(asm, REG_POST_OPS_DATA, REG_TMP)?;

        let mask_table = if self.variant.has_opmask() {
            None
        } else {
            let label = asm.new_data_label();
            asm.lea_data(REG_MASK_TABLE, label)?;
            Some(label)
        };

        let loop_main = asm.new_label();
        let loop_tail = asm.new_label();
        let loop_end = asm.new_label();

        asm.cmp_imm(REG_LEN, 0)?;
        asm.jcc(Cond::Eq, loop_end)?;
        asm.cmp_imm(REG_LEN, lanes)?;
        asm.jcc(Cond::Lt, loop_tail)?;

        asm.bind(loop_main)?;
        self.compute(asm, false)?;
        asm.sub_imm(REG_LEN, lanes)?;
        asm.add_imm(REG_DST, vlen)?;
        if self.with_sum {
            asm.add_imm(REG_SUM_SRC, vlen)?;
        }
        asm.cmp_imm(REG_LEN, lanes)?;
        asm.jcc(Cond::Ge, loop_main)?;

        asm.bind(loop_tail)?;
        asm.cmp_imm(REG_LEN, 0)?;
        asm.jcc(Cond::Eq, loop_end)?;
        asm.mov(REG_TMP, REG_LEN)?;
        match self.tail {
            LaneMask::Vector(vmask) => {
                asm.mov_imm(REG_SHIFT, lanes)?;
                asm.alu(AluOp::Sub, REG_SHIFT, REG_TMP)?;
                asm.vload(
                    vmask,
                    Address::indexed(REG_MASK_TABLE, REG_SHIFT, 4),
                    DataType::F32,
                    LaneMask::None,
                )?;
            }
            _ => {
                asm.mov_imm(REG_REM_MASK, 1)?;
                asm.alu(AluOp::Shl, REG_REM_MASK, REG_TMP)?;
                asm.sub_imm(REG_REM_MASK, 1)?;
                asm.kmov(KREG_REM_MASK, REG_REM_MASK)?;
            }
        }
        self.compute(asm, true)?;

        asm.bind(loop_end)?;
        self.injector.reset_stack_pointer(asm, reservation)?;
        asm.ret()?;

        self.injector.prepare_table(asm, true)?;
        if let Some(label) = mask_table {
            let lanes = self.variant.lanes();
            let mut words = vec![u32::MAX; lanes];
            words.resize(2 * lanes, 0);
            asm.emit_data(label, &words)?;
        }
        Ok(())
    }

    /// Load, add bias, apply the chain and store one register.
    fn compute(&mut self, asm: &mut ProgramAssembler, apply_mask: bool) -> PostOpsResult<()> {
        let dst = self.plan.dst;
        let mask = if apply_mask { self.tail } else { LaneMask::None };
        asm.vload(dst, Address::base(REG_DST), DataType::F32, mask)?;
        if self.conf.with_bias {
            let bias = self.plan.bias;
            asm.vbroadcast(bias, Address::indexed(REG_BIAS, REG_OC_OFFSET, 1), DataType::F32)?;
            asm.vadd(dst, dst, bias)?;
        }
        self.injector
            .compute_vector(asm, dst.idx(), &self.dyn_params(apply_mask))?;
        asm.vstore(Address::base(REG_DST), dst, mask)?;
        self.calls.push(apply_mask);
        Ok(())
    }

    fn dyn_params(&self, apply_mask: bool) -> PostOpsDynamicParams {
        let dst = self.plan.dst.idx();
        let mut rhs = RhsArgDynamicParams::default();
        rhs.vmm_idx_to_out_reg.insert(dst, REG_DST);
        rhs.vmm_idx_to_out_elem_off_val.insert(dst, 0);
        if apply_mask {
            rhs.vmm_tail_idx.insert(dst);
        }
        PostOpsDynamicParams {
            rhs,
            depthwise: Some(DepthwiseDynamicParams {
                reg_weights: REG_D_WEIGHTS,
                reg_bias: REG_D_BIAS,
                oc_off: OcOffset::Reg(REG_OC_OFFSET),
            }),
            quantization: Some(QuantizationDynamicParams::new(
                OcOffset::Reg(REG_OC_OFFSET),
                self.conf.dst_dt,
            )),
            is_broadcast: true,
        }
    }
}
