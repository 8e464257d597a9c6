//! PostOpsInjector — composes the per-kind generators over a whole chain.
//!
//! Built once per kernel. Construction wires one [`EntryGenerator`] per
//! chain entry; every `compute_*` call is a fresh emission pass that walks
//! the chain in order and threads the auxiliary-table offset through the
//! depthwise and quantization entries. The injector borrows the emission
//! host per call and never keeps it.

use std::collections::HashMap;
use std::ops::Range;

use super::binary::{BinaryInjector, BinaryStaticParams, RhsArgDynamicParams};
use super::depthwise::{DepthwiseDynamicParams, DepthwiseInjector, DepthwiseStaticParams};
use super::eltwise::{self, EltwiseInjector, EltwiseStaticParams};
use super::quantization::{
    self, QuantizationDynamicParams, QuantizationInjector, QuantizationStaticParams,
};
use super::VmmIndexSet;
use crate::codegen::asm::{Address, Gpr, VecAsm};
use crate::dispatch::{CpuIsa, IsaVariant};
use crate::error::CodegenResult;
use crate::post_ops::{PostOp, PostOpChain, PostOpKind};

/// Caller-supplied emission for a kind the injector does not generate itself.
pub type LambdaInjector<E> =
    Box<dyn Fn(&mut E, &VmmIndexSet, &RhsArgDynamicParams) -> CodegenResult<()>>;

/// Static configuration of every generator kind. Kinds absent from the chain
/// may leave their entry `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOpsStaticParams {
    pub eltwise: EltwiseStaticParams,
    pub binary: Option<BinaryStaticParams>,
    pub depthwise: Option<DepthwiseStaticParams>,
    pub quantization: Option<QuantizationStaticParams>,
    /// Points at the stack copy of the auxiliary table during the epilogue.
    pub post_ops_data: Gpr,
}

impl Default for PostOpsStaticParams {
    fn default() -> Self {
        PostOpsStaticParams {
            eltwise: EltwiseStaticParams::default(),
            binary: None,
            depthwise: None,
            quantization: None,
            post_ops_data: Gpr::Rax,
        }
    }
}

/// Per-call parameters forwarded to the generators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostOpsDynamicParams {
    pub rhs: RhsArgDynamicParams,
    pub depthwise: Option<DepthwiseDynamicParams>,
    pub quantization: Option<QuantizationDynamicParams>,
    /// Per-channel values are the same for every lane of a register.
    pub is_broadcast: bool,
}

/// The generator built for one chain entry.
#[derive(Debug, Clone)]
pub enum EntryGenerator {
    Eltwise(EltwiseInjector),
    /// Served by the shared binary injector with operand-1 pointer `rhs_arg_idx`.
    Binary { rhs_arg_idx: usize },
    Depthwise(DepthwiseInjector),
    Quantization {
        injector: QuantizationInjector,
        is_last: bool,
    },
    /// Emitted by a registered lambda, or skipped.
    Deferred(PostOpKind),
}

impl EntryGenerator {
    /// Auxiliary-table bytes this entry consumes.
    pub fn memory_step(&self) -> usize {
        match self {
            EntryGenerator::Depthwise(d) => d.memory_step(),
            EntryGenerator::Quantization { injector, .. } => injector.memory_step(),
            _ => 0,
        }
    }
}

/// Stack area holding the auxiliary-table copy. Release it with
/// [`PostOpsInjector::reset_stack_pointer`] on the path that leaves the
/// epilogue.
#[must_use = "the stack reservation must be released with reset_stack_pointer"]
#[derive(Debug, PartialEq, Eq)]
pub struct StackReservation {
    bytes: usize,
}

impl StackReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Largest eltwise scratch-register need over `chain`.
pub fn aux_vec_count(chain: &PostOpChain, isa: CpuIsa, is_fwd: bool) -> usize {
    chain
        .iter()
        .filter_map(|e| match e {
            PostOp::Eltwise(p) => Some(eltwise::aux_vecs_count(p.alg, isa, is_fwd, p.alpha)),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

pub struct PostOpsInjector<E: VecAsm> {
    variant: IsaVariant,
    chain: PostOpChain,
    sp: PostOpsStaticParams,
    generators: Vec<EntryGenerator>,
    binary: Option<BinaryInjector>,
    lambdas: HashMap<PostOpKind, LambdaInjector<E>>,
}

impl<E: VecAsm> PostOpsInjector<E> {
    pub fn new(asm: &mut E, variant: IsaVariant, chain: PostOpChain, sp: PostOpsStaticParams) -> Self {
        Self::with_lambdas(asm, variant, chain, sp, HashMap::new())
    }

    pub fn with_lambdas(
        asm: &mut E,
        variant: IsaVariant,
        chain: PostOpChain,
        sp: PostOpsStaticParams,
        lambdas: HashMap<PostOpKind, LambdaInjector<E>>,
    ) -> Self {
        let has_eltwise = chain.contains(PostOpKind::Eltwise);
        let has_binary = chain.binary_like_count() > 0;
        if variant.has_opmask() && has_eltwise && has_binary {
            let tail = sp.binary.as_ref().and_then(|b| b.rhs_arg_static_params.tail_opmask);
            assert!(
                tail != Some(sp.eltwise.k_mask),
                "eltwise and binary tail share opmask k{} on {variant}",
                sp.eltwise.k_mask.0
            );
        }

        let binary = if has_binary {
            let bsp = sp
                .binary
                .clone()
                .unwrap_or_else(|| panic!("chain has binary entries but no binary params"));
            Some(BinaryInjector::new(variant, bsp))
        } else {
            None
        };

        let last = chain.len().saturating_sub(1);
        let mut rhs_arg_idx = 0;
        let mut generators = Vec::with_capacity(chain.len());
        for (pos, entry) in chain.iter().enumerate() {
            let g = match entry {
                PostOp::Eltwise(p) => {
                    EntryGenerator::Eltwise(EltwiseInjector::new(asm, variant, *p, sp.eltwise))
                }
                PostOp::Binary(_) | PostOp::Prelu(_) => {
                    rhs_arg_idx += 1;
                    EntryGenerator::Binary {
                        rhs_arg_idx: rhs_arg_idx - 1,
                    }
                }
                PostOp::Depthwise(p) => {
                    let dsp = sp
                        .depthwise
                        .unwrap_or_else(|| panic!("chain has depthwise entries but no depthwise params"));
                    EntryGenerator::Depthwise(DepthwiseInjector::new(variant, *p, dsp))
                }
                PostOp::Quantization(p) => {
                    let qsp = sp.quantization.unwrap_or_else(|| {
                        panic!("chain has quantization entries but no quantization params")
                    });
                    EntryGenerator::Quantization {
                        injector: QuantizationInjector::new(*p, qsp),
                        is_last: pos == last,
                    }
                }
                PostOp::Sum { .. } => EntryGenerator::Deferred(PostOpKind::Sum),
            };
            generators.push(g);
        }
        log::debug!(
            "post-ops injector on {variant}: {} entries, {} binary-like",
            generators.len(),
            rhs_arg_idx
        );

        PostOpsInjector {
            variant,
            chain,
            sp,
            generators,
            binary,
            lambdas,
        }
    }

    pub fn set_lambda_injector(&mut self, kind: PostOpKind, f: LambdaInjector<E>) {
        self.lambdas.insert(kind, f);
    }

    pub fn variant(&self) -> IsaVariant {
        self.variant
    }

    pub fn chain(&self) -> &PostOpChain {
        &self.chain
    }

    pub fn generators(&self) -> &[EntryGenerator] {
        &self.generators
    }

    pub fn generator_count(&self) -> usize {
        self.generators.len()
    }

    pub fn static_params(&self) -> &PostOpsStaticParams {
        &self.sp
    }

    /// Emit the constant tables of every eltwise entry.
    pub fn prepare_table(&self, asm: &mut E, gen_table: bool) -> CodegenResult<()> {
        for g in &self.generators {
            if let EntryGenerator::Eltwise(inj) = g {
                inj.prepare_table(asm, gen_table)?;
            }
        }
        Ok(())
    }

    /// Apply the chain to `idxs`. Returns the auxiliary-table byte offset
    /// after each entry.
    pub fn compute_vector_range(
        &self,
        asm: &mut E,
        idxs: &VmmIndexSet,
        dp: &PostOpsDynamicParams,
    ) -> CodegenResult<Vec<usize>> {
        let mut offsets = Vec::with_capacity(self.generators.len());
        let mut aux_offset = 0usize;
        let mut grouped = None;

        for (entry, g) in self.chain.iter().zip(&self.generators) {
            match g {
                EntryGenerator::Eltwise(inj) => inj.compute_vector_range(asm, idxs)?,
                EntryGenerator::Binary { rhs_arg_idx } => {
                    let binary = self
                        .binary
                        .as_ref()
                        .unwrap_or_else(|| panic!("binary entry without a binary injector"));
                    binary.compute_vector_range(asm, idxs, *rhs_arg_idx, entry, &dp.rhs)?;
                }
                EntryGenerator::Depthwise(inj) => {
                    let ddp = dp
                        .depthwise
                        .as_ref()
                        .unwrap_or_else(|| panic!("depthwise entry without dynamic params"));
                    let slot = Address::disp(self.sp.post_ops_data, aux_offset as i32);
                    inj.compute_vector_range(asm, idxs, slot, ddp, dp.is_broadcast)?;
                    aux_offset += inj.memory_step();
                }
                EntryGenerator::Quantization { injector, is_last } => {
                    let qdp = dp
                        .quantization
                        .as_ref()
                        .unwrap_or_else(|| panic!("quantization entry without dynamic params"));
                    let groups = grouped.get_or_insert_with(|| qdp.group(idxs));
                    let slot = Address::disp(self.sp.post_ops_data, aux_offset as i32);
                    let round = quantization::do_rounding(injector.params(), qdp.dst_dt, *is_last);
                    injector.init_ptrs(asm, slot, qdp.oc_off)?;
                    for (&vmm_off, set) in groups.iter() {
                        injector.compute_group(asm, set, vmm_off, round, dp.is_broadcast)?;
                    }
                    aux_offset += injector.memory_step();
                }
                EntryGenerator::Deferred(kind) => {
                    if let Some(f) = self.lambdas.get(kind) {
                        f(asm, idxs, &dp.rhs)?;
                    }
                }
            }
            offsets.push(aux_offset);
        }
        Ok(offsets)
    }

    pub fn compute_vector(
        &self,
        asm: &mut E,
        idx: usize,
        dp: &PostOpsDynamicParams,
    ) -> CodegenResult<Vec<usize>> {
        self.compute_vector_range(asm, &VmmIndexSet::from([idx]), dp)
    }

    /// Registers `range.start..range.end`.
    pub fn compute_vector_span(
        &self,
        asm: &mut E,
        range: Range<usize>,
        dp: &PostOpsDynamicParams,
    ) -> CodegenResult<Vec<usize>> {
        let idxs: VmmIndexSet = range.collect();
        self.compute_vector_range(asm, &idxs, dp)
    }

    /// Copy the auxiliary table at `table` onto the stack and point
    /// `post_ops_data` at the copy. Emits nothing when no entry reads it.
    pub fn push_post_ops_data_on_stack(
        &self,
        asm: &mut E,
        table: Gpr,
        scratch: Gpr,
    ) -> CodegenResult<StackReservation> {
        let n = self.chain.aux_pointer_count();
        if n == 0 {
            return Ok(StackReservation { bytes: 0 });
        }
        let bytes = n * 8;
        asm.sub_imm(Gpr::Rsp, bytes as i64)?;
        for i in 0..n {
            let off = (i * 8) as i32;
            asm.load(scratch, Address::disp(table, off))?;
            asm.store(Address::disp(Gpr::Rsp, off), scratch)?;
        }
        asm.mov(self.sp.post_ops_data, Gpr::Rsp)?;
        Ok(StackReservation { bytes })
    }

    pub fn reset_stack_pointer(&self, asm: &mut E, reservation: StackReservation) -> CodegenResult<()> {
        if reservation.bytes == 0 {
            return Ok(());
        }
        asm.add_imm(Gpr::Rsp, reservation.bytes as i64)
    }
}
