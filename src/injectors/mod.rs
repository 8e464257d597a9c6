//! Post-op code generators.
//!
//! Each sub-generator owns the emission of one post-op kind over a set of
//! vector register indices. [`postops::PostOpsInjector`] composes them over a
//! whole chain; [`factory`] picks the ISA variant to instantiate.

pub mod binary;
pub mod depthwise;
pub mod eltwise;
pub mod factory;
pub mod math_approx;
pub mod postops;
pub mod quantization;

use std::collections::BTreeSet;

/// Logical vector register indices being computed, iterated in ascending
/// order.
pub type VmmIndexSet = BTreeSet<usize>;

pub use binary::{
    BinaryInjector, BinaryStaticParams, BroadcastSet, BroadcastStrategy, RhsArgDynamicParams,
    RhsArgStaticParams,
};
pub use depthwise::{DepthwiseDynamicParams, DepthwiseInjector, DepthwiseStaticParams, OcOffset};
pub use eltwise::{EltwiseInjector, EltwiseStaticParams};
pub use factory::{create, create_with_caps};
pub use postops::{
    aux_vec_count, EntryGenerator, LambdaInjector, PostOpsDynamicParams, PostOpsInjector,
    PostOpsStaticParams, StackReservation,
};
pub use quantization::{QuantizationDynamicParams, QuantizationInjector, QuantizationStaticParams};

#[cfg(test)]
pub(crate) mod test_util {
    use crate::codegen::{Address, Gpr, LaneMask, ProgramAssembler, VecAsm, VectorMachine, Vmm};
    use crate::dispatch::{IsaVariant, VecWidth};
    use crate::error::CodegenResult;
    use crate::types::DataType;

    /// Emit `build`, append `ret`, run with `rdi = args.as_ptr()`.
    pub fn run_program(
        width: VecWidth,
        args: &[u64],
        build: impl FnOnce(&mut ProgramAssembler) -> CodegenResult<()>,
    ) -> crate::codegen::ExecStats {
        let mut asm = ProgramAssembler::new(width);
        build(&mut asm).unwrap();
        asm.ret().unwrap();
        let program = asm.finalize().unwrap();
        unsafe { VectorMachine::new(64 * 1024).run(&program, args.as_ptr() as *const u8) }
            .unwrap()
    }

    /// Load `x` into the highest register of `variant`, let `emit` transform
    /// it, and return the stored lanes.
    pub fn run_on_vector(
        variant: IsaVariant,
        x: &[f32],
        emit: impl FnOnce(&mut ProgramAssembler, usize) -> CodegenResult<()>,
    ) -> Vec<f32> {
        let lanes = variant.lanes();
        assert_eq!(x.len(), lanes);
        let input = x.to_vec();
        let mut out = vec![0.0f32; lanes];
        let args = [input.as_ptr() as u64, out.as_mut_ptr() as u64];
        let v = variant.n_vregs() - 1;
        run_program(variant.width, &args, |asm| {
            asm.load(Gpr::Rsi, Address::base(Gpr::Rdi))?;
            asm.vload(Vmm::from(v), Address::base(Gpr::Rsi), DataType::F32, LaneMask::None)?;
            emit(asm, v)?;
            asm.load(Gpr::Rsi, Address::disp(Gpr::Rdi, 8))?;
            asm.vstore(Address::base(Gpr::Rsi), Vmm::from(v), LaneMask::None)
        });
        out
    }
}
