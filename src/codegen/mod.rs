//! Code emission facility: instruction interface, recorder and executor.

pub mod asm;
pub mod executable;
pub mod machine;
pub mod program;

pub use asm::{
    Address, AluOp, CmpPred, Cond, DataLabel, FmaForm, Gpr, Label, LaneMask, Opmask, RoundMode,
    VBinOp, VUnOp, VecAsm, Vmm,
};
pub use executable::CompiledKernel;
pub use machine::{ExecStats, VectorMachine};
pub use program::{Insn, Program, ProgramAssembler};
