//! Error types for code emission, program execution and kernel invocation.
//!
//! Chain rejection is never an error: validity checks return `bool` and the
//! factory returns `Option`. These types cover faults of the emission
//! facility, the interpreter and caller-supplied runtime arguments.

use thiserror::Error;

use crate::codegen::asm::{Label, Opmask, Vmm};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("vector register {0:?} is outside the register file")]
    VmmOutOfRange(Vmm),
    #[error("opmask {0:?} is outside the mask register file")]
    OpmaskOutOfRange(Opmask),
    #[error("k0 cannot be used as a write mask")]
    OpmaskK0AsWriteMask,
    #[error("label {0:?} bound twice")]
    LabelRebound(Label),
    #[error("label {0:?} referenced but never bound")]
    UnboundLabel(Label),
    #[error("data label {0} referenced but never emitted")]
    UnboundDataLabel(u32),
    #[error("data label {0} emitted twice")]
    DataLabelRebound(u32),
    #[error("unsupported operand: {0}")]
    UnsupportedOperand(&'static str),
}

pub type CodegenResult<T> = Result<T, CodegenError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("stack overflow: rsp would drop {needed} bytes below the stack base")]
    StackOverflow { needed: u64 },
    #[error("stack pointer not restored at ret: entry {entry:#x}, exit {exit:#x}")]
    StackImbalance { entry: u64, exit: u64 },
    #[error("division by zero at instruction {pc}")]
    DivideByZero { pc: usize },
    #[error("program counter {0} ran past the end of the program")]
    PcOutOfRange(usize),
}

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum PostOpsError {
    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),
    #[error("kernel execution failed: {0}")]
    Exec(#[from] ExecError),
    #[error("invalid kernel arguments: {0}")]
    InvalidArgs(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
}

pub type PostOpsResult<T> = Result<T, PostOpsError>;
