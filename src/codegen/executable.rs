//! CompiledKernel — a finalized program plus its invocation entry.
//!
//! Owns the generated code for the lifetime of the kernel object. Generators
//! and injectors only borrow the emission host while building, so nothing
//! else keeps a reference to the program once it is wrapped here.

use super::machine::{ExecStats, VectorMachine};
use super::program::Program;
use crate::config::config;
use crate::error::ExecResult;

/// A generated kernel ready to be invoked.
#[derive(Debug)]
pub struct CompiledKernel {
    name: String,
    program: Program,
    machine: VectorMachine,
}

impl CompiledKernel {
    pub fn new(name: impl Into<String>, program: Program) -> Self {
        CompiledKernel {
            name: name.into(),
            program,
            machine: VectorMachine::new(config().stack_bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Number of emitted instructions.
    pub fn code_size(&self) -> usize {
        self.program.len()
    }

    /// Invoke the kernel with `args` in the first argument register.
    ///
    /// # Safety
    /// `args` must point to the argument block the kernel was generated for,
    /// and every buffer reachable from it must cover the accessed range.
    #[inline]
    pub unsafe fn call(&self, args: *const u8) -> ExecResult<ExecStats> {
        self.machine.run(&self.program, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::asm::{Address, Gpr, VecAsm};
    use crate::codegen::program::ProgramAssembler;
    use crate::dispatch::VecWidth;

    #[test]
    fn test_compiled_kernel_ret_only() {
        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        asm.ret().unwrap();
        let k = CompiledKernel::new("noop", asm.finalize().unwrap());
        assert_eq!(k.code_size(), 1);
        assert_eq!(k.name(), "noop");
        let stats = unsafe { k.call(std::ptr::null()) }.unwrap();
        assert_eq!(stats.insns_retired, 1);
    }

    #[test]
    fn test_compiled_kernel_is_reentrant() {
        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        asm.load(Gpr::Rsi, Address::base(Gpr::Rdi)).unwrap();
        asm.load(Gpr::Rax, Address::base(Gpr::Rsi)).unwrap();
        asm.add_imm(Gpr::Rax, 1).unwrap();
        asm.store(Address::base(Gpr::Rsi), Gpr::Rax).unwrap();
        asm.ret().unwrap();
        let k = std::sync::Arc::new(CompiledKernel::new("inc", asm.finalize().unwrap()));
        let handles: Vec<_> = (0..4u64)
            .map(|i| {
                let k = k.clone();
                std::thread::spawn(move || {
                    let mut cell = [i * 10];
                    let args = [cell.as_mut_ptr() as u64];
                    unsafe { k.call(args.as_ptr() as *const u8) }.unwrap();
                    cell[0]
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), i as u64 * 10 + 1);
        }
    }
}
