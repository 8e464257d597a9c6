//! VectorMachine — executes recorded programs against real memory.
//!
//! Each run gets a fresh register file (32 vector registers of the program
//! width, 8 opmasks, 16 general registers) and a private stack, so one
//! `Program` may be run concurrently from many threads on disjoint buffers.
//! All memory operands are raw host addresses; the code generator is trusted
//! to stay in bounds.

use std::cmp::Ordering;
use std::ops::AddAssign;

use super::asm::*;
use super::program::{Insn, Program, MAX_OPMASKS, MAX_VREGS};
use crate::error::{ExecError, ExecResult};
use crate::types::DataType;

const MAX_LANES: usize = 16;

/// Counters collected during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub insns_retired: u64,
    /// Bytes reserved by `sub rsp, imm`.
    pub stack_reserved_bytes: u64,
    /// Bytes released by `add rsp, imm`.
    pub stack_released_bytes: u64,
    /// Unmasked vector stores.
    pub vector_stores: u64,
    /// Masked vector stores (opmask or vector mask).
    pub masked_stores: u64,
    /// Lanes written by all vector stores.
    pub lanes_stored: u64,
}

impl AddAssign for ExecStats {
    fn add_assign(&mut self, rhs: ExecStats) {
        self.insns_retired += rhs.insns_retired;
        self.stack_reserved_bytes += rhs.stack_reserved_bytes;
        self.stack_released_bytes += rhs.stack_released_bytes;
        self.vector_stores += rhs.vector_stores;
        self.masked_stores += rhs.masked_stores;
        self.lanes_stored += rhs.lanes_stored;
    }
}

/// Program interpreter.
#[derive(Debug, Clone, Copy)]
pub struct VectorMachine {
    stack_bytes: usize,
}

impl VectorMachine {
    pub fn new(stack_bytes: usize) -> Self {
        VectorMachine {
            stack_bytes: stack_bytes.max(64),
        }
    }

    /// Run `program` with `rdi` holding `args`.
    ///
    /// # Safety
    /// Every address the program computes from `args` must be valid for the
    /// accesses it performs.
    pub unsafe fn run(&self, program: &Program, args: *const u8) -> ExecResult<ExecStats> {
        let mut stack = vec![0u64; self.stack_bytes / 8];
        let stack_base = stack.as_mut_ptr() as u64;
        let stack_top = stack_base + (stack.len() * 8) as u64;

        let mut st = State {
            lanes: program.width.lanes(),
            v: [[0u32; MAX_LANES]; MAX_VREGS],
            k: [0u64; MAX_OPMASKS],
            r: [0u64; 16],
            flags: Ordering::Equal,
            stack_base,
            stats: ExecStats::default(),
        };
        st.r[Gpr::Rsp.idx()] = stack_top;
        st.r[Gpr::Rdi.idx()] = args as u64;

        let mut pc = 0usize;
        loop {
            let insn = program.insns.get(pc).ok_or(ExecError::PcOutOfRange(pc))?;
            st.stats.insns_retired += 1;
            pc += 1;
            match insn {
                Insn::Jmp { target } => pc = program.labels[target.0 as usize],
                Insn::Jcc { cond, target } => {
                    if st.holds(*cond) {
                        pc = program.labels[target.0 as usize];
                    }
                }
                Insn::Ret => {
                    let exit = st.r[Gpr::Rsp.idx()];
                    if exit != stack_top {
                        return Err(ExecError::StackImbalance {
                            entry: stack_top,
                            exit,
                        });
                    }
                    drop(stack);
                    return Ok(st.stats);
                }
                other => st.step(program, other, pc - 1)?,
            }
        }
    }
}

struct State {
    lanes: usize,
    v: [[u32; MAX_LANES]; MAX_VREGS],
    k: [u64; MAX_OPMASKS],
    r: [u64; 16],
    flags: Ordering,
    stack_base: u64,
    stats: ExecStats,
}

impl State {
    fn holds(&self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.flags == Ordering::Equal,
            Cond::Ne => self.flags != Ordering::Equal,
            Cond::Lt => self.flags == Ordering::Less,
            Cond::Le => self.flags != Ordering::Greater,
            Cond::Gt => self.flags == Ordering::Greater,
            Cond::Ge => self.flags != Ordering::Less,
        }
    }

    #[inline]
    fn ea(&self, a: &Address) -> u64 {
        let mut addr = self.r[a.base.idx()].wrapping_add(a.disp as i64 as u64);
        if let Some(index) = a.index {
            addr = addr.wrapping_add(self.r[index.idx()].wrapping_mul(a.scale as u64));
        }
        addr
    }

    fn set_gpr(&mut self, dst: Gpr, value: u64) -> ExecResult<()> {
        if dst == Gpr::Rsp && value < self.stack_base {
            return Err(ExecError::StackOverflow {
                needed: self.stack_base - value,
            });
        }
        self.r[dst.idx()] = value;
        Ok(())
    }

    fn alu(&mut self, op: AluOp, dst: Gpr, rhs: u64, pc: usize) -> ExecResult<()> {
        let lhs = self.r[dst.idx()];
        let res = match op {
            AluOp::Add => lhs.wrapping_add(rhs),
            AluOp::Sub => lhs.wrapping_sub(rhs),
            AluOp::Imul => (lhs as i64).wrapping_mul(rhs as i64) as u64,
            AluOp::Shl => lhs << (rhs & 63),
            AluOp::Shr => lhs >> (rhs & 63),
            AluOp::UDiv | AluOp::URem if rhs == 0 => {
                return Err(ExecError::DivideByZero { pc });
            }
            AluOp::UDiv => lhs / rhs,
            AluOp::URem => lhs % rhs,
        };
        self.flags = (res as i64).cmp(&0);
        self.set_gpr(dst, res)
    }

    fn lane_active(&self, mask: LaneMask, lane: usize) -> bool {
        match mask {
            LaneMask::None => true,
            LaneMask::Opmask(k) => self.k[k.0 as usize] >> lane & 1 == 1,
            LaneMask::Vector(m) => self.v[m.idx()][lane] & 0x8000_0000 != 0,
        }
    }

    fn map1(&mut self, dst: Vmm, a: Vmm, f: impl Fn(u32) -> u32) {
        let src = self.v[a.idx()];
        let mut out = [0u32; MAX_LANES];
        for lane in 0..self.lanes {
            out[lane] = f(src[lane]);
        }
        self.v[dst.idx()] = out;
    }

    fn map2(&mut self, dst: Vmm, a: Vmm, b: Vmm, f: impl Fn(u32, u32) -> u32) {
        let (x, y) = (self.v[a.idx()], self.v[b.idx()]);
        let mut out = [0u32; MAX_LANES];
        for lane in 0..self.lanes {
            out[lane] = f(x[lane], y[lane]);
        }
        self.v[dst.idx()] = out;
    }

    fn step(&mut self, program: &Program, insn: &Insn, pc: usize) -> ExecResult<()> {
        match *insn {
            Insn::MovImm { dst, imm } => self.set_gpr(dst, imm as u64)?,
            Insn::Mov { dst, src } => self.set_gpr(dst, self.r[src.idx()])?,
            Insn::Load { dst, addr } => {
                // SAFETY: address produced by trusted generated code.
                let value = unsafe { read_u64(self.ea(&addr)) };
                self.set_gpr(dst, value)?;
            }
            Insn::Store { addr, src } => {
                // SAFETY: address produced by trusted generated code.
                unsafe { write_u64(self.ea(&addr), self.r[src.idx()]) };
            }
            Insn::Lea { dst, addr } => self.set_gpr(dst, self.ea(&addr))?,
            Insn::LeaData { dst, label } => {
                let offset = program.data_offsets[label.0 as usize];
                let addr = program.data.as_ptr() as u64 + (offset * 4) as u64;
                self.set_gpr(dst, addr)?;
            }
            Insn::AluImm { op, dst, imm } => {
                if dst == Gpr::Rsp {
                    match op {
                        AluOp::Sub => self.stats.stack_reserved_bytes += imm as u64,
                        AluOp::Add => self.stats.stack_released_bytes += imm as u64,
                        _ => {}
                    }
                }
                self.alu(op, dst, imm as u64, pc)?;
            }
            Insn::Alu { op, dst, src } => self.alu(op, dst, self.r[src.idx()], pc)?,
            Insn::AluMem { op, dst, addr } => {
                // SAFETY: address produced by trusted generated code.
                let rhs = unsafe { read_u64(self.ea(&addr)) };
                self.alu(op, dst, rhs, pc)?;
            }
            Insn::CmpImm { lhs, imm } => self.flags = (self.r[lhs.idx()] as i64).cmp(&imm),
            Insn::Kmov { dst, src } => self.k[dst.0 as usize] = self.r[src.idx()],
            Insn::VLoad { dst, addr, dt, mask } => {
                let base = self.ea(&addr);
                let mut out = [0u32; MAX_LANES];
                for (lane, slot) in out.iter_mut().enumerate().take(self.lanes) {
                    if self.lane_active(mask, lane) {
                        // SAFETY: active lanes are in bounds by construction.
                        *slot = unsafe { read_elem(base + (lane * dt.size()) as u64, dt) };
                    }
                }
                self.v[dst.idx()] = out;
            }
            Insn::VStore { addr, src, mask } => {
                let base = self.ea(&addr);
                let data = self.v[src.idx()];
                let mut written = 0u64;
                for (lane, word) in data.iter().enumerate().take(self.lanes) {
                    if self.lane_active(mask, lane) {
                        // SAFETY: active lanes are in bounds by construction.
                        unsafe { write_u32(base + (lane * 4) as u64, *word) };
                        written += 1;
                    }
                }
                match mask {
                    LaneMask::None => self.stats.vector_stores += 1,
                    _ => self.stats.masked_stores += 1,
                }
                self.stats.lanes_stored += written;
            }
            Insn::VBroadcast { dst, addr, dt } => {
                // SAFETY: address produced by trusted generated code.
                let word = unsafe { read_elem(self.ea(&addr), dt) };
                self.v[dst.idx()] = splat(word, self.lanes);
            }
            Insn::VBroadcastGpr { dst, src } => {
                self.v[dst.idx()] = splat(self.r[src.idx()] as u32, self.lanes);
            }
            Insn::VMov { dst, src } => self.v[dst.idx()] = self.v[src.idx()],
            Insn::VBinary { op, dst, a, b } => self.map2(dst, a, b, binop(op)),
            Insn::VUnary { op, dst, a } => self.map1(dst, a, move |x| unop(op, x)),
            Insn::VFma { form, dst, a, b } => {
                let d0 = self.v[dst.idx()];
                let (x, y) = (self.v[a.idx()], self.v[b.idx()]);
                let mut out = [0u32; MAX_LANES];
                for lane in 0..self.lanes {
                    let (d, p, q) = (f(d0[lane]), f(x[lane]), f(y[lane]));
                    out[lane] = match form {
                        FmaForm::Fmadd213 => d.mul_add(p, q),
                        FmaForm::Fmadd231 => p.mul_add(q, d),
                        FmaForm::Fnmadd231 => (-p).mul_add(q, d),
                    }
                    .to_bits();
                }
                self.v[dst.idx()] = out;
            }
            Insn::VCmp { pred, dst, a, b } => {
                self.map2(dst, a, b, move |x, y| if compare(pred, f(x), f(y)) { u32::MAX } else { 0 })
            }
            Insn::VCmpMask { pred, dst, a, b } => {
                let (x, y) = (self.v[a.idx()], self.v[b.idx()]);
                let mut bits = 0u64;
                for lane in 0..self.lanes {
                    if compare(pred, f(x[lane]), f(y[lane])) {
                        bits |= 1 << lane;
                    }
                }
                self.k[dst.0 as usize] = bits;
            }
            Insn::VBlendv { dst, a, b, mask } => {
                let (x, y, m) = (self.v[a.idx()], self.v[b.idx()], self.v[mask.idx()]);
                let mut out = [0u32; MAX_LANES];
                for lane in 0..self.lanes {
                    out[lane] = if m[lane] & 0x8000_0000 != 0 { y[lane] } else { x[lane] };
                }
                self.v[dst.idx()] = out;
            }
            Insn::VBlendm { dst, a, b, mask } => {
                let (x, y, k) = (self.v[a.idx()], self.v[b.idx()], self.k[mask.0 as usize]);
                let mut out = [0u32; MAX_LANES];
                for lane in 0..self.lanes {
                    out[lane] = if k >> lane & 1 == 1 { y[lane] } else { x[lane] };
                }
                self.v[dst.idx()] = out;
            }
            Insn::Jmp { .. } | Insn::Jcc { .. } | Insn::Ret => unreachable!("handled by run loop"),
        }
        Ok(())
    }
}

#[inline]
fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

fn splat(word: u32, lanes: usize) -> [u32; MAX_LANES] {
    let mut out = [0u32; MAX_LANES];
    out[..lanes].fill(word);
    out
}

fn compare(pred: CmpPred, a: f32, b: f32) -> bool {
    match pred {
        CmpPred::Eq => a == b,
        CmpPred::Ne => a != b,
        CmpPred::Lt => a < b,
        CmpPred::Le => a <= b,
        CmpPred::Gt => a > b,
        CmpPred::Ge => a >= b,
    }
}

fn binop(op: VBinOp) -> impl Fn(u32, u32) -> u32 {
    move |a, b| match op {
        VBinOp::Add => (f(a) + f(b)).to_bits(),
        VBinOp::Sub => (f(a) - f(b)).to_bits(),
        VBinOp::Mul => (f(a) * f(b)).to_bits(),
        VBinOp::Div => (f(a) / f(b)).to_bits(),
        // maxps/minps return the second operand when unordered.
        VBinOp::Max => if f(a) > f(b) { a } else { b },
        VBinOp::Min => if f(a) < f(b) { a } else { b },
        VBinOp::And => a & b,
        VBinOp::AndNot => !a & b,
        VBinOp::Or => a | b,
        VBinOp::Xor => a ^ b,
        VBinOp::AddI32 => (a as i32).wrapping_add(b as i32) as u32,
        VBinOp::SubI32 => (a as i32).wrapping_sub(b as i32) as u32,
    }
}

fn unop(op: VUnOp, x: u32) -> u32 {
    match op {
        VUnOp::Sqrt => f(x).sqrt().to_bits(),
        VUnOp::Round(mode) => {
            let v = f(x);
            match mode {
                RoundMode::NearestEven => v.round_ties_even(),
                RoundMode::Floor => v.floor(),
                RoundMode::Ceil => v.ceil(),
                RoundMode::Trunc => v.trunc(),
            }
            .to_bits()
        }
        VUnOp::CvtI32F32 => (x as i32 as f32).to_bits(),
        VUnOp::CvtF32I32 => {
            let v = f(x);
            // cvttps2dq yields the integer indefinite value out of range.
            if v.is_nan() || v >= 2_147_483_648.0 || v < -2_147_483_648.0 {
                i32::MIN as u32
            } else {
                v as i32 as u32
            }
        }
        VUnOp::ShlI32(n) => if n > 31 { 0 } else { x << n },
        VUnOp::ShrI32(n) => if n > 31 { 0 } else { x >> n },
    }
}

// ── raw memory access ──────────────────────────────────────────────────────

unsafe fn read_u64(addr: u64) -> u64 {
    std::ptr::read_unaligned(addr as *const u64)
}

unsafe fn write_u64(addr: u64, value: u64) {
    std::ptr::write_unaligned(addr as *mut u64, value)
}

unsafe fn write_u32(addr: u64, value: u32) {
    std::ptr::write_unaligned(addr as *mut u32, value)
}

/// Read one element of `dt` and return it as f32 bits.
unsafe fn read_elem(addr: u64, dt: DataType) -> u32 {
    match dt {
        DataType::F32 => std::ptr::read_unaligned(addr as *const u32),
        DataType::S32 => (std::ptr::read_unaligned(addr as *const i32) as f32).to_bits(),
        DataType::Bf16 => (std::ptr::read_unaligned(addr as *const u16) as u32) << 16,
        DataType::F16 => {
            half::f16::from_bits(std::ptr::read_unaligned(addr as *const u16))
                .to_f32()
                .to_bits()
        }
        DataType::S8 => (std::ptr::read(addr as *const i8) as f32).to_bits(),
        DataType::U8 => (std::ptr::read(addr as *const u8) as f32).to_bits(),
    }
}
