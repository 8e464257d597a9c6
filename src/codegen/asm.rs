//! VecAsm — the vector instruction interface post-op generators emit into.
//!
//! Generators never encode instructions themselves; they call methods on a
//! `VecAsm` host. The register model mirrors x86: `Vmm` indexes the vector
//! file (its width is the host's `VecWidth`), `Opmask` names an AVX-512 mask
//! register and `Gpr` a 64-bit general register.
//!
//! - Every method returns `CodegenResult<()>` so register-range faults surface
//!   at the call site that caused them.
//! - Generators are generic over `<E: VecAsm>`; there is no vtable call per
//!   emitted instruction.

use crate::dispatch::VecWidth;
use crate::error::CodegenResult;
use crate::types::DataType;

// ── Register model ─────────────────────────────────────────────────────────

/// Vector register index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vmm(pub u8);

impl Vmm {
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for Vmm {
    fn from(idx: usize) -> Self {
        Vmm(idx as u8)
    }
}

/// AVX-512 mask register `k0..k7`. `k0` reads as "all lanes" and is never a
/// valid write mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opmask(pub u8);

/// 64-bit general purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    #[inline]
    pub fn idx(self) -> usize {
        self as usize
    }
}

/// `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Gpr,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i32,
}

impl Address {
    pub const fn base(base: Gpr) -> Self {
        Address {
            base,
            index: None,
            scale: 1,
            disp: 0,
        }
    }

    pub const fn disp(base: Gpr, disp: i32) -> Self {
        Address {
            base,
            index: None,
            scale: 1,
            disp,
        }
    }

    pub const fn indexed(base: Gpr, index: Gpr, scale: u8) -> Self {
        Address {
            base,
            index: Some(index),
            scale,
            disp: 0,
        }
    }

    /// Same operand shifted by `delta` bytes.
    pub const fn offset(self, delta: i32) -> Self {
        Address {
            disp: self.disp + delta,
            ..self
        }
    }
}

/// Branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Constant data block in the program's data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataLabel(pub u32);

/// Condition for `jcc`, evaluated on the last flag-setting instruction.
/// Comparisons are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Scalar ALU operation; every form sets flags from its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Imul,
    Shl,
    Shr,
    UDiv,
    URem,
}

/// Float compare predicate; `Ne` is true for unordered inputs, the rest are
/// ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    NearestEven,
    Floor,
    Ceil,
    Trunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    And,
    AndNot,
    Or,
    Xor,
    AddI32,
    SubI32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VUnOp {
    Sqrt,
    Round(RoundMode),
    /// i32 lanes to f32.
    CvtI32F32,
    /// f32 lanes to i32, truncating.
    CvtF32I32,
    ShlI32(u8),
    /// Logical shift right.
    ShrI32(u8),
}

/// Operand order of a fused multiply-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmaForm {
    /// dst = dst * a + b
    Fmadd213,
    /// dst = a * b + dst
    Fmadd231,
    /// dst = -(a * b) + dst
    Fnmadd231,
}

/// Lane predicate of a vector memory access. Inactive lanes read as zero and
/// are not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneMask {
    None,
    /// Lane `i` active when bit `i` of the opmask is set.
    Opmask(Opmask),
    /// Lane `i` active when the sign bit of lane `i` is set.
    Vector(Vmm),
}

// ── VecAsm trait ───────────────────────────────────────────────────────────

/// Vector code emission host.
///
/// A host is created for one register width. Tier-specific limits (16 vs 32
/// registers, opmask availability) are enforced by the generators that know
/// their `IsaVariant`; the host only rejects what no tier could encode.
pub trait VecAsm {
    fn width(&self) -> VecWidth;

    // ── General registers ──────────────────────────────────────────────

    fn mov_imm(&mut self, dst: Gpr, imm: i64) -> CodegenResult<()>;
    fn mov(&mut self, dst: Gpr, src: Gpr) -> CodegenResult<()>;
    /// 64-bit load.
    fn load(&mut self, dst: Gpr, addr: Address) -> CodegenResult<()>;
    /// 64-bit store.
    fn store(&mut self, addr: Address, src: Gpr) -> CodegenResult<()>;
    fn lea(&mut self, dst: Gpr, addr: Address) -> CodegenResult<()>;
    fn alu_imm(&mut self, op: AluOp, dst: Gpr, imm: i64) -> CodegenResult<()>;
    fn alu(&mut self, op: AluOp, dst: Gpr, src: Gpr) -> CodegenResult<()>;
    /// `dst = dst op qword [addr]`.
    fn alu_mem(&mut self, op: AluOp, dst: Gpr, addr: Address) -> CodegenResult<()>;
    fn cmp_imm(&mut self, lhs: Gpr, imm: i64) -> CodegenResult<()>;

    fn add_imm(&mut self, dst: Gpr, imm: i64) -> CodegenResult<()> {
        self.alu_imm(AluOp::Add, dst, imm)
    }

    fn sub_imm(&mut self, dst: Gpr, imm: i64) -> CodegenResult<()> {
        self.alu_imm(AluOp::Sub, dst, imm)
    }

    fn push(&mut self, src: Gpr) -> CodegenResult<()> {
        self.sub_imm(Gpr::Rsp, 8)?;
        self.store(Address::base(Gpr::Rsp), src)
    }

    fn pop(&mut self, dst: Gpr) -> CodegenResult<()> {
        self.load(dst, Address::base(Gpr::Rsp))?;
        self.add_imm(Gpr::Rsp, 8)
    }

    // ── Control flow ───────────────────────────────────────────────────

    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label) -> CodegenResult<()>;
    fn jmp(&mut self, target: Label) -> CodegenResult<()>;
    fn jcc(&mut self, cond: Cond, target: Label) -> CodegenResult<()>;
    fn ret(&mut self) -> CodegenResult<()>;

    // ── Constant data ──────────────────────────────────────────────────

    fn new_data_label(&mut self) -> DataLabel;
    fn emit_data(&mut self, label: DataLabel, words: &[u32]) -> CodegenResult<()>;
    /// Address of a data block; the block may be emitted later.
    fn lea_data(&mut self, dst: Gpr, label: DataLabel) -> CodegenResult<()>;

    // ── Masks ──────────────────────────────────────────────────────────

    fn kmov(&mut self, dst: Opmask, src: Gpr) -> CodegenResult<()>;

    // ── Vector memory ──────────────────────────────────────────────────

    /// Load `lanes` elements of `dt`, converting to f32.
    fn vload(&mut self, dst: Vmm, addr: Address, dt: DataType, mask: LaneMask)
        -> CodegenResult<()>;
    /// Store f32 lanes.
    fn vstore(&mut self, addr: Address, src: Vmm, mask: LaneMask) -> CodegenResult<()>;
    /// Load one element of `dt` into every lane.
    fn vbroadcast(&mut self, dst: Vmm, addr: Address, dt: DataType) -> CodegenResult<()>;
    /// Low 32 bits of `src` into every lane.
    fn vbroadcast_gpr(&mut self, dst: Vmm, src: Gpr) -> CodegenResult<()>;
    fn vmov(&mut self, dst: Vmm, src: Vmm) -> CodegenResult<()>;

    // ── Vector compute ─────────────────────────────────────────────────

    fn vbinary(&mut self, op: VBinOp, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()>;
    fn vunary(&mut self, op: VUnOp, dst: Vmm, a: Vmm) -> CodegenResult<()>;
    fn vfma(&mut self, form: FmaForm, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()>;
    /// All-ones lanes where `a pred b` holds.
    fn vcmp(&mut self, pred: CmpPred, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()>;
    fn vcmp_mask(&mut self, pred: CmpPred, dst: Opmask, a: Vmm, b: Vmm) -> CodegenResult<()>;
    /// dst = sign(mask) ? b : a, per lane.
    fn vblendv(&mut self, dst: Vmm, a: Vmm, b: Vmm, mask: Vmm) -> CodegenResult<()>;
    /// dst = k ? b : a, per lane.
    fn vblendm(&mut self, dst: Vmm, a: Vmm, b: Vmm, mask: Opmask) -> CodegenResult<()>;

    fn vadd(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Add, dst, a, b)
    }
    fn vsub(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Sub, dst, a, b)
    }
    fn vmul(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Mul, dst, a, b)
    }
    fn vdiv(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Div, dst, a, b)
    }
    fn vmax(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Max, dst, a, b)
    }
    fn vmin(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Min, dst, a, b)
    }
    fn vand(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::And, dst, a, b)
    }
    fn vor(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Or, dst, a, b)
    }
    fn vxor(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Xor, dst, a, b)
    }
    fn vzero(&mut self, dst: Vmm) -> CodegenResult<()> {
        self.vbinary(VBinOp::Xor, dst, dst, dst)
    }
    fn vfmadd213(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vfma(FmaForm::Fmadd213, dst, a, b)
    }
    fn vfmadd231(&mut self, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        self.vfma(FmaForm::Fmadd231, dst, a, b)
    }
    fn vround(&mut self, dst: Vmm, a: Vmm, mode: RoundMode) -> CodegenResult<()> {
        self.vunary(VUnOp::Round(mode), dst, a)
    }

    /// Materialize an f32 constant through a scratch general register.
    fn vbroadcast_const(&mut self, dst: Vmm, scratch: Gpr, value: f32) -> CodegenResult<()> {
        self.mov_imm(scratch, value.to_bits() as i64)?;
        self.vbroadcast_gpr(dst, scratch)
    }

    /// Spill vector registers to a fresh stack area, lowest index first.
    fn spill_vmms(&mut self, regs: &[Vmm]) -> CodegenResult<()> {
        if regs.is_empty() {
            return Ok(());
        }
        let vlen = self.width().bytes() as i32;
        self.sub_imm(Gpr::Rsp, (vlen as i64) * regs.len() as i64)?;
        for (i, v) in regs.iter().enumerate() {
            self.vstore(Address::disp(Gpr::Rsp, i as i32 * vlen), *v, LaneMask::None)?;
        }
        Ok(())
    }

    /// Inverse of [`VecAsm::spill_vmms`] for the same register list.
    fn restore_vmms(&mut self, regs: &[Vmm]) -> CodegenResult<()> {
        if regs.is_empty() {
            return Ok(());
        }
        let vlen = self.width().bytes() as i32;
        for (i, v) in regs.iter().enumerate() {
            self.vload(*v, Address::disp(Gpr::Rsp, i as i32 * vlen), DataType::F32, LaneMask::None)?;
        }
        self.add_imm(Gpr::Rsp, (vlen as i64) * regs.len() as i64)
    }
}
