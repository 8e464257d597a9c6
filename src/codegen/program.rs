//! Recorded vector programs.
//!
//! `ProgramAssembler` implements [`VecAsm`] by appending [`Insn`]s to a list
//! and collecting constant data into a word-addressed data section.
//! `finalize` resolves labels and returns an immutable [`Program`] that the
//! [`super::machine::VectorMachine`] can execute.

use super::asm::*;
use crate::dispatch::VecWidth;
use crate::error::{CodegenError, CodegenResult};
use crate::types::DataType;

/// Architectural limits of the emission host: the widest tier's files.
pub const MAX_VREGS: usize = 32;
pub const MAX_OPMASKS: usize = 8;

/// One recorded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    MovImm { dst: Gpr, imm: i64 },
    Mov { dst: Gpr, src: Gpr },
    Load { dst: Gpr, addr: Address },
    Store { addr: Address, src: Gpr },
    Lea { dst: Gpr, addr: Address },
    LeaData { dst: Gpr, label: DataLabel },
    AluImm { op: AluOp, dst: Gpr, imm: i64 },
    Alu { op: AluOp, dst: Gpr, src: Gpr },
    AluMem { op: AluOp, dst: Gpr, addr: Address },
    CmpImm { lhs: Gpr, imm: i64 },
    Jmp { target: Label },
    Jcc { cond: Cond, target: Label },
    Ret,
    Kmov { dst: Opmask, src: Gpr },
    VLoad { dst: Vmm, addr: Address, dt: DataType, mask: LaneMask },
    VStore { addr: Address, src: Vmm, mask: LaneMask },
    VBroadcast { dst: Vmm, addr: Address, dt: DataType },
    VBroadcastGpr { dst: Vmm, src: Gpr },
    VMov { dst: Vmm, src: Vmm },
    VBinary { op: VBinOp, dst: Vmm, a: Vmm, b: Vmm },
    VUnary { op: VUnOp, dst: Vmm, a: Vmm },
    VFma { form: FmaForm, dst: Vmm, a: Vmm, b: Vmm },
    VCmp { pred: CmpPred, dst: Vmm, a: Vmm, b: Vmm },
    VCmpMask { pred: CmpPred, dst: Opmask, a: Vmm, b: Vmm },
    VBlendv { dst: Vmm, a: Vmm, b: Vmm, mask: Vmm },
    VBlendm { dst: Vmm, a: Vmm, b: Vmm, mask: Opmask },
}

/// A finalized program: instructions, resolved labels and constant data.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) width: VecWidth,
    pub(crate) insns: Vec<Insn>,
    /// Label id to instruction index.
    pub(crate) labels: Vec<usize>,
    pub(crate) data: Vec<u32>,
    /// Data label id to word offset in `data`.
    pub(crate) data_offsets: Vec<usize>,
}

impl Program {
    pub fn width(&self) -> VecWidth {
        self.width
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn data_words(&self) -> usize {
        self.data.len()
    }

    /// Count instructions matching `pred`.
    pub fn count(&self, pred: impl Fn(&Insn) -> bool) -> usize {
        self.insns.iter().filter(|i| pred(i)).count()
    }
}

/// [`VecAsm`] host that records into a [`Program`].
#[derive(Debug)]
pub struct ProgramAssembler {
    width: VecWidth,
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
    data: Vec<u32>,
    data_offsets: Vec<Option<usize>>,
}

impl ProgramAssembler {
    pub fn new(width: VecWidth) -> Self {
        ProgramAssembler {
            width,
            insns: Vec::new(),
            labels: Vec::new(),
            data: Vec::new(),
            data_offsets: Vec::new(),
        }
    }

    /// Instructions emitted so far.
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn finalize(self) -> CodegenResult<Program> {
        for insn in &self.insns {
            match insn {
                Insn::Jmp { target } | Insn::Jcc { target, .. } => {
                    if self.labels.get(target.0 as usize).copied().flatten().is_none() {
                        return Err(CodegenError::UnboundLabel(*target));
                    }
                }
                Insn::LeaData { label, .. } => {
                    if self.data_offsets.get(label.0 as usize).copied().flatten().is_none() {
                        return Err(CodegenError::UnboundDataLabel(label.0));
                    }
                }
                _ => {}
            }
        }
        Ok(Program {
            width: self.width,
            insns: self.insns,
            labels: self.labels.into_iter().map(|l| l.unwrap_or(usize::MAX)).collect(),
            data: self.data,
            data_offsets: self
                .data_offsets
                .into_iter()
                .map(|o| o.unwrap_or(usize::MAX))
                .collect(),
        })
    }

    #[inline]
    fn push(&mut self, insn: Insn) -> CodegenResult<()> {
        self.insns.push(insn);
        Ok(())
    }

    fn check_vmm(v: Vmm) -> CodegenResult<()> {
        if v.idx() >= MAX_VREGS {
            return Err(CodegenError::VmmOutOfRange(v));
        }
        Ok(())
    }

    fn check_vmms(regs: &[Vmm]) -> CodegenResult<()> {
        regs.iter().try_for_each(|v| Self::check_vmm(*v))
    }

    fn check_opmask(k: Opmask) -> CodegenResult<()> {
        if k.0 as usize >= MAX_OPMASKS {
            return Err(CodegenError::OpmaskOutOfRange(k));
        }
        Ok(())
    }

    fn check_lane_mask(mask: LaneMask) -> CodegenResult<()> {
        match mask {
            LaneMask::None => Ok(()),
            LaneMask::Opmask(k) => {
                Self::check_opmask(k)?;
                if k.0 == 0 {
                    return Err(CodegenError::OpmaskK0AsWriteMask);
                }
                Ok(())
            }
            LaneMask::Vector(v) => Self::check_vmm(v),
        }
    }

    fn check_addr(addr: &Address) -> CodegenResult<()> {
        if !matches!(addr.scale, 1 | 2 | 4 | 8) {
            return Err(CodegenError::UnsupportedOperand("address scale must be 1, 2, 4 or 8"));
        }
        if addr.index == Some(Gpr::Rsp) {
            return Err(CodegenError::UnsupportedOperand("rsp cannot be an index register"));
        }
        Ok(())
    }
}

impl VecAsm for ProgramAssembler {
    fn width(&self) -> VecWidth {
        self.width
    }

    fn mov_imm(&mut self, dst: Gpr, imm: i64) -> CodegenResult<()> {
        self.push(Insn::MovImm { dst, imm })
    }

    fn mov(&mut self, dst: Gpr, src: Gpr) -> CodegenResult<()> {
        self.push(Insn::Mov { dst, src })
    }

    fn load(&mut self, dst: Gpr, addr: Address) -> CodegenResult<()> {
        Self::check_addr(&addr)?;
        self.push(Insn::Load { dst, addr })
    }

    fn store(&mut self, addr: Address, src: Gpr) -> CodegenResult<()> {
        Self::check_addr(&addr)?;
        self.push(Insn::Store { addr, src })
    }

    fn lea(&mut self, dst: Gpr, addr: Address) -> CodegenResult<()> {
        Self::check_addr(&addr)?;
        self.push(Insn::Lea { dst, addr })
    }

    fn alu_imm(&mut self, op: AluOp, dst: Gpr, imm: i64) -> CodegenResult<()> {
        if matches!(op, AluOp::UDiv | AluOp::URem) && imm == 0 {
            return Err(CodegenError::UnsupportedOperand("division by immediate zero"));
        }
        self.push(Insn::AluImm { op, dst, imm })
    }

    fn alu(&mut self, op: AluOp, dst: Gpr, src: Gpr) -> CodegenResult<()> {
        self.push(Insn::Alu { op, dst, src })
    }

    fn alu_mem(&mut self, op: AluOp, dst: Gpr, addr: Address) -> CodegenResult<()> {
        Self::check_addr(&addr)?;
        self.push(Insn::AluMem { op, dst, addr })
    }

    fn cmp_imm(&mut self, lhs: Gpr, imm: i64) -> CodegenResult<()> {
        self.push(Insn::CmpImm { lhs, imm })
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) -> CodegenResult<()> {
        let here = self.insns.len();
        match self.labels.get_mut(label.0 as usize) {
            Some(slot) if slot.is_none() => {
                *slot = Some(here);
                Ok(())
            }
            Some(_) => Err(CodegenError::LabelRebound(label)),
            None => Err(CodegenError::UnboundLabel(label)),
        }
    }

    fn jmp(&mut self, target: Label) -> CodegenResult<()> {
        self.push(Insn::Jmp { target })
    }

    fn jcc(&mut self, cond: Cond, target: Label) -> CodegenResult<()> {
        self.push(Insn::Jcc { cond, target })
    }

    fn ret(&mut self) -> CodegenResult<()> {
        self.push(Insn::Ret)
    }

    fn new_data_label(&mut self) -> DataLabel {
        self.data_offsets.push(None);
        DataLabel(self.data_offsets.len() as u32 - 1)
    }

    fn emit_data(&mut self, label: DataLabel, words: &[u32]) -> CodegenResult<()> {
        let offset = self.data.len();
        match self.data_offsets.get_mut(label.0 as usize) {
            Some(slot) if slot.is_none() => *slot = Some(offset),
            Some(_) => return Err(CodegenError::DataLabelRebound(label.0)),
            None => return Err(CodegenError::UnboundDataLabel(label.0)),
        }
        self.data.extend_from_slice(words);
        Ok(())
    }

    fn lea_data(&mut self, dst: Gpr, label: DataLabel) -> CodegenResult<()> {
        self.push(Insn::LeaData { dst, label })
    }

    fn kmov(&mut self, dst: Opmask, src: Gpr) -> CodegenResult<()> {
        Self::check_opmask(dst)?;
        self.push(Insn::Kmov { dst, src })
    }

    fn vload(&mut self, dst: Vmm, addr: Address, dt: DataType, mask: LaneMask) -> CodegenResult<()> {
        Self::check_vmm(dst)?;
        Self::check_addr(&addr)?;
        Self::check_lane_mask(mask)?;
        self.push(Insn::VLoad { dst, addr, dt, mask })
    }

    fn vstore(&mut self, addr: Address, src: Vmm, mask: LaneMask) -> CodegenResult<()> {
        Self::check_vmm(src)?;
        Self::check_addr(&addr)?;
        Self::check_lane_mask(mask)?;
        self.push(Insn::VStore { addr, src, mask })
    }

    fn vbroadcast(&mut self, dst: Vmm, addr: Address, dt: DataType) -> CodegenResult<()> {
        Self::check_vmm(dst)?;
        Self::check_addr(&addr)?;
        self.push(Insn::VBroadcast { dst, addr, dt })
    }

    fn vbroadcast_gpr(&mut self, dst: Vmm, src: Gpr) -> CodegenResult<()> {
        Self::check_vmm(dst)?;
        self.push(Insn::VBroadcastGpr { dst, src })
    }

    fn vmov(&mut self, dst: Vmm, src: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, src])?;
        self.push(Insn::VMov { dst, src })
    }

    fn vbinary(&mut self, op: VBinOp, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a, b])?;
        self.push(Insn::VBinary { op, dst, a, b })
    }

    fn vunary(&mut self, op: VUnOp, dst: Vmm, a: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a])?;
        self.push(Insn::VUnary { op, dst, a })
    }

    fn vfma(&mut self, form: FmaForm, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a, b])?;
        self.push(Insn::VFma { form, dst, a, b })
    }

    fn vcmp(&mut self, pred: CmpPred, dst: Vmm, a: Vmm, b: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a, b])?;
        self.push(Insn::VCmp { pred, dst, a, b })
    }

    fn vcmp_mask(&mut self, pred: CmpPred, dst: Opmask, a: Vmm, b: Vmm) -> CodegenResult<()> {
        Self::check_opmask(dst)?;
        Self::check_vmms(&[a, b])?;
        self.push(Insn::VCmpMask { pred, dst, a, b })
    }

    fn vblendv(&mut self, dst: Vmm, a: Vmm, b: Vmm, mask: Vmm) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a, b, mask])?;
        self.push(Insn::VBlendv { dst, a, b, mask })
    }

    fn vblendm(&mut self, dst: Vmm, a: Vmm, b: Vmm, mask: Opmask) -> CodegenResult<()> {
        Self::check_vmms(&[dst, a, b])?;
        Self::check_opmask(mask)?;
        if mask.0 == 0 {
            return Err(CodegenError::OpmaskK0AsWriteMask);
        }
        self.push(Insn::VBlendm { dst, a, b, mask })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve() {
        let mut asm = ProgramAssembler::new(VecWidth::Ymm);
        let l = asm.new_label();
        asm.jmp(l).unwrap();
        asm.mov_imm(Gpr::Rax, 1).unwrap();
        asm.bind(l).unwrap();
        asm.ret().unwrap();
        let p = asm.finalize().unwrap();
        assert_eq!(p.labels[l.0 as usize], 2);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_unbound_label_is_rejected() {
        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        let l = asm.new_label();
        asm.jcc(Cond::Eq, l).unwrap();
        assert_eq!(asm.finalize().unwrap_err(), CodegenError::UnboundLabel(l));
    }

    #[test]
    fn test_rebinding_is_rejected() {
        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        let l = asm.new_label();
        asm.bind(l).unwrap();
        assert_eq!(asm.bind(l).unwrap_err(), CodegenError::LabelRebound(l));
    }

    #[test]
    fn test_data_label_must_be_emitted() {
        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        let d = asm.new_data_label();
        asm.lea_data(Gpr::Rax, d).unwrap();
        assert_eq!(asm.finalize().unwrap_err(), CodegenError::UnboundDataLabel(0));

        let mut asm = ProgramAssembler::new(VecWidth::Xmm);
        let d = asm.new_data_label();
        asm.lea_data(Gpr::Rax, d).unwrap();
        asm.emit_data(d, &[1, 2, 3]).unwrap();
        assert!(asm.emit_data(d, &[4]).is_err());
        let p = asm.finalize().unwrap();
        assert_eq!(p.data_words(), 3);
    }

    #[test]
    fn test_register_range_checks() {
        let mut asm = ProgramAssembler::new(VecWidth::Zmm);
        assert!(asm.vadd(Vmm(31), Vmm(0), Vmm(1)).is_ok());
        assert_eq!(
            asm.vadd(Vmm(32), Vmm(0), Vmm(1)).unwrap_err(),
            CodegenError::VmmOutOfRange(Vmm(32))
        );
        assert_eq!(
            asm.vstore(Address::base(Gpr::Rdx), Vmm(0), LaneMask::Opmask(Opmask(0)))
                .unwrap_err(),
            CodegenError::OpmaskK0AsWriteMask
        );
        assert!(asm.kmov(Opmask(8), Gpr::Rax).is_err());
    }
}
