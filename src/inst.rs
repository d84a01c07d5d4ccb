//! The parsed-instruction catalog: every operation the core understands,
//! plus the [`ParsedInstruction`] wrapper tying an operation to its byte
//! footprint.

use crate::field::{InstrField, Signature};
use crate::modrm::ModRmContext;
use crate::state::{AddrWidth, SegReg, SegmentedAddress, Width};

/// Two-operand ALU operation selector (also the Grp1 `reg` encoding).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(index: u8) -> AluOp {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }

    /// CMP discards its result.
    pub fn writes_back(self) -> bool {
        !matches!(self, AluOp::Cmp)
    }
}

/// Operand shape of a two-operand ALU instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum AluForm {
    /// `op r/m, r` or `op r, r/m`.
    RmReg { to_reg: bool },
    /// `op AL/AX/EAX, imm`.
    AccImm,
    /// Grp1 `op r/m, imm`; `sext` for the 83 sign-extended imm8 form.
    RmImm { sext: bool },
}

/// Grp2 shift/rotate selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    /// Decodes the Grp2 `reg` encoding; 110 is the undocumented SHL alias.
    pub fn from_index(index: u8) -> ShiftOp {
        match index & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
            ShiftOp::Rcl => "rcl",
            ShiftOp::Rcr => "rcr",
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }
}

/// Where a Grp2 shift count comes from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ShiftCount {
    One,
    Cl,
    Imm,
}

/// Grp3 (F6/F7) selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Grp3Op {
    TestImm,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
}

impl Grp3Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Grp3Op::TestImm => "test",
            Grp3Op::Not => "not",
            Grp3Op::Neg => "neg",
            Grp3Op::Mul => "mul",
            Grp3Op::Imul => "imul",
            Grp3Op::Div => "div",
            Grp3Op::Idiv => "idiv",
        }
    }
}

/// Grp4/Grp5 (FE/FF) selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Grp45Op {
    IncRm,
    DecRm,
    CallRm,
    CallFarRm,
    JmpRm,
    JmpFarRm,
    PushRm,
}

impl Grp45Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Grp45Op::IncRm => "inc",
            Grp45Op::DecRm => "dec",
            Grp45Op::CallRm | Grp45Op::CallFarRm => "call",
            Grp45Op::JmpRm | Grp45Op::JmpFarRm => "jmp",
            Grp45Op::PushRm => "push",
        }
    }
}

/// String operation selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

impl StringOp {
    pub fn mnemonic(self, width: Width) -> &'static str {
        match (self, width) {
            (StringOp::Movs, Width::W8) => "movsb",
            (StringOp::Movs, Width::W16) => "movsw",
            (StringOp::Movs, Width::W32) => "movsd",
            (StringOp::Cmps, Width::W8) => "cmpsb",
            (StringOp::Cmps, Width::W16) => "cmpsw",
            (StringOp::Cmps, Width::W32) => "cmpsd",
            (StringOp::Stos, Width::W8) => "stosb",
            (StringOp::Stos, Width::W16) => "stosw",
            (StringOp::Stos, Width::W32) => "stosd",
            (StringOp::Lods, Width::W8) => "lodsb",
            (StringOp::Lods, Width::W16) => "lodsw",
            (StringOp::Lods, Width::W32) => "lodsd",
            (StringOp::Scas, Width::W8) => "scasb",
            (StringOp::Scas, Width::W16) => "scasw",
            (StringOp::Scas, Width::W32) => "scasd",
        }
    }
}

/// REP-family prefix polarity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum RepKind {
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE.
    Repne,
}

/// Condition code, by the low nibble of the Jcc opcode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn from_index(index: u8) -> Cond {
        // Safe by construction: all 16 nibble values are covered.
        match index & 0xF {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::O => "jo",
            Cond::No => "jno",
            Cond::B => "jb",
            Cond::Ae => "jae",
            Cond::E => "je",
            Cond::Ne => "jne",
            Cond::Be => "jbe",
            Cond::A => "ja",
            Cond::S => "js",
            Cond::Ns => "jns",
            Cond::P => "jp",
            Cond::Np => "jnp",
            Cond::L => "jl",
            Cond::Ge => "jge",
            Cond::Le => "jle",
            Cond::G => "jg",
        }
    }
}

/// LOOP-family selector, by opcode order E0..E2.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum LoopKind {
    Loopne,
    Loope,
    Loop,
}

impl LoopKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            LoopKind::Loopne => "loopne",
            LoopKind::Loope => "loope",
            LoopKind::Loop => "loop",
        }
    }
}

/// The closed family of operations. One variant per catalog entry;
/// operand *values* live in the instruction's fields, operand *shape*
/// lives here.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    MovRegImm { width: Width, reg: u8 },
    MovRmImm { width: Width },
    MovRmReg { width: Width, to_reg: bool },
    MovSegRm { to_seg: bool },
    MovAccMoffs { width: Width, to_acc: bool },
    Lea,
    /// LES (C4) / LDS (C5): load a far pointer into `seg`:reg.
    Lfp { seg: SegReg },
    Xchg { width: Width },
    XchgAccReg { reg: u8 },
    Xlat,
    Lahf,
    Sahf,
    /// CBW / CWDE depending on operand width.
    Cbw,
    /// CWD / CDQ depending on operand width.
    Cwd,
    Alu { op: AluOp, width: Width, form: AluForm },
    TestRmReg { width: Width },
    TestAccImm { width: Width },
    IncDecReg { width: Width, reg: u8, dec: bool },
    Grp2 { op: ShiftOp, width: Width, count: ShiftCount },
    Grp3 { op: Grp3Op, width: Width },
    Grp45 { op: Grp45Op, width: Width },
    PushReg { reg: u8 },
    PopReg { reg: u8 },
    PushSeg { seg: SegReg },
    PopSeg { seg: SegReg },
    PushImm { sext: bool },
    Pushf,
    Popf,
    JmpShort,
    JmpNear,
    JmpFar,
    Jcc { cond: Cond, near: bool },
    Loop { kind: LoopKind },
    Jcxz,
    CallNear,
    CallFar,
    RetNear { pop: bool },
    RetFar { pop: bool },
    /// IRET.
    RetInterrupt,
    Int { vector: u8 },
    Into,
    Str { op: StringOp, width: Width },
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    Nop,
    Hlt,
    /// Host callback `FE 38 nn`.
    Callback { index: u8 },
}

impl Op {
    /// True for operations that never fall through to the next linear
    /// instruction: their execution AST carries its own control transfer
    /// instead of a trailing IP advance.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::JmpShort
                | Op::JmpNear
                | Op::JmpFar
                | Op::CallNear
                | Op::CallFar
                | Op::RetNear { .. }
                | Op::RetFar { .. }
                | Op::RetInterrupt
                | Op::Int { .. }
                | Op::Grp45 {
                    op: Grp45Op::CallRm | Grp45Op::CallFarRm | Grp45Op::JmpRm | Grp45Op::JmpFarRm,
                    ..
                }
        )
    }

    pub fn is_string_op(&self) -> bool {
        matches!(self, Op::Str { .. })
    }

    /// RET/IRET family.
    pub fn is_return(&self) -> bool {
        matches!(
            self,
            Op::RetNear { .. } | Op::RetFar { .. } | Op::RetInterrupt
        )
    }

    /// Operations after which the host may have rewritten the machine
    /// context (far returns, IRET, callbacks).
    pub fn can_cause_context_restore(&self) -> bool {
        matches!(
            self,
            Op::RetFar { .. } | Op::RetInterrupt | Op::Callback { .. }
        )
    }

    /// The register index encoded in the opcode byte, if any.
    pub fn register_index(&self) -> Option<u8> {
        match self {
            Op::MovRegImm { reg, .. }
            | Op::IncDecReg { reg, .. }
            | Op::PushReg { reg }
            | Op::PopReg { reg }
            | Op::XchgAccReg { reg } => Some(*reg),
            _ => None,
        }
    }
}

/// A fully parsed instruction: the operation plus every byte it was
/// decoded from, wrapped in fields whose concatenation covers the
/// footprint exactly.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ParsedInstruction {
    pub(crate) address: SegmentedAddress,
    pub(crate) op: Op,
    pub(crate) op_width: Width,
    pub(crate) addr_width: AddrWidth,
    pub(crate) seg_override: Option<SegReg>,
    pub(crate) rep: Option<RepKind>,
    pub(crate) prefix_fields: Vec<InstrField>,
    pub(crate) opcode: InstrField,
    pub(crate) modrm: Option<ModRmContext>,
    pub(crate) imm: Option<InstrField>,
    pub(crate) imm2: Option<InstrField>,
    pub(crate) len: u8,
}

impl ParsedInstruction {
    pub fn address(&self) -> SegmentedAddress {
        self.address
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Effective operand width (16-bit default, toggled by prefix 66).
    pub fn op_width(&self) -> Width {
        self.op_width
    }

    pub fn addr_width(&self) -> AddrWidth {
        self.addr_width
    }

    pub fn segment_override(&self) -> Option<SegReg> {
        self.seg_override
    }

    pub fn rep(&self) -> Option<RepKind> {
        self.rep
    }

    pub fn modrm(&self) -> Option<&ModRmContext> {
        self.modrm.as_ref()
    }

    pub fn imm(&self) -> Option<&InstrField> {
        self.imm.as_ref()
    }

    pub fn imm2(&self) -> Option<&InstrField> {
        self.imm2.as_ref()
    }

    /// Total encoded length in bytes.
    pub fn len(&self) -> u8 {
        self.len
    }

    /// The linear address just past this instruction.
    pub fn next_address(&self) -> SegmentedAddress {
        self.address.advanced(self.len as u16)
    }

    /// All fields in byte order: prefixes, opcode, ModR/M (+SIB +disp),
    /// immediates. Their footprints tile `[address, address+len)`.
    pub fn fields(&self) -> Vec<&InstrField> {
        let mut out: Vec<&InstrField> = self.prefix_fields.iter().collect();
        out.push(&self.opcode);
        if let Some(modrm) = &self.modrm {
            out.extend(modrm.fields());
        }
        out.extend(self.imm.iter());
        out.extend(self.imm2.iter());
        out
    }

    pub fn fields_mut(&mut self) -> Vec<&mut InstrField> {
        let mut out: Vec<&mut InstrField> = self.prefix_fields.iter_mut().collect();
        out.push(&mut self.opcode);
        if let Some(modrm) = &mut self.modrm {
            out.extend(modrm.fields_mut());
        }
        out.extend(self.imm.iter_mut());
        out.extend(self.imm2.iter_mut());
        out
    }

    /// The current SMC fingerprint (truncated at the first non-final
    /// field).
    pub fn signature(&self) -> Signature {
        Signature::from_fields(self.fields().into_iter())
    }

    /// Reconstructs the encoded bytes from the field footprints.
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for field in self.fields() {
            out.extend_from_slice(field.bytes());
        }
        out
    }

    // Capability probes over the operation and the footprint.

    pub fn has_modrm(&self) -> bool {
        self.modrm.is_some()
    }

    pub fn has_value_field(&self) -> bool {
        self.imm.is_some()
            || self.imm2.is_some()
            || self
                .modrm
                .as_ref()
                .is_some_and(|m| m.disp.is_some())
    }

    pub fn has_register_index(&self) -> bool {
        self.op.register_index().is_some()
    }

    pub fn is_string_op(&self) -> bool {
        self.op.is_string_op()
    }

    pub fn is_return(&self) -> bool {
        self.op.is_return()
    }

    pub fn can_cause_context_restore(&self) -> bool {
        self.op.can_cause_context_restore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alu_op_decoding() {
        assert_eq!(AluOp::from_index(0), AluOp::Add);
        assert_eq!(AluOp::from_index(7), AluOp::Cmp);
        assert!(!AluOp::Cmp.writes_back());
        assert!(AluOp::Sub.writes_back());
    }

    #[test]
    fn shl_alias() {
        assert_eq!(ShiftOp::from_index(4), ShiftOp::Shl);
        assert_eq!(ShiftOp::from_index(6), ShiftOp::Shl);
    }

    #[test]
    fn terminators() {
        assert!(Op::JmpShort.is_terminator());
        assert!(Op::RetInterrupt.is_terminator());
        assert!(Op::Int { vector: 3 }.is_terminator());
        assert!(!Op::Nop.is_terminator());
        assert!(!Op::Jcc { cond: Cond::E, near: false }.is_terminator());
    }

    #[test]
    fn context_restore_set() {
        assert!(Op::RetInterrupt.can_cause_context_restore());
        assert!(Op::Callback { index: 7 }.can_cause_context_restore());
        assert!(!Op::RetNear { pop: false }.can_cause_context_restore());
    }
}
