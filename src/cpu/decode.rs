//! Instruction decoder for the ND-100.
//!
//! Every instruction is one 16-bit word. The top five bits select one of 32
//! major opcodes. Memory reference instructions follow with three addressing
//! mode bits (`,X` bit 10, `I` bit 9, `,B` bit 8) and an 8-bit signed
//! displacement; the other groups subdivide the remaining eleven bits.
//! Register-to-register formats carry the source register in bits 3-5 and
//! the destination in bits 0-2.

use serde::{Deserialize, Serialize};

use crate::cpu::registers::Reg;
use crate::word::{sext6, ShiftKind};

/// Memory reference operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemOp {
    Stz,
    Sta,
    Stt,
    Stx,
    Std,
    Ldd,
    Stf,
    Ldf,
    Min,
    Lda,
    Ldt,
    Ldx,
    Add,
    Sub,
    And,
    Ora,
    Fad,
    Fsb,
    Fmu,
    Fdv,
    Mpy,
    Jmp,
    Jpl,
}

/// Memory reference opcodes indexed by major opcode; CJP (22) is its own group.
const MEM_OPS: [Option<MemOp>; 24] = [
    Some(MemOp::Stz),
    Some(MemOp::Sta),
    Some(MemOp::Stt),
    Some(MemOp::Stx),
    Some(MemOp::Std),
    Some(MemOp::Ldd),
    Some(MemOp::Stf),
    Some(MemOp::Ldf),
    Some(MemOp::Min),
    Some(MemOp::Lda),
    Some(MemOp::Ldt),
    Some(MemOp::Ldx),
    Some(MemOp::Add),
    Some(MemOp::Sub),
    Some(MemOp::And),
    Some(MemOp::Ora),
    Some(MemOp::Fad),
    Some(MemOp::Fsb),
    Some(MemOp::Fmu),
    Some(MemOp::Fdv),
    Some(MemOp::Mpy),
    Some(MemOp::Jmp),
    None,
    Some(MemOp::Jpl),
];

impl MemOp {
    fn major(self) -> u16 {
        MEM_OPS
            .iter()
            .position(|op| *op == Some(self))
            .unwrap_or_default() as u16
    }
}

/// Addressing mode bits of a memory reference instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddrMode {
    /// `,X`: add X to the address.
    pub indexed: bool,
    /// `I`: one level of indirection.
    pub indirect: bool,
    /// `,B`: relative to B instead of P; the operand uses the alternate page table.
    pub base: bool,
}

impl AddrMode {
    /// P-relative, no modifiers.
    pub const DIRECT: AddrMode = AddrMode {
        indexed: false,
        indirect: false,
        base: false,
    };

    /// Decode bits 8-10.
    pub fn from_bits(bits: u16) -> Self {
        Self {
            indexed: bits & 4 != 0,
            indirect: bits & 2 != 0,
            base: bits & 1 != 0,
        }
    }

    /// Encode into bits 8-10.
    pub fn to_bits(self) -> u16 {
        (u16::from(self.indexed) << 2) | (u16::from(self.indirect) << 1) | u16::from(self.base)
    }
}

/// Conditional jump conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpCond {
    /// A >= 0.
    Jap,
    /// A < 0.
    Jan,
    /// A == 0.
    Jaz,
    /// A != 0.
    Jaf,
    /// X += 1, then X >= 0.
    Jpc,
    /// X += 1, then X < 0.
    Jnc,
    /// X == 0.
    Jxz,
    /// X < 0.
    Jxn,
}

const JUMP_CONDS: [JumpCond; 8] = [
    JumpCond::Jap,
    JumpCond::Jan,
    JumpCond::Jaz,
    JumpCond::Jaf,
    JumpCond::Jpc,
    JumpCond::Jnc,
    JumpCond::Jxz,
    JumpCond::Jxn,
];

/// Register compare conditions of SKP, on `dr` against `sr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipCond {
    Eql,
    Geq,
    Gre,
    Mgre,
    Ueq,
    Lss,
    Lst,
    Mlst,
}

const SKIP_CONDS: [SkipCond; 8] = [
    SkipCond::Eql,
    SkipCond::Geq,
    SkipCond::Gre,
    SkipCond::Mgre,
    SkipCond::Ueq,
    SkipCond::Lss,
    SkipCond::Lst,
    SkipCond::Mlst,
];

/// Register operation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RopFunc {
    Swap,
    And,
    Exor,
    Or,
    /// RADD, with add-one and add-old-carry modifiers.
    Add { ad1: bool, adc: bool },
}

/// Interrupt and paging system control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    Iof,
    Ion,
    Pof,
    Piof,
    Sex,
    Rex,
    Pon,
    Pion,
}

/// Internal register transfer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalOp {
    /// A := internal register.
    Tra,
    /// Internal register := A.
    Trr,
    /// Internal register &= !A.
    Mcl,
    /// Internal register |= A.
    Mst,
}

/// Shift register selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftTarget {
    T,
    D,
    A,
    /// The 32-bit AD pair.
    Ad,
}

/// Argument instruction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgTarget {
    B,
    A,
    T,
    X,
}

impl ArgTarget {
    /// The register written.
    pub fn reg(self) -> Reg {
        match self {
            ArgTarget::B => Reg::B,
            ArgTarget::A => Reg::A,
            ArgTarget::T => Reg::T,
            ArgTarget::X => Reg::X,
        }
    }
}

/// Bit operation functions; K is the one-bit accumulator in STS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BopFunc {
    SetZero,
    SetOne,
    SetComplement,
    SetFromK,
    SkipZero,
    SkipOne,
    SkipComplementK,
    SkipEqualK,
    StoreComplementK,
    StoreK,
    LoadComplement,
    LoadK,
    AndComplement,
    And,
    OrComplement,
    Or,
}

const BOP_FUNCS: [BopFunc; 16] = [
    BopFunc::SetZero,
    BopFunc::SetOne,
    BopFunc::SetComplement,
    BopFunc::SetFromK,
    BopFunc::SkipZero,
    BopFunc::SkipOne,
    BopFunc::SkipComplementK,
    BopFunc::SkipEqualK,
    BopFunc::StoreComplementK,
    BopFunc::StoreK,
    BopFunc::LoadComplement,
    BopFunc::LoadK,
    BopFunc::AndComplement,
    BopFunc::And,
    BopFunc::OrComplement,
    BopFunc::Or,
];

/// Decoded ND-100 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Memory reference: STZ..MPY, JMP, JPL.
    Memory { op: MemOp, mode: AddrMode, disp: i8 },
    /// Conditional jump, P-relative.
    CondJump { cond: JumpCond, disp: i8 },
    /// Skip next instruction if `dr cond sr`.
    Skip { cond: SkipCond, dr: Reg, sr: Reg },
    /// Execute the instruction held in a register.
    Exr { sr: Reg },
    /// Fill a byte field with the low byte of A.
    Bfill,
    /// Move bytes.
    Movb,
    /// Move bytes, refusing forbidden overlap.
    Movbf,
    /// Load byte: A := byte (T + X/2).
    Lbyt,
    /// Store byte: byte (T + X/2) := A.
    Sbyt,
    /// X := (A - 1) * 3.
    Mix3,
    /// AD := dr * sr.
    Rmpy { dr: Reg, sr: Reg },
    /// A := AD / sr, D := remainder.
    Rdiv { sr: Reg },
    /// Dequeue the interrupting device of a level into A.
    Ident { level: u8 },
    /// Register operation.
    Rop {
        func: RopFunc,
        cm1: bool,
        cld: bool,
        dr: Reg,
        sr: Reg,
    },
    /// Internal register transfer.
    Internal { op: InternalOp, reg: u8 },
    /// Interrupt and paging system control.
    Control(Control),
    /// IOX with the device address in T.
    Ioxt,
    /// T := physical word at (A, D).
    Exam,
    /// Physical word at (A, D) := T.
    Depo,
    /// Give up the current level.
    Wait { code: u8 },
    /// Integer in A to float in TAD.
    Nlz { scale: i8 },
    /// Float in TAD to integer in A.
    Dnz { scale: i8 },
    /// Store a level's register block at X.
    Srb { level: u8 },
    /// Load a level's register block from X.
    Lrb { level: u8 },
    /// Monitor call.
    Mon { number: u8 },
    /// Write A into another level's register.
    Irw { level: u8, reg: Reg },
    /// Read another level's register into A.
    Irr { level: u8, reg: Reg },
    /// Shift a register or the AD pair.
    Shift {
        target: ShiftTarget,
        kind: ShiftKind,
        count: i8,
    },
    /// Input/output transfer.
    Iox { device: u16 },
    /// Set or add a signed argument.
    Arg {
        target: ArgTarget,
        add: bool,
        value: i8,
    },
    /// Bit operation on one bit of a register (field 0 is STS).
    Bop { func: BopFunc, bit: u8, dr: Reg },
    /// A defined ND-100 instruction this core does not provide.
    Unsupported(u16),
    /// An undefined encoding.
    Illegal(u16),
}

impl Instruction {
    /// True for the memory reference group.
    pub fn is_memory_reference(&self) -> bool {
        matches!(self, Instruction::Memory { .. })
    }

    /// True for instructions that trap in rings 0 and 1 while paging is on.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Instruction::Internal { .. }
                | Instruction::Control(_)
                | Instruction::Iox { .. }
                | Instruction::Ioxt
                | Instruction::Exam
                | Instruction::Depo
                | Instruction::Wait { .. }
                | Instruction::Srb { .. }
                | Instruction::Lrb { .. }
                | Instruction::Irr { .. }
                | Instruction::Irw { .. }
                | Instruction::Ident { .. }
        )
    }
}

/// Major opcode numbers (top five bits) of the non-memory groups.
mod major {
    pub const CJP: u16 = 22;
    pub const SKP: u16 = 24;
    pub const ROP: u16 = 25;
    pub const MIS: u16 = 26;
    pub const SHT: u16 = 27;
    pub const UNUSED: u16 = 28;
    pub const IOX: u16 = 29;
    pub const ARG: u16 = 30;
    pub const BOP: u16 = 31;
}

/// Opcode of the skip-group encoding that has no defined function.
const UNDEFINED_SKIP: u16 = 0o142700;

/// Decode one instruction word.
pub fn decode(word: u16) -> Instruction {
    let major = word >> 11;
    let disp = word as u8 as i8;

    match major {
        major::CJP => Instruction::CondJump {
            cond: JUMP_CONDS[usize::from((word >> 8) & 7)],
            disp,
        },
        major::SKP => decode_skip_group(word),
        major::ROP => decode_rop(word),
        major::MIS => decode_misc(word),
        major::SHT => Instruction::Shift {
            target: match (word >> 7) & 3 {
                0 => ShiftTarget::T,
                1 => ShiftTarget::D,
                2 => ShiftTarget::A,
                _ => ShiftTarget::Ad,
            },
            kind: ShiftKind::from_bits(word >> 9),
            count: sext6(word),
        },
        major::UNUSED => Instruction::Illegal(word),
        major::IOX => Instruction::Iox {
            device: word & 0o3777,
        },
        major::ARG => Instruction::Arg {
            target: match (word >> 8) & 3 {
                0 => ArgTarget::B,
                1 => ArgTarget::A,
                2 => ArgTarget::T,
                _ => ArgTarget::X,
            },
            add: word & 0o2000 != 0,
            value: disp,
        },
        major::BOP => Instruction::Bop {
            func: BOP_FUNCS[usize::from((word >> 7) & 0xf)],
            bit: ((word >> 3) & 0xf) as u8,
            dr: Reg::from_field(word),
        },
        _ => match MEM_OPS.get(usize::from(major)).copied().flatten() {
            Some(op) => Instruction::Memory {
                op,
                mode: AddrMode::from_bits(word >> 8),
                disp,
            },
            None => Instruction::Illegal(word),
        },
    }
}

fn decode_skip_group(word: u16) -> Instruction {
    if word & 0o300 == 0 {
        return Instruction::Skip {
            cond: SKIP_CONDS[usize::from((word >> 8) & 7)],
            dr: Reg::from_field(word),
            sr: Reg::from_field(word >> 3),
        };
    }

    match word {
        0o140130 => return Instruction::Bfill,
        0o140131 => return Instruction::Movb,
        0o140132 => return Instruction::Movbf,
        0o142200 => return Instruction::Lbyt,
        0o142600 => return Instruction::Sbyt,
        0o143200 => return Instruction::Mix3,
        0o143604 => return Instruction::Ident { level: 10 },
        0o143611 => return Instruction::Ident { level: 11 },
        0o143622 => return Instruction::Ident { level: 12 },
        0o143643 => return Instruction::Ident { level: 13 },
        UNDEFINED_SKIP => return Instruction::Illegal(word),
        _ => {}
    }

    match word & 0o177707 {
        0o140600 => {
            return Instruction::Exr {
                sr: Reg::from_field(word >> 3),
            }
        }
        0o141600 => {
            return Instruction::Rdiv {
                sr: Reg::from_field(word >> 3),
            }
        }
        _ => {}
    }

    match word & 0o177700 {
        0o141200 => Instruction::Rmpy {
            dr: Reg::from_field(word),
            sr: Reg::from_field(word >> 3),
        },
        0o140300 | 0o143300 => Instruction::Unsupported(word),
        _ => Instruction::Illegal(word),
    }
}

fn decode_rop(word: u16) -> Instruction {
    let func = if word & 0o2000 != 0 {
        RopFunc::Add {
            ad1: word & 0o400 != 0,
            adc: word & 0o1000 != 0,
        }
    } else {
        match (word >> 8) & 3 {
            0 => RopFunc::Swap,
            1 => RopFunc::And,
            2 => RopFunc::Exor,
            _ => RopFunc::Or,
        }
    };
    Instruction::Rop {
        func,
        cm1: word & 0o200 != 0,
        cld: word & 0o100 != 0,
        dr: Reg::from_field(word),
        sr: Reg::from_field(word >> 3),
    }
}

fn decode_misc(word: u16) -> Instruction {
    let level = ((word >> 3) & 0xf) as u8;
    let low = word as u8;

    match word & 0o177700 {
        0o150000 => return internal(InternalOp::Tra, word),
        0o150100 => return internal(InternalOp::Trr, word),
        0o150200 => return internal(InternalOp::Mcl, word),
        0o150300 => return internal(InternalOp::Mst, word),
        0o150400 => {
            return match word & 0o77 {
                0o01 => Instruction::Control(Control::Iof),
                0o02 => Instruction::Control(Control::Ion),
                0o04 => Instruction::Control(Control::Pof),
                0o05 => Instruction::Control(Control::Piof),
                0o06 => Instruction::Control(Control::Sex),
                0o07 => Instruction::Control(Control::Rex),
                0o10 => Instruction::Control(Control::Pon),
                0o12 => Instruction::Control(Control::Pion),
                0o15 => Instruction::Ioxt,
                0o16 => Instruction::Exam,
                0o17 => Instruction::Depo,
                _ => Instruction::Illegal(word),
            }
        }
        _ => {}
    }

    match word & 0o177400 {
        0o151000 => return Instruction::Wait { code: low },
        0o151400 => return Instruction::Nlz { scale: low as i8 },
        0o152000 => return Instruction::Dnz { scale: low as i8 },
        0o153000 => return Instruction::Mon { number: low },
        _ => {}
    }

    match word & 0o177600 {
        0o153400 => {
            return Instruction::Irw {
                level,
                reg: Reg::from_field(word),
            }
        }
        0o153600 => {
            return Instruction::Irr {
                level,
                reg: Reg::from_field(word),
            }
        }
        _ => {}
    }

    match word & 0o177607 {
        0o152402 => Instruction::Srb { level },
        0o152600 => Instruction::Lrb { level },
        _ => Instruction::Illegal(word),
    }
}

fn internal(op: InternalOp, word: u16) -> Instruction {
    Instruction::Internal {
        op,
        reg: (word & 0o17) as u8,
    }
}

fn field(reg: Reg) -> u16 {
    reg.index() as u16
}

/// Encode an instruction back to its word.
pub fn encode(instr: &Instruction) -> u16 {
    let byte = |v: i8| u16::from(v as u8);
    match *instr {
        Instruction::Memory { op, mode, disp } => {
            (op.major() << 11) | (mode.to_bits() << 8) | byte(disp)
        }
        Instruction::CondJump { cond, disp } => {
            let c = JUMP_CONDS.iter().position(|c| *c == cond).unwrap_or_default() as u16;
            (major::CJP << 11) | (c << 8) | byte(disp)
        }
        Instruction::Skip { cond, dr, sr } => {
            let c = SKIP_CONDS.iter().position(|c| *c == cond).unwrap_or_default() as u16;
            0o140000 | (c << 8) | (field(sr) << 3) | field(dr)
        }
        Instruction::Exr { sr } => 0o140600 | (field(sr) << 3),
        Instruction::Bfill => 0o140130,
        Instruction::Movb => 0o140131,
        Instruction::Movbf => 0o140132,
        Instruction::Lbyt => 0o142200,
        Instruction::Sbyt => 0o142600,
        Instruction::Mix3 => 0o143200,
        Instruction::Rmpy { dr, sr } => 0o141200 | (field(sr) << 3) | field(dr),
        Instruction::Rdiv { sr } => 0o141600 | (field(sr) << 3),
        Instruction::Ident { level } => match level {
            10 => 0o143604,
            11 => 0o143611,
            12 => 0o143622,
            _ => 0o143643,
        },
        Instruction::Rop {
            func,
            cm1,
            cld,
            dr,
            sr,
        } => {
            let f = match func {
                RopFunc::Swap => 0,
                RopFunc::And => 0o400,
                RopFunc::Exor => 0o1000,
                RopFunc::Or => 0o1400,
                RopFunc::Add { ad1, adc } => 0o2000 | (u16::from(ad1) << 8) | (u16::from(adc) << 9),
            };
            0o144000
                | f
                | (u16::from(cm1) << 7)
                | (u16::from(cld) << 6)
                | (field(sr) << 3)
                | field(dr)
        }
        Instruction::Internal { op, reg } => {
            let base = match op {
                InternalOp::Tra => 0o150000,
                InternalOp::Trr => 0o150100,
                InternalOp::Mcl => 0o150200,
                InternalOp::Mst => 0o150300,
            };
            base | u16::from(reg & 0o17)
        }
        Instruction::Control(c) => {
            0o150400
                | match c {
                    Control::Iof => 0o01,
                    Control::Ion => 0o02,
                    Control::Pof => 0o04,
                    Control::Piof => 0o05,
                    Control::Sex => 0o06,
                    Control::Rex => 0o07,
                    Control::Pon => 0o10,
                    Control::Pion => 0o12,
                }
        }
        Instruction::Ioxt => 0o150415,
        Instruction::Exam => 0o150416,
        Instruction::Depo => 0o150417,
        Instruction::Wait { code } => 0o151000 | u16::from(code),
        Instruction::Nlz { scale } => 0o151400 | byte(scale),
        Instruction::Dnz { scale } => 0o152000 | byte(scale),
        Instruction::Srb { level } => 0o152402 | (u16::from(level & 0xf) << 3),
        Instruction::Lrb { level } => 0o152600 | (u16::from(level & 0xf) << 3),
        Instruction::Mon { number } => 0o153000 | u16::from(number),
        Instruction::Irw { level, reg } => 0o153400 | (u16::from(level & 0xf) << 3) | field(reg),
        Instruction::Irr { level, reg } => 0o153600 | (u16::from(level & 0xf) << 3) | field(reg),
        Instruction::Shift {
            target,
            kind,
            count,
        } => {
            let t = match target {
                ShiftTarget::T => 0,
                ShiftTarget::D => 1,
                ShiftTarget::A => 2,
                ShiftTarget::Ad => 3,
            };
            0o154000 | (kind.to_bits() << 9) | (t << 7) | (u16::from(count as u8) & 0o77)
        }
        Instruction::Iox { device } => 0o164000 | (device & 0o3777),
        Instruction::Arg { target, add, value } => {
            let t = match target {
                ArgTarget::B => 0,
                ArgTarget::A => 1,
                ArgTarget::T => 2,
                ArgTarget::X => 3,
            };
            0o170000 | (u16::from(add) << 10) | (t << 8) | byte(value)
        }
        Instruction::Bop { func, bit, dr } => {
            let f = BOP_FUNCS.iter().position(|f| *f == func).unwrap_or_default() as u16;
            0o174000 | (f << 7) | (u16::from(bit & 0xf) << 3) | field(dr)
        }
        Instruction::Unsupported(word) | Instruction::Illegal(word) => word,
    }
}
