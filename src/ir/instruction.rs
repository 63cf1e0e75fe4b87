use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::flags_to_struct;
use crate::ir::opcode::Opcode;
use crate::types::TypeId;

/// Virtual register index, local to a function. The code generator maps it
/// to a physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Reg(pub u32);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Optimizer tag: the instruction stays in the stream but the code
/// generator emits nothing for it. Bit 7 is reserved in every qualifier
/// interpretation.
pub const FLAG_NOOP: u8 = 0x80;

/// Optimizer tag on `MOVI r, 0`: the generator may use the target's
/// preferred zero idiom instead of a move of an immediate zero.
pub const FLAG_ZERO_IDIOM: u8 = 0x40;

pub const ARITH_SIGNED: u8 = 0x01;
pub const ARITH_SATURATE: u8 = 0x02;
pub const ARITH_FLOAT: u8 = 0x04;
pub const ARITH_TRAP_OVERFLOW: u8 = 0x08;

flags_to_struct!(
    ArithFlags,
    u8,
    ARITH_SIGNED is_signed "Operands are interpreted as signed",
    ARITH_SATURATE is_saturating "Overflow clamps instead of wrapping",
    ARITH_FLOAT is_float "Integer opcode applied to float operands",
    ARITH_TRAP_OVERFLOW traps_on_overflow "Overflow raises a trap",
);

pub const MEM_VOLATILE: u8 = 0x01;
pub const MEM_ATOMIC: u8 = 0x02;

/// Memory qualifier byte: bits 0-1 are volatile/atomic, bits 4-6 carry the
/// access alignment as a power of two (0 = natural).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct MemFlags(u8);

impl MemFlags {
    pub fn from_raw(value: u8) -> anyhow::Result<Self> {
        if value & !(MEM_VOLATILE | MEM_ATOMIC | 0x70) != 0 {
            Err(anyhow::anyhow!("MemFlags with invalid bits {value:X}"))
        } else {
            Ok(Self(value))
        }
    }

    pub fn into_raw(self) -> u8 {
        self.0
    }

    pub fn is_volatile(self) -> bool {
        self.0 & MEM_VOLATILE != 0
    }

    pub fn is_atomic(self) -> bool {
        self.0 & MEM_ATOMIC != 0
    }

    /// Explicit access alignment in bytes, `None` for natural alignment.
    pub fn alignment(self) -> Option<u64> {
        match (self.0 >> 4) & 0x7 {
            0 => None,
            log2 => Some(1u64 << log2),
        }
    }
}

/// Branch condition selector, stored in the low nibble of the qualifier
/// byte of `BR`/`BRC`. Zero is the unconditional form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum BranchCond {
    Always = 0,
    Eq = 1,
    Ne = 2,
    Lt = 3,
    Le = 4,
    Gt = 5,
    Ge = 6,
    Carry = 7,
    NoCarry = 8,
    Overflow = 9,
    NoOverflow = 10,
    Sign = 11,
    NoSign = 12,
    Parity = 13,
    NoParity = 14,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct BranchFlags(u8);

impl BranchFlags {
    pub fn from_raw(value: u8) -> anyhow::Result<Self> {
        let _ = BranchCond::try_from(value & 0x0F)
            .map_err(|_| anyhow::anyhow!("BranchFlags with invalid condition {value:X}"))?;
        Ok(Self(value & 0x0F))
    }

    pub fn into_raw(self) -> u8 {
        self.0
    }

    pub fn cond(self) -> BranchCond {
        // from_raw guarantees the nibble decodes
        BranchCond::try_from(self.0 & 0x0F).unwrap_or(BranchCond::Always)
    }
}

/// A value an instruction consumes. Every operand knows the type it
/// denotes; reference operands (block, function, global) denote no value
/// and carry void.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    Register {
        index: Reg,
        ty: TypeId,
    },
    /// Sign-extended to 64 bits regardless of the denoted type.
    ImmInt {
        value: i64,
        ty: TypeId,
    },
    ImmFloat {
        value: f64,
        ty: TypeId,
    },
    Block {
        name: String,
    },
    Func {
        name: String,
    },
    Global {
        name: String,
    },
    Memory {
        base: Reg,
        offset: i32,
        index: Option<Reg>,
        /// 1, 2, 4 or 8.
        scale: u8,
        ty: TypeId,
    },
}

impl Operand {
    pub fn ty(&self) -> TypeId {
        match self {
            Operand::Register { ty, .. }
            | Operand::ImmInt { ty, .. }
            | Operand::ImmFloat { ty, .. }
            | Operand::Memory { ty, .. } => *ty,
            Operand::Block { .. } | Operand::Func { .. } | Operand::Global { .. } => TypeId::VOID,
        }
    }

    pub fn reg(index: u32, ty: TypeId) -> Self {
        Operand::Register {
            index: Reg(index),
            ty,
        }
    }

    pub fn imm(value: i64, ty: TypeId) -> Self {
        Operand::ImmInt { value, ty }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Qualifier byte, interpreted per opcode category; bit 7 is the no-op
    /// tag.
    pub flags: u8,
    pub dest: Option<Reg>,
    pub sources: Vec<Operand>,
    pub result_type: TypeId,
    /// Name used when rendering text; does not survive binary encoding.
    pub result_name: Option<String>,
}

impl Instruction {
    pub fn new(opcode: Opcode, result_type: TypeId) -> Self {
        Self {
            opcode,
            flags: 0,
            dest: None,
            sources: Vec::new(),
            result_type,
            result_name: None,
        }
    }

    pub fn with_dest(mut self, dest: Reg) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_sources(mut self, sources: Vec<Operand>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.result_name = Some(name.into());
        self
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator() && !self.is_noop()
    }

    pub fn is_noop(&self) -> bool {
        self.opcode == Opcode::Nop || self.flags & FLAG_NOOP != 0
    }

    /// Demotes the instruction to a tagged no-op in place.
    pub fn make_noop(&mut self) {
        self.opcode = Opcode::Nop;
        self.flags = FLAG_NOOP;
        self.dest = None;
        self.sources.clear();
        self.result_type = TypeId::VOID;
        self.result_name = None;
    }
}
