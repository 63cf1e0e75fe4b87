//! x86-64 instruction selection. REX and ModR/M composition happens only
//! in [`encode_rex`] and [`encode_modrm`]; every lowering builds on those
//! two helpers, following the Intel SDM encodings.

use std::collections::HashMap;
use std::fmt::Write;

use crate::codegen::CodegenError;
use crate::ir::instruction::{Instruction, Operand, Reg, FLAG_ZERO_IDIOM};
use crate::ir::opcode::Opcode;
use crate::ir::Function;
use crate::target::TargetConfig;
use crate::types::TypeId;

/// Physical registers in x86-64 encoding order.
const REG_NAMES_64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const REG_NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
    "r12d", "r13d", "r14d", "r15d",
];

/// Allocation order. `rsp` and `rbp` are reserved for the frame.
const ALLOCATABLE: [u8; 14] = [0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Return-value register of the calling convention.
const RAX: u8 = 0;

/// REX prefix: `0100WRXB`.
pub fn encode_rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b)
}

/// ModR/M byte: mod in bits 6-7, reg in 3-5, r/m in 0-2. High register
/// bits travel in the REX prefix.
pub fn encode_modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Round-robin virtual-to-physical mapping, assigned on first use and
/// reset per function. The optimizer bounds the register count, so the
/// simple scheme suffices.
struct RegAlloc {
    map: HashMap<u32, u8>,
    next: usize,
}

impl RegAlloc {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 0,
        }
    }

    fn phys(&mut self, vreg: Reg) -> u8 {
        if let Some(phys) = self.map.get(&vreg.0) {
            return *phys;
        }
        let phys = ALLOCATABLE[self.next % ALLOCATABLE.len()];
        self.next += 1;
        self.map.insert(vreg.0, phys);
        phys
    }
}

struct Emitter {
    bytes: Vec<u8>,
    listing: Option<String>,
}

impl Emitter {
    fn new(with_listing: bool) -> Self {
        Self {
            bytes: Vec::new(),
            listing: with_listing.then(String::new),
        }
    }

    fn emit(&mut self, bytes: &[u8], text: std::fmt::Arguments<'_>) {
        self.bytes.extend_from_slice(bytes);
        if let Some(listing) = self.listing.as_mut() {
            let _ = writeln!(listing, "    {text}");
        }
    }

    fn label(&mut self, text: std::fmt::Arguments<'_>) {
        if let Some(listing) = self.listing.as_mut() {
            let _ = writeln!(listing, "{text}");
        }
    }
}

/// Lowers one function body. On error nothing is committed to the module
/// buffer; the staged bytes are dropped with the emitter.
pub fn lower_function(
    fun: &Function,
    target: &TargetConfig,
    with_listing: bool,
) -> Result<(Vec<u8>, Option<String>), CodegenError> {
    if fun.register_count > target.resources.general_purpose_regs {
        return Err(CodegenError::BadMapping(format!(
            "{} virtual registers exceed the pool of {}",
            fun.register_count, target.resources.general_purpose_regs
        )));
    }

    let mut alloc = RegAlloc::new();
    let mut out = Emitter::new(with_listing);

    out.label(format_args!("{}:", fun.name));
    out.emit(&[0x55], format_args!("push rbp"));
    out.emit(
        &[encode_rex(true, false, false, false), 0x89, encode_modrm(0b11, 4, 5)],
        format_args!("mov rbp, rsp"),
    );

    for block in &fun.blocks {
        out.label(format_args!(".{}_{}:", fun.name, block.name));
        for insn in &block.instructions {
            lower_instruction(insn, &mut alloc, &mut out)?;
        }
    }

    // a fallthrough end needs the frame torn down; skip when the last
    // instruction already returned
    if out.bytes.last() != Some(&0xC3) {
        out.emit(&[0x5D], format_args!("pop rbp"));
        out.emit(&[0xC3], format_args!("ret"));
    }
    Ok((out.bytes, out.listing))
}

fn unsupported_operand(insn: &Instruction, which: &str) -> CodegenError {
    CodegenError::Unsupported(format!(
        "`{}` cannot lower its {which} operand kind",
        insn.opcode.mnemonic()
    ))
}

fn unsupported_imm(value: i64) -> CodegenError {
    CodegenError::Unsupported(format!("immediate {value} does not fit 32 bits"))
}

fn lower_instruction(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    if insn.flags & crate::ir::instruction::FLAG_NOOP != 0 {
        // optimizer-tagged no-op: emits nothing
        return Ok(());
    }
    match insn.opcode {
        Opcode::Nop => {
            out.emit(&[0x90], format_args!("nop"));
            Ok(())
        }
        Opcode::Ret => lower_ret(insn, alloc, out),
        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {
            lower_binary(insn, alloc, out)
        }
        Opcode::Neg | Opcode::Not | Opcode::Inc | Opcode::Dec => lower_unary(insn, alloc, out),
        Opcode::Mov => lower_mov(insn, alloc, out),
        Opcode::Movi => lower_movi(insn, alloc, out),
        Opcode::Push => lower_push(insn, alloc, out),
        Opcode::Pop => lower_pop(insn, alloc, out),
        other => Err(CodegenError::Unsupported(format!(
            "no x86-64 lowering for `{}`",
            other.mnemonic()
        ))),
    }
}

fn dest_of(insn: &Instruction, alloc: &mut RegAlloc) -> Result<u8, CodegenError> {
    insn.dest
        .map(|reg| alloc.phys(reg))
        .ok_or_else(|| {
            CodegenError::InvalidIr(format!(
                "`{}` needs a destination register",
                insn.opcode.mnemonic()
            ))
        })
}

/// `mov r64, r64` (89 /r).
fn emit_mov_rr(out: &mut Emitter, dst: u8, src: u8) {
    out.emit(
        &[
            encode_rex(true, src >= 8, false, dst >= 8),
            0x89,
            encode_modrm(0b11, src, dst),
        ],
        format_args!("mov {}, {}", REG_NAMES_64[dst as usize], REG_NAMES_64[src as usize]),
    );
}

/// The caller reads the result from `rax`, so a returned value is moved
/// there before the single-byte `ret`.
fn lower_ret(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    match insn.sources.first() {
        Some(Operand::Register { index, .. }) => {
            let src = alloc.phys(*index);
            if src != RAX {
                emit_mov_rr(out, RAX, src);
            }
        }
        Some(Operand::ImmInt { value, .. }) => emit_mov_imm(out, RAX, *value, true)?,
        Some(_) => return Err(unsupported_operand(insn, "returned")),
        None => {}
    }
    out.emit(&[0xC3], format_args!("ret"));
    Ok(())
}

/// `push r64` (50+rd) or `push imm32` (68 id).
fn lower_push(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    match insn.sources.as_slice() {
        [Operand::Register { index, .. }] => {
            let src = alloc.phys(*index);
            let mut bytes = Vec::with_capacity(2);
            if src >= 8 {
                bytes.push(encode_rex(false, false, false, true));
            }
            bytes.push(0x50 + (src & 0x7));
            out.emit(&bytes, format_args!("push {}", REG_NAMES_64[src as usize]));
            Ok(())
        }
        [Operand::ImmInt { value, .. }] => {
            let imm = i32::try_from(*value).map_err(|_| unsupported_imm(*value))?;
            let mut bytes = vec![0x68];
            bytes.extend_from_slice(&imm.to_le_bytes());
            out.emit(&bytes, format_args!("push {imm}"));
            Ok(())
        }
        _ => Err(unsupported_operand(insn, "source")),
    }
}

/// `pop r64` (58+rd).
fn lower_pop(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    let dest = dest_of(insn, alloc)?;
    let mut bytes = Vec::with_capacity(2);
    if dest >= 8 {
        bytes.push(encode_rex(false, false, false, true));
    }
    bytes.push(0x58 + (dest & 0x7));
    out.emit(&bytes, format_args!("pop {}", REG_NAMES_64[dest as usize]));
    Ok(())
}

/// Single-source group-three/five ops: `neg`/`not` (F7 /3, /2) and
/// `inc`/`dec` (FF /0, /1). The source is copied into the destination
/// first when they differ.
fn lower_unary(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    let [src] = insn.sources.as_slice() else {
        return Err(CodegenError::InvalidIr(format!(
            "`{}` takes exactly one source operand",
            insn.opcode.mnemonic()
        )));
    };
    let src_phys = match src {
        Operand::Register { index, .. } => alloc.phys(*index),
        _ => return Err(unsupported_operand(insn, "source")),
    };
    let dest = dest_of(insn, alloc)?;
    if src_phys != dest {
        emit_mov_rr(out, dest, src_phys);
    }
    let (opcode, ext, name) = match insn.opcode {
        Opcode::Neg => (0xF7u8, 3u8, "neg"),
        Opcode::Not => (0xF7u8, 2u8, "not"),
        Opcode::Inc => (0xFFu8, 0u8, "inc"),
        Opcode::Dec => (0xFFu8, 1u8, "dec"),
        _ => unreachable!("caller matched the unary group"),
    };
    out.emit(
        &[
            encode_rex(true, false, false, dest >= 8),
            opcode,
            encode_modrm(0b11, ext, dest),
        ],
        format_args!("{name} {}", REG_NAMES_64[dest as usize]),
    );
    Ok(())
}

/// Three-operand arithmetic over two-operand x86: copy the first source
/// into the destination when they differ, then fold the second source in.
fn lower_binary(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    let [s1, s2] = insn.sources.as_slice() else {
        return Err(CodegenError::InvalidIr(format!(
            "`{}` takes exactly two source operands",
            insn.opcode.mnemonic()
        )));
    };

    // sources are read before the destination is written, so they claim
    // their physical registers first
    let s1_phys = match s1 {
        Operand::Register { index, .. } => Some(alloc.phys(*index)),
        Operand::ImmInt { .. } => None,
        _ => return Err(unsupported_operand(insn, "first source")),
    };
    let s2_phys = match s2 {
        Operand::Register { index, .. } => Some(alloc.phys(*index)),
        Operand::ImmInt { .. } => None,
        _ => return Err(unsupported_operand(insn, "second source")),
    };
    let dest = dest_of(insn, alloc)?;

    match (s1, s1_phys) {
        (_, Some(src)) => {
            if src != dest {
                emit_mov_rr(out, dest, src);
            }
        }
        (Operand::ImmInt { value, .. }, None) => emit_mov_imm(out, dest, *value, true)?,
        _ => unreachable!("first source was classified above"),
    }

    let (rr_opcode, imm_ext, name) = match insn.opcode {
        Opcode::Add => (0x01u8, 0u8, "add"),
        Opcode::Sub => (0x29u8, 5u8, "sub"),
        Opcode::And => (0x21u8, 4u8, "and"),
        Opcode::Or => (0x09u8, 1u8, "or"),
        Opcode::Xor => (0x31u8, 6u8, "xor"),
        _ => unreachable!("caller matched the binary group"),
    };
    match (s2, s2_phys) {
        (_, Some(src)) => {
            out.emit(
                &[
                    encode_rex(true, src >= 8, false, dest >= 8),
                    rr_opcode,
                    encode_modrm(0b11, src, dest),
                ],
                format_args!(
                    "{name} {}, {}",
                    REG_NAMES_64[dest as usize], REG_NAMES_64[src as usize]
                ),
            );
        }
        (Operand::ImmInt { value, .. }, None) => {
            let imm = i32::try_from(*value).map_err(|_| {
                unsupported_imm(*value)
            })?;
            let mut bytes = vec![
                encode_rex(true, false, false, dest >= 8),
                0x81,
                encode_modrm(0b11, imm_ext, dest),
            ];
            bytes.extend_from_slice(&imm.to_le_bytes());
            out.emit(
                &bytes,
                format_args!("{name} {}, {imm}", REG_NAMES_64[dest as usize]),
            );
        }
        _ => {
            return Err(unsupported_operand(insn, "second source"));
        }
    }
    Ok(())
}

/// Register-to-register move; an immediate source degrades to `MOVI`.
fn lower_mov(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    match insn.sources.as_slice() {
        [Operand::Register { index, .. }] => {
            let src = alloc.phys(*index);
            let dest = dest_of(insn, alloc)?;
            if src != dest {
                emit_mov_rr(out, dest, src);
            }
            Ok(())
        }
        [Operand::ImmInt { value, .. }] => {
            let dest = dest_of(insn, alloc)?;
            emit_mov_imm(out, dest, *value, true)
        }
        _ => Err(unsupported_operand(insn, "source")),
    }
}

/// `MOVI dest, imm` (HOIL `LOAD_I32`). A 32-bit result uses the short
/// `mov r32, imm32` form, which zero-extends; 64-bit results take the
/// REX.W sign-extended form. The zero-idiom tag emits `xor r32, r32`.
fn lower_movi(
    insn: &Instruction,
    alloc: &mut RegAlloc,
    out: &mut Emitter,
) -> Result<(), CodegenError> {
    let dest = dest_of(insn, alloc)?;
    let [Operand::ImmInt { value, .. }] = insn.sources.as_slice() else {
        return Err(unsupported_operand(insn, "source"));
    };
    if insn.flags & FLAG_ZERO_IDIOM != 0 && *value == 0 {
        let mut bytes = Vec::with_capacity(3);
        if dest >= 8 {
            bytes.push(encode_rex(false, true, false, true));
        }
        bytes.push(0x31);
        bytes.push(encode_modrm(0b11, dest, dest));
        out.emit(
            &bytes,
            format_args!(
                "xor {}, {}",
                REG_NAMES_32[dest as usize], REG_NAMES_32[dest as usize]
            ),
        );
        return Ok(());
    }
    let wide = insn.result_type == TypeId::I64 || insn.result_type == TypeId::U64;
    emit_mov_imm(out, dest, *value, wide)
}

/// `mov r, imm32` (C7 /0). The wide form sign-extends the immediate to 64
/// bits; the narrow form zero-extends, which is what a 32-bit result
/// wants.
fn emit_mov_imm(out: &mut Emitter, dest: u8, value: i64, wide: bool) -> Result<(), CodegenError> {
    let imm = i32::try_from(value).map_err(|_| unsupported_imm(value))?;
    let mut bytes = Vec::with_capacity(7);
    if wide {
        bytes.push(encode_rex(true, false, false, dest >= 8));
    } else if dest >= 8 {
        bytes.push(encode_rex(false, false, false, true));
    }
    bytes.push(0xC7);
    bytes.push(encode_modrm(0b11, 0, dest));
    bytes.extend_from_slice(&imm.to_le_bytes());
    let name = if wide {
        REG_NAMES_64[dest as usize]
    } else {
        REG_NAMES_32[dest as usize]
    };
    out.emit(&bytes, format_args!("mov {name}, {imm}"));
    Ok(())
}
