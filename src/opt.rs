//! Semantic-preserving IR rewrites between validation and code
//! generation. The optimizer owns the module it transforms and hands it
//! back; no other pass mutates a module after this one ran.

use serde::Serialize;

use crate::diag::{Code, Diagnostics};
use crate::ir::instruction::{Instruction, Operand, FLAG_NOOP, FLAG_ZERO_IDIOM};
use crate::ir::opcode::Opcode;
use crate::ir::{Block, Module};
use crate::target::TargetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum OptLevel {
    None,
    Basic,
    Normal,
    Aggressive,
}

impl OptLevel {
    pub fn from_cli(level: u8) -> Option<OptLevel> {
        Some(match level {
            0 => OptLevel::None,
            1 => OptLevel::Basic,
            2 => OptLevel::Normal,
            3 => OptLevel::Aggressive,
            _ => return None,
        })
    }
}

/// Runs the optimization pipeline. Every pass is idempotent and the fixed
/// point loop is bounded at two iterations, so the whole pipeline is
/// idempotent as well.
pub fn optimize(
    mut module: Module,
    level: OptLevel,
    target: &TargetConfig,
    diags: &mut Diagnostics,
) -> Module {
    check_register_pressure(&module, target, diags);
    if level < OptLevel::Basic {
        return module;
    }
    for fun in &mut module.functions {
        for block in &mut fun.blocks {
            for _ in 0..2 {
                if !peephole(block) {
                    break;
                }
            }
            if level >= OptLevel::Aggressive {
                sink_noops(block);
            }
        }
    }
    module
}

/// Spilling is out of scope: a function must fit the target's register
/// pool or assembly is refused before any byte is emitted.
fn check_register_pressure(module: &Module, target: &TargetConfig, diags: &mut Diagnostics) {
    for fun in &module.functions {
        if fun.external {
            continue;
        }
        if fun.register_count > target.resources.general_purpose_regs {
            diags.error(
                Code::AssemblerBadMapping,
                format!(
                    "function `{}` uses {} virtual registers but the target has {}",
                    fun.name, fun.register_count, target.resources.general_purpose_regs
                ),
                None,
            );
        }
    }
}

/// One local rewrite sweep over a block. Returns true when anything
/// changed.
fn peephole(block: &mut Block) -> bool {
    let mut changed = false;
    for i in 0..block.instructions.len() {
        if is_add_zero(&block.instructions[i]) {
            block.instructions[i].make_noop();
            changed = true;
            continue;
        }
        if is_zero_load(&block.instructions[i]) {
            block.instructions[i].flags |= FLAG_ZERO_IDIOM;
            changed = true;
            continue;
        }
        if i > 0 && is_mov_swap_pair(&block.instructions[i - 1], &block.instructions[i]) {
            block.instructions[i].make_noop();
            changed = true;
        }
    }
    changed
}

/// `ADD r, r, 0` computes nothing.
fn is_add_zero(insn: &Instruction) -> bool {
    if insn.opcode != Opcode::Add || insn.is_noop() {
        return false;
    }
    let Some(dest) = insn.dest else { return false };
    matches!(
        insn.sources.as_slice(),
        [
            Operand::Register { index, .. },
            Operand::ImmInt { value: 0, .. },
        ] if *index == dest
    )
}

/// `MOVI r, 0` is rewritten to the target's zero idiom (`xor r, r` on
/// x86-64); the tag tells the generator which form to emit.
fn is_zero_load(insn: &Instruction) -> bool {
    insn.opcode == Opcode::Movi
        && insn.flags & (FLAG_ZERO_IDIOM | FLAG_NOOP) == 0
        && matches!(insn.sources.as_slice(), [Operand::ImmInt { value: 0, .. }])
}

/// `MOV a, b; MOV b, a` — the second move restores what was already there.
fn is_mov_swap_pair(first: &Instruction, second: &Instruction) -> bool {
    if first.opcode != Opcode::Mov || second.opcode != Opcode::Mov {
        return false;
    }
    if first.is_noop() || second.is_noop() {
        return false;
    }
    let (Some(a), Some(b)) = (first.dest, second.dest) else {
        return false;
    };
    let first_src = matches!(
        first.sources.as_slice(),
        [Operand::Register { index, .. }] if *index == b
    );
    let second_src = matches!(
        second.sources.as_slice(),
        [Operand::Register { index, .. }] if *index == a
    );
    first_src && second_src
}

/// The only instruction reordering in v1: tagged no-ops drift down to just
/// before the block terminator. Nothing moves across the terminator.
fn sink_noops(block: &mut Block) {
    let Some(last) = block.instructions.last() else {
        return;
    };
    if !last.is_terminator() {
        return;
    }
    let Some(terminator) = block.instructions.pop() else {
        return;
    };
    let (live, noops): (Vec<_>, Vec<_>) = block
        .instructions
        .drain(..)
        .partition(|insn| !insn.is_noop());
    block.instructions.extend(live);
    block.instructions.extend(noops);
    block.instructions.push(terminator);
}
