use std::collections::{HashMap, HashSet};

use crate::diag::{Code, Diagnostics};
use crate::ir::instruction::Operand;
use crate::ir::opcode::{OpCategory, Opcode};
use crate::ir::{implicitly_converts, Function, Instruction, Module, Reg};
use crate::types::TypeId;

/// Validates a parsed (or decoded) module: symbol resolution, control-flow
/// shape, operand arity and implicit-conversion rules. Reports everything
/// it finds and keeps going, so one run surfaces multiple problems.
pub fn analyze(module: &Module, diags: &mut Diagnostics) {
    let mut functions: HashMap<&str, &Function> = HashMap::new();
    for fun in &module.functions {
        if functions.insert(&fun.name, fun).is_some() {
            diags.error(
                Code::SemanticRedefined,
                format!("function `{}` is defined more than once", fun.name),
                None,
            );
        }
    }
    let mut globals: HashSet<&str> = HashSet::new();
    for global in &module.globals {
        if !globals.insert(&global.name) {
            diags.error(
                Code::SemanticRedefined,
                format!("global `{}` is defined more than once", global.name),
                None,
            );
        }
    }

    for fun in &module.functions {
        if fun.external {
            if !fun.blocks.is_empty() {
                diags.error(
                    Code::SemanticInvalidControl,
                    format!("external function `{}` must not have a body", fun.name),
                    None,
                );
            }
            continue;
        }
        analyze_function(module, fun, &functions, &globals, diags);
    }
}

fn analyze_function(
    module: &Module,
    fun: &Function,
    functions: &HashMap<&str, &Function>,
    globals: &HashSet<&str>,
    diags: &mut Diagnostics,
) {
    let mut labels: HashSet<&str> = HashSet::new();
    for block in &fun.blocks {
        if !labels.insert(&block.name) {
            diags.error(
                Code::SemanticRedefined,
                format!(
                    "block `{}` is defined more than once in function `{}`",
                    block.name, fun.name
                ),
                None,
            );
        }
    }

    if fun.entry().is_none() {
        diags.error(
            Code::SemanticInvalidControl,
            format!("function `{}` has no ENTRY block", fun.name),
            None,
        );
    }

    for block in &fun.blocks {
        if block.instructions.is_empty() {
            diags.error(
                Code::SemanticInvalidControl,
                format!(
                    "block `{}` in function `{}` is empty",
                    block.name, fun.name
                ),
                None,
            );
            continue;
        }
        if block.terminator().is_none() {
            diags.error(
                Code::SemanticInvalidControl,
                format!(
                    "block `{}` in function `{}` does not end with a terminator",
                    block.name, fun.name
                ),
                None,
            );
        }
        for insn in &block.instructions {
            check_instruction(module, fun, insn, &labels, functions, globals, diags);
        }
    }
}

fn check_register(fun: &Function, reg: Reg, what: &str, diags: &mut Diagnostics) {
    if reg.0 >= fun.register_count {
        diags.error(
            Code::SemanticInvalidOperand,
            format!(
                "{what} r{} exceeds the register count {} of function `{}`",
                reg.0, fun.register_count, fun.name
            ),
            None,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn check_instruction(
    module: &Module,
    fun: &Function,
    insn: &Instruction,
    labels: &HashSet<&str>,
    functions: &HashMap<&str, &Function>,
    globals: &HashSet<&str>,
    diags: &mut Diagnostics,
) {
    let count = insn.sources.len();
    if !insn.opcode.arity().accepts(count) {
        diags.error(
            Code::SemanticInvalidOperand,
            format!(
                "`{}` takes {:?} source operands, got {count}",
                insn.opcode.mnemonic(),
                insn.opcode.arity()
            ),
            None,
        );
    }

    if let Some(dest) = insn.dest {
        check_register(fun, dest, "destination register", diags);
    }
    for src in &insn.sources {
        match src {
            Operand::Register { index, .. } => {
                check_register(fun, *index, "register operand", diags)
            }
            Operand::Memory { base, index, .. } => {
                check_register(fun, *base, "memory base register", diags);
                if let Some(index) = index {
                    check_register(fun, *index, "memory index register", diags);
                }
            }
            Operand::Block { name } => {
                if !labels.contains(name.as_str()) {
                    diags.error(
                        Code::SemanticUndefined,
                        format!(
                            "undefined block label `{name}` in function `{}`",
                            fun.name
                        ),
                        None,
                    );
                }
            }
            Operand::Func { name } => {
                if !functions.contains_key(name.as_str()) {
                    diags.error(
                        Code::SemanticUndefined,
                        format!("call to undefined function `{name}`"),
                        None,
                    );
                }
            }
            Operand::Global { name } => {
                // a bare identifier may refer to a global or a function
                if !globals.contains(name.as_str()) && !functions.contains_key(name.as_str()) {
                    diags.error(
                        Code::SemanticUndefined,
                        format!("undefined symbol `{name}`"),
                        None,
                    );
                }
            }
            Operand::ImmInt { .. } | Operand::ImmFloat { .. } => {}
        }
    }

    match insn.opcode {
        Opcode::Br => check_branch(fun, insn, diags),
        Opcode::Brc => check_branch_cond(fun, insn, diags),
        Opcode::Call => check_call(fun, insn, functions, diags),
        Opcode::Ret => check_return(module, fun, insn, diags),
        _ => check_operand_types(module, fun, insn, diags),
    }
}

fn check_branch(fun: &Function, insn: &Instruction, diags: &mut Diagnostics) {
    match insn.sources.as_slice() {
        [Operand::Block { .. }] => {}
        [Operand::Register { .. }, Operand::Block { .. }, Operand::Block { .. }] => {}
        [_] | [_, _, _] => {
            diags.error(
                Code::SemanticInvalidControl,
                format!(
                    "malformed branch in function `{}`: conditional form is \
                     (condition register, then label, else label)",
                    fun.name
                ),
                None,
            );
        }
        // arity already reported
        _ => {}
    }
}

fn check_branch_cond(fun: &Function, insn: &Instruction, diags: &mut Diagnostics) {
    if insn.sources.len() < 2 {
        return; // arity already reported
    }
    let mut well_formed = matches!(insn.sources.first(), Some(Operand::Register { .. }));
    if insn.sources.len() == 3 {
        well_formed &= insn.sources[1..]
            .iter()
            .all(|src| matches!(src, Operand::Block { .. }));
    } else {
        // switch form: selector, default label, then value/label pairs;
        // two operands is the zero-case switch
        well_formed &= matches!(insn.sources.get(1), Some(Operand::Block { .. }));
        well_formed &= insn.sources.len() % 2 == 0;
        for (idx, src) in insn.sources.iter().enumerate().skip(2) {
            if idx % 2 == 0 {
                well_formed &= matches!(src, Operand::ImmInt { .. });
            } else {
                well_formed &= matches!(src, Operand::Block { .. });
            }
        }
    }
    if !well_formed {
        diags.error(
            Code::SemanticInvalidControl,
            format!("malformed conditional branch in function `{}`", fun.name),
            None,
        );
    }
}

fn check_call(
    fun: &Function,
    insn: &Instruction,
    functions: &HashMap<&str, &Function>,
    diags: &mut Diagnostics,
) {
    let Some(Operand::Func { name }) = insn.sources.first() else {
        diags.error(
            Code::SemanticInvalidControl,
            format!(
                "first call operand in function `{}` must be a function reference",
                fun.name
            ),
            None,
        );
        return;
    };
    let Some(callee) = functions.get(name.as_str()) else {
        return; // undefined, reported above
    };
    let args = insn.sources.len() - 1;
    let ok = if callee.variadic {
        args >= callee.params.len()
    } else {
        args == callee.params.len()
    };
    if !ok {
        diags.error(
            Code::SemanticInvalidOperand,
            format!(
                "call to `{name}` passes {args} arguments, expected {}{}",
                callee.params.len(),
                if callee.variadic { " or more" } else { "" }
            ),
            None,
        );
    }
}

fn check_return(module: &Module, fun: &Function, insn: &Instruction, diags: &mut Diagnostics) {
    match insn.sources.as_slice() {
        [] => {
            if fun.return_type != TypeId::VOID {
                diags.error(
                    Code::SemanticInvalidOperand,
                    format!(
                        "function `{}` returns {} but the return carries no value",
                        fun.name,
                        module.types.display(fun.return_type)
                    ),
                    None,
                );
            }
        }
        [value] => {
            let ty = value.ty();
            if ty != TypeId::VOID && !implicitly_converts(&module.types, ty, fun.return_type) {
                diags.error(
                    Code::SemanticInvalidOperand,
                    format!(
                        "returned value of type {} does not convert to {} in function `{}`",
                        module.types.display(ty),
                        module.types.display(fun.return_type),
                        fun.name
                    ),
                    None,
                );
            }
        }
        // arity already reported
        _ => {}
    }
}

/// Value operands of arithmetic-like instructions must convert to the
/// result type; only the lossless implicit conversions apply.
fn check_operand_types(module: &Module, fun: &Function, insn: &Instruction, diags: &mut Diagnostics) {
    let against = match insn.opcode.category() {
        OpCategory::Arithmetic | OpCategory::Bit | OpCategory::FloatingPoint => insn.result_type,
        OpCategory::Comparison => insn
            .sources
            .first()
            .map(Operand::ty)
            .unwrap_or(TypeId::VOID),
        _ => return,
    };
    if against == TypeId::VOID {
        return;
    }
    for src in &insn.sources {
        let ty = src.ty();
        if ty == TypeId::VOID {
            continue; // reference operand or unknown, already handled
        }
        if !implicitly_converts(&module.types, ty, against) {
            diags.error(
                Code::SemanticInvalidOperand,
                format!(
                    "operand of type {} does not convert to {} for `{}` in function `{}`",
                    module.types.display(ty),
                    module.types.display(against),
                    insn.opcode.mnemonic(),
                    fun.name
                ),
                None,
            );
        }
    }
}
