//! Canonical text rendering of a module. The output is valid HOIL and is
//! deterministic for structurally equal modules, which makes it the
//! round-trip comparison oracle for the binary codec.

use std::fmt::Write;

use crate::ir::instruction::{Instruction, Operand};
use crate::ir::{Block, Function, Global, Module};
use crate::types::TypeId;

pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "MODULE \"{}\";", module.name);

    let req = &module.requirements;
    if !req.required.is_empty() || !req.preferred.is_empty() || req.device_class.is_some() {
        let mut line = String::from("TARGET {");
        if !req.required.is_empty() {
            line.push_str(" REQUIRED ");
            line.push_str(&quoted_list(&req.required));
            line.push(';');
        }
        if !req.preferred.is_empty() {
            line.push_str(" PREFERRED ");
            line.push_str(&quoted_list(&req.preferred));
            line.push(';');
        }
        if let Some(device) = &req.device_class {
            let _ = write!(line, " DEVICE \"{device}\";");
        }
        line.push_str(" }");
        out.push('\n');
        out.push_str(&line);
        out.push('\n');
    }

    let named = module.types.named_types();
    if !named.is_empty() {
        out.push('\n');
        for (name, id) in named {
            let Some(crate::types::Type::Struct { fields, .. }) = module.types.get(id) else {
                continue;
            };
            let mut line = format!("TYPE {name} = {{ ");
            for (i, field) in fields.iter().enumerate() {
                if i != 0 {
                    line.push_str(", ");
                }
                let _ = write!(line, "{}: {}", field.name, module.types.display(field.ty));
            }
            line.push_str(" };");
            out.push_str(&line);
            out.push('\n');
        }
    }

    if !module.globals.is_empty() {
        out.push('\n');
        for global in &module.globals {
            print_global(&mut out, module, global);
        }
    }

    for fun in &module.functions {
        out.push('\n');
        print_function(&mut out, module, fun);
    }
    out
}

fn quoted_list(items: &[String]) -> String {
    let mut text = String::new();
    for (i, item) in items.iter().enumerate() {
        if i != 0 {
            text.push_str(", ");
        }
        let _ = write!(text, "\"{item}\"");
    }
    text
}

fn print_global(out: &mut String, module: &Module, global: &Global) {
    let keyword = if global.is_constant { "CONSTANT" } else { "GLOBAL" };
    if global.is_external {
        let _ = write!(out, "EXTERN {keyword} ");
    } else {
        let _ = write!(out, "{keyword} ");
    }
    let _ = write!(out, "{}: {}", global.name, module.types.display(global.ty));
    if let Some(init) = &global.init {
        out.push_str(" = { ");
        for (i, byte) in init.iter().enumerate() {
            if i != 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{byte:#04x}");
        }
        out.push_str(" }");
    }
    if global.align != 0 {
        let _ = write!(out, " ALIGN {}", global.align);
    }
    out.push_str(";\n");
}

fn print_function(out: &mut String, module: &Module, fun: &Function) {
    if fun.external {
        out.push_str("EXTERN ");
    }
    let _ = write!(out, "FUNCTION {}(", fun.name);
    for (i, param) in fun.params.iter().enumerate() {
        if i != 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}: {}", param.name, module.types.display(param.ty));
    }
    if fun.variadic {
        if !fun.params.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }
    let _ = write!(out, ") -> {}", module.types.display(fun.return_type));
    if fun.external {
        out.push_str(";\n");
        return;
    }
    out.push_str(" {\n");
    for block in &fun.blocks {
        print_block(out, module, block);
    }
    out.push_str("}\n");
}

fn print_block(out: &mut String, module: &Module, block: &Block) {
    let _ = writeln!(out, "{}:", block.name);
    for insn in &block.instructions {
        print_instruction(out, module, insn);
    }
}

fn print_instruction(out: &mut String, module: &Module, insn: &Instruction) {
    out.push_str("    ");
    if let Some(dest) = insn.dest {
        match &insn.result_name {
            Some(name) => {
                let _ = write!(out, "{name} = ");
            }
            None => {
                let _ = write!(out, "{dest} = ");
            }
        }
    }
    out.push_str(insn.opcode.mnemonic());
    for (i, src) in insn.sources.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        print_operand(out, src);
    }
    if insn.dest.is_some() && insn.result_type != TypeId::VOID {
        let _ = write!(out, " : {}", module.types.display(insn.result_type));
    }
    out.push_str(";\n");
}

fn print_operand(out: &mut String, operand: &Operand) {
    match operand {
        Operand::Register { index, .. } => {
            let _ = write!(out, "{index}");
        }
        Operand::ImmInt { value, .. } => {
            let _ = write!(out, "{value}");
        }
        Operand::ImmFloat { value, .. } => {
            let _ = write!(out, "{value:?}");
        }
        Operand::Block { name } | Operand::Func { name } | Operand::Global { name } => {
            out.push_str(name);
        }
        Operand::Memory {
            base,
            offset,
            index,
            scale,
            ..
        } => {
            let _ = write!(out, "[{base}");
            if *offset != 0 || index.is_some() {
                if *offset >= 0 {
                    let _ = write!(out, " + {offset}");
                } else {
                    let _ = write!(out, " - {}", offset.unsigned_abs());
                }
            }
            if let Some(index) = index {
                let _ = write!(out, ", {index}, {scale}");
            }
            out.push(']');
        }
    }
}
