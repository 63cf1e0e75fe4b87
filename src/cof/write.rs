use std::collections::HashMap;

use crate::cof::{
    CofError, OperandTag, SectionKind, TypeCategory, COF_MAGIC, DEST_NONE, FUNC_EXTERNAL,
    FUNC_VARIADIC, GLOBAL_CONSTANT, GLOBAL_EXTERNAL, GLOBAL_HAS_INIT, HEADER_SIZE, INDEX_NONE,
    SECTION_ENTRY_SIZE,
};
use crate::ir::instruction::{Instruction, Operand};
use crate::ir::Module;
use crate::types::Type;
use crate::COF_VERSION;

/// String interner building the metadata section in place. Offsets are
/// stable because the buffer is append-only; the module name is seeded at
/// offset 0 before anything else is written.
struct StringTable {
    buf: Vec<u8>,
    map: HashMap<String, u32>,
}

impl StringTable {
    fn new(module_name: &str) -> Self {
        let mut table = Self {
            buf: Vec::new(),
            map: HashMap::new(),
        };
        // infallible: offset 0 is always in range
        let _ = table.intern(module_name);
        table
    }

    fn intern(&mut self, text: &str) -> Result<u32, CofError> {
        if let Some(offset) = self.map.get(text) {
            return Ok(*offset);
        }
        let offset = u32::try_from(self.buf.len())
            .ok()
            .filter(|off| *off <= 0x00FF_FFFF)
            .ok_or_else(|| {
                CofError::Unsupported("string table exceeds the 24-bit offset range".into())
            })?;
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
        self.map.insert(text.to_owned(), offset);
        Ok(offset)
    }

    /// Appends raw bytes (the target block) without registering a string.
    fn push_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u24(buf: &mut Vec<u8>, value: u32) -> Result<(), CofError> {
    if value > 0x00FF_FFFF {
        return Err(CofError::Unsupported(format!(
            "value {value:#x} does not fit the 24-bit operand field"
        )));
    }
    buf.extend_from_slice(&value.to_le_bytes()[..3]);
    Ok(())
}

fn push_i24(buf: &mut Vec<u8>, value: i64) -> Result<(), CofError> {
    if !(-0x0080_0000..0x0080_0000).contains(&value) {
        // wider immediates are reserved for a future operand kind
        return Err(CofError::Unsupported(format!(
            "immediate {value} does not fit the 24-bit sign-extended form"
        )));
    }
    buf.extend_from_slice(&value.to_le_bytes()[..3]);
    Ok(())
}

/// Encodes a module into COF bytes. The module is expected to be
/// semantically valid; structural problems the encoder cannot represent
/// (wide immediates, float immediates, out-of-range indices) fail with
/// [`CofError::Unsupported`].
pub fn write_module(module: &Module) -> Result<Vec<u8>, CofError> {
    let mut strings = StringTable::new(&module.name);

    // target-requirement block, directly after the module name
    let req = &module.requirements;
    let mut block = Vec::new();
    push_u16(&mut block, req.required.len() as u16);
    push_u16(&mut block, req.preferred.len() as u16);
    block.push(u8::from(req.device_class.is_some()));
    for feature in req.required.iter().chain(&req.preferred) {
        block.extend_from_slice(feature.as_bytes());
        block.push(0);
    }
    if let Some(device) = &req.device_class {
        block.extend_from_slice(device.as_bytes());
        block.push(0);
    }
    strings.push_raw(&block);

    let type_buf = write_types(module, &mut strings)?;

    let mut const_buf = Vec::new();
    let mut global_buf = Vec::new();
    push_u32(&mut global_buf, module.globals.len() as u32);
    for global in &module.globals {
        let name_off = strings.intern(&global.name)?;
        push_u32(&mut global_buf, name_off);
        push_u32(&mut global_buf, global.ty.into_raw());
        let mut flags = 0u8;
        if global.is_constant {
            flags |= GLOBAL_CONSTANT;
        }
        if global.is_external {
            flags |= GLOBAL_EXTERNAL;
        }
        if global.init.is_some() {
            flags |= GLOBAL_HAS_INIT;
        }
        global_buf.push(flags);
        push_u32(&mut global_buf, global.align);
        match &global.init {
            Some(init) => {
                push_u32(&mut global_buf, const_buf.len() as u32);
                push_u32(&mut global_buf, init.len() as u32);
                const_buf.extend_from_slice(init);
            }
            None => {
                push_u32(&mut global_buf, 0);
                push_u32(&mut global_buf, 0);
            }
        }
    }

    let mut code_buf = Vec::new();
    let mut fn_buf = Vec::new();
    push_u32(&mut fn_buf, module.functions.len() as u32);
    for fun in &module.functions {
        let name_off = strings.intern(&fun.name)?;
        push_u32(&mut fn_buf, name_off);
        push_u32(&mut fn_buf, fun.return_type.into_raw());
        let mut flags = 0u8;
        if fun.variadic {
            flags |= FUNC_VARIADIC;
        }
        if fun.external {
            flags |= FUNC_EXTERNAL;
        }
        fn_buf.push(flags);
        push_u32(&mut fn_buf, fun.register_count);
        push_u32(&mut fn_buf, fun.params.len() as u32);
        for param in &fun.params {
            let param_off = strings.intern(&param.name)?;
            push_u32(&mut fn_buf, param_off);
            push_u32(&mut fn_buf, param.ty.into_raw());
        }
        push_u32(&mut fn_buf, fun.blocks.len() as u32);
        for block in &fun.blocks {
            let label_off = strings.intern(&block.name)?;
            let code_off = code_buf.len() as u32;
            for insn in &block.instructions {
                write_instruction(&mut code_buf, insn, &mut strings)?;
            }
            push_u32(&mut fn_buf, label_off);
            push_u32(&mut fn_buf, code_off);
            push_u32(&mut fn_buf, code_buf.len() as u32 - code_off);
            push_u32(&mut fn_buf, block.instructions.len() as u32);
        }
    }

    let sections: [(SectionKind, &[u8]); 6] = [
        (SectionKind::Type, &type_buf),
        (SectionKind::Function, &fn_buf),
        (SectionKind::Global, &global_buf),
        (SectionKind::Constant, &const_buf),
        (SectionKind::Code, &code_buf),
        (SectionKind::Metadata, &strings.buf),
    ];

    let mut out = Vec::new();
    out.extend_from_slice(&COF_MAGIC);
    out.push(COF_VERSION.0);
    out.push(COF_VERSION.1);
    out.push(COF_VERSION.2);
    out.push(0); // reserved
    push_u32(&mut out, sections.len() as u32);
    out.extend_from_slice(&[0; 4]); // pad the header to 16 bytes

    let mut offset = HEADER_SIZE + SECTION_ENTRY_SIZE * sections.len() as u32;
    for (kind, data) in &sections {
        push_u32(&mut out, u32::from(*kind));
        push_u32(&mut out, offset);
        push_u32(&mut out, data.len() as u32);
        offset += data.len() as u32;
    }
    for (_, data) in &sections {
        out.extend_from_slice(data);
    }
    Ok(out)
}

fn write_types(module: &Module, strings: &mut StringTable) -> Result<Vec<u8>, CofError> {
    let mut buf = Vec::new();
    push_u32(&mut buf, module.types.composite_count());
    for (id, ty) in module.types.composites() {
        push_u32(&mut buf, id.into_raw());
        match ty {
            Type::Pointer { base, space, quals } => {
                buf.push(TypeCategory::Pointer.into());
                push_u32(&mut buf, base.into_raw());
                buf.push(*space);
                buf.push(quals.into_raw());
            }
            Type::Vector { elem, lanes } => {
                buf.push(TypeCategory::Vector.into());
                push_u32(&mut buf, elem.into_raw());
                push_u32(&mut buf, *lanes);
            }
            Type::Array { elem, len } => {
                buf.push(TypeCategory::Array.into());
                push_u32(&mut buf, elem.into_raw());
                push_u32(&mut buf, *len);
            }
            Type::Struct { name, fields, .. } => {
                buf.push(TypeCategory::Struct.into());
                let name_off = strings.intern(name)?;
                push_u32(&mut buf, name_off);
                push_u32(&mut buf, fields.len() as u32);
                for field in fields {
                    let field_off = strings.intern(&field.name)?;
                    push_u32(&mut buf, field_off);
                    push_u32(&mut buf, field.ty.into_raw());
                }
            }
            Type::Function {
                ret,
                params,
                variadic,
            } => {
                buf.push(TypeCategory::Function.into());
                push_u32(&mut buf, ret.into_raw());
                buf.push(u8::from(*variadic));
                push_u32(&mut buf, params.len() as u32);
                for param in params {
                    push_u32(&mut buf, param.into_raw());
                }
            }
            // primitives have fixed ids and no table entry
            Type::Void | Type::Bool | Type::Int { .. } | Type::Float { .. } => {
                return Err(CofError::Corrupt(
                    "primitive type registered as composite".into(),
                ))
            }
        }
    }
    Ok(buf)
}

/// One instruction: `{opcode, flags, operand count, dest register}` header
/// bytes, the result type id, then tag-prefixed source operands.
fn write_instruction(
    buf: &mut Vec<u8>,
    insn: &Instruction,
    strings: &mut StringTable,
) -> Result<(), CofError> {
    buf.push(insn.opcode.into());
    buf.push(insn.flags);
    let count = u8::try_from(insn.sources.len())
        .map_err(|_| CofError::Unsupported("more than 255 source operands".into()))?;
    buf.push(count);
    match insn.dest {
        Some(reg) => {
            let byte = u8::try_from(reg.0)
                .ok()
                .filter(|byte| *byte != DEST_NONE)
                .ok_or_else(|| {
                    CofError::Unsupported(format!(
                        "destination register r{} does not fit the encoding",
                        reg.0
                    ))
                })?;
            buf.push(byte);
        }
        None => buf.push(DEST_NONE),
    }
    push_u32(buf, insn.result_type.into_raw());

    for src in &insn.sources {
        match src {
            Operand::Register { index, .. } => {
                buf.push(OperandTag::Register.into());
                push_u24(buf, index.0)?;
            }
            Operand::ImmInt { value, .. } => {
                buf.push(OperandTag::Immediate.into());
                push_i24(buf, *value)?;
            }
            Operand::ImmFloat { .. } => {
                // only the 24-bit integer immediate form exists in v1
                return Err(CofError::Unsupported(
                    "float immediates have no v1 binary encoding".into(),
                ));
            }
            Operand::Block { name } => {
                buf.push(OperandTag::Block.into());
                let off = strings.intern(name)?;
                push_u24(buf, off)?;
            }
            Operand::Func { name } => {
                buf.push(OperandTag::Function.into());
                let off = strings.intern(name)?;
                push_u24(buf, off)?;
            }
            Operand::Global { name } => {
                buf.push(OperandTag::Global.into());
                let off = strings.intern(name)?;
                push_u24(buf, off)?;
            }
            Operand::Memory {
                base,
                offset,
                index,
                scale,
                ..
            } => {
                buf.push(OperandTag::Memory.into());
                let base = u8::try_from(base.0).map_err(|_| {
                    CofError::Unsupported(format!(
                        "memory base register r{} does not fit the encoding",
                        base.0
                    ))
                })?;
                buf.push(base);
                buf.extend_from_slice(&offset.to_le_bytes());
                match index {
                    Some(reg) => {
                        let byte = u8::try_from(reg.0)
                            .ok()
                            .filter(|byte| *byte != INDEX_NONE)
                            .ok_or_else(|| {
                                CofError::Unsupported(format!(
                                    "memory index register r{} does not fit the encoding",
                                    reg.0
                                ))
                            })?;
                        buf.push(byte);
                    }
                    None => buf.push(INDEX_NONE),
                }
                buf.push(*scale);
            }
        }
    }
    Ok(())
}
