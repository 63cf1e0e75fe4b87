use std::collections::HashMap;
use std::io::{BufRead, Read, Seek, SeekFrom};

use crate::cof::{
    insn, CofError, Metadata, SectionKind, TypeCategory, COF_MAGIC, FUNC_EXTERNAL, FUNC_VARIADIC,
    GLOBAL_CONSTANT, GLOBAL_EXTERNAL, GLOBAL_HAS_INIT,
};
use crate::diag::Diagnostics;
use crate::ir::{Block, Function, Global, Module, Parameter};
use crate::reader::{CoilBufRead, CoilRead};
use crate::types::{PtrQualifiers, TypeId};
use crate::COF_VERSION;

/// Decodes a COF container into a module. Every failure is recorded as a
/// binary-category diagnostic and `None` is returned; a partially decoded
/// module is never handed out.
pub fn read_module<I: BufRead + Seek>(mut input: I, diags: &mut Diagnostics) -> Option<Module> {
    match read_module_inner(&mut input) {
        Ok(module) => Some(module),
        Err(err) => {
            diags.report(err.into_diagnostic());
            None
        }
    }
}

struct SectionTable {
    sections: HashMap<SectionKind, (u32, u32)>,
}

impl SectionTable {
    fn load<I: BufRead + Seek>(
        &self,
        input: &mut I,
        kind: SectionKind,
    ) -> Result<Vec<u8>, CofError> {
        let Some((offset, size)) = self.sections.get(&kind).copied() else {
            return Ok(Vec::new());
        };
        input.seek(SeekFrom::Start(offset.into()))?;
        let mut data = Vec::with_capacity(size as usize);
        let read = input.take(size.into()).read_to_end(&mut data)?;
        if read != size as usize {
            return Err(CofError::Corrupt(format!(
                "section {kind:?} is truncated: expected {size} bytes, got {read}"
            )));
        }
        Ok(data)
    }
}

fn read_module_inner<I: BufRead + Seek>(input: &mut I) -> Result<Module, CofError> {
    let file_len = input.seek(SeekFrom::End(0))?;
    input.seek(SeekFrom::Start(0))?;

    let mut magic = [0u8; 4];
    input
        .read_exact(&mut magic)
        .map_err(|_| CofError::InvalidFormat("file is smaller than the magic".into()))?;
    if magic != COF_MAGIC {
        return Err(CofError::InvalidFormat(format!(
            "bad magic {magic:02x?}, expected \"COIL\""
        )));
    }
    let major = input.read_u8()?;
    let minor = input.read_u8()?;
    let patch = input.read_u8()?;
    let reserved = input.read_u8()?;
    if major != COF_VERSION.0 {
        return Err(CofError::UnsupportedVersion(format!(
            "{major}.{minor}.{patch}"
        )));
    }
    #[cfg(feature = "restrictive")]
    if reserved != 0 {
        return Err(CofError::Corrupt("reserved header byte is not zero".into()));
    }
    #[cfg(not(feature = "restrictive"))]
    let _ = reserved;
    let section_count = input.read_u32()?;
    let mut padding = [0u8; 4];
    input.read_exact(&mut padding)?;
    #[cfg(feature = "restrictive")]
    if padding != [0; 4] {
        return Err(CofError::Corrupt("header padding is not zero".into()));
    }
    if section_count > 64 {
        return Err(CofError::Corrupt(format!(
            "unreasonable section count {section_count}"
        )));
    }

    let mut sections = HashMap::new();
    for _ in 0..section_count {
        let (kind_raw, offset, size): (u32, u32, u32) = bincode::deserialize_from(&mut *input)
            .map_err(|err| CofError::Corrupt(format!("bad section table entry: {err}")))?;
        let kind = SectionKind::try_from(kind_raw)
            .map_err(|_| CofError::Corrupt(format!("unknown section type {kind_raw}")))?;
        if kind == SectionKind::Header {
            return Err(CofError::Corrupt("header listed in the section table".into()));
        }
        if u64::from(offset) + u64::from(size) > file_len {
            return Err(CofError::Corrupt(format!(
                "section {kind:?} extends past the end of the file"
            )));
        }
        if sections.insert(kind, (offset, size)).is_some() {
            return Err(CofError::Corrupt(format!("duplicate section {kind:?}")));
        }
    }
    let table = SectionTable { sections };

    if !table.sections.contains_key(&SectionKind::Metadata) {
        return Err(CofError::MissingSection("metadata".into()));
    }
    let metadata = Metadata::new(table.load(input, SectionKind::Metadata)?);
    let module_name = metadata.string_at(0)?;

    let mut module = Module::new(module_name.clone());
    read_requirements(&metadata, &module_name, &mut module)?;
    read_types(&table.load(input, SectionKind::Type)?, &metadata, &mut module)?;

    let const_data = table.load(input, SectionKind::Constant)?;
    read_globals(
        &table.load(input, SectionKind::Global)?,
        &metadata,
        &const_data,
        &mut module,
    )?;

    let code_data = table.load(input, SectionKind::Code)?;
    read_functions(
        &table.load(input, SectionKind::Function)?,
        &metadata,
        &code_data,
        &mut module,
    )?;

    Ok(module)
}

/// The target block sits directly after the module name in the metadata
/// section.
fn read_requirements(
    metadata: &Metadata,
    module_name: &str,
    module: &mut Module,
) -> Result<(), CofError> {
    let start = module_name.len() + 1;
    let Some(mut cursor) = metadata.as_bytes().get(start..) else {
        return Err(CofError::Corrupt("metadata section has no target block".into()));
    };
    let required_count = cursor.read_u16()?;
    let preferred_count = cursor.read_u16()?;
    let has_device = cursor.read_u8()?;
    for _ in 0..required_count {
        let name = cursor.read_c_string_raw()?;
        module
            .requirements
            .required
            .push(String::from_utf8_lossy(&name).into_owned());
    }
    for _ in 0..preferred_count {
        let name = cursor.read_c_string_raw()?;
        module
            .requirements
            .preferred
            .push(String::from_utf8_lossy(&name).into_owned());
    }
    if has_device != 0 {
        let device = cursor.read_c_string_raw()?;
        module.requirements.device_class = Some(String::from_utf8_lossy(&device).into_owned());
    }
    Ok(())
}

/// Rebuilds the composite part of the type registry. Entries were written
/// in id order and interning is deterministic, so re-interning must
/// reproduce every recorded id.
fn read_types(data: &[u8], metadata: &Metadata, module: &mut Module) -> Result<(), CofError> {
    if data.is_empty() {
        return Ok(());
    }
    let mut cursor = data;
    let count = cursor.read_u32()?;
    let mut scratch = Diagnostics::new();
    for _ in 0..count {
        let recorded = TypeId::from_raw(cursor.read_u32()?);
        let category_raw = cursor.read_u8()?;
        let category = TypeCategory::try_from(category_raw)
            .map_err(|_| CofError::Corrupt(format!("unknown type category {category_raw}")))?;
        let id = match category {
            TypeCategory::Pointer => {
                let base = TypeId::from_raw(cursor.read_u32()?);
                let space = cursor.read_u8()?;
                let quals = PtrQualifiers::from_raw(cursor.read_u8()?)
                    .map_err(|err| CofError::Corrupt(err.to_string()))?;
                module.types.pointer_to(base, space, quals)
            }
            TypeCategory::Vector => {
                let elem = TypeId::from_raw(cursor.read_u32()?);
                let lanes = cursor.read_u32()?;
                module.types.vector_of(elem, lanes, &mut scratch)
            }
            TypeCategory::Array => {
                let elem = TypeId::from_raw(cursor.read_u32()?);
                let len = cursor.read_u32()?;
                module.types.array_of(elem, len)
            }
            TypeCategory::Struct => {
                let name = metadata.string_at(cursor.read_u32()?)?;
                let field_count = cursor.read_u32()?;
                let mut fields = Vec::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    let field_name = metadata.string_at(cursor.read_u32()?)?;
                    let ty = TypeId::from_raw(cursor.read_u32()?);
                    fields.push((field_name, ty));
                }
                let id = module.types.struct_of(name.clone(), fields, &mut scratch);
                if id != TypeId::VOID {
                    module.types.register_named(name, id, &mut scratch);
                }
                id
            }
            TypeCategory::Function => {
                let ret = TypeId::from_raw(cursor.read_u32()?);
                let variadic = cursor.read_u8()? != 0;
                let param_count = cursor.read_u32()?;
                let mut params = Vec::with_capacity(param_count as usize);
                for _ in 0..param_count {
                    params.push(TypeId::from_raw(cursor.read_u32()?));
                }
                module.types.function_of(ret, params, variadic)
            }
        };
        if scratch.had_error() || id != recorded {
            return Err(CofError::Corrupt(format!(
                "type table entry {:#x} did not rebuild",
                recorded.into_raw()
            )));
        }
    }
    Ok(())
}

fn read_globals(
    data: &[u8],
    metadata: &Metadata,
    const_data: &[u8],
    module: &mut Module,
) -> Result<(), CofError> {
    if data.is_empty() {
        return Ok(());
    }
    let mut cursor = data;
    let count = cursor.read_u32()?;
    for _ in 0..count {
        let name = metadata.string_at(cursor.read_u32()?)?;
        let ty = TypeId::from_raw(cursor.read_u32()?);
        let flags = cursor.read_u8()?;
        if flags & !(GLOBAL_CONSTANT | GLOBAL_EXTERNAL | GLOBAL_HAS_INIT) != 0 {
            return Err(CofError::Corrupt(format!(
                "global `{name}` carries unknown flags {flags:#04x}"
            )));
        }
        let align = cursor.read_u32()?;
        let init_off = cursor.read_u32()? as usize;
        let init_len = cursor.read_u32()? as usize;
        let init = if flags & GLOBAL_HAS_INIT != 0 {
            let Some(bytes) = const_data.get(init_off..init_off + init_len) else {
                return Err(CofError::Corrupt(format!(
                    "initializer of global `{name}` is outside the constant section"
                )));
            };
            Some(bytes.to_vec())
        } else {
            None
        };
        module.globals.push(Global {
            name,
            ty,
            is_constant: flags & GLOBAL_CONSTANT != 0,
            is_external: flags & GLOBAL_EXTERNAL != 0,
            init,
            align,
        });
    }
    Ok(())
}

fn read_functions(
    data: &[u8],
    metadata: &Metadata,
    code_data: &[u8],
    module: &mut Module,
) -> Result<(), CofError> {
    if data.is_empty() {
        return Ok(());
    }
    let mut cursor = data;
    let count = cursor.read_u32()?;
    for _ in 0..count {
        let name = metadata.string_at(cursor.read_u32()?)?;
        let return_type = TypeId::from_raw(cursor.read_u32()?);
        let flags = cursor.read_u8()?;
        if flags & !(FUNC_VARIADIC | FUNC_EXTERNAL) != 0 {
            return Err(CofError::Corrupt(format!(
                "function `{name}` carries unknown flags {flags:#04x}"
            )));
        }
        let register_count = cursor.read_u32()?;
        let param_count = cursor.read_u32()?;
        let mut fun = Function::new(name, return_type);
        fun.variadic = flags & FUNC_VARIADIC != 0;
        fun.external = flags & FUNC_EXTERNAL != 0;
        fun.register_count = register_count;
        for _ in 0..param_count {
            let param_name = metadata.string_at(cursor.read_u32()?)?;
            let ty = TypeId::from_raw(cursor.read_u32()?);
            fun.params.push(Parameter {
                name: param_name,
                ty,
            });
        }
        let block_count = cursor.read_u32()?;
        for _ in 0..block_count {
            let label = metadata.string_at(cursor.read_u32()?)?;
            let code_off = cursor.read_u32()? as usize;
            let code_len = cursor.read_u32()? as usize;
            let insn_count = cursor.read_u32()?;
            let Some(stream) = code_data.get(code_off..code_off + code_len) else {
                return Err(CofError::Corrupt(format!(
                    "block `{label}` of function `{}` points outside the code section",
                    fun.name
                )));
            };
            let mut block = Block::new(label);
            let mut insn_cursor = stream;
            for _ in 0..insn_count {
                block.push(insn::decode_instruction(&mut insn_cursor, metadata)?);
            }
            if !insn_cursor.is_empty() {
                return Err(CofError::Corrupt(format!(
                    "trailing bytes after the instructions of block `{}`",
                    block.name
                )));
            }
            fun.blocks.push(block);
        }
        module.functions.push(fun);
    }
    Ok(())
}
