//! Stateless decoder for one binary instruction. Used by the section
//! reader; rejects unknown opcodes and operand counts that disagree with
//! the opcode's arity contract.

use std::io::Read;

use crate::cof::{CofError, Metadata, OperandTag, DEST_NONE, INDEX_NONE};
use crate::ir::instruction::{Instruction, Operand, Reg};
use crate::ir::opcode::Opcode;
use crate::reader::CoilRead;
use crate::types::TypeId;

pub fn decode_instruction(
    input: &mut impl Read,
    strings: &Metadata,
) -> Result<Instruction, CofError> {
    let opcode_raw = input.read_u8()?;
    let opcode = Opcode::try_from(opcode_raw)
        .map_err(|_| CofError::Corrupt(format!("unknown opcode {opcode_raw:#04x}")))?;
    let flags = input.read_u8()?;
    let count = input.read_u8()? as usize;
    let dest_raw = input.read_u8()?;
    let result_type = TypeId::from_raw(input.read_u32()?);

    if !opcode.arity().accepts(count) {
        return Err(CofError::Corrupt(format!(
            "operand count {count} disagrees with the arity of `{}`",
            opcode.mnemonic()
        )));
    }

    // value-denoting operands carry no type of their own on the wire; they
    // take the instruction's result type
    let value_type = result_type;

    let mut sources = Vec::with_capacity(count);
    for _ in 0..count {
        let tag_raw = input.read_u8()?;
        let tag = OperandTag::try_from(tag_raw)
            .map_err(|_| CofError::Corrupt(format!("unknown operand tag {tag_raw:#04x}")))?;
        let operand = match tag {
            OperandTag::Register => Operand::Register {
                index: Reg(input.read_u24()?),
                ty: value_type,
            },
            OperandTag::Immediate => Operand::ImmInt {
                value: input.read_i24()?,
                ty: value_type,
            },
            OperandTag::Block => Operand::Block {
                name: strings.string_at(input.read_u24()?)?,
            },
            OperandTag::Function => Operand::Func {
                name: strings.string_at(input.read_u24()?)?,
            },
            OperandTag::Global => Operand::Global {
                name: strings.string_at(input.read_u24()?)?,
            },
            OperandTag::Memory => {
                let base = Reg(input.read_u8()?.into());
                let offset = input.read_i32()?;
                let index_raw = input.read_u8()?;
                let index = (index_raw != INDEX_NONE).then(|| Reg(index_raw.into()));
                let scale = input.read_u8()?;
                if !matches!(scale, 1 | 2 | 4 | 8) {
                    return Err(CofError::Corrupt(format!(
                        "memory operand scale must be 1, 2, 4 or 8, got {scale}"
                    )));
                }
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                    ty: value_type,
                }
            }
        };
        sources.push(operand);
    }

    Ok(Instruction {
        opcode,
        flags,
        dest: (dest_raw != DEST_NONE).then(|| Reg(dest_raw.into())),
        sources,
        result_type,
        result_name: None,
    })
}
