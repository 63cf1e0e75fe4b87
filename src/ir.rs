pub mod instruction;
pub mod opcode;
pub mod printer;

use serde::Serialize;

use crate::diag::{Code, Diagnostics};
use crate::types::{Type, TypeId, TypeRegistry};

pub use instruction::{Instruction, Operand, Reg};
pub use opcode::{Arity, OpCategory, Opcode};

/// Name of the designated entry block every function body must have.
pub const ENTRY_BLOCK: &str = "ENTRY";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeId,
}

/// Ordered, non-empty instruction sequence ending in a terminator. The
/// emptiness and terminator rules are validated by the semantic analyzer,
/// not enforced structurally, so a partially-built block is representable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, insn: Instruction) {
        self.instructions.push(insn);
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|insn| insn.is_terminator())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub return_type: TypeId,
    pub params: Vec<Parameter>,
    pub variadic: bool,
    /// External functions carry no blocks.
    pub external: bool,
    pub blocks: Vec<Block>,
    /// One past the highest virtual register index in use.
    pub register_count: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: TypeId) -> Self {
        Self {
            name: name.into(),
            return_type,
            params: Vec::new(),
            variadic: false,
            external: false,
            blocks: Vec::new(),
            register_count: 0,
        }
    }

    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|block| block.name == name)
    }

    pub fn block_mut(&mut self, name: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|block| block.name == name)
    }

    pub fn entry(&self) -> Option<&Block> {
        self.block(ENTRY_BLOCK)
    }

    /// Appends a block, failing on duplicate names within the function.
    pub fn add_block(&mut self, block: Block, diags: &mut Diagnostics) -> bool {
        if self.block(&block.name).is_some() {
            diags.error(
                Code::SemanticRedefined,
                format!(
                    "block `{}` is already defined in function `{}`",
                    block.name, self.name
                ),
                None,
            );
            return false;
        }
        self.blocks.push(block);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Global {
    pub name: String,
    pub ty: TypeId,
    pub is_constant: bool,
    pub is_external: bool,
    pub init: Option<Vec<u8>>,
    pub align: u32,
}

/// Features the module needs from whatever target assembles it. The HOIL
/// `TARGET { … }` block is the authoritative source for these lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetRequirements {
    pub required: Vec<String>,
    pub preferred: Vec<String>,
    pub device_class: Option<String>,
}

/// Top-level IR unit. Owns its type registry, globals and functions;
/// children refer to each other by name through the module-level lookups.
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub name: String,
    pub types: TypeRegistry,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
    pub requirements: TargetRequirements,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: TypeRegistry::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            requirements: TargetRequirements::default(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|fun| fun.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|global| global.name == name)
    }

    /// Appends a function, failing on a duplicate name.
    pub fn add_function(&mut self, fun: Function, diags: &mut Diagnostics) -> bool {
        if self.function(&fun.name).is_some() {
            diags.error(
                Code::SemanticRedefined,
                format!("function `{}` is already defined", fun.name),
                None,
            );
            return false;
        }
        self.functions.push(fun);
        true
    }

    /// Appends a global, failing on a duplicate name.
    pub fn add_global(&mut self, global: Global, diags: &mut Diagnostics) -> bool {
        if self.global(&global.name).is_some() {
            diags.error(
                Code::SemanticRedefined,
                format!("global `{}` is already defined", global.name),
                None,
            );
            return false;
        }
        self.globals.push(global);
        true
    }

    /// Renders the module as HOIL-shaped text. Structurally equal modules
    /// render identically, which makes this the round-trip oracle.
    pub fn dump(&self) -> String {
        printer::print_module(self)
    }
}

/// The lossless implicit conversions: integer widening within a
/// signedness, integer to f32-or-wider float, float widening. Everything
/// else needs an explicit conversion instruction.
pub fn implicitly_converts(types: &TypeRegistry, from: TypeId, to: TypeId) -> bool {
    if from == to {
        return true;
    }
    let (Some(from_ty), Some(to_ty)) = (types.get(from), types.get(to)) else {
        return false;
    };
    match (from_ty, to_ty) {
        (
            Type::Int {
                width: from_width,
                signed: from_signed,
            },
            Type::Int {
                width: to_width,
                signed: to_signed,
            },
        ) => from_signed == to_signed && to_width > from_width,
        (Type::Int { .. }, Type::Float { width }) => *width >= 32,
        (Type::Float { width: from_width }, Type::Float { width: to_width }) => {
            to_width > from_width
        }
        _ => false,
    }
}
