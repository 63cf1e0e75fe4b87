use std::collections::HashMap;

use serde::Serialize;

use crate::diag::{Code, Diagnostics};
use crate::flags_to_struct;

pub const QUAL_CONST: u8 = 0x01;
pub const QUAL_VOLATILE: u8 = 0x02;
pub const QUAL_RESTRICT: u8 = 0x04;

flags_to_struct!(
    PtrQualifiers,
    u8,
    QUAL_CONST is_const "Pointee is never written through this pointer",
    QUAL_VOLATILE is_volatile "Accesses through this pointer are not elided or reordered",
    QUAL_RESTRICT is_restrict "No other pointer aliases the pointee",
);

impl PtrQualifiers {
    pub const NONE: Self = Self(0);

    pub fn new(is_const: bool, is_volatile: bool, is_restrict: bool) -> Self {
        let mut raw = 0;
        if is_const {
            raw |= QUAL_CONST;
        }
        if is_volatile {
            raw |= QUAL_VOLATILE;
        }
        if is_restrict {
            raw |= QUAL_RESTRICT;
        }
        Self(raw)
    }
}

/// Interned handle to a type. Primitive ids are fixed so the binary format
/// can reference them without a table entry; composite ids are assigned
/// sequentially from [`TypeId::FIRST_COMPOSITE`] in interning order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TypeId(u32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const I8: TypeId = TypeId(2);
    pub const I16: TypeId = TypeId(3);
    pub const I32: TypeId = TypeId(4);
    pub const I64: TypeId = TypeId(5);
    pub const U8: TypeId = TypeId(6);
    pub const U16: TypeId = TypeId(7);
    pub const U32: TypeId = TypeId(8);
    pub const U64: TypeId = TypeId(9);
    pub const F16: TypeId = TypeId(10);
    pub const F32: TypeId = TypeId(11);
    pub const F64: TypeId = TypeId(12);

    pub const FIRST_COMPOSITE: u32 = 0x100;
    pub(crate) const PRIMITIVE_COUNT: u32 = 13;

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn into_raw(self) -> u32 {
        self.0
    }

    pub fn is_primitive(self) -> bool {
        self.0 < Self::FIRST_COMPOSITE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StructField {
    pub name: String,
    pub ty: TypeId,
    /// Byte offset from the start of the struct, aligned to the field type.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Type {
    Void,
    Bool,
    Int { width: u16, signed: bool },
    Float { width: u16 },
    Pointer {
        base: TypeId,
        space: u8,
        quals: PtrQualifiers,
    },
    Vector { elem: TypeId, lanes: u32 },
    /// `len == 0` means unsized.
    Array { elem: TypeId, len: u32 },
    Struct {
        name: String,
        fields: Vec<StructField>,
        size: u64,
        align: u64,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
}

impl Type {
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float { .. })
    }
}

/// Per-module append-only type table. Structural equality: interning the
/// same shape twice yields the same id.
#[derive(Debug, Clone, Serialize)]
pub struct TypeRegistry {
    // primitives first, composites after, see index_of
    types: Vec<Type>,
    #[serde(skip)]
    interned: HashMap<Type, TypeId>,
    named: HashMap<String, TypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let types = vec![
            Type::Void,
            Type::Bool,
            Type::Int { width: 8, signed: true },
            Type::Int { width: 16, signed: true },
            Type::Int { width: 32, signed: true },
            Type::Int { width: 64, signed: true },
            Type::Int { width: 8, signed: false },
            Type::Int { width: 16, signed: false },
            Type::Int { width: 32, signed: false },
            Type::Int { width: 64, signed: false },
            Type::Float { width: 16 },
            Type::Float { width: 32 },
            Type::Float { width: 64 },
        ];
        let interned = types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (ty.clone(), TypeId(idx as u32)))
            .collect();
        Self {
            types,
            interned,
            named: HashMap::new(),
        }
    }

    fn index_of(id: TypeId) -> Option<usize> {
        if id.0 < TypeId::PRIMITIVE_COUNT {
            Some(id.0 as usize)
        } else if id.0 >= TypeId::FIRST_COMPOSITE {
            Some((TypeId::PRIMITIVE_COUNT + (id.0 - TypeId::FIRST_COMPOSITE)) as usize)
        } else {
            None
        }
    }

    fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(id) = self.interned.get(&ty) {
            return *id;
        }
        let composite_count = self.types.len() as u32 - TypeId::PRIMITIVE_COUNT;
        let id = TypeId(TypeId::FIRST_COMPOSITE + composite_count);
        self.types.push(ty.clone());
        self.interned.insert(ty, id);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        Self::index_of(id).and_then(|idx| self.types.get(idx))
    }

    pub fn pointer_to(&mut self, base: TypeId, space: u8, quals: PtrQualifiers) -> TypeId {
        self.intern(Type::Pointer { base, space, quals })
    }

    pub fn vector_of(&mut self, elem: TypeId, lanes: u32, diags: &mut Diagnostics) -> TypeId {
        if lanes == 0 {
            diags.error(
                Code::TypeVectorInvalid,
                "vector type must have at least one lane",
                None,
            );
            return TypeId::VOID;
        }
        self.intern(Type::Vector { elem, lanes })
    }

    pub fn array_of(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.intern(Type::Array { elem, len })
    }

    /// Lays the struct out and interns it. Element offsets are assigned in
    /// declaration order, each aligned up to its own alignment; the struct
    /// alignment is the maximum element alignment and the total size is the
    /// end offset rounded up to it.
    pub fn struct_of(
        &mut self,
        name: impl Into<String>,
        fields: Vec<(String, TypeId)>,
        diags: &mut Diagnostics,
    ) -> TypeId {
        let name = name.into();
        let mut laid_out = Vec::with_capacity(fields.len());
        let mut offset = 0u64;
        let mut align = 1u64;
        for (field_name, ty) in fields {
            let (Some(field_size), Some(field_align)) = (self.size_of(ty), self.align_of(ty))
            else {
                diags.error(
                    Code::TypeUnknown,
                    format!("unknown type in struct field `{name}.{field_name}`"),
                    None,
                );
                return TypeId::VOID;
            };
            offset = align_up(offset, field_align);
            laid_out.push(StructField {
                name: field_name,
                ty,
                offset,
            });
            offset += field_size;
            align = align.max(field_align);
        }
        let size = align_up(offset, align);
        self.intern(Type::Struct {
            name,
            fields: laid_out,
            size,
            align,
        })
    }

    pub fn function_of(&mut self, ret: TypeId, params: Vec<TypeId>, variadic: bool) -> TypeId {
        self.intern(Type::Function {
            ret,
            params,
            variadic,
        })
    }

    /// Binds `name` so HOIL can refer to the type by identifier. Duplicate
    /// bindings fail and leave the original in place.
    pub fn register_named(
        &mut self,
        name: impl Into<String>,
        id: TypeId,
        diags: &mut Diagnostics,
    ) -> bool {
        let name = name.into();
        if self.named.contains_key(&name) {
            diags.error(
                Code::SemanticRedefined,
                format!("type `{name}` is already defined"),
                None,
            );
            return false;
        }
        self.named.insert(name, id);
        true
    }

    pub fn lookup_named(&self, name: &str) -> Option<TypeId> {
        self.named.get(name).copied()
    }

    /// Named bindings in id order (deterministic for printing).
    pub fn named_types(&self) -> Vec<(&str, TypeId)> {
        let mut entries: Vec<(&str, TypeId)> = self
            .named
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
            .collect();
        entries.sort_by_key(|(_, id)| *id);
        entries
    }

    /// Byte size. `None` for unknown ids; void is zero-sized, function
    /// types are sizeless (only pointers to them are values).
    pub fn size_of(&self, id: TypeId) -> Option<u64> {
        Some(match self.get(id)? {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int { width, .. } | Type::Float { width } => u64::from(*width) / 8,
            Type::Pointer { .. } => 8,
            Type::Vector { elem, lanes } => self.size_of(*elem)? * u64::from(*lanes),
            Type::Array { elem, len } => self.size_of(*elem)? * u64::from(*len),
            Type::Struct { size, .. } => *size,
            Type::Function { .. } => 0,
        })
    }

    /// Byte alignment. `None` for unknown ids.
    pub fn align_of(&self, id: TypeId) -> Option<u64> {
        Some(match self.get(id)? {
            Type::Void => 1,
            Type::Bool => 1,
            Type::Int { width, .. } | Type::Float { width } => u64::from(*width) / 8,
            Type::Pointer { .. } => 8,
            Type::Vector { .. } => {
                let size = self.size_of(id)?;
                size.max(1).next_power_of_two().min(16)
            }
            Type::Array { elem, .. } => self.align_of(*elem)?,
            Type::Struct { align, .. } => *align,
            Type::Function { .. } => 1,
        })
    }

    /// Composite entries in id order, for the binary type section.
    pub fn composites(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .skip(TypeId::PRIMITIVE_COUNT as usize)
            .map(|(idx, ty)| {
                let id = TypeId(
                    TypeId::FIRST_COMPOSITE + (idx as u32 - TypeId::PRIMITIVE_COUNT),
                );
                (id, ty)
            })
    }

    pub fn composite_count(&self) -> u32 {
        self.types.len() as u32 - TypeId::PRIMITIVE_COUNT
    }

    /// Renders the type the way HOIL spells it.
    pub fn display(&self, id: TypeId) -> String {
        let Some(ty) = self.get(id) else {
            return format!("<unknown:{:#x}>", id.0);
        };
        match ty {
            Type::Void => "void".into(),
            Type::Bool => "bool".into(),
            Type::Int { width, signed: true } => format!("i{width}"),
            Type::Int {
                width,
                signed: false,
            } => format!("u{width}"),
            Type::Float { width } => format!("f{width}"),
            Type::Pointer { base, quals, .. } => {
                let mut quals_text = String::new();
                if quals.is_const() {
                    quals_text.push_str(", const");
                }
                if quals.is_volatile() {
                    quals_text.push_str(", volatile");
                }
                if quals.is_restrict() {
                    quals_text.push_str(", restrict");
                }
                format!("ptr<{}{}>", self.display(*base), quals_text)
            }
            Type::Vector { elem, lanes } => {
                format!("vec<{}, {lanes}>", self.display(*elem))
            }
            Type::Array { elem, len: 0 } => format!("array<{}>", self.display(*elem)),
            Type::Array { elem, len } => {
                format!("array<{}, {len}>", self.display(*elem))
            }
            Type::Struct { name, .. } => name.clone(),
            Type::Function {
                ret,
                params,
                variadic,
            } => {
                let mut text = String::from("fn(");
                for (i, param) in params.iter().enumerate() {
                    if i != 0 {
                        text.push_str(", ");
                    }
                    text.push_str(&self.display(*param));
                }
                if *variadic {
                    if !params.is_empty() {
                        text.push_str(", ");
                    }
                    text.push_str("...");
                }
                text.push_str(") -> ");
                text.push_str(&self.display(*ret));
                text
            }
        }
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two() || align == 1);
    value.div_ceil(align.max(1)) * align.max(1)
}
