use serde::Serialize;

/// Reserved words. Keywords are matched case-insensitively; the canonical
/// spelling in rendered text is upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Keyword {
    Module,
    Type,
    Global,
    Constant,
    Function,
    Extern,
    Target,
    Entry,
    Required,
    Preferred,
    Device,
    Align,
    // primitive type names
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
    Ptr,
    Vec,
    Array,
    // pointer qualifiers
    Const,
    Volatile,
    Restrict,
}

impl Keyword {
    pub fn from_ident(text: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match text.to_ascii_lowercase().as_str() {
            "module" => Module,
            "type" => Type,
            "global" => Global,
            "constant" => Constant,
            "function" => Function,
            "extern" => Extern,
            "target" => Target,
            "entry" => Entry,
            "required" => Required,
            "preferred" => Preferred,
            "device" => Device,
            "align" => Align,
            "void" => Void,
            "bool" => Bool,
            "i8" => I8,
            "i16" => I16,
            "i32" => I32,
            "i64" => I64,
            "u8" => U8,
            "u16" => U16,
            "u32" => U32,
            "u64" => U64,
            "f16" => F16,
            "f32" => F32,
            "f64" => F64,
            "ptr" => Ptr,
            "vec" => Vec,
            "array" => Array,
            "const" => Const,
            "volatile" => Volatile,
            "restrict" => Restrict,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    Keyword(Keyword),
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Comma,
    Colon,
    Semi,
    Assign,
    Arrow,
    Ellipsis,
    Plus,
    Minus,
    Eof,
}

impl TokenKind {
    /// Human-readable token name for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Keyword(kw) => format!("keyword `{kw:?}`").to_lowercase(),
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Int(value) => format!("integer `{value}`"),
            TokenKind::Float(value) => format!("float `{value}`"),
            TokenKind::Str(value) => format!("string \"{value}\""),
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
            TokenKind::LBrace => "`{`".into(),
            TokenKind::RBrace => "`}`".into(),
            TokenKind::LBracket => "`[`".into(),
            TokenKind::RBracket => "`]`".into(),
            TokenKind::Lt => "`<`".into(),
            TokenKind::Gt => "`>`".into(),
            TokenKind::Comma => "`,`".into(),
            TokenKind::Colon => "`:`".into(),
            TokenKind::Semi => "`;`".into(),
            TokenKind::Assign => "`=`".into(),
            TokenKind::Arrow => "`->`".into(),
            TokenKind::Ellipsis => "`...`".into(),
            TokenKind::Plus => "`+`".into(),
            TokenKind::Minus => "`-`".into(),
            TokenKind::Eof => "end of file".into(),
        }
    }
}

/// A token with its position in the source. Offsets are bytes; line and
/// column are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    pub line: u32,
    pub column: u32,
    pub len: u32,
}
