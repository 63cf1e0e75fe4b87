use std::collections::HashMap;

use crate::diag::{Code, Diagnostics, Location};
use crate::hoil::lexer::Lexer;
use crate::hoil::token::{Keyword, Token, TokenKind};
use crate::ir::instruction::{Instruction, Operand, Reg};
use crate::ir::opcode::{OpCategory, Opcode};
use crate::ir::{Block, Function, Global, Module, Parameter};
use crate::types::{PtrQualifiers, TypeId};

/// Lexes and parses one HOIL source file. Returns a module whenever the
/// `MODULE` header was seen, even if errors were recorded along the way;
/// the driver decides whether to continue based on the sink.
pub fn parse_module(source: &str, file: &str, diags: &mut Diagnostics) -> Option<Module> {
    let tokens = Lexer::new(source, file).tokenize(diags);
    Parser {
        tokens,
        pos: 0,
        file: file.to_owned(),
    }
    .run(diags)
}

/// Operand as written, before classification against the opcode.
#[derive(Debug, Clone)]
enum RawOperand {
    Int(i64),
    Float(f64),
    Ident(String),
    Mem {
        base: String,
        offset: i32,
        index: Option<String>,
        scale: u8,
    },
}

/// Per-function state: value names, and the type each virtual register was
/// last assigned with.
#[derive(Default)]
struct FuncCtx {
    value_names: HashMap<String, u32>,
    reg_types: Vec<TypeId>,
}

impl FuncCtx {
    /// `rN` spellings denote register N directly; anything else goes
    /// through the value-name table.
    fn resolve(&self, name: &str) -> Option<(u32, TypeId)> {
        if let Some(index) = parse_reg_name(name) {
            let ty = self
                .reg_types
                .get(index as usize)
                .copied()
                .unwrap_or(TypeId::VOID);
            return Some((index, ty));
        }
        let index = *self.value_names.get(name)?;
        let ty = self
            .reg_types
            .get(index as usize)
            .copied()
            .unwrap_or(TypeId::VOID);
        Some((index, ty))
    }
}

fn parse_reg_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('r')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().kind == *kind {
            self.advance();
            return true;
        }
        false
    }

    fn loc_of(&self, token: &Token) -> Location {
        Location::new(self.file.clone(), token.line, token.column)
    }

    fn loc(&self) -> Location {
        self.loc_of(self.peek())
    }

    fn expect(&mut self, kind: TokenKind, diags: &mut Diagnostics) -> Option<Token> {
        if self.peek().kind == kind {
            return Some(self.advance());
        }
        let loc = self.loc();
        diags.error(
            Code::ParserExpectedToken,
            format!(
                "expected {}, found {}",
                kind.describe(),
                self.peek().kind.describe()
            ),
            Some(loc),
        );
        None
    }

    fn expect_ident(&mut self, diags: &mut Diagnostics) -> Option<String> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            return Some(name);
        }
        let loc = self.loc();
        diags.error(
            Code::ParserExpectedToken,
            format!("expected identifier, found {}", self.peek().kind.describe()),
            Some(loc),
        );
        None
    }

    /// Skips ahead to the next statement boundary: just past a `;`, or just
    /// before a top-level keyword, `}` or end of file. Every syntactic form
    /// starts with a unique keyword, so this is deterministic.
    fn synchronize(&mut self) {
        loop {
            match &self.peek().kind {
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::Semi => {
                    self.advance();
                    return;
                }
                TokenKind::Keyword(
                    Keyword::Module
                    | Keyword::Type
                    | Keyword::Global
                    | Keyword::Constant
                    | Keyword::Function
                    | Keyword::Extern
                    | Keyword::Target,
                ) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn run(mut self, diags: &mut Diagnostics) -> Option<Module> {
        if !self.eat(&TokenKind::Keyword(Keyword::Module)) {
            let loc = self.loc();
            diags.error(
                Code::ParserExpectedToken,
                format!(
                    "expected `MODULE` header, found {}",
                    self.peek().kind.describe()
                ),
                Some(loc),
            );
            return None;
        }
        let name = match &self.peek().kind {
            TokenKind::Str(name) => {
                let name = name.clone();
                self.advance();
                name
            }
            _ => {
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    "expected module name string",
                    Some(loc),
                );
                self.synchronize();
                String::new()
            }
        };
        let _ = self.expect(TokenKind::Semi, diags);
        let mut module = Module::new(name);

        loop {
            match &self.peek().kind {
                TokenKind::Eof => break,
                TokenKind::Keyword(Keyword::Type) => self.parse_type_decl(&mut module, diags),
                TokenKind::Keyword(Keyword::Global) => {
                    self.parse_global(&mut module, false, false, diags)
                }
                TokenKind::Keyword(Keyword::Constant) => {
                    self.parse_global(&mut module, true, false, diags)
                }
                TokenKind::Keyword(Keyword::Target) => self.parse_target(&mut module, diags),
                TokenKind::Keyword(Keyword::Function) => {
                    self.parse_function(&mut module, false, diags)
                }
                TokenKind::Keyword(Keyword::Extern) => {
                    self.advance();
                    match &self.peek().kind {
                        TokenKind::Keyword(Keyword::Function) => {
                            self.parse_function(&mut module, true, diags)
                        }
                        TokenKind::Keyword(Keyword::Global) => {
                            self.parse_global(&mut module, false, true, diags)
                        }
                        TokenKind::Keyword(Keyword::Constant) => {
                            self.parse_global(&mut module, true, true, diags)
                        }
                        _ => {
                            let loc = self.loc();
                            diags.error(
                                Code::ParserUnexpectedToken,
                                format!(
                                    "expected `FUNCTION`, `GLOBAL` or `CONSTANT` after `EXTERN`, found {}",
                                    self.peek().kind.describe()
                                ),
                                Some(loc),
                            );
                            self.synchronize();
                        }
                    }
                }
                other => {
                    let loc = self.loc();
                    diags.error(
                        Code::ParserUnexpectedToken,
                        format!("unexpected {} at top level", other.describe()),
                        Some(loc),
                    );
                    let before = self.pos;
                    self.synchronize();
                    if self.pos == before {
                        // a stray `}` stops synchronization in place
                        self.advance();
                    }
                }
            }
        }
        Some(module)
    }

    fn at_top_decl(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Keyword(
                Keyword::Module
                    | Keyword::Type
                    | Keyword::Global
                    | Keyword::Constant
                    | Keyword::Function
                    | Keyword::Extern
                    | Keyword::Target,
            )
        )
    }

    fn parse_type(&mut self, module: &mut Module, diags: &mut Diagnostics) -> TypeId {
        let token = self.advance();
        match &token.kind {
            TokenKind::Keyword(Keyword::Void) => TypeId::VOID,
            TokenKind::Keyword(Keyword::Bool) => TypeId::BOOL,
            TokenKind::Keyword(Keyword::I8) => TypeId::I8,
            TokenKind::Keyword(Keyword::I16) => TypeId::I16,
            TokenKind::Keyword(Keyword::I32) => TypeId::I32,
            TokenKind::Keyword(Keyword::I64) => TypeId::I64,
            TokenKind::Keyword(Keyword::U8) => TypeId::U8,
            TokenKind::Keyword(Keyword::U16) => TypeId::U16,
            TokenKind::Keyword(Keyword::U32) => TypeId::U32,
            TokenKind::Keyword(Keyword::U64) => TypeId::U64,
            TokenKind::Keyword(Keyword::F16) => TypeId::F16,
            TokenKind::Keyword(Keyword::F32) => TypeId::F32,
            TokenKind::Keyword(Keyword::F64) => TypeId::F64,
            TokenKind::Keyword(Keyword::Ptr) => {
                let _ = self.expect(TokenKind::Lt, diags);
                let base = self.parse_type(module, diags);
                let mut is_const = false;
                let mut is_volatile = false;
                let mut is_restrict = false;
                while self.eat(&TokenKind::Comma) {
                    match &self.advance().kind {
                        TokenKind::Keyword(Keyword::Const) => is_const = true,
                        TokenKind::Keyword(Keyword::Volatile) => is_volatile = true,
                        TokenKind::Keyword(Keyword::Restrict) => is_restrict = true,
                        other => {
                            let loc = self.loc();
                            diags.error(
                                Code::ParserExpectedToken,
                                format!("expected pointer qualifier, found {}", other.describe()),
                                Some(loc),
                            );
                        }
                    }
                }
                let _ = self.expect(TokenKind::Gt, diags);
                module.types.pointer_to(
                    base,
                    0,
                    PtrQualifiers::new(is_const, is_volatile, is_restrict),
                )
            }
            TokenKind::Keyword(Keyword::Vec) => {
                let _ = self.expect(TokenKind::Lt, diags);
                let elem = self.parse_type(module, diags);
                let _ = self.expect(TokenKind::Comma, diags);
                let lanes = self.parse_int(diags).max(0) as u32;
                let _ = self.expect(TokenKind::Gt, diags);
                module.types.vector_of(elem, lanes, diags)
            }
            TokenKind::Keyword(Keyword::Array) => {
                let _ = self.expect(TokenKind::Lt, diags);
                let elem = self.parse_type(module, diags);
                let len = if self.eat(&TokenKind::Comma) {
                    self.parse_int(diags).max(0) as u32
                } else {
                    0
                };
                let _ = self.expect(TokenKind::Gt, diags);
                module.types.array_of(elem, len)
            }
            TokenKind::Ident(name) => match module.types.lookup_named(name) {
                Some(id) => id,
                None => {
                    diags.error(
                        Code::TypeNotFound,
                        format!("unknown type `{name}`"),
                        Some(self.loc_of(&token)),
                    );
                    TypeId::VOID
                }
            },
            other => {
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected type, found {}", other.describe()),
                    Some(self.loc_of(&token)),
                );
                TypeId::VOID
            }
        }
    }

    fn parse_int(&mut self, diags: &mut Diagnostics) -> i64 {
        let negative = self.eat(&TokenKind::Minus);
        if let TokenKind::Int(value) = &self.peek().kind {
            let value = *value;
            self.advance();
            return if negative { -value } else { value };
        }
        let loc = self.loc();
        diags.error(
            Code::ParserExpectedToken,
            format!("expected integer, found {}", self.peek().kind.describe()),
            Some(loc),
        );
        0
    }

    fn parse_type_decl(&mut self, module: &mut Module, diags: &mut Diagnostics) {
        self.advance(); // TYPE
        let Some(name) = self.expect_ident(diags) else {
            self.synchronize();
            return;
        };
        if self.expect(TokenKind::Assign, diags).is_none()
            || self.expect(TokenKind::LBrace, diags).is_none()
        {
            self.synchronize();
            return;
        }
        let mut fields = Vec::new();
        while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
            let Some(field_name) = self.expect_ident(diags) else {
                self.synchronize();
                return;
            };
            if self.expect(TokenKind::Colon, diags).is_none() {
                self.synchronize();
                return;
            }
            let ty = self.parse_type(module, diags);
            fields.push((field_name, ty));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let _ = self.expect(TokenKind::RBrace, diags);
        let _ = self.expect(TokenKind::Semi, diags);
        let id = module.types.struct_of(name.clone(), fields, diags);
        if id != TypeId::VOID {
            module.types.register_named(name, id, diags);
        }
    }

    fn parse_global(
        &mut self,
        module: &mut Module,
        is_constant: bool,
        is_external: bool,
        diags: &mut Diagnostics,
    ) {
        self.advance(); // GLOBAL or CONSTANT
        let Some(name) = self.expect_ident(diags) else {
            self.synchronize();
            return;
        };
        if self.expect(TokenKind::Colon, diags).is_none() {
            self.synchronize();
            return;
        }
        let ty = self.parse_type(module, diags);
        let mut init = None;
        if self.eat(&TokenKind::Assign) {
            init = self.parse_initializer(module, ty, diags);
        }
        let mut align = 0;
        if self.eat(&TokenKind::Keyword(Keyword::Align)) {
            align = self.parse_int(diags).max(0) as u32;
        }
        let _ = self.expect(TokenKind::Semi, diags);
        module.add_global(
            Global {
                name,
                ty,
                is_constant,
                is_external,
                init,
                align,
            },
            diags,
        );
    }

    fn parse_initializer(
        &mut self,
        module: &mut Module,
        ty: TypeId,
        diags: &mut Diagnostics,
    ) -> Option<Vec<u8>> {
        match self.peek().kind.clone() {
            TokenKind::Str(text) => {
                self.advance();
                let mut bytes = text.into_bytes();
                bytes.push(0);
                Some(bytes)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut bytes = Vec::new();
                while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
                    bytes.push(self.parse_int(diags) as u8);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                let _ = self.expect(TokenKind::RBrace, diags);
                Some(bytes)
            }
            TokenKind::Int(_) | TokenKind::Minus => {
                let value = self.parse_int(diags);
                let size = module
                    .types
                    .size_of(ty)
                    .filter(|size| (1..=8).contains(size))
                    .unwrap_or(8) as usize;
                Some(value.to_le_bytes()[..size].to_vec())
            }
            other => {
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected initializer, found {}", other.describe()),
                    Some(loc),
                );
                None
            }
        }
    }

    fn parse_target(&mut self, module: &mut Module, diags: &mut Diagnostics) {
        self.advance(); // TARGET
        if self.expect(TokenKind::LBrace, diags).is_none() {
            self.synchronize();
            return;
        }
        while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
            match self.peek().kind.clone() {
                TokenKind::Keyword(Keyword::Required) => {
                    self.advance();
                    let list = self.parse_string_list(diags);
                    module.requirements.required.extend(list);
                    let _ = self.expect(TokenKind::Semi, diags);
                }
                TokenKind::Keyword(Keyword::Preferred) => {
                    self.advance();
                    let list = self.parse_string_list(diags);
                    module.requirements.preferred.extend(list);
                    let _ = self.expect(TokenKind::Semi, diags);
                }
                TokenKind::Keyword(Keyword::Device) => {
                    self.advance();
                    if let TokenKind::Str(device) = self.peek().kind.clone() {
                        self.advance();
                        module.requirements.device_class = Some(device);
                    } else {
                        let loc = self.loc();
                        diags.error(
                            Code::ParserExpectedToken,
                            "expected device class string",
                            Some(loc),
                        );
                    }
                    let _ = self.expect(TokenKind::Semi, diags);
                }
                other => {
                    let loc = self.loc();
                    diags.error(
                        Code::ParserUnexpectedToken,
                        format!("unexpected {} in TARGET block", other.describe()),
                        Some(loc),
                    );
                    self.synchronize();
                    return;
                }
            }
        }
        let _ = self.expect(TokenKind::RBrace, diags);
        self.eat(&TokenKind::Semi);
    }

    fn parse_string_list(&mut self, diags: &mut Diagnostics) -> Vec<String> {
        let mut list = Vec::new();
        loop {
            if let TokenKind::Str(item) = self.peek().kind.clone() {
                self.advance();
                list.push(item);
            } else {
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected string, found {}", self.peek().kind.describe()),
                    Some(loc),
                );
                return list;
            }
            if !self.eat(&TokenKind::Comma) {
                return list;
            }
        }
    }

    fn parse_function(&mut self, module: &mut Module, external: bool, diags: &mut Diagnostics) {
        self.advance(); // FUNCTION
        let Some(name) = self.expect_ident(diags) else {
            self.synchronize();
            return;
        };
        if self.expect(TokenKind::LParen, diags).is_none() {
            self.synchronize();
            return;
        }
        let mut params = Vec::new();
        let mut variadic = false;
        while !matches!(self.peek().kind, TokenKind::RParen | TokenKind::Eof) {
            if self.eat(&TokenKind::Ellipsis) {
                variadic = true;
                break;
            }
            let Some(param_name) = self.expect_ident(diags) else {
                self.synchronize();
                return;
            };
            if self.expect(TokenKind::Colon, diags).is_none() {
                self.synchronize();
                return;
            }
            let ty = self.parse_type(module, diags);
            params.push(Parameter {
                name: param_name,
                ty,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let _ = self.expect(TokenKind::RParen, diags);
        let _ = self.expect(TokenKind::Arrow, diags);
        let return_type = self.parse_type(module, diags);

        let mut fun = Function::new(name, return_type);
        fun.variadic = variadic;
        let mut ctx = FuncCtx::default();
        for (i, param) in params.iter().enumerate() {
            ctx.value_names.insert(param.name.clone(), i as u32);
            ctx.reg_types.push(param.ty);
        }
        fun.params = params;

        if external || self.peek().kind == TokenKind::Semi {
            fun.external = true;
            let _ = self.expect(TokenKind::Semi, diags);
            module.add_function(fun, diags);
            return;
        }

        if self.expect(TokenKind::LBrace, diags).is_none() {
            self.synchronize();
            return;
        }
        self.parse_body(module, &mut fun, &mut ctx, diags);
        fun.register_count = ctx.reg_types.len() as u32;
        module.add_function(fun, diags);
    }

    fn at_label(&self) -> bool {
        let label_head = matches!(
            self.peek().kind,
            TokenKind::Ident(_) | TokenKind::Keyword(Keyword::Entry)
        );
        label_head && self.peek_at(1).kind == TokenKind::Colon
    }

    fn parse_body(
        &mut self,
        module: &mut Module,
        fun: &mut Function,
        ctx: &mut FuncCtx,
        diags: &mut Diagnostics,
    ) {
        while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
            if self.at_top_decl() {
                // unclosed body; leave the declaration for the top loop
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected `}}` before {}", self.peek().kind.describe()),
                    Some(loc),
                );
                return;
            }
            if !self.at_label() {
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    format!(
                        "expected block label, found {}",
                        self.peek().kind.describe()
                    ),
                    Some(loc),
                );
                self.synchronize();
                continue;
            }
            let label = match self.advance().kind {
                TokenKind::Ident(name) => name,
                TokenKind::Keyword(Keyword::Entry) => crate::ir::ENTRY_BLOCK.to_owned(),
                _ => unreachable!("at_label checked the head token"),
            };
            self.advance(); // `:`
            let mut block = Block::new(label);
            while !self.at_label()
                && !self.at_top_decl()
                && !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof)
            {
                if let Some(insn) = self.parse_instruction(module, ctx, diags) {
                    block.push(insn);
                }
            }
            fun.add_block(block, diags);
        }
        let _ = self.expect(TokenKind::RBrace, diags);
    }

    fn parse_instruction(
        &mut self,
        module: &mut Module,
        ctx: &mut FuncCtx,
        diags: &mut Diagnostics,
    ) -> Option<Instruction> {
        let start_loc = self.loc();

        let mut dest_name = None;
        if matches!(self.peek().kind, TokenKind::Ident(_))
            && self.peek_at(1).kind == TokenKind::Assign
        {
            let TokenKind::Ident(name) = self.advance().kind else {
                unreachable!()
            };
            self.advance(); // `=`
            dest_name = Some(name);
        }

        let spelled = match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected instruction mnemonic, found {}", other.describe()),
                    Some(start_loc),
                );
                self.synchronize();
                return None;
            }
        };
        let Some(opcode) = Opcode::from_mnemonic(&spelled) else {
            diags.error(
                Code::ParserInvalidSyntax,
                format!("unknown mnemonic `{spelled}`"),
                Some(start_loc),
            );
            self.synchronize();
            return None;
        };

        let mut raw = Vec::new();
        if !matches!(
            self.peek().kind,
            TokenKind::Semi | TokenKind::Colon | TokenKind::RBrace | TokenKind::Eof
        ) {
            loop {
                match self.parse_raw_operand(diags) {
                    Some(op) => raw.push(op),
                    None => {
                        self.synchronize();
                        return None;
                    }
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut explicit_type = None;
        if self.eat(&TokenKind::Colon) {
            explicit_type = Some(self.parse_type(module, diags));
        }
        let _ = self.expect(TokenKind::Semi, diags);

        Some(self.finish_instruction(
            opcode,
            &spelled,
            dest_name,
            raw,
            explicit_type,
            ctx,
            diags,
            start_loc,
        ))
    }

    fn parse_raw_operand(&mut self, diags: &mut Diagnostics) -> Option<RawOperand> {
        match self.peek().kind.clone() {
            TokenKind::Int(value) => {
                self.advance();
                Some(RawOperand::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                Some(RawOperand::Float(value))
            }
            TokenKind::Minus => {
                self.advance();
                match self.peek().kind.clone() {
                    TokenKind::Int(value) => {
                        self.advance();
                        Some(RawOperand::Int(-value))
                    }
                    TokenKind::Float(value) => {
                        self.advance();
                        Some(RawOperand::Float(-value))
                    }
                    other => {
                        let loc = self.loc();
                        diags.error(
                            Code::ParserExpectedToken,
                            format!("expected literal after `-`, found {}", other.describe()),
                            Some(loc),
                        );
                        None
                    }
                }
            }
            TokenKind::Ident(name) => {
                self.advance();
                Some(RawOperand::Ident(name))
            }
            TokenKind::Keyword(Keyword::Entry) => {
                self.advance();
                Some(RawOperand::Ident(crate::ir::ENTRY_BLOCK.to_owned()))
            }
            TokenKind::LBracket => {
                self.advance();
                let base = self.expect_ident(diags)?;
                let mut offset = 0i32;
                if self.eat(&TokenKind::Plus) {
                    offset = self.parse_int(diags) as i32;
                } else if self.eat(&TokenKind::Minus) {
                    offset = -(self.parse_int(diags) as i32);
                }
                let mut index = None;
                let mut scale = 1u8;
                if self.eat(&TokenKind::Comma) {
                    index = Some(self.expect_ident(diags)?);
                    if self.expect(TokenKind::Comma, diags).is_none() {
                        return None;
                    }
                    let value = self.parse_int(diags);
                    if matches!(value, 1 | 2 | 4 | 8) {
                        scale = value as u8;
                    } else {
                        let loc = self.loc();
                        diags.error(
                            Code::ParserInvalidSyntax,
                            format!("memory scale must be 1, 2, 4 or 8, got {value}"),
                            Some(loc),
                        );
                    }
                }
                self.expect(TokenKind::RBracket, diags)?;
                Some(RawOperand::Mem {
                    base,
                    offset,
                    index,
                    scale,
                })
            }
            other => {
                let loc = self.loc();
                diags.error(
                    Code::ParserExpectedToken,
                    format!("expected operand, found {}", other.describe()),
                    Some(loc),
                );
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_instruction(
        &mut self,
        opcode: Opcode,
        spelled: &str,
        dest_name: Option<String>,
        raw: Vec<RawOperand>,
        explicit_type: Option<TypeId>,
        ctx: &mut FuncCtx,
        diags: &mut Diagnostics,
        loc: Location,
    ) -> Instruction {
        let count = raw.len();
        let label_position = |idx: usize| -> bool {
            match opcode {
                Opcode::Br => (count == 1 && idx == 0) || (count == 3 && idx >= 1),
                // conditional form: cond, then, else; switch form: selector,
                // default, then value/label pairs
                Opcode::Brc => {
                    if count == 3 {
                        idx >= 1
                    } else {
                        idx == 1 || (idx >= 3 && idx % 2 == 1)
                    }
                }
                _ => false,
            }
        };
        let func_position = |idx: usize| -> bool {
            matches!(opcode, Opcode::Call | Opcode::Sysc) && idx == 0
        };

        let mut sources = Vec::with_capacity(count);
        for (idx, op) in raw.into_iter().enumerate() {
            let operand = match op {
                RawOperand::Int(value) => Operand::ImmInt {
                    value,
                    ty: TypeId::VOID,
                },
                RawOperand::Float(value) => Operand::ImmFloat {
                    value,
                    ty: TypeId::VOID,
                },
                RawOperand::Ident(name) => {
                    if label_position(idx) {
                        Operand::Block { name }
                    } else if func_position(idx) {
                        Operand::Func { name }
                    } else if let Some((index, ty)) = ctx.resolve(&name) {
                        Operand::Register {
                            index: Reg(index),
                            ty,
                        }
                    } else {
                        Operand::Global { name }
                    }
                }
                RawOperand::Mem {
                    base,
                    offset,
                    index,
                    scale,
                } => {
                    let base_reg = match ctx.resolve(&base) {
                        Some((index, _)) => Reg(index),
                        None => {
                            diags.error(
                                Code::ParserInvalidSyntax,
                                format!("memory base `{base}` is not a register"),
                                Some(loc.clone()),
                            );
                            Reg(0)
                        }
                    };
                    let index_reg = index.map(|name| match ctx.resolve(&name) {
                        Some((index, _)) => Reg(index),
                        None => {
                            diags.error(
                                Code::ParserInvalidSyntax,
                                format!("memory index `{name}` is not a register"),
                                Some(loc.clone()),
                            );
                            Reg(0)
                        }
                    });
                    Operand::Memory {
                        base: base_reg,
                        offset,
                        index: index_reg,
                        scale,
                        ty: TypeId::VOID,
                    }
                }
            };
            sources.push(operand);
        }

        let first_value_type = sources.iter().find_map(|src| match src {
            Operand::Register { ty, .. } | Operand::Memory { ty, .. } if *ty != TypeId::VOID => {
                Some(*ty)
            }
            _ => None,
        });
        let result_type = explicit_type.unwrap_or_else(|| {
            if spelled.eq_ignore_ascii_case("LOAD_I32") {
                TypeId::I32
            } else {
                match opcode.category() {
                    OpCategory::Comparison => TypeId::BOOL,
                    OpCategory::FloatingPoint => first_value_type.unwrap_or(TypeId::F64),
                    _ => match first_value_type {
                        Some(ty) => ty,
                        None if dest_name.is_some() => TypeId::I64,
                        None => TypeId::VOID,
                    },
                }
            }
        });

        // untyped literal and memory operands take the result type
        for src in &mut sources {
            match src {
                Operand::ImmInt { ty, .. } | Operand::Memory { ty, .. } if *ty == TypeId::VOID => {
                    *ty = if result_type == TypeId::VOID {
                        TypeId::I64
                    } else {
                        result_type
                    };
                }
                Operand::ImmFloat { ty, .. } if *ty == TypeId::VOID => {
                    *ty = if result_type == TypeId::VOID {
                        TypeId::F64
                    } else {
                        result_type
                    };
                }
                _ => {}
            }
        }

        let mut insn = Instruction::new(opcode, result_type);
        insn.sources = sources;
        if let Some(name) = dest_name {
            let index = if let Some(index) = parse_reg_name(&name) {
                while ctx.reg_types.len() <= index as usize {
                    ctx.reg_types.push(TypeId::VOID);
                }
                ctx.reg_types[index as usize] = result_type;
                index
            } else if let Some(&index) = ctx.value_names.get(&name) {
                ctx.reg_types[index as usize] = result_type;
                insn.result_name = Some(name);
                index
            } else {
                let index = ctx.reg_types.len() as u32;
                ctx.reg_types.push(result_type);
                ctx.value_names.insert(name.clone(), index);
                insn.result_name = Some(name);
                index
            };
            insn.dest = Some(Reg(index));
        }
        insn
    }
}
