use crate::diag::{Code, Diagnostics, Location};
use crate::hoil::token::{Keyword, Token, TokenKind};

/// Streaming tokenizer over a UTF-8 byte buffer. Never fails: unknown
/// characters are reported and skipped, and an `Eof` token is always
/// delivered at the end.
pub struct Lexer<'a> {
    src: &'a [u8],
    file: String,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: impl Into<String>) -> Self {
        Self {
            src: source.as_bytes(),
            file: file.into(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.file.clone(), self.line, self.column)
    }

    /// Lexes the whole input. The final token is always `Eof`.
    pub fn tokenize(mut self, diags: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token(diags);
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return tokens;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(byte)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    pub fn next_token(&mut self, diags: &mut Diagnostics) -> Token {
        loop {
            self.skip_trivia();
            let offset = self.pos;
            let line = self.line;
            let column = self.column;
            let token = |kind: TokenKind, len: usize| Token {
                kind,
                offset,
                line,
                column,
                len: len as u32,
            };

            let Some(byte) = self.peek() else {
                return token(TokenKind::Eof, 0);
            };
            match byte {
                b'(' => {
                    self.bump();
                    return token(TokenKind::LParen, 1);
                }
                b')' => {
                    self.bump();
                    return token(TokenKind::RParen, 1);
                }
                b'{' => {
                    self.bump();
                    return token(TokenKind::LBrace, 1);
                }
                b'}' => {
                    self.bump();
                    return token(TokenKind::RBrace, 1);
                }
                b'[' => {
                    self.bump();
                    return token(TokenKind::LBracket, 1);
                }
                b']' => {
                    self.bump();
                    return token(TokenKind::RBracket, 1);
                }
                b'<' => {
                    self.bump();
                    return token(TokenKind::Lt, 1);
                }
                b'>' => {
                    self.bump();
                    return token(TokenKind::Gt, 1);
                }
                b',' => {
                    self.bump();
                    return token(TokenKind::Comma, 1);
                }
                b':' => {
                    self.bump();
                    return token(TokenKind::Colon, 1);
                }
                b';' => {
                    self.bump();
                    return token(TokenKind::Semi, 1);
                }
                b'=' => {
                    self.bump();
                    return token(TokenKind::Assign, 1);
                }
                b'+' => {
                    self.bump();
                    return token(TokenKind::Plus, 1);
                }
                b'-' => {
                    self.bump();
                    if self.peek() == Some(b'>') {
                        self.bump();
                        return token(TokenKind::Arrow, 2);
                    }
                    return token(TokenKind::Minus, 1);
                }
                b'.' if self.peek_at(1) == Some(b'.') && self.peek_at(2) == Some(b'.') => {
                    self.bump();
                    self.bump();
                    self.bump();
                    return token(TokenKind::Ellipsis, 3);
                }
                b'"' => return self.lex_string(diags, offset, line, column),
                b'0'..=b'9' => return self.lex_number(offset, line, column),
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                    return self.lex_ident(offset, line, column)
                }
                other => {
                    diags.error(
                        Code::LexerInvalidChar,
                        format!("unexpected character `{}`", other.escape_ascii()),
                        Some(Location::new(self.file.clone(), line, column)),
                    );
                    self.bump();
                    // recovered, restart on the next byte
                }
            }
        }
    }

    fn lex_ident(&mut self, offset: usize, line: u32, column: u32) -> Token {
        while let Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_') = self.peek() {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[offset..self.pos])
            .expect("identifier bytes are ASCII")
            .to_owned();
        let kind = match Keyword::from_ident(&text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(text),
        };
        Token {
            kind,
            offset,
            line,
            column,
            len: (self.pos - offset) as u32,
        }
    }

    fn lex_number(&mut self, offset: usize, line: u32, column: u32) -> Token {
        let token = |kind: TokenKind, len: usize| Token {
            kind,
            offset,
            line,
            column,
            len: len as u32,
        };
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.bump();
            self.bump();
            let digits_start = self.pos;
            while let Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F') = self.peek() {
                self.bump();
            }
            let digits = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap();
            let value = u64::from_str_radix(digits, 16).unwrap_or(0);
            return token(TokenKind::Int(value as i64), self.pos - offset);
        }

        let mut is_float = false;
        while let Some(b'0'..=b'9') = self.peek() {
            self.bump();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            is_float = true;
            self.bump();
            while let Some(b'0'..=b'9') = self.peek() {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some(b'+' | b'-')) {
                ahead = 2;
            }
            if matches!(self.peek_at(ahead), Some(b'0'..=b'9')) {
                is_float = true;
                for _ in 0..=ahead {
                    self.bump();
                }
                while let Some(b'0'..=b'9') = self.peek() {
                    self.bump();
                }
            }
        }

        let text = std::str::from_utf8(&self.src[offset..self.pos]).unwrap();
        let kind = if is_float {
            TokenKind::Float(text.parse().unwrap_or(0.0))
        } else {
            TokenKind::Int(text.parse::<u64>().unwrap_or(0) as i64)
        };
        token(kind, self.pos - offset)
    }

    fn lex_string(
        &mut self,
        diags: &mut Diagnostics,
        offset: usize,
        line: u32,
        column: u32,
    ) -> Token {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    diags.error(
                        Code::LexerInvalidChar,
                        "unterminated string literal",
                        Some(Location::new(self.file.clone(), line, column)),
                    );
                    break;
                }
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => value.push('\n'),
                    Some(b'r') => value.push('\r'),
                    Some(b't') => value.push('\t'),
                    Some(b'0') => value.push('\0'),
                    Some(b'\\') => value.push('\\'),
                    Some(b'"') => value.push('"'),
                    other => {
                        diags.error(
                            Code::LexerInvalidChar,
                            format!(
                                "unknown escape `\\{}`",
                                other.map(|b| b as char).unwrap_or(' ')
                            ),
                            Some(Location::new(self.file.clone(), line, column)),
                        );
                    }
                },
                Some(byte) => value.push(byte as char),
            }
        }
        Token {
            kind: TokenKind::Str(value),
            offset,
            line,
            column,
            len: (self.pos - offset) as u32,
        }
    }
}
