use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

/// How bad a diagnostic is. `Error` and above flip the sink's had-error
/// flag, which the driver consults between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// The stage a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    Lexer,
    Parser,
    Semantic,
    Type,
    Binary,
    Assembler,
    Codegen,
    System,
    General,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Lexer => "lexer",
            Category::Parser => "parser",
            Category::Semantic => "semantic",
            Category::Type => "type",
            Category::Binary => "binary",
            Category::Assembler => "assembler",
            Category::Codegen => "codegen",
            Category::System => "system",
            Category::General => "general",
        };
        f.write_str(name)
    }
}

/// Stable numeric diagnostic codes, grouped in per-category hundreds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u16)]
pub enum Code {
    LexerInvalidChar = 100,

    ParserUnexpectedToken = 200,
    ParserExpectedToken = 201,
    ParserInvalidSyntax = 202,
    ParserNotImplemented = 203,

    SemanticUndefined = 300,
    SemanticRedefined = 301,
    SemanticInvalidOperand = 302,
    SemanticInvalidControl = 303,

    TypeVectorInvalid = 400,
    TypeUnknown = 401,
    TypeNotFound = 402,

    BinaryInvalidFormat = 500,
    BinaryUnsupportedVersion = 501,
    BinaryCorrupt = 502,
    BinaryMissingSection = 503,

    AssemblerNoTarget = 600,
    AssemblerBadMapping = 601,
    AssemblerUnsupported = 602,

    CodegenUnsupported = 700,
    CodegenInvalidIr = 701,

    SystemIo = 800,
    SystemOutOfMemory = 801,
}

impl Code {
    pub fn category(self) -> Category {
        match u16::from(self) {
            100..=199 => Category::Lexer,
            200..=299 => Category::Parser,
            300..=399 => Category::Semantic,
            400..=499 => Category::Type,
            500..=599 => Category::Binary,
            600..=699 => Category::Assembler,
            700..=799 => Category::Codegen,
            800..=899 => Category::System,
            _ => Category::General,
        }
    }
}

/// A position in a HOIL source file. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Category,
    pub code: Code,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        code: Code,
        message: impl Into<String>,
        location: Option<Location>,
    ) -> Self {
        Self {
            severity,
            category: code.category(),
            code,
            message: message.into(),
            location,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.location {
            write!(f, "{}:{}:{}: ", loc.file, loc.line, loc.column)?;
        }
        write!(
            f,
            "{} [{}/{}]: {}",
            self.severity,
            self.category,
            u16::from(self.code),
            self.message
        )
    }
}

/// Append-only diagnostic sink shared by every stage. Reporting never
/// panics; recovery is the reporting stage's problem.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    had_error: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, diag: Diagnostic) {
        if diag.severity >= Severity::Error {
            self.had_error = true;
        }
        self.entries.push(diag);
    }

    pub fn info(&mut self, code: Code, message: impl Into<String>, location: Option<Location>) {
        self.report(Diagnostic::new(Severity::Info, code, message, location));
    }

    pub fn warning(&mut self, code: Code, message: impl Into<String>, location: Option<Location>) {
        self.report(Diagnostic::new(Severity::Warning, code, message, location));
    }

    pub fn error(&mut self, code: Code, message: impl Into<String>, location: Option<Location>) {
        self.report(Diagnostic::new(Severity::Error, code, message, location));
    }

    pub fn fatal(&mut self, code: Code, message: impl Into<String>, location: Option<Location>) {
        self.report(Diagnostic::new(Severity::Fatal, code, message, location));
    }

    /// True once any diagnostic at `Error` severity or above was recorded.
    pub fn had_error(&self) -> bool {
        self.had_error
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
