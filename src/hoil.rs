//! The HOIL front end: text to typed IR.

pub mod lexer;
pub mod parser;
pub mod sema;
pub mod token;

pub use lexer::Lexer;
pub use parser::parse_module;
pub use sema::analyze;

use crate::diag::Diagnostics;
use crate::ir::Module;

/// Parses and, when parsing was clean, analyzes one source file. Mirrors
/// the stage gating of the driver: analysis does not run over a module the
/// parser already rejected.
pub fn compile(source: &str, file: &str, diags: &mut Diagnostics) -> Option<Module> {
    let module = parse_module(source, file, diags)?;
    if !diags.had_error() {
        analyze(&module, diags);
    }
    Some(module)
}
