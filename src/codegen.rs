//! Lowers an optimized module to native machine code. The generator is
//! parameterized by a [`TargetConfig`]; x86-64 is the one backend v1
//! ships.

pub mod x86_64;

use crate::diag::{Code, Diagnostics};
use crate::ir::Module;
use crate::target::TargetConfig;

/// Growing native-code buffer plus the optional assembly listing, one line
/// per emitted instruction.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    listing: Option<String>,
}

impl CodeBuffer {
    pub fn new(with_listing: bool) -> Self {
        Self {
            bytes: Vec::new(),
            listing: with_listing.then(String::new),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn listing(&self) -> Option<&str> {
        self.listing.as_deref()
    }

    fn commit(&mut self, bytes: &[u8], listing: Option<&str>) {
        self.bytes.extend_from_slice(bytes);
        if let (Some(own), Some(new)) = (self.listing.as_mut(), listing) {
            own.push_str(new);
        }
    }
}

/// Failure while lowering one function. The function's staged output is
/// discarded; generation continues with the next function.
#[derive(Debug)]
pub enum CodegenError {
    Unsupported(String),
    BadMapping(String),
    /// IR that should have been rejected by the analyzer reached the
    /// generator, e.g. an arithmetic instruction with no destination.
    InvalidIr(String),
}

impl CodegenError {
    fn code(&self) -> Code {
        match self {
            CodegenError::Unsupported(_) => Code::CodegenUnsupported,
            CodegenError::BadMapping(_) => Code::AssemblerBadMapping,
            CodegenError::InvalidIr(_) => Code::CodegenInvalidIr,
        }
    }

    fn message(self) -> String {
        match self {
            CodegenError::Unsupported(msg)
            | CodegenError::BadMapping(msg)
            | CodegenError::InvalidIr(msg) => msg,
        }
    }
}

/// Generates native code for every function body in the module. A failed
/// function contributes no bytes; the driver decides whether the overall
/// run still counts as a success via the sink.
pub fn generate(
    module: &Module,
    target: &TargetConfig,
    with_listing: bool,
    diags: &mut Diagnostics,
) -> CodeBuffer {
    let mut buffer = CodeBuffer::new(with_listing);

    for feature in &module.requirements.required {
        if !target.satisfies([feature.as_str()]) {
            diags.error(
                Code::AssemblerUnsupported,
                format!(
                    "target `{}` does not provide required feature `{feature}`",
                    target.arch.name
                ),
                None,
            );
            return buffer;
        }
    }

    if target.arch.name != "x86_64" {
        diags.error(
            Code::AssemblerNoTarget,
            format!("no code generator for architecture `{}`", target.arch.name),
            None,
        );
        return buffer;
    }

    for fun in &module.functions {
        if fun.external {
            continue;
        }
        match x86_64::lower_function(fun, target, with_listing) {
            Ok((bytes, listing)) => buffer.commit(&bytes, listing.as_deref()),
            Err(err) => {
                let code = err.code();
                diags.error(
                    code,
                    format!("function `{}`: {}", fun.name, err.message()),
                    None,
                );
            }
        }
    }
    buffer
}
