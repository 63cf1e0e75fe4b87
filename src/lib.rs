#![forbid(unsafe_code)]
pub mod codegen;
pub mod cof;
pub mod diag;
pub mod hoil;
pub mod ir;
pub mod opt;
pub(crate) mod reader;
pub mod target;
pub mod types;

#[cfg(test)]
mod test;

pub use diag::{Category, Code, Diagnostic, Diagnostics, Location, Severity};
pub use ir::Module;

/// COF container version emitted by this crate (major, minor, patch).
/// Readers accept any file whose major version matches.
pub const COF_VERSION: (u8, u8, u8) = (1, 0, 0);

#[macro_export]
macro_rules! flag_to_function {
    ($flag_name:ident $fun_name:ident $comment:literal) => {
        #[doc = $comment]
        pub fn $fun_name(&self) -> bool {
            self.0 & $flag_name != 0
        }
    };
}

/// Declares a newtype over an instruction qualifier byte with one accessor
/// per known bit. `from_raw` rejects bytes with bits outside the known set.
#[macro_export]
macro_rules! flags_to_struct {
    ($struct_name:ident, $struct_type:ty, $($flag_name:ident $flag_fun_name:ident $flag_doc:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, serde::Serialize)]
        pub struct $struct_name($struct_type);
        impl $struct_name {
            pub fn from_raw(value: $struct_type) -> anyhow::Result<Self> {
                let invalid_bits = value & !(0 $(| $flag_name)*);
                if invalid_bits != 0 {
                    Err(anyhow::anyhow!("Flag {} with invalid bits {invalid_bits:X}", stringify!($struct_name)))
                } else {
                    Ok(Self(value))
                }
            }

            pub fn into_raw(&self) -> $struct_type {
                self.0
            }

            $(
                $crate::flag_to_function!($flag_name $flag_fun_name $flag_doc);
            )*
        }
    }
}
