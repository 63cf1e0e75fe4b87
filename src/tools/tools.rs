mod assemble;
use assemble::assemble;
mod compile;
use compile::compile;
mod dump_ir;
use dump_ir::dump_ir;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use coil_rs::Diagnostics;

/// Exit codes of the driver, stable for scripting.
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 1;
pub const EXIT_IO: i32 = 2;
pub const EXIT_ASSEMBLY: i32 = 3;

/// Assemble, compile and inspect COIL modules
#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Assemble a COF module into native code
    Assemble(AssembleArgs),
    /// Compile HOIL text into a COF module
    Compile(CompileArgs),
    /// Print the IR of a COF or HOIL file as text
    DumpIr(DumpIrArgs),
}

#[derive(Clone, Debug, clap::Args)]
pub struct AssembleArgs {
    /// input COF file
    pub input: PathBuf,
    /// output file for the native code stream
    #[arg(short, long)]
    pub output: PathBuf,
    /// target configuration to assemble for
    #[arg(long, default_value = "x86_64")]
    pub target: String,
    /// optimization level 0-3
    #[arg(long, default_value_t = 2)]
    pub opt: u8,
    /// print the decoded IR before optimizing
    #[arg(long)]
    pub dump_ir: bool,
    /// write an assembly listing next to the code stream
    #[arg(long)]
    pub asm: Option<PathBuf>,
    /// report stage progress on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Debug, clap::Args)]
pub struct CompileArgs {
    /// input HOIL source file
    pub input: PathBuf,
    /// output COF file
    #[arg(short, long)]
    pub output: PathBuf,
    /// print the parsed IR after analysis
    #[arg(long)]
    pub dump_ir: bool,
    /// report stage progress on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Debug, clap::Args)]
pub struct DumpIrArgs {
    /// input file; `.hoil` parses as text, anything else decodes as COF
    pub input: PathBuf,
}

/// True when the path names a HOIL text file.
pub fn is_hoil_input(path: &Path) -> bool {
    matches!(
        path.extension().and_then(std::ffi::OsStr::to_str),
        Some("hoil") | Some("coil")
    )
}

/// One line per diagnostic on stderr, in the order they were recorded.
pub fn print_diags(diags: &Diagnostics) {
    for diag in diags {
        eprintln!("{diag}");
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap would exit with its own code; the driver contract says
            // bad arguments are exit 1
            let _ = err.print();
            std::process::exit(EXIT_BAD_ARGS);
        }
    };
    let code = match &args.operation {
        Operation::Assemble(assemble_args) => assemble(assemble_args),
        Operation::Compile(compile_args) => compile(compile_args),
        Operation::DumpIr(dump_args) => dump_ir(dump_args),
    };
    std::process::exit(code);
}
