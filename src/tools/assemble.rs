use std::fs::File;
use std::io::BufReader;

use coil_rs::opt::OptLevel;
use coil_rs::target::TargetConfig;
use coil_rs::{codegen, cof, opt, Diagnostics};

use crate::{print_diags, AssembleArgs, EXIT_ASSEMBLY, EXIT_BAD_ARGS, EXIT_IO, EXIT_OK};

/// The full back-end pipeline: decode, optimize, generate. The error flag
/// is consulted at every stage boundary; the first failing stage is the
/// last one that runs.
pub fn assemble(args: &AssembleArgs) -> i32 {
    let Some(target) = TargetConfig::by_name(&args.target) else {
        eprintln!("unknown target `{}`", args.target);
        return EXIT_BAD_ARGS;
    };
    let Some(level) = OptLevel::from_cli(args.opt) else {
        eprintln!("optimization level must be 0-3, got {}", args.opt);
        return EXIT_BAD_ARGS;
    };

    let input = match File::open(&args.input) {
        Ok(file) => BufReader::new(file),
        Err(err) => {
            eprintln!("cannot open {}: {err}", args.input.display());
            return EXIT_IO;
        }
    };

    let mut diags = Diagnostics::new();
    if args.verbose {
        eprintln!("decoding {}", args.input.display());
    }
    let module = cof::read_module(input, &mut diags);
    let Some(module) = module.filter(|_| !diags.had_error()) else {
        print_diags(&diags);
        return EXIT_ASSEMBLY;
    };

    if args.dump_ir {
        print!("{}", module.dump());
    }

    if args.verbose {
        eprintln!("optimizing at level {level:?}");
    }
    let module = opt::optimize(module, level, &target, &mut diags);
    if diags.had_error() {
        print_diags(&diags);
        return EXIT_ASSEMBLY;
    }

    if args.verbose {
        eprintln!("generating code for `{}`", target.arch.name);
    }
    let with_listing = args.asm.is_some();
    let buffer = codegen::generate(&module, &target, with_listing, &mut diags);
    print_diags(&diags);
    if diags.had_error() {
        return EXIT_ASSEMBLY;
    }

    if let Err(err) = std::fs::write(&args.output, buffer.bytes()) {
        eprintln!("cannot write {}: {err}", args.output.display());
        return EXIT_IO;
    }
    if let (Some(path), Some(listing)) = (&args.asm, buffer.listing()) {
        if let Err(err) = std::fs::write(path, listing) {
            eprintln!("cannot write {}: {err}", path.display());
            return EXIT_IO;
        }
    }
    if args.verbose {
        eprintln!(
            "wrote {} bytes to {}",
            buffer.bytes().len(),
            args.output.display()
        );
    }
    EXIT_OK
}
