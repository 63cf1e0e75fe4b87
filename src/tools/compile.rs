use coil_rs::{cof, hoil, Diagnostics};

use crate::{print_diags, CompileArgs, EXIT_ASSEMBLY, EXIT_IO, EXIT_OK};

/// The front-end pipeline: parse, analyze, encode.
pub fn compile(args: &CompileArgs) -> i32 {
    let source = match std::fs::read_to_string(&args.input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {}: {err}", args.input.display());
            return EXIT_IO;
        }
    };
    let file_name = args.input.display().to_string();

    let mut diags = Diagnostics::new();
    if args.verbose {
        eprintln!("parsing {file_name}");
    }
    let module = hoil::parse_module(&source, &file_name, &mut diags);
    let Some(module) = module.filter(|_| !diags.had_error()) else {
        print_diags(&diags);
        return EXIT_ASSEMBLY;
    };

    if args.verbose {
        eprintln!("analyzing `{}`", module.name);
    }
    hoil::analyze(&module, &mut diags);
    if diags.had_error() {
        print_diags(&diags);
        return EXIT_ASSEMBLY;
    }

    if args.dump_ir {
        print!("{}", module.dump());
    }

    if args.verbose {
        eprintln!("encoding `{}`", module.name);
    }
    let bytes = match cof::write_module(&module) {
        Ok(bytes) => bytes,
        Err(err) => {
            diags.report(err.into_diagnostic());
            print_diags(&diags);
            return EXIT_ASSEMBLY;
        }
    };
    print_diags(&diags);

    if let Err(err) = std::fs::write(&args.output, &bytes) {
        eprintln!("cannot write {}: {err}", args.output.display());
        return EXIT_IO;
    }
    if args.verbose {
        eprintln!("wrote {} bytes to {}", bytes.len(), args.output.display());
    }
    EXIT_OK
}
