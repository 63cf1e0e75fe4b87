use std::fs::File;
use std::io::BufReader;

use coil_rs::{cof, hoil, Diagnostics};

use crate::{is_hoil_input, print_diags, DumpIrArgs, EXIT_ASSEMBLY, EXIT_IO, EXIT_OK};

/// Prints the textual rendering of a module, from either form.
pub fn dump_ir(args: &DumpIrArgs) -> i32 {
    let mut diags = Diagnostics::new();
    let module = if is_hoil_input(&args.input) {
        let source = match std::fs::read_to_string(&args.input) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("cannot read {}: {err}", args.input.display());
                return EXIT_IO;
            }
        };
        let file_name = args.input.display().to_string();
        hoil::compile(&source, &file_name, &mut diags)
    } else {
        let input = match File::open(&args.input) {
            Ok(file) => BufReader::new(file),
            Err(err) => {
                eprintln!("cannot open {}: {err}", args.input.display());
                return EXIT_IO;
            }
        };
        cof::read_module(input, &mut diags)
    };
    print_diags(&diags);
    let Some(module) = module.filter(|_| !diags.had_error()) else {
        return EXIT_ASSEMBLY;
    };
    print!("{}", module.dump());
    EXIT_OK
}
