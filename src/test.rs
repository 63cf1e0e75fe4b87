use rstest::rstest;

use std::io::Cursor;

use crate::codegen::{self, x86_64};
use crate::cof::{self, insn::decode_instruction, Metadata};
use crate::diag::{Code, Diagnostics, Severity};
use crate::hoil;
use crate::ir::instruction::{Instruction, Operand, Reg, FLAG_NOOP, FLAG_ZERO_IDIOM};
use crate::ir::opcode::{Arity, Opcode};
use crate::ir::{implicitly_converts, Block, Function, Module};
use crate::opt::{optimize, OptLevel};
use crate::target::TargetConfig;
use crate::types::{Type, TypeId, TypeRegistry};

fn parse_clean(source: &str) -> Module {
    let mut diags = Diagnostics::new();
    let module = hoil::compile(source, "test.hoil", &mut diags).expect("module parses");
    assert!(
        !diags.had_error(),
        "unexpected diagnostics: {:?}",
        diags.iter().map(|d| d.to_string()).collect::<Vec<_>>()
    );
    module
}

fn roundtrip(module: &Module) -> Module {
    let bytes = cof::write_module(module).expect("encodes");
    let mut diags = Diagnostics::new();
    let decoded = cof::read_module(Cursor::new(&bytes), &mut diags).expect("decodes");
    assert!(!diags.had_error());
    decoded
}

// ---------------------------------------------------------------- types

#[rstest]
#[case(TypeId::BOOL, 1, 1)]
#[case(TypeId::I8, 1, 1)]
#[case(TypeId::I16, 2, 2)]
#[case(TypeId::I32, 4, 4)]
#[case(TypeId::I64, 8, 8)]
#[case(TypeId::U64, 8, 8)]
#[case(TypeId::F16, 2, 2)]
#[case(TypeId::F32, 4, 4)]
#[case(TypeId::F64, 8, 8)]
fn primitive_layout(#[case] id: TypeId, #[case] size: u64, #[case] align: u64) {
    let types = TypeRegistry::new();
    assert_eq!(types.size_of(id), Some(size));
    assert_eq!(types.align_of(id), Some(align));
}

#[test]
fn struct_layout_aligns_fields() {
    let mut types = TypeRegistry::new();
    let mut diags = Diagnostics::new();
    let id = types.struct_of(
        "Mixed",
        vec![
            ("a".into(), TypeId::I8),
            ("b".into(), TypeId::I32),
            ("c".into(), TypeId::I8),
        ],
        &mut diags,
    );
    let Some(Type::Struct { fields, size, align, .. }) = types.get(id) else {
        panic!("expected a struct");
    };
    assert_eq!(fields[0].offset, 0);
    assert_eq!(fields[1].offset, 4); // aligned up for the i32
    assert_eq!(fields[2].offset, 8);
    assert_eq!(*align, 4);
    assert_eq!(*size, 12); // rounded up to the struct alignment
    // offsets are non-decreasing multiples of the field alignment
    let mut last = 0;
    for field in fields {
        assert!(field.offset >= last);
        assert_eq!(field.offset % types.align_of(field.ty).unwrap(), 0);
        last = field.offset;
    }
    assert_eq!(size % align, 0);
}

#[test]
fn zero_lane_vector_is_rejected() {
    let mut types = TypeRegistry::new();
    let mut diags = Diagnostics::new();
    let id = types.vector_of(TypeId::I32, 0, &mut diags);
    assert_eq!(id, TypeId::VOID);
    assert!(diags.had_error());
    let diag = diags.iter().next().unwrap();
    assert_eq!(diag.code, Code::TypeVectorInvalid);
}

#[test]
fn interning_is_structural() {
    let mut types = TypeRegistry::new();
    let a = types.pointer_to(TypeId::I32, 0, crate::types::PtrQualifiers::NONE);
    let b = types.pointer_to(TypeId::I32, 0, crate::types::PtrQualifiers::NONE);
    assert_eq!(a, b);
    let c = types.pointer_to(TypeId::I64, 0, crate::types::PtrQualifiers::NONE);
    assert_ne!(a, c);
    assert!(!a.is_primitive());
}

#[test]
fn unknown_type_queries_return_nothing() {
    let types = TypeRegistry::new();
    let bogus = TypeId::from_raw(0x7777);
    assert!(types.get(bogus).is_none());
    assert!(types.size_of(bogus).is_none());
}

#[rstest]
#[case(TypeId::I8, TypeId::I16, true)]
#[case(TypeId::I16, TypeId::I8, false)]
#[case(TypeId::I8, TypeId::U16, false)]
#[case(TypeId::U32, TypeId::U64, true)]
#[case(TypeId::I32, TypeId::F32, true)]
#[case(TypeId::I32, TypeId::F16, false)]
#[case(TypeId::F32, TypeId::F64, true)]
#[case(TypeId::F64, TypeId::F32, false)]
fn implicit_conversion_table(#[case] from: TypeId, #[case] to: TypeId, #[case] expected: bool) {
    let types = TypeRegistry::new();
    assert_eq!(implicitly_converts(&types, from, to), expected);
}

// ----------------------------------------------------------- diagnostics

#[test]
fn diagnostic_line_format() {
    let mut diags = Diagnostics::new();
    diags.error(
        Code::ParserExpectedToken,
        "expected `;`",
        Some(crate::diag::Location::new("m.hoil", 3, 7)),
    );
    let line = diags.iter().next().unwrap().to_string();
    assert_eq!(line, "m.hoil:3:7: error [parser/201]: expected `;`");
}

#[test]
fn had_error_tracks_severity() {
    let mut diags = Diagnostics::new();
    diags.info(Code::SystemIo, "note", None);
    diags.warning(Code::SystemIo, "warn", None);
    assert!(!diags.had_error());
    diags.error(Code::SystemIo, "bad", None);
    assert!(diags.had_error());
    assert_eq!(diags.len(), 3);
}

#[rstest]
#[case(Code::LexerInvalidChar, "lexer")]
#[case(Code::SemanticInvalidControl, "semantic")]
#[case(Code::BinaryCorrupt, "binary")]
#[case(Code::AssemblerBadMapping, "assembler")]
#[case(Code::CodegenUnsupported, "codegen")]
fn codes_map_to_categories(#[case] code: Code, #[case] name: &str) {
    assert_eq!(code.category().to_string(), name);
}

// ----------------------------------------------------------------- lexer

#[test]
fn lexer_tracks_positions() {
    use crate::hoil::token::TokenKind;
    let mut diags = Diagnostics::new();
    let tokens = hoil::Lexer::new("MODULE \"m\";\n  RET;", "m.hoil").tokenize(&mut diags);
    assert!(!diags.had_error());
    assert_eq!(tokens[0].line, 1);
    assert_eq!(tokens[0].column, 1);
    let ret = tokens
        .iter()
        .find(|t| matches!(&t.kind, TokenKind::Ident(name) if name == "RET"))
        .unwrap();
    assert_eq!(ret.line, 2);
    assert_eq!(ret.column, 3);
    assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
}

#[test]
fn lexer_handles_comments_and_hex() {
    use crate::hoil::token::TokenKind;
    let mut diags = Diagnostics::new();
    let tokens = hoil::Lexer::new("// comment\n0x10 42", "m.hoil").tokenize(&mut diags);
    let ints: Vec<i64> = tokens
        .iter()
        .filter_map(|t| match t.kind {
            TokenKind::Int(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(ints, vec![16, 42]);
}

#[test]
fn lexer_skips_unknown_characters() {
    let mut diags = Diagnostics::new();
    let tokens = hoil::Lexer::new("@ 7", "m.hoil").tokenize(&mut diags);
    assert!(diags.had_error());
    assert_eq!(diags.iter().next().unwrap().code, Code::LexerInvalidChar);
    // the lexer recovered and still produced the integer
    assert!(tokens
        .iter()
        .any(|t| t.kind == crate::hoil::token::TokenKind::Int(7)));
}

#[test]
fn lexer_string_escapes() {
    use crate::hoil::token::TokenKind;
    let mut diags = Diagnostics::new();
    let tokens = hoil::Lexer::new(r#""a\n\"b\"""#, "m.hoil").tokenize(&mut diags);
    assert_eq!(tokens[0].kind, TokenKind::Str("a\n\"b\"".into()));
}

// ---------------------------------------------------------------- parser

#[test]
fn parses_minimal_function() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f() -> i32 {
ENTRY:
    x = LOAD_I32 0;
    RET x;
}
"#,
    );
    assert_eq!(module.name, "m");
    let fun = module.function("f").unwrap();
    assert_eq!(fun.register_count, 1);
    assert_eq!(fun.return_type, TypeId::I32);
    let entry = fun.entry().unwrap();
    assert_eq!(entry.instructions.len(), 2);
    let load = &entry.instructions[0];
    assert_eq!(load.opcode, Opcode::Movi);
    assert_eq!(load.result_type, TypeId::I32);
    assert_eq!(load.dest, Some(Reg(0)));
    assert_eq!(load.sources, vec![Operand::imm(0, TypeId::I32)]);
    assert!(entry.instructions[1].is_terminator());
}

#[test]
fn parser_recovers_at_statement_boundary() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
GLOBAL broken i32;
FUNCTION f() -> void {
ENTRY:
    RET;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    assert!(diags.had_error());
    // the function after the bad declaration still parsed
    assert!(module.function("f").is_some());
}

#[test]
fn parser_reports_unknown_mnemonic() {
    let mut diags = Diagnostics::new();
    let _ = hoil::parse_module(
        "MODULE \"m\";\nFUNCTION f() -> void {\nENTRY:\n    FROB 1;\n    RET;\n}\n",
        "m.hoil",
        &mut diags,
    );
    assert!(diags
        .iter()
        .any(|d| d.code == Code::ParserInvalidSyntax && d.message.contains("FROB")));
}

#[test]
fn parses_declarations_and_requirements() {
    let module = parse_clean(
        r#"
MODULE "full";
TARGET { REQUIRED "sse", "sse2"; PREFERRED "avx"; DEVICE "cpu"; }
TYPE Pair = { a: i32, b: i64 };
GLOBAL counter: u64 = 1 ALIGN 8;
CONSTANT greeting: array<u8, 6> = "hello";
EXTERN FUNCTION ext(n: i64) -> void;
FUNCTION f(p: ptr<i32, const>) -> void {
ENTRY:
    RET;
}
"#,
    );
    assert_eq!(module.requirements.required, vec!["sse", "sse2"]);
    assert_eq!(module.requirements.preferred, vec!["avx"]);
    assert_eq!(module.requirements.device_class.as_deref(), Some("cpu"));
    let pair = module.types.lookup_named("Pair").unwrap();
    assert_eq!(module.types.size_of(pair), Some(16));
    let counter = module.global("counter").unwrap();
    assert_eq!(counter.align, 8);
    assert_eq!(counter.init.as_deref(), Some(&[1, 0, 0, 0, 0, 0, 0, 0][..]));
    let greeting = module.global("greeting").unwrap();
    assert!(greeting.is_constant);
    assert_eq!(greeting.init.as_deref(), Some(&b"hello\0"[..]));
    assert!(module.function("ext").unwrap().external);
}

#[test]
fn duplicate_definitions_are_redefinitions() {
    let mut diags = Diagnostics::new();
    let _ = hoil::parse_module(
        "MODULE \"m\";\nGLOBAL g: i32;\nGLOBAL g: i32;\n",
        "m.hoil",
        &mut diags,
    );
    assert!(diags.iter().any(|d| d.code == Code::SemanticRedefined));
}

// ---------------------------------------------------------------- sema

#[test]
fn missing_terminator_is_exactly_one_semantic_error() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
FUNCTION f() -> void {
ENTRY:
    x = LOAD_I32 1;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    assert!(!diags.had_error());
    hoil::analyze(&module, &mut diags);
    let errors: Vec<_> = diags
        .iter()
        .filter(|d| d.severity >= Severity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, Code::SemanticInvalidControl);
    assert_eq!(errors[0].category.to_string(), "semantic");
    assert!(errors[0].message.contains("ENTRY"));
}

#[test]
fn undefined_symbols_are_reported() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
FUNCTION f() -> void {
ENTRY:
    BR nowhere;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    hoil::analyze(&module, &mut diags);
    assert!(diags
        .iter()
        .any(|d| d.code == Code::SemanticUndefined && d.message.contains("nowhere")));
}

#[test]
fn missing_entry_block_is_invalid_control() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        "MODULE \"m\";\nFUNCTION f() -> void {\nstart:\n    RET;\n}\n",
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    hoil::analyze(&module, &mut diags);
    assert!(diags
        .iter()
        .any(|d| d.code == Code::SemanticInvalidControl && d.message.contains("ENTRY")));
}

#[test]
fn register_indices_are_bounded() {
    let mut module = Module::new("m");
    let mut fun = Function::new("f", TypeId::VOID);
    fun.register_count = 1;
    let mut block = Block::new("ENTRY");
    block.push(
        Instruction::new(Opcode::Mov, TypeId::I64)
            .with_dest(Reg(0))
            .with_sources(vec![Operand::reg(5, TypeId::I64)]),
    );
    block.push(Instruction::new(Opcode::Ret, TypeId::VOID));
    fun.blocks.push(block);
    module.functions.push(fun);

    let mut diags = Diagnostics::new();
    hoil::analyze(&module, &mut diags);
    assert!(diags
        .iter()
        .any(|d| d.code == Code::SemanticInvalidOperand && d.message.contains("r5")));
}

#[test]
fn return_type_must_convert() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
FUNCTION f(x: i64) -> i32 {
ENTRY:
    RET x;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    hoil::analyze(&module, &mut diags);
    assert!(diags.iter().any(|d| d.code == Code::SemanticInvalidOperand));
}

#[test]
fn conditional_branch_shape_is_checked() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(c: bool) -> void {
ENTRY:
    BR c, then_, else_;
then_:
    RET;
else_:
    RET;
}
"#,
    );
    let fun = module.function("f").unwrap();
    let br = &fun.entry().unwrap().instructions[0];
    assert_eq!(br.opcode, Opcode::Br);
    assert!(matches!(br.sources[0], Operand::Register { .. }));
    assert!(matches!(&br.sources[1], Operand::Block { name } if name == "then_"));
}

#[test]
fn minimal_switch_is_accepted() {
    // a zero-case switch degenerates to selector plus default label
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(s: i64) -> void {
ENTRY:
    BRC s, done;
done:
    RET;
}
"#,
    );
    let fun = module.function("f").unwrap();
    let brc = &fun.entry().unwrap().instructions[0];
    assert_eq!(brc.opcode, Opcode::Brc);
    assert!(matches!(brc.sources[0], Operand::Register { .. }));
    assert!(matches!(&brc.sources[1], Operand::Block { name } if name == "done"));
}

#[test]
fn switch_with_cases_is_accepted() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(s: i64) -> void {
ENTRY:
    BRC s, fallback, 1, one;
one:
    RET;
fallback:
    RET;
}
"#,
    );
    let fun = module.function("f").unwrap();
    let brc = &fun.entry().unwrap().instructions[0];
    assert!(matches!(brc.sources[2], Operand::ImmInt { value: 1, .. }));
    assert!(matches!(&brc.sources[3], Operand::Block { name } if name == "one"));
}

#[test]
fn odd_switch_operand_count_is_rejected() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
FUNCTION f(s: i64) -> void {
ENTRY:
    BRC s, done, 1, one, 2;
one:
    RET;
done:
    RET;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    hoil::analyze(&module, &mut diags);
    assert!(diags.iter().any(|d| d.code == Code::SemanticInvalidOperand));
}

#[test]
fn call_argument_counts_are_checked() {
    let mut diags = Diagnostics::new();
    let module = hoil::parse_module(
        r#"
MODULE "m";
EXTERN FUNCTION two(a: i64, b: i64) -> void;
FUNCTION f() -> void {
ENTRY:
    CALL two, 1;
    RET;
}
"#,
        "m.hoil",
        &mut diags,
    )
    .unwrap();
    hoil::analyze(&module, &mut diags);
    assert!(diags
        .iter()
        .any(|d| d.code == Code::SemanticInvalidOperand && d.message.contains("two")));
}

// --------------------------------------------------------------- opcodes

#[rstest]
#[case(Opcode::Nop, 0x00)]
#[case(Opcode::Br, 0x02)]
#[case(Opcode::Ret, 0x05)]
#[case(Opcode::Hlt, 0x0D)]
#[case(Opcode::Add, 0x10)]
#[case(Opcode::Divp, 0x1F)]
#[case(Opcode::And, 0x20)]
#[case(Opcode::Bmsk, 0x2F)]
#[case(Opcode::Cmpnz, 0x39)]
#[case(Opcode::Mov, 0x40)]
#[case(Opcode::Movi, 0x45)]
#[case(Opcode::Ststr, 0x4B)]
#[case(Opcode::Adjsp, 0x56)]
#[case(Opcode::Varref, 0x66)]
#[case(Opcode::F64f32, 0x78)]
#[case(Opcode::Barrier, 0x8C)]
#[case(Opcode::Fma, 0x9D)]
#[case(Opcode::Cmov, 0xA1)]
#[case(Opcode::Alloca, 0xC4)]
#[case(Opcode::Include, 0xDB)]
fn opcode_values_are_stable(#[case] opcode: Opcode, #[case] value: u8) {
    assert_eq!(u8::from(opcode), value);
    assert_eq!(Opcode::try_from(value), Ok(opcode));
}

#[test]
fn mnemonics_round_trip() {
    for raw in 0x00u8..=0xDB {
        let Ok(opcode) = Opcode::try_from(raw) else {
            continue;
        };
        assert_eq!(Opcode::from_mnemonic(opcode.mnemonic()), Some(opcode));
    }
    // HOIL alias for MOVI
    assert_eq!(Opcode::from_mnemonic("LOAD_I32"), Some(Opcode::Movi));
    assert_eq!(Opcode::from_mnemonic("load_i32"), Some(Opcode::Movi));
    assert_eq!(Opcode::from_mnemonic("FROB"), None);
}

#[rstest]
#[case(Opcode::Br, 1, true)]
#[case(Opcode::Br, 2, false)]
#[case(Opcode::Br, 3, true)]
#[case(Opcode::Brc, 1, false)]
#[case(Opcode::Brc, 2, true)]
#[case(Opcode::Brc, 3, true)]
#[case(Opcode::Brc, 4, true)]
#[case(Opcode::Brc, 5, false)]
#[case(Opcode::Brc, 6, true)]
#[case(Opcode::Ret, 0, true)]
#[case(Opcode::Ret, 1, true)]
#[case(Opcode::Ret, 2, false)]
#[case(Opcode::Call, 1, true)]
#[case(Opcode::Call, 9, true)]
#[case(Opcode::Call, 0, false)]
#[case(Opcode::Add, 2, true)]
#[case(Opcode::Add, 3, false)]
#[case(Opcode::Atomadd, 2, true)]
#[case(Opcode::Atomadd, 3, true)]
#[case(Opcode::Ldmul, 0, false)]
fn arity_contract(#[case] opcode: Opcode, #[case] count: usize, #[case] accepted: bool) {
    assert_eq!(opcode.arity().accepts(count), accepted);
}

#[test]
fn variadic_opcodes_are_flagged() {
    assert!(Opcode::Br.is_variadic());
    assert!(Opcode::Brc.is_variadic());
    assert!(Opcode::Call.is_variadic());
    assert!(Opcode::Ret.is_variadic());
    assert!(Opcode::Stmul.is_variadic());
    assert!(!Opcode::Add.is_variadic());
    assert_eq!(Opcode::Sub.arity(), Arity::Exact(2));
}

// ------------------------------------------------------------ cof codec

#[test]
fn header_starts_with_magic() {
    let module = parse_clean("MODULE \"m\";\n");
    let bytes = cof::write_module(&module).unwrap();
    assert_eq!(&bytes[0..4], b"COIL");
    assert_eq!(bytes[4], crate::COF_VERSION.0);
    // section count at offset 8
    assert_eq!(
        u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        6
    );
}

#[test]
fn roundtrip_two_functions_identical_dump() {
    let module = parse_clean(
        r#"
MODULE "round";
EXTERN FUNCTION ext(n: i64) -> void;
FUNCTION f() -> void {
ENTRY:
    RET;
tail:
    RET;
}
"#,
    );
    let decoded = roundtrip(&module);
    assert_eq!(module.dump(), decoded.dump());
}

#[test]
fn roundtrip_preserves_types_globals_and_requirements() {
    let module = parse_clean(
        r#"
MODULE "rich";
TARGET { REQUIRED "sse"; DEVICE "cpu"; }
TYPE Pair = { a: i32, b: i64 };
GLOBAL counter: u64 = 7 ALIGN 8;
GLOBAL table: Pair;
CONSTANT msg: array<u8, 3> = { 0x68, 0x69, 0x00 };
FUNCTION f(a: i32, b: i32) -> i32 {
ENTRY:
    r2 = ADD a, b;
    RET r2;
}
"#,
    );
    let decoded = roundtrip(&module);
    assert_eq!(module.dump(), decoded.dump());
    assert_eq!(decoded.requirements.required, vec!["sse"]);
    let pair = decoded.types.lookup_named("Pair").unwrap();
    assert_eq!(decoded.types.size_of(pair), Some(16));
    assert_eq!(decoded.global("counter").unwrap().init.as_deref().unwrap()[0], 7);
    assert_eq!(decoded.function("f").unwrap().register_count, 3);
}

#[test]
fn reencoding_a_decoded_module_is_bit_identical() {
    let module = parse_clean(
        r#"
MODULE "bits";
TYPE Pair = { a: i32, b: i64 };
GLOBAL counter: u64 = 9;
FUNCTION f(a: i64) -> i64 {
ENTRY:
    r1 = ADD a, 1;
    RET r1;
}
"#,
    );
    let bytes = cof::write_module(&module).unwrap();
    let mut diags = Diagnostics::new();
    let decoded = cof::read_module(Cursor::new(&bytes), &mut diags).unwrap();
    let reencoded = cof::write_module(&decoded).unwrap();
    assert_eq!(bytes, reencoded);
}

#[test]
fn truncated_file_is_corrupt() {
    let module = parse_clean(
        "MODULE \"m\";\nFUNCTION f() -> void {\nENTRY:\n    RET;\n}\n",
    );
    let bytes = cof::write_module(&module).unwrap();
    let truncated = &bytes[..bytes.len() - 1];
    let mut diags = Diagnostics::new();
    let decoded = cof::read_module(Cursor::new(truncated), &mut diags);
    assert!(decoded.is_none());
    assert!(diags.iter().any(|d| d.code == Code::BinaryCorrupt));
}

#[test]
fn bad_magic_is_invalid_format() {
    let module = parse_clean("MODULE \"m\";\n");
    let mut bytes = cof::write_module(&module).unwrap();
    bytes[0] = b'X';
    let mut diags = Diagnostics::new();
    assert!(cof::read_module(Cursor::new(&bytes), &mut diags).is_none());
    assert!(diags.iter().any(|d| d.code == Code::BinaryInvalidFormat));
}

#[test]
fn future_version_is_unsupported() {
    let module = parse_clean("MODULE \"m\";\n");
    let mut bytes = cof::write_module(&module).unwrap();
    bytes[4] = crate::COF_VERSION.0 + 1;
    let mut diags = Diagnostics::new();
    assert!(cof::read_module(Cursor::new(&bytes), &mut diags).is_none());
    assert!(diags
        .iter()
        .any(|d| d.code == Code::BinaryUnsupportedVersion));
}

#[test]
fn missing_metadata_section_is_reported() {
    let module = parse_clean("MODULE \"m\";\n");
    let mut bytes = cof::write_module(&module).unwrap();
    // the metadata entry is the sixth section-table row; retag it as
    // relocation so the mandatory section disappears
    let entry = 16 + 5 * 12;
    bytes[entry..entry + 4].copy_from_slice(&6u32.to_le_bytes());
    let mut diags = Diagnostics::new();
    assert!(cof::read_module(Cursor::new(&bytes), &mut diags).is_none());
    assert!(diags
        .iter()
        .any(|d| d.code == Code::BinaryMissingSection));
}

#[test]
fn wide_immediates_are_rejected() {
    let mut module = Module::new("m");
    let mut fun = Function::new("f", TypeId::VOID);
    fun.register_count = 1;
    let mut block = Block::new("ENTRY");
    block.push(
        Instruction::new(Opcode::Movi, TypeId::I64)
            .with_dest(Reg(0))
            .with_sources(vec![Operand::imm(0x0100_0000, TypeId::I64)]),
    );
    block.push(Instruction::new(Opcode::Ret, TypeId::VOID));
    fun.blocks.push(block);
    module.functions.push(fun);

    let err = cof::write_module(&module).unwrap_err();
    assert_eq!(err.code(), Code::CodegenUnsupported);
}

#[test]
fn decoder_rejects_unknown_opcode() {
    let strings = Metadata::new(b"m\0".to_vec());
    let bytes = [
        0xEF, // reserved implementation-extension opcode
        0x00, // flags
        0x00, // operand count
        0xFF, // no destination
        0x00, 0x00, 0x00, 0x00, // result type: void
    ];
    let err = decode_instruction(&mut &bytes[..], &strings).unwrap_err();
    assert_eq!(err.code(), Code::BinaryCorrupt);
}

#[test]
fn decoder_rejects_arity_mismatch() {
    let strings = Metadata::new(b"m\0".to_vec());
    let bytes = [
        0x10, // ADD
        0x00, // flags
        0x01, // one operand, but ADD takes two
        0x00, // dest r0
        0x05, 0x00, 0x00, 0x00, // result type: i64
        0x01, // register tag
        0x00, 0x00, 0x00, // r0
    ];
    let err = decode_instruction(&mut &bytes[..], &strings).unwrap_err();
    assert_eq!(err.code(), Code::BinaryCorrupt);
}

#[test]
fn decoder_reads_memory_operands() {
    let strings = Metadata::new(b"m\0".to_vec());
    let bytes = [
        0x41, // LOAD
        0x00, // flags
        0x01, // one operand
        0x01, // dest r1
        0x04, 0x00, 0x00, 0x00, // result type: i32
        0x06, // memory tag
        0x00, // base r0
        0xFC, 0xFF, 0xFF, 0xFF, // displacement -4
        0xFF, // no index register
        0x01, // scale 1
    ];
    let insn = decode_instruction(&mut &bytes[..], &strings).unwrap();
    assert_eq!(insn.opcode, Opcode::Load);
    assert_eq!(insn.dest, Some(Reg(1)));
    let Operand::Memory { base, offset, index, scale, .. } = &insn.sources[0] else {
        panic!("expected a memory operand");
    };
    assert_eq!((base.0, *offset, *index, *scale), (0, -4, None, 1));
}

#[test]
fn decoder_rejects_variadic_violations() {
    let strings = Metadata::new(b"m\0".to_vec());
    let bytes = [
        0x02, // BR
        0x00, // flags
        0x02, // two operands: branch takes one or three
        0xFF, // no destination
        0x00, 0x00, 0x00, 0x00, // result type: void
        0x01, 0x00, 0x00, 0x00, // r0
        0x01, 0x01, 0x00, 0x00, // r1
    ];
    let err = decode_instruction(&mut &bytes[..], &strings).unwrap_err();
    assert_eq!(err.code(), Code::BinaryCorrupt);
}

// ------------------------------------------------------------- optimizer

fn add_zero_module() -> Module {
    let mut module = Module::new("m");
    let mut fun = Function::new("f", TypeId::VOID);
    fun.register_count = 1;
    let mut block = Block::new("ENTRY");
    block.push(
        Instruction::new(Opcode::Add, TypeId::I64)
            .with_dest(Reg(0))
            .with_sources(vec![
                Operand::reg(0, TypeId::I64),
                Operand::imm(0, TypeId::I64),
            ]),
    );
    block.push(Instruction::new(Opcode::Ret, TypeId::VOID));
    fun.blocks.push(block);
    module.functions.push(fun);
    module
}

#[test]
fn peephole_eliminates_add_zero() {
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(add_zero_module(), OptLevel::Basic, &target, &mut diags);
    assert!(!diags.had_error());
    let entry = &module.functions[0].blocks[0];
    assert!(entry.instructions[0].is_noop());
    assert_eq!(entry.instructions[0].flags & FLAG_NOOP, FLAG_NOOP);
    assert!(entry.instructions[1].is_terminator());
}

#[test]
fn optimizer_is_idempotent() {
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let once = optimize(add_zero_module(), OptLevel::Aggressive, &target, &mut diags);
    let twice = optimize(once.clone(), OptLevel::Aggressive, &target, &mut diags);
    assert!(!diags.had_error());
    assert_eq!(once.dump(), twice.dump());
    assert_eq!(once.functions, twice.functions);
}

#[test]
fn mov_swap_pair_is_eliminated() {
    let mut module = Module::new("m");
    let mut fun = Function::new("f", TypeId::VOID);
    fun.register_count = 2;
    let mut block = Block::new("ENTRY");
    block.push(
        Instruction::new(Opcode::Mov, TypeId::I64)
            .with_dest(Reg(1))
            .with_sources(vec![Operand::reg(0, TypeId::I64)]),
    );
    block.push(
        Instruction::new(Opcode::Mov, TypeId::I64)
            .with_dest(Reg(0))
            .with_sources(vec![Operand::reg(1, TypeId::I64)]),
    );
    block.push(Instruction::new(Opcode::Ret, TypeId::VOID));
    fun.blocks.push(block);
    module.functions.push(fun);

    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(module, OptLevel::Basic, &target, &mut diags);
    let entry = &module.functions[0].blocks[0];
    assert!(!entry.instructions[0].is_noop());
    assert!(entry.instructions[1].is_noop());
}

#[test]
fn zero_load_gains_the_idiom_tag() {
    let module = parse_clean(
        "MODULE \"m\";\nFUNCTION f() -> i32 {\nENTRY:\n    r0 = LOAD_I32 0;\n    RET r0;\n}\n",
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(module, OptLevel::Basic, &target, &mut diags);
    let load = &module.functions[0].blocks[0].instructions[0];
    assert_eq!(load.flags & FLAG_ZERO_IDIOM, FLAG_ZERO_IDIOM);
    assert!(!load.is_noop());
}

#[test]
fn register_pressure_fails_bad_mapping() {
    let mut module = Module::new("m");
    let mut fun = Function::new("f", TypeId::VOID);
    fun.register_count = 17; // one over the x86-64 pool
    let mut block = Block::new("ENTRY");
    block.push(Instruction::new(Opcode::Ret, TypeId::VOID));
    fun.blocks.push(block);
    module.functions.push(fun);

    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(module, OptLevel::None, &target, &mut diags);
    assert!(diags.iter().any(|d| d.code == Code::AssemblerBadMapping));

    // code generation refuses the function as well and emits nothing
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(buffer.bytes().is_empty());
    assert!(diags.iter().any(|d| d.code == Code::AssemblerBadMapping));
}

#[test]
fn aggressive_sinks_noops_before_terminator() {
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let mut module = add_zero_module();
    // a live instruction after the future no-op
    let block = &mut module.functions[0].blocks[0];
    let ret = block.instructions.pop().unwrap();
    block.push(
        Instruction::new(Opcode::Movi, TypeId::I64)
            .with_dest(Reg(0))
            .with_sources(vec![Operand::imm(3, TypeId::I64)]),
    );
    block.instructions.push(ret);

    let module = optimize(module, OptLevel::Aggressive, &target, &mut diags);
    let insns = &module.functions[0].blocks[0].instructions;
    assert!(!insns[0].is_noop()); // the MOVI moved up
    assert!(insns[1].is_noop()); // the tagged no-op sank
    assert!(insns[2].is_terminator()); // the terminator stayed last
}

// ------------------------------------------------------------- codegen

#[test]
fn rex_and_modrm_compose() {
    assert_eq!(x86_64::encode_rex(true, false, false, false), 0x48);
    assert_eq!(x86_64::encode_rex(true, true, false, true), 0x4D);
    assert_eq!(x86_64::encode_modrm(0b11, 0, 0), 0xC0);
    assert_eq!(x86_64::encode_modrm(0b11, 4, 5), 0xE5);
    // high register bits are masked out of the ModR/M byte
    assert_eq!(x86_64::encode_modrm(0b11, 9, 10), 0xCA);
}

#[test]
fn minimal_function_end_to_end() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f() -> i32 {
ENTRY:
    x = LOAD_I32 0;
    RET x;
}
"#,
    );
    let decoded = roundtrip(&module);

    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&decoded, &target, true, &mut diags);
    assert!(!diags.had_error());
    let bytes = buffer.bytes();

    // prologue appears exactly once, at the start
    assert_eq!(&bytes[0..4], &[0x55, 0x48, 0x89, 0xE5]);
    assert_eq!(
        bytes
            .windows(4)
            .filter(|w| w == &[0x55, 0x48, 0x89, 0xE5])
            .count(),
        1
    );
    // the 6-byte `mov eax, 0` ending in four zero bytes
    assert_eq!(&bytes[4..10], &[0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00]);
    // the stream ends with `ret`
    assert_eq!(bytes.last(), Some(&0xC3));

    let listing = buffer.listing().unwrap();
    assert!(listing.contains("push rbp"));
    assert!(listing.contains("mov eax, 0"));
    assert!(listing.contains("ret"));
}

#[test]
fn eliminated_add_leaves_prologue_and_ret() {
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(add_zero_module(), OptLevel::Basic, &target, &mut diags);
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(!diags.had_error());
    assert_eq!(buffer.bytes(), &[0x55, 0x48, 0x89, 0xE5, 0xC3]);
}

#[test]
fn zero_idiom_lowers_to_xor() {
    let module = parse_clean(
        "MODULE \"m\";\nFUNCTION f() -> i32 {\nENTRY:\n    r0 = LOAD_I32 0;\n    RET r0;\n}\n",
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let module = optimize(module, OptLevel::Basic, &target, &mut diags);
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(!diags.had_error());
    // xor eax, eax replaces the immediate move
    assert_eq!(buffer.bytes(), &[0x55, 0x48, 0x89, 0xE5, 0x31, 0xC0, 0xC3]);
}

#[test]
fn three_operand_add_moves_then_adds() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64, b: i64) -> i64 {
ENTRY:
    r2 = ADD a, b;
    RET r2;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, true, &mut diags);
    assert!(!diags.had_error());
    let listing = buffer.listing().unwrap();
    // r0 -> rax, r1 -> rcx, r2 -> rdx by first-use order
    assert!(listing.contains("mov rdx, rax"));
    assert!(listing.contains("add rdx, rcx"));
    // mov rdx, rax = REX.W 89 /r with reg=rax rm=rdx
    let bytes = buffer.bytes();
    assert!(bytes.windows(3).any(|w| w == [0x48, 0x89, 0xC2]));
    assert!(bytes.windows(3).any(|w| w == [0x48, 0x01, 0xCA]));
    // the result lives in rdx, so the return moves it into rax first
    assert!(listing.contains("mov rax, rdx"));
    assert_eq!(&bytes[bytes.len() - 4..], &[0x48, 0x89, 0xD0, 0xC3]);
}

#[test]
fn returned_register_reaches_rax() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64, b: i64) -> i64 {
ENTRY:
    r2 = ADD a, b;
    RET b;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(!diags.had_error());
    // a -> rax, b -> rcx, r2 -> rdx; the return copies rcx into rax
    assert_eq!(
        buffer.bytes(),
        &[
            0x55, 0x48, 0x89, 0xE5, // prologue
            0x48, 0x89, 0xC2, // mov rdx, rax
            0x48, 0x01, 0xCA, // add rdx, rcx
            0x48, 0x89, 0xC8, // mov rax, rcx
            0xC3, // ret
        ]
    );
}

#[test]
fn sub_immediate_uses_group_one() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64) -> i64 {
ENTRY:
    r1 = SUB a, 5;
    RET r1;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(!diags.had_error());
    // 81 /5 id with rm=rcx (r1 -> rcx)
    let expected = [0x48, 0x81, 0xE9, 0x05, 0x00, 0x00, 0x00];
    assert!(buffer.bytes().windows(7).any(|w| w == expected));
}

#[test]
fn unary_ops_copy_then_operate() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64) -> i64 {
ENTRY:
    r1 = NEG a;
    r1 = INC r1;
    RET r1;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, true, &mut diags);
    assert!(!diags.had_error());
    let bytes = buffer.bytes();
    // mov rcx, rax; neg rcx (F7 /3); inc rcx (FF /0)
    assert!(bytes.windows(3).any(|w| w == [0x48, 0x89, 0xC1]));
    assert!(bytes.windows(3).any(|w| w == [0x48, 0xF7, 0xD9]));
    assert!(bytes.windows(3).any(|w| w == [0x48, 0xFF, 0xC1]));
    let listing = buffer.listing().unwrap();
    assert!(listing.contains("neg rcx"));
    assert!(listing.contains("inc rcx"));
}

#[test]
fn bitwise_ops_share_the_binary_path() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64, b: i64) -> i64 {
ENTRY:
    r2 = AND a, b;
    r2 = XOR r2, 255;
    RET r2;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(!diags.had_error());
    let bytes = buffer.bytes();
    // and rdx, rcx (21 /r with reg=rcx rm=rdx)
    assert!(bytes.windows(3).any(|w| w == [0x48, 0x21, 0xCA]));
    // xor rdx, 255 (81 /6 id)
    let expected = [0x48, 0x81, 0xF2, 0xFF, 0x00, 0x00, 0x00];
    assert!(bytes.windows(7).any(|w| w == expected));
}

#[test]
fn push_pop_use_short_forms() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION f(a: i64) -> void {
ENTRY:
    PUSH a;
    r1 = POP;
    RET;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, true, &mut diags);
    assert!(!diags.had_error());
    let bytes = buffer.bytes();
    // push rax (50) after the prologue's push rbp, pop rcx (59)
    assert_eq!(bytes[4], 0x50);
    assert!(bytes.contains(&0x59));
    let listing = buffer.listing().unwrap();
    assert!(listing.contains("push rax"));
    assert!(listing.contains("pop rcx"));
}

#[test]
fn unsupported_opcode_skips_function_but_continues() {
    let module = parse_clean(
        r#"
MODULE "m";
FUNCTION bad() -> i64 {
ENTRY:
    r0 = MUL 2, 3;
    RET r0;
}
FUNCTION good() -> void {
ENTRY:
    RET;
}
"#,
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(diags
        .iter()
        .any(|d| d.code == Code::CodegenUnsupported && d.message.contains("bad")));
    // only `good` made it into the stream
    assert_eq!(buffer.bytes(), &[0x55, 0x48, 0x89, 0xE5, 0xC3]);
}

#[test]
fn missing_required_feature_aborts_generation() {
    let module = parse_clean(
        "MODULE \"m\";\nTARGET { REQUIRED \"avx512\"; }\nFUNCTION f() -> void {\nENTRY:\n    RET;\n}\n",
    );
    let target = TargetConfig::x86_64();
    let mut diags = Diagnostics::new();
    let buffer = codegen::generate(&module, &target, false, &mut diags);
    assert!(buffer.bytes().is_empty());
    assert!(diags.iter().any(|d| d.code == Code::AssemblerUnsupported));
}

// --------------------------------------------------------------- target

#[test]
fn default_x86_64_configuration() {
    let target = TargetConfig::x86_64();
    assert_eq!(target.arch.name, "x86_64");
    assert_eq!(target.resources.general_purpose_regs, 16);
    assert_eq!(target.resources.vector_width_bits, 128);
    assert_eq!(target.memory.cache_line_size, 64);
    assert_eq!(target.memory.page_size, 4096);
    assert!(target.satisfies(["sse", "sse2"]));
    assert!(!target.satisfies(["avx"]));
    assert!(target.arch.feature("avx").is_some());
}

#[test]
fn target_lookup_by_name() {
    assert!(TargetConfig::by_name("x86_64").is_some());
    assert!(TargetConfig::by_name("amd64").is_some());
    assert!(TargetConfig::by_name("riscv").is_none());
}

// --------------------------------------------------------------- printer

#[test]
fn dump_is_reparseable_and_stable() {
    let module = parse_clean(
        r#"
MODULE "stable";
TYPE Pair = { a: i32, b: i64 };
GLOBAL counter: u64 = 3;
FUNCTION f(a: i32) -> i32 {
ENTRY:
    r1 = ADD a, 1;
    RET r1;
}
"#,
    );
    let first = module.dump();
    let reparsed = parse_clean(&first);
    assert_eq!(first, reparsed.dump());
}
