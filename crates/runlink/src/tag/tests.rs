use super::*;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn parse(text: &str) -> Tag {
    Tag::parse(text).unwrap_or_else(|e| panic!("{}", e))
}

#[test]
fn test_parse_simple_function() {
    let tag = parse("abs func(int)int");
    assert_eq!(tag.names, vec!["abs"]);
    assert!(tag.signature.func);
    assert_eq!(tag.signature.args.len(), 1);
    assert_eq!(
        tag.signature.args[0].prim,
        Prim::Int {
            bits: 32,
            signed: true
        }
    );
    assert_eq!(tag.signature.ret.name, "int");
    assert!(!tag.signature.is_fallible());
}

#[test]
fn test_parse_candidate_names() {
    let tag = parse("atexit,__cxa_atexit func(*void)int");
    assert_eq!(tag.names, vec!["atexit", "__cxa_atexit"]);
}

#[test]
fn test_parse_fread() {
    let tag = parse("fread func(&void[@3],size_t/@1,size_t,&FILE)size_t<@3; ferror(@4)");
    let sig = &tag.signature;

    assert_eq!(sig.args[0].prim, Prim::Pointer);
    assert_eq!(sig.args[0].ownership, Some(Ownership::Borrowed));
    assert_eq!(
        sig.args[0].assertions,
        vec![Assertion::Capacity(Cmp::Ge, Operand::Arg(3))]
    );
    assert_eq!(sig.args[1].assertions, vec![Assertion::SizeOf(Operand::Arg(1))]);
    assert_eq!(sig.args[3].prim, Prim::Handle);
    assert_eq!(sig.args[3].name, "FILE");

    assert_eq!(sig.error_condition(), Some((Cmp::Lt, &Operand::Arg(3))));
    assert_eq!(
        sig.ret.failure,
        Some(Failure {
            symbol: "ferror".to_string(),
            operands: vec![Operand::Arg(4)],
        })
    );
    assert!(sig.is_fallible());
}

#[test]
fn test_parse_puts_error_convention() {
    let tag = parse("puts func(&char)int<0;strerror");
    let sig = &tag.signature;
    assert_eq!(sig.args[0].prim, Prim::String);
    assert_eq!(sig.error_condition(), Some((Cmp::Lt, &Operand::Literal(0))));
    assert_eq!(sig.ret.failure.as_ref().map(|f| f.symbol.as_str()), Some("strerror"));
    assert!(sig.ret.failure.as_ref().is_some_and(|f| f.operands.is_empty()));
}

#[rstest]
#[case("char", Prim::Int { bits: 8, signed: true })]
#[case("uchar", Prim::Int { bits: 8, signed: false })]
#[case("ushort", Prim::Int { bits: 16, signed: false })]
#[case("uint32_t", Prim::Int { bits: 32, signed: false })]
#[case("longlong", Prim::Int { bits: 64, signed: true })]
#[case("double", Prim::Float { bits: 64 })]
#[case("_Bool", Prim::Bool)]
#[case("div_t", Prim::Aggregate)]
#[case("#char", Prim::String)]
#[case("$char", Prim::String)]
#[case("&int", Prim::Pointer)]
#[case("+void", Prim::Pointer)]
#[case("*FILE", Prim::Handle)]
fn test_type_classification(#[case] ty: &str, #[case] expected: Prim) {
    let tag = parse(&format!("f func({})void", ty));
    assert_eq!(tag.signature.args[0].prim, expected);
}

#[test]
fn test_size_t_follows_pointer_width() {
    let tag = parse("strlen func(#char)size_t");
    assert_eq!(
        tag.signature.ret.prim,
        Prim::Int {
            bits: (std::mem::size_of::<usize>() * 8) as u8,
            signed: false
        }
    );
}

#[test]
fn test_parse_prefix_combinations() {
    let tag = parse("f func(#&char,-size_t=16,int%2)void");
    let args = &tag.signature.args;
    assert!(args[0].immutable);
    assert_eq!(args[0].ownership, Some(Ownership::Borrowed));
    assert!(args[1].ignored);
    assert_eq!(
        args[1].assertions,
        vec![Assertion::Compare(Cmp::Eq, Operand::Literal(16))]
    );
    assert_eq!(args[2].maps, Some(2));
}

#[test]
fn test_parse_all_assertions() {
    let tag = parse("f func(&void~@2^@2:@2[>4],&void,#char...f@3)*void!NULL");
    let sig = &tag.signature;
    assert_eq!(
        sig.args[0].assertions,
        vec![
            Assertion::Disjoint(Operand::Arg(2)),
            Assertion::Within(Operand::Arg(2)),
            Assertion::SameType(Operand::Arg(2)),
            Assertion::Capacity(Cmp::Gt, Operand::Literal(4)),
        ]
    );
    assert_eq!(sig.printf_index(), Some(2));
    assert_eq!(
        sig.error_condition(),
        Some((Cmp::Ne, &Operand::Constant("NULL".to_string())))
    );
}

#[test]
fn test_parse_non_function_tag() {
    let tag = parse("errno int");
    assert!(!tag.signature.func);
    assert!(tag.signature.args.is_empty());
}

#[test]
fn test_parse_literals() {
    let tag = parse("f func(int>=-1,uint<0xff)void");
    let args = &tag.signature.args;
    assert_eq!(
        args[0].assertions,
        vec![Assertion::Compare(Cmp::Ge, Operand::Literal(-1))]
    );
    assert_eq!(
        args[1].assertions,
        vec![Assertion::Compare(Cmp::Lt, Operand::Literal(255))]
    );
}

#[test]
fn test_display_is_canonical() {
    let text = "fread func(&void[>=@3],size_t/@1,size_t,&FILE)size_t<@3;ferror(@4)";
    let tag = parse(text);
    assert_eq!(tag.to_string(), text);
    assert_eq!(parse(&tag.to_string()).signature.args.len(), 4);
}

#[rstest]
#[case("", ParseErrorKind::Empty)]
#[case("abs", ParseErrorKind::ExpectedSignature)]
#[case("abs func(", ParseErrorKind::ExpectedTypeName)]
#[case("abs func(int int", ParseErrorKind::Expected(")"))]
#[case(",abs func(int)int", ParseErrorKind::ExpectedSymbolName)]
#[case("f func($&char)void", ParseErrorKind::DuplicateOwnership)]
#[case("f func(void)void", ParseErrorKind::VoidArgument)]
#[case("f func(int;strerror)void", ParseErrorKind::FailureOutsideReturn)]
#[case("f func(int%0)void", ParseErrorKind::ExpectedIndex)]
#[case("f func(int>@0)void", ParseErrorKind::ReturnOperandInArgument)]
#[case("f func(int>@2)void", ParseErrorKind::OperandOutOfRange { index: 2, args: 1 })]
#[case("f func(#char...f@1,int)void", ParseErrorKind::MisplacedPrintf)]
#[case("f func(int)int junk", ParseErrorKind::Unexpected('j'))]
#[case("f func(int[>@1)void", ParseErrorKind::Expected("]"))]
fn test_parse_errors(#[case] text: &str, #[case] expected: ParseErrorKind) {
    let err = Tag::parse(text).unwrap_err();
    assert_eq!(err.kind, expected);
    assert_eq!(err.tag, text);
}

#[test]
fn test_error_span_points_at_offender() {
    let err = Tag::parse("f func(int,$$char)void").unwrap_err();
    assert_eq!(err.kind, ParseErrorKind::DuplicateOwnership);
    assert_eq!(err.fragment(), "$");
    assert_eq!(err.span.start, 12);
}

#[test]
fn test_constants_and_sizes() {
    assert_eq!(constant_value("EOF"), Some(-1));
    assert_eq!(constant_value("NULL"), Some(0));
    assert_eq!(constant_value("NOT_A_CONSTANT"), None);
    assert_eq!(c_size_of("void"), Some(1));
    assert_eq!(c_size_of("int"), Some(4));
    assert_eq!(c_size_of("double"), Some(8));
    assert_eq!(c_size_of("FILE"), None);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn type_name() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "int", "uint", "char", "short", "long", "size_t", "double", "float", "void", "FILE",
            "bool",
        ])
    }

    fn arg() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["", "#", "$", "&", "*", "+", "-", "#&"]),
            type_name(),
            prop::sample::select(vec!["", "[>@1]", "/@1", "^@1", "~@1", ":@1", ">=0", "!NULL"]),
            prop::sample::select(vec!["", "%1", "%2"]),
        )
            .prop_filter_map("void needs a sigil", |(prefix, name, suffix, macro_)| {
                let bare = prefix.is_empty() || prefix == "-";
                if bare && name == "void" {
                    None
                } else {
                    Some(format!("{}{}{}{}", prefix, name, suffix, macro_))
                }
            })
    }

    fn tag() -> impl Strategy<Value = String> {
        (
            prop::collection::vec(arg(), 1..5),
            type_name(),
            prop::sample::select(vec!["", "<0", "=0;strerror", "!0;SDL_GetError"]),
        )
            .prop_map(|(args, ret, fail)| format!("sym,alt func({}){}{}", args.join(","), ret, fail))
    }

    proptest! {
        #[test]
        fn parsing_is_idempotent(text in tag()) {
            let first = Tag::parse(&text);
            let second = Tag::parse(&text);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.is_ok(), "{:?}", first);
        }

        #[test]
        fn display_reparses_to_same_shape(text in tag()) {
            let tag = Tag::parse(&text).unwrap();
            let reparsed = Tag::parse(&tag.to_string()).unwrap();
            prop_assert_eq!(tag.names, reparsed.names);
            let prims = |t: &Signature| t.args.iter().map(|a| a.prim).collect::<Vec<_>>();
            prop_assert_eq!(prims(&tag.signature), prims(&reparsed.signature));
            prop_assert_eq!(tag.signature.ret.prim, reparsed.signature.ret.prim);
        }
    }
}
