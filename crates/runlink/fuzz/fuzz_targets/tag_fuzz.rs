//! Tag parser stability fuzzer
//!
//! Any input must either parse or return a `ParseError` without panicking.
//! Parsed tags must print back to text that parses to the same names and
//! argument types, and shape inference must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use runlink::{FnShape, Tag};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    match Tag::parse(input) {
        Ok(tag) => {
            let printed = tag.to_string();
            let reparsed = Tag::parse(&printed)
                .unwrap_or_else(|e| panic!("canonical form `{}` failed: {}", printed, e));
            assert_eq!(tag.names, reparsed.names);
            let prims = |t: &Tag| t.signature.args.iter().map(|a| a.prim).collect::<Vec<_>>();
            assert_eq!(prims(&tag), prims(&reparsed), "canonical form changed `{}`", printed);
            let _ = FnShape::infer(&tag.signature);
        }
        Err(err) => {
            assert!(err.span.start <= err.span.end);
            let _ = err.fragment();
        }
    }
});
