//! Safety assertions checked before a foreign call
//!
//! Assertions come from the tag (`[>=@3]`, `/@1`, `^@2`, `~@2`, `...f@1`) and
//! are evaluated on the mapped native argument list, so `%n` macros and
//! ignored arguments are already resolved. Assertions whose inputs are
//! unknown (a raw pointer without capacity, a format passed as a pointer)
//! are skipped rather than guessed.

use crate::caller::SignatureError;
use crate::tag::{c_size_of, constant_value, Assertion, Operand, Signature, TypeDesc};
use crate::types::{Class, Kind, NativeValue, Value};

/// An assertion that did not hold
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("argument {arg} violates `{assertion}`: {detail}")]
pub struct AssertionError {
    /// 1-based native argument index
    pub arg: usize,
    pub assertion: String,
    pub detail: String,
}

/// One native argument as seen by the checks
#[derive(Debug, Clone, Copy)]
pub struct ArgState<'v> {
    /// Language value the argument came from, if any
    pub value: Option<&'v Value>,
    pub native: NativeValue,
    pub class: Class,
    /// Bytes addressable through the argument, when known
    ///
    /// Recorded while marshaling; a buffer's length is read from the guard
    /// already held for the call, never by locking it again.
    pub capacity: Option<usize>,
}

impl ArgState<'_> {
    fn int(&self) -> i128 {
        self.native.as_int_of(self.class)
    }

    fn address(&self) -> usize {
        self.native.as_ptr() as usize
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn same_storage(&self, other: &ArgState<'_>) -> bool {
        match (self.value, other.value) {
            (Some(Value::Buffer(a)), Some(Value::Buffer(b))) => a.same_storage(b),
            _ => false,
        }
    }
}

/// Bind-time checks that need no argument values
///
/// Rejects unknown constant names and `:@n` assertions between different
/// pointee types.
pub fn check_signature(signature: &Signature) -> Result<(), SignatureError> {
    let descs = signature.args.iter().chain(std::iter::once(&signature.ret));
    for desc in descs {
        let failure_ops = desc.failure.iter().flat_map(|f| f.operands.iter());
        for operand in desc.assertions.iter().map(Assertion::operand).chain(failure_ops) {
            if let Operand::Constant(name) = operand {
                if constant_value(name).is_none() {
                    return Err(SignatureError::UnknownConstant(name.clone()));
                }
            }
        }
    }

    for (i, arg) in signature.args.iter().enumerate() {
        for assertion in &arg.assertions {
            if let Assertion::SameType(Operand::Arg(n)) = assertion {
                let other = &signature.args[n - 1];
                if other.name != arg.name {
                    return Err(SignatureError::TypeMismatch {
                        arg: i + 1,
                        expected: other.name.clone(),
                        found: arg.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Integer value of an operand against the current arguments
pub(crate) fn operand_value(operand: &Operand, args: &[ArgState<'_>]) -> Option<i128> {
    match operand {
        Operand::Arg(n) => args.get(n.checked_sub(1)?).map(ArgState::int),
        Operand::Literal(v) => Some(*v as i128),
        Operand::Constant(name) => constant_value(name).map(i128::from),
    }
}

/// Check every argument assertion of `signature`
///
/// `args` is the full native argument list in declaration order (excluding
/// the variadic tail), `tail` the values passed for a printf-style argument.
pub fn check_arguments(
    signature: &Signature,
    args: &[ArgState<'_>],
    tail: &[Value],
) -> Result<(), AssertionError> {
    for (i, desc) in signature.args.iter().enumerate() {
        let Some(state) = args.get(i) else {
            continue;
        };
        for assertion in &desc.assertions {
            check_one(i, &signature.args, assertion, state, args, tail)?;
        }
    }
    Ok(())
}

fn check_one(
    index: usize,
    descs: &[TypeDesc],
    assertion: &Assertion,
    state: &ArgState<'_>,
    args: &[ArgState<'_>],
    tail: &[Value],
) -> Result<(), AssertionError> {
    let desc = &descs[index];
    let fail = |detail: String| AssertionError {
        arg: index + 1,
        assertion: assertion.to_string(),
        detail,
    };
    let other = |operand: &Operand| match operand {
        Operand::Arg(n) => n.checked_sub(1).and_then(|i| args.get(i)),
        _ => None,
    };

    match assertion {
        Assertion::Compare(cmp, operand) => {
            let Some(rhs) = operand_value(operand, args) else {
                return Ok(());
            };
            let lhs = state.int();
            if !cmp.holds(lhs, rhs) {
                return Err(fail(format!("{} {} {} is false", lhs, cmp.as_str(), rhs)));
            }
        }
        Assertion::Capacity(cmp, operand) => {
            let (Some(bytes), Some(rhs)) = (state.capacity(), operand_value(operand, args)) else {
                return Ok(());
            };
            if state.address() == 0 {
                return Ok(());
            }
            let element = c_size_of(&desc.name).unwrap_or(1).max(1);
            let elements = (bytes / element) as i128;
            if !cmp.holds(elements, rhs) {
                return Err(fail(format!(
                    "capacity {} {} {} is false",
                    elements,
                    cmp.as_str(),
                    rhs
                )));
            }
        }
        Assertion::SizeOf(operand) => {
            let expected = match operand {
                // `/@n` is the size of the pointee of argument n
                Operand::Arg(n) => n
                    .checked_sub(1)
                    .and_then(|i| descs.get(i))
                    .and_then(|d| c_size_of(&d.name))
                    .map(|size| size as i128),
                literal => operand_value(literal, args),
            };
            if let Some(expected) = expected {
                if state.int() != expected {
                    return Err(fail(format!("{} is not {}", state.int(), expected)));
                }
            }
        }
        Assertion::Within(operand) => {
            let Some(base) = other(operand) else {
                return Ok(());
            };
            let Some(len) = base.capacity() else {
                return Ok(());
            };
            let (start, at) = (base.address(), state.address());
            if at != 0 && (at < start || at > start + len) {
                return Err(fail(format!(
                    "{:#x} lies outside {:#x}..{:#x}",
                    at,
                    start,
                    start + len
                )));
            }
        }
        Assertion::Disjoint(operand) => {
            let Some(peer) = other(operand) else {
                return Ok(());
            };
            if state.same_storage(peer) {
                return Err(fail("both arguments share one buffer".to_string()));
            }
            let (a, b) = (state.address(), peer.address());
            if a == 0 || b == 0 {
                return Ok(());
            }
            let a_end = a + state.capacity().unwrap_or(1);
            let b_end = b + peer.capacity().unwrap_or(1);
            if a < b_end && b < a_end {
                return Err(fail(format!(
                    "{:#x}..{:#x} overlaps {:#x}..{:#x}",
                    a, a_end, b, b_end
                )));
            }
        }
        Assertion::SameType(_) => {}
        Assertion::Printf(operand) => {
            let format = match other(operand).and_then(|s| s.value) {
                Some(Value::String(format)) => format,
                _ => return Ok(()),
            };
            check_format(format, tail).map_err(fail)?;
        }
    }
    Ok(())
}

/// Validate a printf format against the values of the variadic tail
///
/// `%%` is a literal percent sign and `%n` is always rejected.
pub fn check_format(format: &str, tail: &[Value]) -> Result<(), String> {
    let bytes = format.as_bytes();
    let mut values = tail.iter();
    let mut consumed = 0usize;
    let mut i = 0;

    let mut take = |expect: &str, accepts: &dyn Fn(&Kind) -> bool| -> Result<(), String> {
        consumed += 1;
        match values.next().and_then(Value::kind) {
            Some(kind) if accepts(&kind) => Ok(()),
            Some(kind) => Err(format!(
                "conversion {} expects {}, got {}",
                consumed, expect, kind
            )),
            None => Err(format!(
                "conversion {} has no matching argument",
                consumed
            )),
        }
    };

    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            i += 1;
            continue;
        }

        while matches!(bytes.get(i), Some(b'-' | b'+' | b' ' | b'#' | b'0' | b'\'')) {
            i += 1;
        }
        if bytes.get(i) == Some(&b'*') {
            take("an int width", &is_int)?;
            i += 1;
        }
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            if bytes.get(i) == Some(&b'*') {
                take("an int precision", &is_int)?;
                i += 1;
            }
            while bytes.get(i).is_some_and(u8::is_ascii_digit) {
                i += 1;
            }
        }
        while matches!(bytes.get(i), Some(b'h' | b'l' | b'j' | b'z' | b't' | b'L' | b'q')) {
            i += 1;
        }

        match bytes.get(i).copied() {
            Some(b'd' | b'i' | b'c' | b'u' | b'o' | b'x' | b'X') => take("an integer", &is_int)?,
            Some(b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A') => {
                take("a float", &|k: &Kind| matches!(k, Kind::F32 | Kind::F64))?
            }
            Some(b's') => take("a string", &|k: &Kind| {
                matches!(k, Kind::String | Kind::Pointer | Kind::Buffer)
            })?,
            Some(b'p') => take("a pointer", &|k: &Kind| {
                !is_int(k) && !matches!(k, Kind::F32 | Kind::F64 | Kind::Error)
            })?,
            Some(b'n') => return Err("%n is not allowed".to_string()),
            Some(other) => return Err(format!("unknown conversion '%{}'", other as char)),
            None => return Err("format ends inside a conversion".to_string()),
        }
        i += 1;
    }

    let extra = values.count();
    if extra > 0 {
        return Err(format!(
            "{} argument(s) beyond the {} conversion(s)",
            extra, consumed
        ));
    }
    Ok(())
}

fn is_int(kind: &Kind) -> bool {
    kind.int_bits().is_some() || *kind == Kind::Bool
}
