//! Tag grammar
//!
//! A tag names one or more candidate symbols followed by the C type of the
//! symbol, annotated with ownership and safety assertions:
//!
//! ```text
//! fread func(&void[@3],size_t/@1,size_t,&FILE)size_t<@3;ferror(@4)
//! ```
//!
//! `Tag::parse` turns the text into a [`Tag`]; parsing is pure and the same
//! input always yields equal output.

mod parser;

use serde::Serialize;
use std::fmt;
use std::os::raw::c_long;

/// A parsed tag: candidate symbol names in order of preference plus the signature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    pub names: Vec<String>,
    pub signature: Signature,
}

impl Tag {
    /// Parse a tag of the form `name[,name...] <type-signature>`
    pub fn parse(text: &str) -> Result<Tag, ParseError> {
        parser::Parser::new(text).parse()
    }
}

/// Argument and return descriptors of a symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signature {
    pub args: Vec<TypeDesc>,
    pub ret: TypeDesc,
    /// `true` when written as `func(...)ret`
    pub func: bool,
}

impl Signature {
    /// The return carries an error condition or a failure lookup
    pub fn is_fallible(&self) -> bool {
        self.error_condition().is_some() || self.ret.failure.is_some()
    }

    /// The relational assertion on the return value, if any
    pub fn error_condition(&self) -> Option<(Cmp, &Operand)> {
        self.ret.assertions.iter().find_map(|a| match a {
            Assertion::Compare(cmp, operand) => Some((*cmp, operand)),
            _ => None,
        })
    }

    /// Index of the printf-style variadic argument, if declared
    pub fn printf_index(&self) -> Option<usize> {
        self.args.iter().position(|a| a.printf_format().is_some())
    }
}

/// Primitive shape of a described value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Prim {
    Void,
    Bool,
    Int { bits: u8, signed: bool },
    Float { bits: u8 },
    Pointer,
    String,
    Handle,
    Aggregate,
}

/// Who frees a pointer-backed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Ownership {
    /// `$` the receiver takes ownership and must free it
    Sold,
    /// `&` the receiver's use ends when the call returns
    Borrowed,
    /// `*` neither side frees
    Static,
    /// `+` the receiver overwrites storage owned by the sender
    Initialize,
}

impl Ownership {
    pub fn sigil(self) -> char {
        match self {
            Ownership::Sold => '$',
            Ownership::Borrowed => '&',
            Ownership::Static => '*',
            Ownership::Initialize => '+',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Cmp {
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
    Ne,
}

impl Cmp {
    /// Evaluate `lhs <cmp> rhs`
    pub fn holds(self, lhs: i128, rhs: i128) -> bool {
        match self {
            Cmp::Ge => lhs >= rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cmp::Ge => ">=",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Lt => "<",
            Cmp::Eq => "=",
            Cmp::Ne => "!",
        }
    }
}

/// Right-hand side of an assertion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Operand {
    /// `@n`, where `@0` is the return value and `@1` the first argument
    Arg(usize),
    Literal(i64),
    /// A C constant such as `NULL` or `EOF`
    Constant(String),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Arg(n) => write!(f, "@{}", n),
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Constant(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Assertion {
    /// `[cmp operand]` memory capacity compared with the operand
    Capacity(Cmp, Operand),
    /// `cmp operand` value comparison; on the return it is the error condition
    Compare(Cmp, Operand),
    /// `/operand` equals the size of the operand's pointee
    SizeOf(Operand),
    /// `^operand` points within the operand's buffer
    Within(Operand),
    /// `~operand` must not overlap the operand's buffer
    Disjoint(Operand),
    /// `:operand` same pointee type as the operand
    SameType(Operand),
    /// `...f operand` printf-style variadic tail, format at the operand
    Printf(Operand),
}

impl Assertion {
    pub fn operand(&self) -> &Operand {
        match self {
            Assertion::Capacity(_, op)
            | Assertion::Compare(_, op)
            | Assertion::SizeOf(op)
            | Assertion::Within(op)
            | Assertion::Disjoint(op)
            | Assertion::SameType(op)
            | Assertion::Printf(op) => op,
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::Capacity(cmp, op) => write!(f, "[{}{}]", cmp.as_str(), op),
            Assertion::Compare(cmp, op) => write!(f, "{}{}", cmp.as_str(), op),
            Assertion::SizeOf(op) => write!(f, "/{}", op),
            Assertion::Within(op) => write!(f, "^{}", op),
            Assertion::Disjoint(op) => write!(f, "~{}", op),
            Assertion::SameType(op) => write!(f, ":{}", op),
            Assertion::Printf(op) => write!(f, "...f{}", op),
        }
    }
}

/// `;symbol(operands)` diagnostic lookup run when the return signals failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Failure {
    pub symbol: String,
    /// Empty means the raw return code is passed
    pub operands: Vec<Operand>,
}

/// Byte range inside the tag text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// One argument or return type of a signature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeDesc {
    pub prim: Prim,
    /// C type name as written, without sigils
    pub name: String,
    pub ownership: Option<Ownership>,
    /// `#` the pointee is read-only
    pub immutable: bool,
    /// `-` not supplied by the caller
    pub ignored: bool,
    /// `%n` takes the value of language parameter `n` (1-based)
    pub maps: Option<usize>,
    pub assertions: Vec<Assertion>,
    pub failure: Option<Failure>,
    pub span: Span,
}

impl TypeDesc {
    /// Format operand of a printf-style argument
    pub fn printf_format(&self) -> Option<&Operand> {
        self.assertions.iter().find_map(|a| match a {
            Assertion::Printf(op) => Some(op),
            _ => None,
        })
    }

    /// Scalar shape of the pointee for pointer-like descriptors
    pub fn pointee(&self) -> Option<Prim> {
        scalar_prim(&self.name)
    }

    /// Declared with a sigil, i.e. passed by address
    pub fn is_indirect(&self) -> bool {
        self.ownership.is_some() || self.immutable
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ignored {
            f.write_str("-")?;
        }
        if self.immutable {
            f.write_str("#")?;
        }
        if let Some(ownership) = self.ownership {
            write!(f, "{}", ownership.sigil())?;
        }
        f.write_str(&self.name)?;
        for assertion in &self.assertions {
            write!(f, "{}", assertion)?;
        }
        if let Some(n) = self.maps {
            write!(f, "%{}", n)?;
        }
        if let Some(failure) = &self.failure {
            write!(f, ";{}", failure.symbol)?;
            if !failure.operands.is_empty() {
                let ops: Vec<String> = failure.operands.iter().map(|o| o.to_string()).collect();
                write!(f, "({})", ops.join(","))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.func {
            return write!(f, "{}", self.ret);
        }
        f.write_str("func(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, "){}", self.ret)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.names.join(","), self.signature)
    }
}

/// Shape of a standard C scalar type name
pub fn scalar_prim(name: &str) -> Option<Prim> {
    let int = |bits: usize, signed: bool| Prim::Int {
        bits: bits as u8,
        signed,
    };
    let long_bits = std::mem::size_of::<c_long>() * 8;
    let ptr_bits = std::mem::size_of::<usize>() * 8;
    Some(match name {
        "bool" | "_Bool" => Prim::Bool,
        "char" | "schar" | "int8_t" => int(8, true),
        "uchar" | "uint8_t" => int(8, false),
        "short" | "int16_t" => int(16, true),
        "ushort" | "uint16_t" => int(16, false),
        "int" | "int32_t" => int(32, true),
        "uint" | "uint32_t" => int(32, false),
        "long" => int(long_bits, true),
        "ulong" => int(long_bits, false),
        "longlong" | "int64_t" => int(64, true),
        "ulonglong" | "uint64_t" => int(64, false),
        "ssize_t" | "ptrdiff_t" | "intptr_t" => int(ptr_bits, true),
        "size_t" | "uintptr_t" => int(ptr_bits, false),
        "float" => Prim::Float { bits: 32 },
        "double" => Prim::Float { bits: 64 },
        _ => return None,
    })
}

/// `sizeof` of a C type name; `void` counts as one byte
pub fn c_size_of(name: &str) -> Option<usize> {
    if name == "void" {
        return Some(1);
    }
    match scalar_prim(name)? {
        Prim::Bool => Some(1),
        Prim::Int { bits, .. } | Prim::Float { bits } => Some(bits as usize / 8),
        _ => None,
    }
}

/// Value of a well-known C constant
pub fn constant_value(name: &str) -> Option<i64> {
    Some(match name {
        "NULL" | "false" | "EXIT_SUCCESS" | "SEEK_SET" => 0,
        "true" | "EXIT_FAILURE" | "SEEK_CUR" => 1,
        "SEEK_END" => 2,
        "EOF" => -1,
        "CHAR_BIT" => 8,
        "INT_MAX" => i32::MAX as i64,
        "INT_MIN" => i32::MIN as i64,
        "UINT_MAX" => u32::MAX as i64,
        "SIZE_MAX" => i64::MAX,
        _ => return None,
    })
}

/// What went wrong while parsing a tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    Empty,
    ExpectedSymbolName,
    ExpectedSignature,
    ExpectedTypeName,
    ExpectedOperand,
    ExpectedIndex,
    Expected(&'static str),
    Unexpected(char),
    DuplicateOwnership,
    Duplicate(&'static str),
    VoidArgument,
    FailureOutsideReturn,
    MisplacedPrintf,
    OperandOutOfRange { index: usize, args: usize },
    ReturnOperandInArgument,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::Empty => write!(f, "tag is empty"),
            ParseErrorKind::ExpectedSymbolName => write!(f, "expected a symbol name"),
            ParseErrorKind::ExpectedSignature => {
                write!(f, "expected a space followed by the type signature")
            }
            ParseErrorKind::ExpectedTypeName => write!(f, "expected a type name"),
            ParseErrorKind::ExpectedOperand => {
                write!(f, "expected '@n', an integer literal or a constant name")
            }
            ParseErrorKind::ExpectedIndex => write!(f, "expected a positive index"),
            ParseErrorKind::Expected(what) => write!(f, "expected '{}'", what),
            ParseErrorKind::Unexpected(c) => write!(f, "unexpected character '{}'", c),
            ParseErrorKind::DuplicateOwnership => {
                write!(f, "more than one ownership sigil on a type")
            }
            ParseErrorKind::Duplicate(what) => write!(f, "{} given more than once", what),
            ParseErrorKind::VoidArgument => write!(f, "'void' is only valid as a return type"),
            ParseErrorKind::FailureOutsideReturn => {
                write!(f, "failure lookups are only valid on the return type")
            }
            ParseErrorKind::MisplacedPrintf => {
                write!(f, "a printf-style argument must be the last argument")
            }
            ParseErrorKind::OperandOutOfRange { index, args } => write!(
                f,
                "operand @{} refers past the {} declared argument(s)",
                index, args
            ),
            ParseErrorKind::ReturnOperandInArgument => {
                write!(f, "'@0' names the return value and cannot be used on an argument")
            }
        }
    }
}

/// Malformed tag text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tag `{tag}` at {}..{}: {kind}", .span.start, .span.end)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
    pub tag: String,
}

impl ParseError {
    /// The offending slice of the tag text
    pub fn fragment(&self) -> &str {
        let end = self.span.end.min(self.tag.len());
        self.tag.get(self.span.start.min(end)..end).unwrap_or("")
    }
}

#[cfg(test)]
mod tests;
