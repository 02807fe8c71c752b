//! Recursive descent over the tag text
//!
//! The grammar is ASCII-only, so the parser walks bytes and reports spans as
//! byte offsets into the original text.

use super::{
    scalar_prim, Assertion, Cmp, Failure, Operand, Ownership, ParseError, ParseErrorKind, Prim,
    Signature, Span, Tag, TypeDesc,
};

/// Where a type descriptor sits in the signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Argument,
    Return,
}

pub(super) struct Parser<'t> {
    text: &'t str,
    bytes: &'t [u8],
    current: usize,
}

type PResult<T> = Result<T, ParseError>;

impl<'t> Parser<'t> {
    pub(super) fn new(text: &'t str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            current: 0,
        }
    }

    pub(super) fn parse(mut self) -> PResult<Tag> {
        self.skip_spaces();
        if self.is_at_end() {
            return Err(self.error_at(ParseErrorKind::Empty, Span::new(0, self.text.len())));
        }

        let names = self.parse_names()?;

        if !self.check(b' ') && !self.check(b'\t') {
            return Err(self.error_here(ParseErrorKind::ExpectedSignature));
        }
        self.skip_spaces();
        if self.is_at_end() {
            return Err(self.error_here(ParseErrorKind::ExpectedSignature));
        }

        let signature = self.parse_signature()?;

        self.skip_spaces();
        if let Some(c) = self.peek() {
            return Err(self.error_here(ParseErrorKind::Unexpected(c as char)));
        }

        self.validate(&signature)?;
        Ok(Tag { names, signature })
    }

    // === Top-level parsing ===

    fn parse_names(&mut self) -> PResult<Vec<String>> {
        let mut names = Vec::new();
        loop {
            match self.identifier() {
                Some(name) => names.push(name.to_string()),
                None => return Err(self.error_here(ParseErrorKind::ExpectedSymbolName)),
            }
            if !self.match_byte(b',') {
                return Ok(names);
            }
        }
    }

    fn parse_signature(&mut self) -> PResult<Signature> {
        if self.text[self.current..].starts_with("func(") {
            self.current += "func(".len();
            let mut args = Vec::new();
            self.skip_spaces();
            if !self.match_byte(b')') {
                loop {
                    self.skip_spaces();
                    args.push(self.parse_type(Position::Argument)?);
                    self.skip_spaces();
                    if self.match_byte(b',') {
                        continue;
                    }
                    if self.match_byte(b')') {
                        break;
                    }
                    return Err(self.error_here(ParseErrorKind::Expected(")")));
                }
            }
            self.skip_spaces();
            let ret = self.parse_type(Position::Return)?;
            Ok(Signature {
                args,
                ret,
                func: true,
            })
        } else {
            let ret = self.parse_type(Position::Return)?;
            Ok(Signature {
                args: Vec::new(),
                ret,
                func: false,
            })
        }
    }

    /// Parse `prefix* typename suffix*`
    fn parse_type(&mut self, position: Position) -> PResult<TypeDesc> {
        let start = self.current;
        let mut ownership = None;
        let mut immutable = false;
        let mut ignored = false;

        // Prefixes
        while let Some(c) = self.peek() {
            let sigil = match c {
                b'$' => Some(Ownership::Sold),
                b'&' => Some(Ownership::Borrowed),
                b'*' => Some(Ownership::Static),
                b'+' => Some(Ownership::Initialize),
                b'#' => {
                    if immutable {
                        return Err(self.error_here(ParseErrorKind::Duplicate("'#'")));
                    }
                    immutable = true;
                    None
                }
                b'-' => {
                    if ignored {
                        return Err(self.error_here(ParseErrorKind::Duplicate("'-'")));
                    }
                    ignored = true;
                    None
                }
                _ => break,
            };
            if let Some(sigil) = sigil {
                if ownership.is_some() {
                    return Err(self.error_here(ParseErrorKind::DuplicateOwnership));
                }
                ownership = Some(sigil);
            }
            self.current += 1;
        }

        let name = match self.identifier() {
            Some(name) => name.to_string(),
            None => return Err(self.error_here(ParseErrorKind::ExpectedTypeName)),
        };

        let mut assertions = Vec::new();
        let mut maps = None;
        let mut failure = None;

        // Suffixes
        while let Some(c) = self.peek() {
            let suffix_start = self.current;
            match c {
                b'[' => {
                    self.current += 1;
                    let cmp = self.comparison().unwrap_or(Cmp::Ge);
                    let operand = self.operand()?;
                    self.consume(b']', "]")?;
                    assertions.push(Assertion::Capacity(cmp, operand));
                }
                b'>' | b'<' | b'=' | b'!' => {
                    let cmp = self.comparison().unwrap_or(Cmp::Eq);
                    let operand = self.operand()?;
                    assertions.push(Assertion::Compare(cmp, operand));
                }
                b'/' => {
                    self.current += 1;
                    assertions.push(Assertion::SizeOf(self.operand()?));
                }
                b'^' => {
                    self.current += 1;
                    assertions.push(Assertion::Within(self.operand()?));
                }
                b'~' => {
                    self.current += 1;
                    assertions.push(Assertion::Disjoint(self.operand()?));
                }
                b':' => {
                    self.current += 1;
                    assertions.push(Assertion::SameType(self.operand()?));
                }
                b'.' => {
                    if !self.text[self.current..].starts_with("...f") {
                        return Err(self.error_here(ParseErrorKind::Expected("...f")));
                    }
                    self.current += "...f".len();
                    assertions.push(Assertion::Printf(self.operand()?));
                }
                b'%' => {
                    self.current += 1;
                    if maps.is_some() {
                        return Err(self.error_at(
                            ParseErrorKind::Duplicate("argument mapping"),
                            Span::new(suffix_start, self.current),
                        ));
                    }
                    match self.index() {
                        Some(n) if n > 0 => maps = Some(n),
                        _ => return Err(self.error_here(ParseErrorKind::ExpectedIndex)),
                    }
                }
                b';' => {
                    if position != Position::Return {
                        return Err(self.error_here(ParseErrorKind::FailureOutsideReturn));
                    }
                    if failure.is_some() {
                        return Err(self.error_here(ParseErrorKind::Duplicate("failure lookup")));
                    }
                    self.current += 1;
                    self.skip_spaces();
                    failure = Some(self.failure()?);
                }
                _ => break,
            }
        }

        let prim = if ownership.is_some() || immutable {
            match name.as_str() {
                "char" => Prim::String,
                "void" => Prim::Pointer,
                other if scalar_prim(other).is_some() => Prim::Pointer,
                _ => Prim::Handle,
            }
        } else if name == "void" {
            if position == Position::Argument {
                return Err(self.error_at(
                    ParseErrorKind::VoidArgument,
                    Span::new(start, self.current),
                ));
            }
            Prim::Void
        } else {
            scalar_prim(&name).unwrap_or(Prim::Aggregate)
        };

        Ok(TypeDesc {
            prim,
            name,
            ownership,
            immutable,
            ignored,
            maps,
            assertions,
            failure,
            span: Span::new(start, self.current),
        })
    }

    fn failure(&mut self) -> PResult<Failure> {
        let symbol = match self.identifier() {
            Some(symbol) => symbol.to_string(),
            None => return Err(self.error_here(ParseErrorKind::ExpectedSymbolName)),
        };
        let mut operands = Vec::new();
        if self.match_byte(b'(') {
            loop {
                self.skip_spaces();
                operands.push(self.operand()?);
                self.skip_spaces();
                if self.match_byte(b',') {
                    continue;
                }
                self.consume(b')', ")")?;
                break;
            }
        }
        Ok(Failure { symbol, operands })
    }

    /// Cross-descriptor checks that need the whole signature
    fn validate(&self, signature: &Signature) -> PResult<()> {
        let count = signature.args.len();
        for (i, arg) in signature.args.iter().enumerate() {
            for assertion in &arg.assertions {
                match assertion.operand() {
                    Operand::Arg(0) => {
                        return Err(self.error_at(ParseErrorKind::ReturnOperandInArgument, arg.span))
                    }
                    Operand::Arg(n) if *n > count => {
                        return Err(self.error_at(
                            ParseErrorKind::OperandOutOfRange {
                                index: *n,
                                args: count,
                            },
                            arg.span,
                        ))
                    }
                    _ => {}
                }
                if matches!(assertion, Assertion::Printf(_)) && i + 1 != count {
                    return Err(self.error_at(ParseErrorKind::MisplacedPrintf, arg.span));
                }
            }
        }

        let ret = &signature.ret;
        let failure_ops = ret.failure.iter().flat_map(|f| f.operands.iter());
        for operand in ret.assertions.iter().map(|a| a.operand()).chain(failure_ops) {
            if let Operand::Arg(n) = operand {
                if *n > count {
                    return Err(self.error_at(
                        ParseErrorKind::OperandOutOfRange {
                            index: *n,
                            args: count,
                        },
                        ret.span,
                    ));
                }
            }
        }
        Ok(())
    }

    // === Lexical helpers ===

    fn comparison(&mut self) -> Option<Cmp> {
        let cmp = match (self.peek()?, self.bytes.get(self.current + 1).copied()) {
            (b'>', Some(b'=')) => Cmp::Ge,
            (b'<', Some(b'=')) => Cmp::Le,
            (b'>', _) => Cmp::Gt,
            (b'<', _) => Cmp::Lt,
            (b'=', _) => Cmp::Eq,
            (b'!', _) => Cmp::Ne,
            _ => return None,
        };
        self.current += cmp.as_str().len();
        Some(cmp)
    }

    fn operand(&mut self) -> PResult<Operand> {
        let start = self.current;
        match self.peek() {
            Some(b'@') => {
                self.current += 1;
                match self.index() {
                    Some(n) => Ok(Operand::Arg(n)),
                    None => Err(self.error_here(ParseErrorKind::ExpectedIndex)),
                }
            }
            Some(c) if c == b'-' || c.is_ascii_digit() => {
                if c == b'-' {
                    self.current += 1;
                }
                let literal = if self.text[self.current..].starts_with("0x") {
                    self.current += 2;
                    let digits = self.take_while(|b| b.is_ascii_hexdigit());
                    i64::from_str_radix(digits, 16).ok()
                } else {
                    self.take_while(|b| b.is_ascii_digit()).parse::<i64>().ok()
                };
                match literal {
                    Some(v) if c == b'-' => Ok(Operand::Literal(-v)),
                    Some(v) => Ok(Operand::Literal(v)),
                    None => Err(self.error_at(
                        ParseErrorKind::ExpectedOperand,
                        Span::new(start, self.current.max(start + 1)),
                    )),
                }
            }
            _ => match self.identifier() {
                Some(name) => Ok(Operand::Constant(name.to_string())),
                None => Err(self.error_here(ParseErrorKind::ExpectedOperand)),
            },
        }
    }

    fn index(&mut self) -> Option<usize> {
        self.take_while(|b| b.is_ascii_digit()).parse().ok()
    }

    fn identifier(&mut self) -> Option<&'t str> {
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {}
            _ => return None,
        }
        Some(self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_'))
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'t str {
        let start = self.current;
        while self.peek().is_some_and(&pred) {
            self.current += 1;
        }
        &self.text[start..self.current]
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.current += 1;
        }
    }

    fn consume(&mut self, byte: u8, expected: &'static str) -> PResult<()> {
        if self.match_byte(byte) {
            Ok(())
        } else {
            Err(self.error_here(ParseErrorKind::Expected(expected)))
        }
    }

    fn match_byte(&mut self, byte: u8) -> bool {
        if self.check(byte) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn check(&self, byte: u8) -> bool {
        self.peek() == Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.current).copied()
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    // === Errors ===

    /// Error spanning the next byte (or the end of input)
    fn error_here(&self, kind: ParseErrorKind) -> ParseError {
        let end = (self.current + 1).min(self.text.len());
        self.error_at(kind, Span::new(self.current, end.max(self.current)))
    }

    fn error_at(&self, kind: ParseErrorKind, span: Span) -> ParseError {
        ParseError {
            kind,
            span,
            tag: self.text.to_string(),
        }
    }
}
