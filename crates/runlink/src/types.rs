//! Type mapping between language values and native classes
//!
//! - `Kind`: shape of a language-level value (what a slot's function type says)
//! - `Class`: native primitive class a value is pushed or pulled as
//! - `Value`: a language-level value
//! - `NativeValue`: a value as it sits in a call frame (signed integers only)

use crate::callbacks::Trampoline;
use crate::caller::{arg_roles, trailing_initializers, ArgRole, SignatureError};
use crate::handle::{AddressPassable, Buffer, Handle, Pointer};
use crate::tag::{Prim, Signature};
use serde::Serialize;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Shape of a language-level value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Kind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
    String,
    Buffer,
    Handle,
    Aggregate,
    Function(FnShape),
    /// Trailing error result of a fallible function
    Error,
}

impl Kind {
    /// Language kind for a described primitive (`None` for `void`)
    pub fn from_prim(prim: Prim) -> Option<Kind> {
        Some(match prim {
            Prim::Void => return None,
            Prim::Bool => Kind::Bool,
            Prim::Int { bits, signed } => Kind::int(bits, signed)?,
            Prim::Float { bits: 32 } => Kind::F32,
            Prim::Float { .. } => Kind::F64,
            Prim::Pointer => Kind::Pointer,
            Prim::String => Kind::String,
            Prim::Handle => Kind::Handle,
            Prim::Aggregate => Kind::Aggregate,
        })
    }

    pub fn int(bits: u8, signed: bool) -> Option<Kind> {
        Some(match (bits, signed) {
            (8, true) => Kind::I8,
            (16, true) => Kind::I16,
            (32, true) => Kind::I32,
            (64, true) => Kind::I64,
            (8, false) => Kind::U8,
            (16, false) => Kind::U16,
            (32, false) => Kind::U32,
            (64, false) => Kind::U64,
            _ => return None,
        })
    }

    /// Width of an integer kind in bits
    pub fn int_bits(&self) -> Option<u8> {
        match self {
            Kind::I8 | Kind::U8 => Some(8),
            Kind::I16 | Kind::U16 => Some(16),
            Kind::I32 | Kind::U32 => Some(32),
            Kind::I64 | Kind::U64 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Bool => "bool",
            Kind::I8 => "i8",
            Kind::I16 => "i16",
            Kind::I32 => "i32",
            Kind::I64 => "i64",
            Kind::U8 => "u8",
            Kind::U16 => "u16",
            Kind::U32 => "u32",
            Kind::U64 => "u64",
            Kind::F32 => "f32",
            Kind::F64 => "f64",
            Kind::Pointer => "pointer",
            Kind::String => "string",
            Kind::Buffer => "buffer",
            Kind::Handle => "handle",
            Kind::Aggregate => "aggregate",
            Kind::Function(shape) => return write!(f, "{}", shape),
            Kind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Language-level function type of a slot or callback
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct FnShape {
    pub params: Vec<Kind>,
    pub results: Vec<Kind>,
    /// Accepts extra trailing arguments after the last parameter
    /// (printf-style tails)
    pub variadic: bool,
}

impl FnShape {
    pub fn new(params: Vec<Kind>, results: Vec<Kind>) -> Self {
        Self {
            params,
            results,
            variadic: false,
        }
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Results end in `Kind::Error`
    pub fn is_fallible(&self) -> bool {
        self.results.last() == Some(&Kind::Error)
    }

    /// Derive the language shape a tag implies when a slot declares none
    ///
    /// Trailing `+scalar` arguments become extra results and a fallible
    /// return appends `Kind::Error`.
    pub fn infer(signature: &Signature) -> Result<FnShape, SignatureError> {
        if !signature.func {
            return Err(SignatureError::NotAFunction);
        }

        let outs = trailing_initializers(signature);
        let (roles, param_count) = arg_roles(signature, outs);

        let mut params: Vec<Option<Kind>> = vec![None; param_count];
        let mut out_kinds = Vec::with_capacity(outs);
        for (arg, role) in signature.args.iter().zip(&roles) {
            match role {
                ArgRole::Param(p) => {
                    if params[*p].is_none() {
                        params[*p] = Some(Kind::from_prim(arg.prim).ok_or_else(|| {
                            SignatureError::Unsupported {
                                position: format!("parameter {}", p + 1),
                                reason: format!("'{}' has no language kind", arg.name),
                            }
                        })?);
                    }
                }
                ArgRole::Out(_) => {
                    // trailing_initializers only counts scalar pointees
                    if let Some(kind) = arg.pointee().and_then(Kind::from_prim) {
                        out_kinds.push(kind);
                    }
                }
                ArgRole::Fill => {}
            }
        }

        let params = params
            .into_iter()
            .enumerate()
            .map(|(p, kind)| {
                kind.ok_or_else(|| SignatureError::Unsupported {
                    position: format!("parameter {}", p + 1),
                    reason: "no argument is mapped to it".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::new();
        if let Some(primary) = Kind::from_prim(signature.ret.prim) {
            results.push(primary);
        }
        results.extend(out_kinds);
        if signature.is_fallible() {
            results.push(Kind::Error);
        }

        Ok(FnShape {
            params,
            results,
            variadic: signature.printf_index().is_some(),
        })
    }
}

impl fmt::Display for FnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|k| k.to_string()).collect();
        write!(f, "fn({}", params.join(", "))?;
        if self.variadic {
            f.write_str(if self.params.is_empty() { "..." } else { ", ..." })?;
        }
        f.write_str(")")?;
        match self.results.len() {
            0 => Ok(()),
            1 => write!(f, " -> {}", self.results[0]),
            _ => {
                let results: Vec<String> = self.results.iter().map(|k| k.to_string()).collect();
                write!(f, " -> ({})", results.join(", "))
            }
        }
    }
}

/// Native primitive class of a pushed or pulled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Class {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
    String,
}

impl Class {
    /// Class of a described primitive; aggregates by value have none
    pub fn of(prim: Prim) -> Option<Class> {
        Some(match prim {
            Prim::Void => Class::Void,
            Prim::Bool => Class::Bool,
            Prim::Int { bits, signed } => match (bits, signed) {
                (8, true) => Class::I8,
                (16, true) => Class::I16,
                (32, true) => Class::I32,
                (64, true) => Class::I64,
                (8, false) => Class::U8,
                (16, false) => Class::U16,
                (32, false) => Class::U32,
                (64, false) => Class::U64,
                _ => return None,
            },
            Prim::Float { bits: 32 } => Class::F32,
            Prim::Float { .. } => Class::F64,
            Prim::Pointer | Prim::Handle => Class::Pointer,
            Prim::String => Class::String,
            Prim::Aggregate => return None,
        })
    }

    /// Class used when a language kind crosses the boundary on its own,
    /// as in callback parameters and hidden out-params
    pub fn for_kind(kind: &Kind) -> Option<Class> {
        Some(match kind {
            Kind::Bool => Class::Bool,
            Kind::I8 => Class::I8,
            Kind::I16 => Class::I16,
            Kind::I32 => Class::I32,
            Kind::I64 => Class::I64,
            Kind::U8 => Class::U8,
            Kind::U16 => Class::U16,
            Kind::U32 => Class::U32,
            Kind::U64 => Class::U64,
            Kind::F32 => Class::F32,
            Kind::F64 => Class::F64,
            Kind::Pointer | Kind::Handle | Kind::Function(_) => Class::Pointer,
            Kind::String => Class::String,
            Kind::Buffer | Kind::Aggregate | Kind::Error => return None,
        })
    }

    /// Can a value of `kind` be pushed as this class
    pub fn accepts(self, kind: &Kind) -> bool {
        match self {
            Class::Void => false,
            Class::Bool => *kind == Kind::Bool,
            Class::F32 => *kind == Kind::F32,
            Class::F64 => *kind == Kind::F64,
            Class::Pointer => matches!(
                kind,
                Kind::Pointer | Kind::Buffer | Kind::Handle | Kind::Aggregate | Kind::Function(_)
            ),
            Class::String => matches!(kind, Kind::String | Kind::Pointer),
            int => int.int_bits().is_some() && kind.int_bits() == int.int_bits(),
        }
    }

    /// Can a value pulled as this class be presented as `kind`
    pub fn produces(self, kind: &Kind) -> bool {
        match self {
            Class::Pointer => matches!(kind, Kind::Pointer | Kind::Handle),
            other => other.accepts(kind),
        }
    }

    pub fn int_bits(self) -> Option<u8> {
        match self {
            Class::I8 | Class::U8 => Some(8),
            Class::I16 | Class::U16 => Some(16),
            Class::I32 | Class::U32 => Some(32),
            Class::I64 | Class::U64 => Some(64),
            _ => None,
        }
    }

    /// Bytes a value of this class occupies in a call frame
    pub fn frame_bytes(self) -> usize {
        match self {
            Class::Void => 0,
            Class::Bool | Class::I8 | Class::U8 => 1,
            Class::I16 | Class::U16 => 2,
            Class::I32 | Class::U32 | Class::F32 => 4,
            Class::I64 | Class::U64 | Class::F64 => 8,
            Class::Pointer | Class::String => std::mem::size_of::<usize>(),
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A function implemented in the host language, callable from foreign code
#[derive(Clone)]
pub struct LanguageFn {
    shape: FnShape,
    body: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl LanguageFn {
    pub fn new<F>(shape: FnShape, body: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            shape,
            body: Arc::new(body),
        }
    }

    pub fn shape(&self) -> &FnShape {
        &self.shape
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.body)(args)
    }

    pub fn same_function(&self, other: &LanguageFn) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for LanguageFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LanguageFn({})", self.shape)
    }
}

/// A language-level value
#[derive(Clone)]
pub enum Value {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(Pointer),
    String(String),
    Buffer(Buffer),
    Handle(Handle),
    Aggregate(Arc<dyn AddressPassable>),
    Function(LanguageFn),
    Callback(Arc<Trampoline>),
}

impl Value {
    /// Kind of the value; `None` for `Void`
    pub fn kind(&self) -> Option<Kind> {
        Some(match self {
            Value::Void => return None,
            Value::Bool(_) => Kind::Bool,
            Value::I8(_) => Kind::I8,
            Value::I16(_) => Kind::I16,
            Value::I32(_) => Kind::I32,
            Value::I64(_) => Kind::I64,
            Value::U8(_) => Kind::U8,
            Value::U16(_) => Kind::U16,
            Value::U32(_) => Kind::U32,
            Value::U64(_) => Kind::U64,
            Value::F32(_) => Kind::F32,
            Value::F64(_) => Kind::F64,
            Value::Pointer(_) => Kind::Pointer,
            Value::String(_) => Kind::String,
            Value::Buffer(_) => Kind::Buffer,
            Value::Handle(_) => Kind::Handle,
            Value::Aggregate(_) => Kind::Aggregate,
            Value::Function(f) => Kind::Function(f.shape().clone()),
            Value::Callback(t) => Kind::Function(t.shape().clone()),
        })
    }

    /// Integer view of numeric values, reinterpreting unsigned bits
    pub fn as_i64(&self) -> Option<i64> {
        Some(match self {
            Value::Bool(b) => *b as i64,
            Value::I8(v) => *v as i64,
            Value::I16(v) => *v as i64,
            Value::I32(v) => *v as i64,
            Value::I64(v) => *v,
            Value::U8(v) => *v as i64,
            Value::U16(v) => *v as i64,
            Value::U32(v) => *v as i64,
            Value::U64(v) => *v as i64,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            Value::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    /// Bytes addressable behind a pointer-like value, when known
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Value::Pointer(p) => p.capacity(),
            Value::String(s) => Some(s.len() + 1),
            Value::Buffer(b) => Some(b.len()),
            Value::Aggregate(a) => Some(a.size()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "Void"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::I8(v) => write!(f, "I8({})", v),
            Value::I16(v) => write!(f, "I16({})", v),
            Value::I32(v) => write!(f, "I32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::U8(v) => write!(f, "U8({})", v),
            Value::U16(v) => write!(f, "U16({})", v),
            Value::U32(v) => write!(f, "U32({})", v),
            Value::U64(v) => write!(f, "U64({})", v),
            Value::F32(v) => write!(f, "F32({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Pointer(p) => write!(f, "Pointer({:#x})", p.addr()),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Buffer(b) => write!(f, "{:?}", b),
            Value::Handle(h) => write!(f, "Handle({} @ {:p})", h.type_name(), h.as_ptr()),
            Value::Aggregate(a) => write!(f, "Aggregate({} @ {:p})", a.type_name(), a.address()),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Callback(t) => write!(f, "Callback({:?})", t.address()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a.addr() == b.addr(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a.same_storage(b),
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Aggregate(a), Value::Aggregate(b)) => a.address() == b.address(),
            (Value::Function(a), Value::Function(b)) => a.same_function(b),
            (Value::Callback(a), Value::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Pointer => Pointer,
    String => String,
    Buffer => Buffer,
    Handle => Handle,
    LanguageFn => Function,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// A value as it sits in a call frame
///
/// Unsigned integers are carried as the signed type of equal width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl NativeValue {
    pub fn zero(class: Class) -> NativeValue {
        NativeValue::from_int(class, 0)
    }

    /// Truncate an integer into the frame representation of `class`
    pub fn from_int(class: Class, v: i128) -> NativeValue {
        match class {
            Class::Void => NativeValue::Void,
            Class::Bool => NativeValue::Bool(v != 0),
            Class::I8 | Class::U8 => NativeValue::I8(v as i8),
            Class::I16 | Class::U16 => NativeValue::I16(v as i16),
            Class::I32 | Class::U32 => NativeValue::I32(v as i32),
            Class::I64 | Class::U64 => NativeValue::I64(v as i64),
            Class::F32 => NativeValue::F32(v as f32),
            Class::F64 => NativeValue::F64(v as f64),
            Class::Pointer | Class::String => NativeValue::Pointer(v as usize as *mut c_void),
        }
    }

    /// Integer view used by assertions and error conditions
    pub fn as_int(&self) -> i128 {
        match *self {
            NativeValue::Void => 0,
            NativeValue::Bool(b) => b as i128,
            NativeValue::I8(v) => v as i128,
            NativeValue::I16(v) => v as i128,
            NativeValue::I32(v) => v as i128,
            NativeValue::I64(v) => v as i128,
            NativeValue::F32(v) => v as i128,
            NativeValue::F64(v) => v as i128,
            NativeValue::Pointer(p) => p as usize as i128,
        }
    }

    /// Integer view honouring the signedness of `class`
    pub fn as_int_of(&self, class: Class) -> i128 {
        match (*self, class) {
            (NativeValue::I8(v), Class::U8) => v as u8 as i128,
            (NativeValue::I16(v), Class::U16) => v as u16 as i128,
            (NativeValue::I32(v), Class::U32) => v as u32 as i128,
            (NativeValue::I64(v), Class::U64) => v as u64 as i128,
            (native, _) => native.as_int(),
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        match *self {
            NativeValue::Pointer(p) => p,
            other => other.as_int() as usize as *mut c_void,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn shape_of(tag: &str) -> FnShape {
        FnShape::infer(&Tag::parse(tag).unwrap().signature).unwrap()
    }

    #[test]
    fn test_infer_simple_shape() {
        assert_eq!(
            shape_of("abs func(int)int"),
            FnShape::new(vec![Kind::I32], vec![Kind::I32])
        );
    }

    #[test]
    fn test_infer_fallible_appends_error() {
        assert_eq!(
            shape_of("puts func(&char)int<0;strerror"),
            FnShape::new(vec![Kind::String], vec![Kind::I32, Kind::Error])
        );
    }

    #[test]
    fn test_infer_out_params_and_ignored() {
        let shape = shape_of("f func(#char,-size_t/@1,+int,+double)void");
        assert_eq!(shape.params, vec![Kind::String]);
        assert_eq!(shape.results, vec![Kind::I32, Kind::F64]);
    }

    #[test]
    fn test_infer_argument_mapping() {
        let shape = shape_of("f func(int%2,double%1)void");
        assert_eq!(shape.params, vec![Kind::F64, Kind::I32]);
    }

    #[test]
    fn test_infer_variadic() {
        let shape = shape_of("printf func(#char...f@1)int");
        assert!(shape.variadic);
        assert_eq!(shape.params, vec![Kind::String]);
        assert_eq!(shape.to_string(), "fn(string, ...) -> i32");
    }

    #[test]
    fn test_infer_rejects_non_function() {
        let sig = Tag::parse("errno int").unwrap().signature;
        assert!(matches!(
            FnShape::infer(&sig),
            Err(SignatureError::NotAFunction)
        ));
    }

    #[rstest]
    #[case(Class::I32, Kind::I32, true)]
    #[case(Class::I32, Kind::U32, true)]
    #[case(Class::I32, Kind::I64, false)]
    #[case(Class::U8, Kind::I8, true)]
    #[case(Class::F32, Kind::F64, false)]
    #[case(Class::Pointer, Kind::Buffer, true)]
    #[case(Class::Pointer, Kind::String, false)]
    #[case(Class::String, Kind::String, true)]
    #[case(Class::String, Kind::Pointer, true)]
    #[case(Class::Void, Kind::Pointer, false)]
    fn test_class_accepts(#[case] class: Class, #[case] kind: Kind, #[case] expected: bool) {
        assert_eq!(class.accepts(&kind), expected);
    }

    #[test]
    fn test_pointer_class_produces_only_addresses() {
        assert!(Class::Pointer.produces(&Kind::Handle));
        assert!(!Class::Pointer.produces(&Kind::Buffer));
        assert!(!Class::Pointer.produces(&Kind::Aggregate));
    }

    #[test]
    fn test_native_value_reinterprets_unsigned() {
        let native = NativeValue::from_int(Class::U32, u32::MAX as i128);
        assert_eq!(native, NativeValue::I32(-1));
        assert_eq!(native.as_int_of(Class::U32), u32::MAX as i128);
        assert_eq!(native.as_int(), -1);
    }

    #[test]
    fn test_value_kind_and_conversions() {
        assert_eq!(Value::from(7u16).kind(), Some(Kind::U16));
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(-3i8).as_i64(), Some(-3));
        assert_eq!(Value::from(u64::MAX).as_i64(), Some(-1));
        assert_eq!(Value::Void.kind(), None);
        assert_eq!(Value::from("abc").capacity(), Some(4));
    }
}
