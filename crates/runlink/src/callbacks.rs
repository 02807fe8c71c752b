//! Callbacks: native entry points that call back into language functions
//!
//! A [`Trampoline`] wraps a [`LanguageFn`] in a backend thunk. When native
//! code calls the thunk, each native argument is rebuilt as a [`Value`], the
//! function runs, and its single result is written back with the class the
//! function's shape declares.

use crate::marshal::{malloc_c_str, pull_value};
use crate::resolver::Address;
use crate::types::{Class, FnShape, Kind, LanguageFn, NativeValue, Value};
use crate::vm::{ArgCursor, Backend, NativeThunk, ThunkHandler};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Errors that can occur while creating a callback
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallbackError {
    #[error("a callback cannot take or return a value of kind {0}")]
    Unsupported(Kind),

    #[error("a callback returns at most one result, this shape has {0}")]
    TooManyResults(usize),

    #[error("variadic callbacks are not supported")]
    Variadic,

    #[error("backend could not create the thunk: {0}")]
    Backend(String),
}

/// A language function callable from native code
///
/// The address stays valid until the trampoline is dropped.
pub struct Trampoline {
    shape: FnShape,
    thunk: Box<dyn NativeThunk>,
}

impl Trampoline {
    pub fn new(backend: &dyn Backend, function: LanguageFn) -> Result<Self, CallbackError> {
        let shape = function.shape().clone();
        if shape.variadic {
            return Err(CallbackError::Variadic);
        }

        let params = shape
            .params
            .iter()
            .map(callback_class)
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match shape.results.as_slice() {
            [] => Class::Void,
            [kind] => callback_class(kind)?,
            results => return Err(CallbackError::TooManyResults(results.len())),
        };

        let classes = params.clone();
        let handler: ThunkHandler =
            Arc::new(move |cursor: &mut ArgCursor<'_>| dispatch(&function, &classes, ret, cursor));
        let thunk = backend.new_thunk(&params, ret, handler)?;

        Ok(Self { shape, thunk })
    }

    pub fn address(&self) -> Address {
        self.thunk.address()
    }

    pub fn shape(&self) -> &FnShape {
        &self.shape
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("shape", &self.shape.to_string())
            .field("address", &self.address())
            .finish()
    }
}

fn callback_class(kind: &Kind) -> Result<Class, CallbackError> {
    match kind {
        Kind::Function(_) => Err(CallbackError::Unsupported(kind.clone())),
        other => Class::for_kind(other).ok_or_else(|| CallbackError::Unsupported(other.clone())),
    }
}

/// Runs on whatever thread native code calls from
fn dispatch(
    function: &LanguageFn,
    classes: &[Class],
    ret: Class,
    cursor: &mut ArgCursor<'_>,
) -> NativeValue {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let args: Vec<Value> = function
            .shape()
            .params
            .iter()
            .zip(classes)
            // SAFETY: string parameters are NUL-terminated per the C contract
            // of the caller; they are borrowed, so never freed here
            .map(|(kind, class)| unsafe { pull_value(cursor.next_value(), *class, kind, None) })
            .collect();
        let result = function.call(&args);
        lower_result(ret, &result)
    }));

    match outcome {
        Ok(native) => native,
        Err(payload) => {
            error!(
                shape = %function.shape(),
                panic = panic_message(payload.as_ref()),
                "callback panicked, returning zero"
            );
            NativeValue::zero(ret)
        }
    }
}

/// Convert a callback result for the return register
///
/// String results are copied into C allocator memory owned by the caller.
fn lower_result(ret: Class, value: &Value) -> NativeValue {
    let native = match (ret, value) {
        (Class::Void, _) => Some(NativeValue::Void),
        (Class::Bool, Value::Bool(b)) => Some(NativeValue::Bool(*b)),
        (Class::F32, Value::F32(v)) => Some(NativeValue::F32(*v)),
        (Class::F64, Value::F64(v)) => Some(NativeValue::F64(*v)),
        (Class::String, Value::String(s)) => malloc_c_str(s).ok().map(NativeValue::Pointer),
        (Class::Pointer, Value::Pointer(p)) => Some(NativeValue::Pointer(p.as_ptr())),
        (Class::Pointer, Value::Handle(h)) => Some(NativeValue::Pointer(h.as_ptr())),
        (Class::Pointer, Value::Callback(t)) => Some(NativeValue::Pointer(t.address().as_ptr())),
        (class, value) if class.int_bits().is_some() => value
            .kind()
            .filter(|kind| class.accepts(kind))
            .and_then(|_| value.as_i64())
            .map(|v| NativeValue::from_int(class, v as i128)),
        _ => None,
    };

    native.unwrap_or_else(|| {
        error!(expected = %ret, got = ?value, "callback returned a value of the wrong kind, returning zero");
        NativeValue::zero(ret)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
