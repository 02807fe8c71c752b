//! Value marshaling between language values and call frames
//!
//! Lowering turns a [`Value`] into the [`NativeValue`] pushed for one argument;
//! the [`MarshalContext`] owns whatever must outlive the push until the call
//! returns (C string copies, buffer locks, trampolines). Pulling turns a
//! returned [`NativeValue`] back into a [`Value`] of the expected [`Kind`].
//!
//! Anything handed over to the callee (`$` strings, kept trampolines) stays
//! pending until [`MarshalContext::commit`] runs after the call; a context
//! dropped earlier releases it again.

use crate::callbacks::{CallbackError, Trampoline};
use crate::contract_violation;
use crate::handle::{Handle, Pointer};
use crate::tag::{Ownership, TypeDesc};
use crate::types::{Class, Kind, NativeValue, Value};
use crate::vm::Backend;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::MutexGuard;

/// Marshaling errors
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("string argument contains a NUL byte at offset {offset}")]
    InteriorNul { offset: usize },

    #[error("out of memory copying a {bytes}-byte string")]
    OutOfMemory { bytes: usize },

    #[error("cannot create callback: {0}")]
    Trampoline(#[from] CallbackError),
}

/// Per-call marshaling state
///
/// Everything held here stays alive until the context is dropped, which the
/// call frame builder does only after the foreign call returned.
pub struct MarshalContext<'a> {
    backend: &'a dyn Backend,
    strings: Vec<CString>,
    buffers: Vec<(usize, MutexGuard<'a, Vec<u8>>)>,
    trampolines: Vec<Trampoline>,
    /// `malloc` copies the callee takes over once the call is made
    sold: Vec<*mut c_void>,
    /// Trampolines the callee keeps beyond the call
    kept: Vec<Trampoline>,
}

impl<'a> MarshalContext<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            strings: Vec::new(),
            buffers: Vec::new(),
            trampolines: Vec::new(),
            sold: Vec::new(),
            kept: Vec::new(),
        }
    }

    /// Lower one fixed argument pushed as `class`
    ///
    /// The value's kind must already be accepted by `class`; anything else is
    /// a contract violation.
    pub fn lower(
        &mut self,
        class: Class,
        ownership: Option<Ownership>,
        value: &'a Value,
    ) -> Result<NativeValue, MarshalError> {
        let native = match (class, value) {
            (Class::Bool, Value::Bool(b)) => NativeValue::Bool(*b),
            (Class::F32, Value::F32(v)) => NativeValue::F32(*v),
            (Class::F64, Value::F64(v)) => NativeValue::F64(*v),
            (class, value) if class.int_bits().is_some() => match value.as_i64() {
                Some(v) if class.accepts(&value.kind().unwrap_or(Kind::Error)) => {
                    NativeValue::from_int(class, v as i128)
                }
                _ => mismatch(class, value),
            },
            (Class::String, Value::String(s)) => self.lower_string(s, ownership)?,
            (Class::String, Value::Pointer(p)) | (Class::Pointer, Value::Pointer(p)) => {
                NativeValue::Pointer(p.as_ptr())
            }
            (Class::Pointer, Value::Buffer(buffer)) => {
                let id = buffer.storage_id();
                let address = match self.buffers.iter_mut().find(|(held, _)| *held == id) {
                    Some((_, guard)) => guard.as_mut_ptr(),
                    None => {
                        let mut guard = buffer.lock();
                        let address = guard.as_mut_ptr();
                        self.buffers.push((id, guard));
                        address
                    }
                };
                NativeValue::Pointer(address as *mut c_void)
            }
            (Class::Pointer, Value::Handle(handle)) => NativeValue::Pointer(handle.as_ptr()),
            (Class::Pointer, Value::Aggregate(aggregate)) => {
                NativeValue::Pointer(aggregate.address())
            }
            (Class::Pointer, Value::Function(function)) => {
                let trampoline = Trampoline::new(self.backend, function.clone())?;
                let address = trampoline.address().as_ptr();
                match ownership {
                    Some(Ownership::Sold) | Some(Ownership::Static) => self.kept.push(trampoline),
                    _ => self.trampolines.push(trampoline),
                }
                NativeValue::Pointer(address)
            }
            (Class::Pointer, Value::Callback(trampoline)) => {
                NativeValue::Pointer(trampoline.address().as_ptr())
            }
            (class, value) => mismatch(class, value),
        };
        Ok(native)
    }

    /// Lower one argument of a variadic tail, applying C default promotions
    pub fn lower_variadic(&mut self, value: &'a Value) -> Result<NativeValue, MarshalError> {
        Ok(match value {
            Value::Bool(b) => NativeValue::I32(*b as i32),
            Value::I8(v) => NativeValue::I32(*v as i32),
            Value::I16(v) => NativeValue::I32(*v as i32),
            Value::I32(v) => NativeValue::I32(*v),
            Value::U8(v) => NativeValue::I32(*v as i32),
            Value::U16(v) => NativeValue::I32(*v as i32),
            Value::U32(v) => NativeValue::I32(*v as i32),
            Value::I64(v) => NativeValue::I64(*v),
            Value::U64(v) => NativeValue::I64(*v as i64),
            Value::F32(v) => NativeValue::F64(*v as f64),
            Value::F64(v) => NativeValue::F64(*v),
            Value::String(s) => self.lower_string(s, None)?,
            other => self.lower(Class::Pointer, None, other)?,
        })
    }

    fn lower_string(
        &mut self,
        text: &str,
        ownership: Option<Ownership>,
    ) -> Result<NativeValue, MarshalError> {
        if let Some(offset) = text.bytes().position(|b| b == 0) {
            return Err(MarshalError::InteriorNul { offset });
        }
        if ownership == Some(Ownership::Sold) {
            let raw = malloc_c_str(text)?;
            self.sold.push(raw);
            return Ok(NativeValue::Pointer(raw));
        }
        let copy = CString::new(text).map_err(|e| MarshalError::InteriorNul {
            offset: e.nul_position(),
        })?;
        let address = copy.as_ptr() as *mut c_void;
        self.strings.push(copy);
        Ok(NativeValue::Pointer(address))
    }

    /// Bytes addressable through `value` as lowered in this context
    ///
    /// A buffer's length comes from the guard this context holds; a buffer
    /// that was not lowered here has no known capacity.
    pub fn capacity_of(&self, value: &Value) -> Option<usize> {
        match value {
            Value::Buffer(buffer) => {
                let id = buffer.storage_id();
                self.buffers
                    .iter()
                    .find(|(held, _)| *held == id)
                    .map(|(_, guard)| guard.len())
            }
            other => other.capacity(),
        }
    }

    /// Hand sold strings and kept trampolines over to the callee
    ///
    /// Called once the foreign call was made.
    pub fn commit(&mut self) {
        self.sold.clear();
        for trampoline in self.kept.drain(..) {
            std::mem::forget(trampoline);
        }
    }

    /// Trampolines created for this call
    pub fn trampoline_count(&self) -> usize {
        self.trampolines.len() + self.kept.len()
    }

    /// Allocations still owned by this context that the callee would take over
    pub fn pending_transfers(&self) -> usize {
        self.sold.len() + self.kept.len()
    }
}

impl Drop for MarshalContext<'_> {
    fn drop(&mut self) {
        for raw in self.sold.drain(..) {
            // SAFETY: allocated by `malloc_c_str` and never reached a callee
            unsafe { libc::free(raw) };
        }
    }
}

/// Copy `text` into C allocator memory the receiver must free
pub(crate) fn malloc_c_str(text: &str) -> Result<*mut c_void, MarshalError> {
    let bytes = text.len() + 1;
    // SAFETY: the allocation is checked and exactly `bytes` long
    unsafe {
        let raw = libc::malloc(bytes) as *mut u8;
        if raw.is_null() {
            return Err(MarshalError::OutOfMemory { bytes });
        }
        std::ptr::copy_nonoverlapping(text.as_ptr(), raw, text.len());
        *raw.add(text.len()) = 0;
        Ok(raw as *mut c_void)
    }
}

#[cold]
fn mismatch(class: Class, value: &Value) -> ! {
    match value.kind() {
        Some(kind) => contract_violation(&format!("unsupported type: cannot pass {} as {}", kind, class)),
        None => contract_violation(&format!("unsupported type: cannot pass void as {}", class)),
    }
}

/// Turn a native value pulled as `class` into a value of `kind`
///
/// `desc` supplies the ownership of returned strings and the type name of
/// returned handles.
///
/// # Safety
///
/// A `String` pull reads a NUL-terminated string at the returned address, and
/// frees it when `desc` marks it as sold.
pub unsafe fn pull_value(
    native: NativeValue,
    class: Class,
    kind: &Kind,
    desc: Option<&TypeDesc>,
) -> Value {
    let int = native.as_int_of(class);
    match kind {
        Kind::Bool => Value::Bool(int != 0),
        Kind::I8 => Value::I8(int as i8),
        Kind::I16 => Value::I16(int as i16),
        Kind::I32 => Value::I32(int as i32),
        Kind::I64 => Value::I64(int as i64),
        Kind::U8 => Value::U8(int as u8),
        Kind::U16 => Value::U16(int as u16),
        Kind::U32 => Value::U32(int as u32),
        Kind::U64 => Value::U64(int as u64),
        Kind::F32 => Value::F32(match native {
            NativeValue::F32(v) => v,
            NativeValue::F64(v) => v as f32,
            other => other.as_int() as f32,
        }),
        Kind::F64 => Value::F64(match native {
            NativeValue::F64(v) => v,
            NativeValue::F32(v) => v as f64,
            other => other.as_int() as f64,
        }),
        Kind::Pointer => {
            let mut pointer = Pointer::new(native.as_ptr());
            if let Some(ownership) = desc.and_then(|d| d.ownership) {
                pointer = pointer.with_ownership(ownership);
            }
            Value::Pointer(pointer)
        }
        Kind::String => {
            let ptr = native.as_ptr();
            if ptr.is_null() {
                return Value::String(String::new());
            }
            let text = CStr::from_ptr(ptr as *const c_char)
                .to_string_lossy()
                .into_owned();
            if desc.and_then(|d| d.ownership) == Some(Ownership::Sold) {
                libc::free(ptr);
            }
            Value::String(text)
        }
        Kind::Handle => {
            let type_name = desc.map(|d| d.name.as_str()).unwrap_or("void");
            Value::Handle(Handle::new(type_name, native.as_ptr()))
        }
        other => contract_violation(&format!("unsupported type: cannot return {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Buffer, Record};
    use crate::tag::Tag;
    use crate::vm::LibffiBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_unsigned_is_reinterpreted() {
        let backend = LibffiBackend;
        let value = Value::U32(u32::MAX);
        let mut ctx = MarshalContext::new(&backend);
        assert_eq!(ctx.lower(Class::U32, None, &value).unwrap(), NativeValue::I32(-1));

        let back = unsafe { pull_value(NativeValue::I32(-1), Class::U32, &Kind::U32, None) };
        assert_eq!(back, Value::U32(u32::MAX));
    }

    #[test]
    fn test_borrowed_string_lives_in_context() {
        let backend = LibffiBackend;
        let value = Value::from("hello");
        let mut ctx = MarshalContext::new(&backend);
        let native = ctx.lower(Class::String, Some(Ownership::Borrowed), &value).unwrap();
        let text = unsafe { CStr::from_ptr(native.as_ptr() as *const c_char) };
        assert_eq!(text.to_str().unwrap(), "hello");
    }

    #[test]
    fn test_sold_string_is_malloced() {
        let backend = LibffiBackend;
        let value = Value::from("mine");
        let mut ctx = MarshalContext::new(&backend);
        let native = ctx.lower(Class::String, Some(Ownership::Sold), &value).unwrap();
        assert_eq!(ctx.pending_transfers(), 1);
        ctx.commit();
        assert_eq!(ctx.pending_transfers(), 0);
        drop(ctx);
        // Still readable after the context is gone; the receiver frees it
        let text = unsafe { CStr::from_ptr(native.as_ptr() as *const c_char) }
            .to_string_lossy()
            .into_owned();
        assert_eq!(text, "mine");
        unsafe { libc::free(native.as_ptr()) };
    }

    #[test]
    fn test_interior_nul_is_an_error() {
        let backend = LibffiBackend;
        let value = Value::from("a\0b");
        let mut ctx = MarshalContext::new(&backend);
        assert!(matches!(
            ctx.lower(Class::String, None, &value),
            Err(MarshalError::InteriorNul { offset: 1 })
        ));
    }

    #[test]
    fn test_same_buffer_twice_shares_lock() {
        let backend = LibffiBackend;
        let buffer = Buffer::new(8);
        let a = Value::Buffer(buffer.clone());
        let b = Value::Buffer(buffer);
        let mut ctx = MarshalContext::new(&backend);
        let first = ctx.lower(Class::Pointer, None, &a).unwrap();
        let second = ctx.lower(Class::Pointer, None, &b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_capacity_of_held_buffer_reads_guard() {
        let backend = LibffiBackend;
        let buffer = Buffer::new(12);
        let held = Value::Buffer(buffer.clone());
        let elsewhere = Value::Buffer(Buffer::new(3));
        let text = Value::from("abc");
        let mut ctx = MarshalContext::new(&backend);
        ctx.lower(Class::Pointer, None, &held).unwrap();

        // The lock is still held by the context
        assert!(buffer.try_lock().is_none());
        assert_eq!(ctx.capacity_of(&held), Some(12));
        assert_eq!(ctx.capacity_of(&elsewhere), None);
        assert_eq!(ctx.capacity_of(&text), Some(4));
        drop(ctx);
        assert_eq!(buffer.try_lock().map(|bytes| bytes.len()), Some(12));
    }

    #[test]
    fn test_uncommitted_transfers_are_released() {
        let backend = LibffiBackend;
        let value = Value::from("never sent");
        let mut ctx = MarshalContext::new(&backend);
        ctx.lower(Class::String, Some(Ownership::Sold), &value).unwrap();
        ctx.lower(Class::String, Some(Ownership::Sold), &value).unwrap();
        assert_eq!(ctx.pending_transfers(), 2);
        // Dropping without commit frees both copies
        drop(ctx);
    }

    #[test]
    fn test_aggregate_passes_address() {
        let backend = LibffiBackend;
        let record = Arc::new(Record::new([0u8; 4]));
        let expected = crate::handle::AddressPassable::address(record.as_ref());
        let value = Value::Aggregate(record);
        let mut ctx = MarshalContext::new(&backend);
        let native = ctx.lower(Class::Pointer, None, &value).unwrap();
        assert_eq!(native.as_ptr(), expected);
    }

    #[test]
    #[should_panic(expected = "unsupported type")]
    fn test_kind_mismatch_is_contract_violation() {
        let backend = LibffiBackend;
        let value = Value::F64(1.0);
        let mut ctx = MarshalContext::new(&backend);
        let _ = ctx.lower(Class::I32, None, &value);
    }

    #[test]
    fn test_variadic_promotions() {
        let backend = LibffiBackend;
        let small = Value::U8(200);
        let float = Value::F32(1.5);
        let mut ctx = MarshalContext::new(&backend);
        assert_eq!(ctx.lower_variadic(&small).unwrap(), NativeValue::I32(200));
        assert_eq!(ctx.lower_variadic(&float).unwrap(), NativeValue::F64(1.5));
    }

    #[test]
    fn test_pull_null_string_is_empty() {
        let value = unsafe {
            pull_value(
                NativeValue::Pointer(std::ptr::null_mut()),
                Class::String,
                &Kind::String,
                None,
            )
        };
        assert_eq!(value, Value::String(String::new()));
    }

    #[test]
    fn test_pull_handle_takes_type_name() {
        let tag = Tag::parse("fopen func(#char,#char)&FILE").unwrap();
        let value = unsafe {
            pull_value(
                NativeValue::Pointer(0x40 as *mut c_void),
                Class::Pointer,
                &Kind::Handle,
                Some(&tag.signature.ret),
            )
        };
        assert_eq!(value, Value::Handle(Handle::new("FILE", 0x40 as *mut c_void)));
    }

    #[test]
    fn test_pull_sold_string_frees_copy() {
        let tag = Tag::parse("strdup func(#char)$char").unwrap();
        let raw = malloc_c_str("copied").unwrap();
        let value = unsafe {
            pull_value(
                NativeValue::Pointer(raw),
                Class::String,
                &Kind::String,
                Some(&tag.signature.ret),
            )
        };
        assert_eq!(value.as_str(), Some("copied"));
    }
}
