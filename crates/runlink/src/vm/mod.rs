//! Calling-convention virtual machine
//!
//! A [`CallVm`] receives typed arguments one at a time and then performs the
//! call through a class-specific entry point. A [`Backend`] creates VMs and
//! reverse thunks (native entry points that forward into Rust).
//!
//! The shipped backend wraps libffi ([`LibffiBackend`]); tests plug in
//! recording implementations.

pub mod libffi;
pub mod pool;

pub use self::libffi::LibffiBackend;
pub use pool::{Frame, FramePool};

use crate::callbacks::CallbackError;
use crate::contract_violation;
use crate::resolver::Address;
use crate::types::{Class, NativeValue};
use std::ffi::c_void;
use std::sync::Arc;

/// A call frame under construction
///
/// Arguments are pushed in declaration order. After [`CallVm::begin_varargs`]
/// the remaining pushes form the variadic tail. Calling consumes the pushed
/// arguments; [`CallVm::reset`] discards them without calling.
pub trait CallVm: Send {
    /// Argument bytes this frame can hold
    fn capacity(&self) -> usize;

    fn reset(&mut self);

    fn push_bool(&mut self, value: bool);
    fn push_i8(&mut self, value: i8);
    fn push_i16(&mut self, value: i16);
    fn push_i32(&mut self, value: i32);
    fn push_i64(&mut self, value: i64);
    fn push_f32(&mut self, value: f32);
    fn push_f64(&mut self, value: f64);
    fn push_pointer(&mut self, value: *mut c_void);

    /// Mark the end of the fixed arguments
    fn begin_varargs(&mut self);

    /// # Safety
    ///
    /// `target` must be a function whose native signature matches the pushed
    /// arguments and the return class of the entry point.
    unsafe fn call_void(&mut self, target: Address);
    unsafe fn call_bool(&mut self, target: Address) -> bool;
    unsafe fn call_i8(&mut self, target: Address) -> i8;
    unsafe fn call_i16(&mut self, target: Address) -> i16;
    unsafe fn call_i32(&mut self, target: Address) -> i32;
    unsafe fn call_i64(&mut self, target: Address) -> i64;
    unsafe fn call_f32(&mut self, target: Address) -> f32;
    unsafe fn call_f64(&mut self, target: Address) -> f64;
    unsafe fn call_pointer(&mut self, target: Address) -> *mut c_void;
}

impl dyn CallVm + '_ {
    /// Push a frame value with the primitive matching its representation
    pub fn push(&mut self, value: NativeValue) {
        match value {
            NativeValue::Void => contract_violation("cannot push a void argument"),
            NativeValue::Bool(v) => self.push_bool(v),
            NativeValue::I8(v) => self.push_i8(v),
            NativeValue::I16(v) => self.push_i16(v),
            NativeValue::I32(v) => self.push_i32(v),
            NativeValue::I64(v) => self.push_i64(v),
            NativeValue::F32(v) => self.push_f32(v),
            NativeValue::F64(v) => self.push_f64(v),
            NativeValue::Pointer(p) => self.push_pointer(p),
        }
    }

    /// Call `target` through the entry point for `ret`
    ///
    /// # Safety
    ///
    /// Same contract as the class-specific entry points.
    pub unsafe fn invoke(&mut self, target: Address, ret: Class) -> NativeValue {
        match ret {
            Class::Void => {
                self.call_void(target);
                NativeValue::Void
            }
            Class::Bool => NativeValue::Bool(self.call_bool(target)),
            Class::I8 | Class::U8 => NativeValue::I8(self.call_i8(target)),
            Class::I16 | Class::U16 => NativeValue::I16(self.call_i16(target)),
            Class::I32 | Class::U32 => NativeValue::I32(self.call_i32(target)),
            Class::I64 | Class::U64 => NativeValue::I64(self.call_i64(target)),
            Class::F32 => NativeValue::F32(self.call_f32(target)),
            Class::F64 => NativeValue::F64(self.call_f64(target)),
            Class::Pointer | Class::String => NativeValue::Pointer(self.call_pointer(target)),
        }
    }
}

/// Read a value of `class` stored at `slot`
///
/// # Safety
///
/// `slot` must point to a live, initialized value of the class's width.
pub unsafe fn read_native(slot: *const c_void, class: Class) -> NativeValue {
    match class {
        Class::Void => NativeValue::Void,
        Class::Bool => NativeValue::Bool(*(slot as *const u8) != 0),
        Class::I8 | Class::U8 => NativeValue::I8(*(slot as *const i8)),
        Class::I16 | Class::U16 => NativeValue::I16(*(slot as *const i16)),
        Class::I32 | Class::U32 => NativeValue::I32(*(slot as *const i32)),
        Class::I64 | Class::U64 => NativeValue::I64(*(slot as *const i64)),
        Class::F32 => NativeValue::F32(*(slot as *const f32)),
        Class::F64 => NativeValue::F64(*(slot as *const f64)),
        Class::Pointer | Class::String => NativeValue::Pointer(*(slot as *const *mut c_void)),
    }
}

/// Handler run when a reverse thunk is entered from native code
pub type ThunkHandler = Arc<dyn Fn(&mut ArgCursor<'_>) -> NativeValue + Send + Sync>;

/// A native entry point forwarding into Rust
///
/// Dropping the thunk invalidates its address.
pub trait NativeThunk: Send + Sync {
    fn address(&self) -> Address;
}

/// Factory for call frames and reverse thunks
pub trait Backend: Send + Sync {
    fn new_vm(&self, capacity: usize) -> Box<dyn CallVm>;

    fn new_thunk(
        &self,
        params: &[Class],
        ret: Class,
        handler: ThunkHandler,
    ) -> Result<Box<dyn NativeThunk>, CallbackError>;
}

/// Native arguments of a thunk invocation, read in order
pub struct ArgCursor<'a> {
    values: &'a [NativeValue],
    position: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(values: &'a [NativeValue]) -> Self {
        Self {
            values,
            position: 0,
        }
    }

    /// Next argument, or `Void` once the arguments are exhausted
    pub fn next_value(&mut self) -> NativeValue {
        let value = self
            .values
            .get(self.position)
            .copied()
            .unwrap_or(NativeValue::Void);
        self.position += 1;
        value
    }

    pub fn remaining(&self) -> usize {
        self.values.len().saturating_sub(self.position)
    }
}
