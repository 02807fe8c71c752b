//! libffi-backed call frames and reverse thunks

use super::{read_native, ArgCursor, Backend, CallVm, NativeThunk, ThunkHandler};
use crate::callbacks::CallbackError;
use crate::contract_violation;
use crate::resolver::Address;
use crate::types::{Class, NativeValue};
use ::libffi::low::{self, ffi_type, CodePtr};
use ::libffi::middle::{Cif, Closure, Type};
use std::ffi::c_void;

/// Backend calling through libffi
#[derive(Debug, Clone, Copy, Default)]
pub struct LibffiBackend;

impl LibffiBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LibffiBackend {
    fn new_vm(&self, capacity: usize) -> Box<dyn CallVm> {
        Box::new(FfiVm::new(capacity))
    }

    fn new_thunk(
        &self,
        params: &[Class],
        ret: Class,
        handler: ThunkHandler,
    ) -> Result<Box<dyn NativeThunk>, CallbackError> {
        Ok(Box::new(FfiThunk::new(params, ret, handler)?))
    }
}

/// One pushed argument, stored at a stable slot until the call
#[derive(Debug, Clone, Copy)]
enum Stored {
    Bool(u8),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl Stored {
    fn ffi_type(&self) -> Type {
        match self {
            Stored::Bool(_) => Type::u8(),
            Stored::I8(_) => Type::i8(),
            Stored::I16(_) => Type::i16(),
            Stored::I32(_) => Type::i32(),
            Stored::I64(_) => Type::i64(),
            Stored::F32(_) => Type::f32(),
            Stored::F64(_) => Type::f64(),
            Stored::Pointer(_) => Type::pointer(),
        }
    }

    fn as_raw(&mut self) -> *mut c_void {
        match self {
            Stored::Bool(v) => v as *mut u8 as *mut c_void,
            Stored::I8(v) => v as *mut i8 as *mut c_void,
            Stored::I16(v) => v as *mut i16 as *mut c_void,
            Stored::I32(v) => v as *mut i32 as *mut c_void,
            Stored::I64(v) => v as *mut i64 as *mut c_void,
            Stored::F32(v) => v as *mut f32 as *mut c_void,
            Stored::F64(v) => v as *mut f64 as *mut c_void,
            Stored::Pointer(v) => v as *mut *mut c_void as *mut c_void,
        }
    }

    fn bytes(&self) -> usize {
        match self {
            Stored::Bool(_) | Stored::I8(_) => 1,
            Stored::I16(_) => 2,
            Stored::I32(_) | Stored::F32(_) => 4,
            Stored::I64(_) | Stored::F64(_) => 8,
            Stored::Pointer(_) => std::mem::size_of::<*mut c_void>(),
        }
    }
}

/// A call frame that builds a libffi call interface at call time
pub struct FfiVm {
    capacity: usize,
    used: usize,
    args: Vec<Stored>,
    /// Number of fixed arguments once `begin_varargs` was called
    fixed: Option<usize>,
}

// SAFETY: the stored pointers are plain addresses handed to native code; the
// frame never dereferences them
unsafe impl Send for FfiVm {}

impl FfiVm {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            args: Vec::with_capacity(capacity / 8),
            fixed: None,
        }
    }

    fn store(&mut self, value: Stored) {
        if self.used + value.bytes() > self.capacity {
            contract_violation(&format!(
                "call frame overflow: {} of {} argument bytes used",
                self.used, self.capacity
            ));
        }
        self.used += value.bytes();
        self.args.push(value);
    }

    /// Prepare the call interface and invoke `target`
    ///
    /// Integer returns are read as a full register (`R = u64`) since libffi
    /// widens them.
    unsafe fn call_raw<R>(&mut self, target: Address, ret: Type) -> R {
        let types: Vec<Type> = self.args.iter().map(Stored::ffi_type).collect();
        let mut raw_types: Vec<*mut ffi_type> = types.iter().map(Type::as_raw_ptr).collect();
        let mut values: Vec<*mut c_void> = self.args.iter_mut().map(Stored::as_raw).collect();

        let mut cif: low::ffi_cif = std::mem::zeroed();
        let total = raw_types.len();
        let prepared = match self.fixed {
            Some(fixed) => low::prep_cif_var(
                &mut cif,
                low::ffi_abi_FFI_DEFAULT_ABI,
                fixed,
                total,
                ret.as_raw_ptr(),
                raw_types.as_mut_ptr(),
            ),
            None => low::prep_cif(
                &mut cif,
                low::ffi_abi_FFI_DEFAULT_ABI,
                total,
                ret.as_raw_ptr(),
                raw_types.as_mut_ptr(),
            ),
        };
        if let Err(err) = prepared {
            contract_violation(&format!("libffi rejected the call interface: {:?}", err));
        }

        let result = low::call::<R>(
            &mut cif,
            CodePtr::from_ptr(target.as_ptr() as *const c_void),
            values.as_mut_ptr(),
        );
        drop(types);
        self.reset();
        result
    }
}

impl CallVm for FfiVm {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.args.clear();
        self.used = 0;
        self.fixed = None;
    }

    fn push_bool(&mut self, value: bool) {
        self.store(Stored::Bool(value as u8));
    }

    fn push_i8(&mut self, value: i8) {
        self.store(Stored::I8(value));
    }

    fn push_i16(&mut self, value: i16) {
        self.store(Stored::I16(value));
    }

    fn push_i32(&mut self, value: i32) {
        self.store(Stored::I32(value));
    }

    fn push_i64(&mut self, value: i64) {
        self.store(Stored::I64(value));
    }

    fn push_f32(&mut self, value: f32) {
        self.store(Stored::F32(value));
    }

    fn push_f64(&mut self, value: f64) {
        self.store(Stored::F64(value));
    }

    fn push_pointer(&mut self, value: *mut c_void) {
        self.store(Stored::Pointer(value));
    }

    fn begin_varargs(&mut self) {
        self.fixed = Some(self.args.len());
    }

    unsafe fn call_void(&mut self, target: Address) {
        self.call_raw::<u64>(target, Type::void());
    }

    unsafe fn call_bool(&mut self, target: Address) -> bool {
        self.call_raw::<u64>(target, Type::u8()) as u8 != 0
    }

    unsafe fn call_i8(&mut self, target: Address) -> i8 {
        self.call_raw::<u64>(target, Type::i8()) as i8
    }

    unsafe fn call_i16(&mut self, target: Address) -> i16 {
        self.call_raw::<u64>(target, Type::i16()) as i16
    }

    unsafe fn call_i32(&mut self, target: Address) -> i32 {
        self.call_raw::<u64>(target, Type::i32()) as i32
    }

    unsafe fn call_i64(&mut self, target: Address) -> i64 {
        self.call_raw::<u64>(target, Type::i64()) as i64
    }

    unsafe fn call_f32(&mut self, target: Address) -> f32 {
        self.call_raw::<f32>(target, Type::f32())
    }

    unsafe fn call_f64(&mut self, target: Address) -> f64 {
        self.call_raw::<f64>(target, Type::f64())
    }

    unsafe fn call_pointer(&mut self, target: Address) -> *mut c_void {
        self.call_raw::<*mut c_void>(target, Type::pointer())
    }
}

fn class_type(class: Class) -> Type {
    match class {
        Class::Void => Type::void(),
        Class::Bool => Type::u8(),
        Class::I8 | Class::U8 => Type::i8(),
        Class::I16 | Class::U16 => Type::i16(),
        Class::I32 | Class::U32 => Type::i32(),
        Class::I64 | Class::U64 => Type::i64(),
        Class::F32 => Type::f32(),
        Class::F64 => Type::f64(),
        Class::Pointer | Class::String => Type::pointer(),
    }
}

struct ThunkData {
    params: Vec<Class>,
    ret: Class,
    handler: ThunkHandler,
}

/// A libffi closure forwarding into a [`ThunkHandler`]
pub struct FfiThunk {
    // Declared before `data` so the closure is torn down first
    closure: Closure<'static>,
    _data: Box<ThunkData>,
}

// SAFETY: the closure only reads `data`, which is immutable and whose handler
// is Send + Sync
unsafe impl Send for FfiThunk {}
unsafe impl Sync for FfiThunk {}

impl FfiThunk {
    fn new(params: &[Class], ret: Class, handler: ThunkHandler) -> Result<Self, CallbackError> {
        if params.contains(&Class::Void) {
            return Err(CallbackError::Backend(
                "void is not a valid parameter class".to_string(),
            ));
        }

        let cif = Cif::new(params.iter().copied().map(class_type), class_type(ret));
        let data = Box::new(ThunkData {
            params: params.to_vec(),
            ret,
            handler,
        });
        // SAFETY: the box outlives the closure; see field order on FfiThunk
        let userdata: &'static ThunkData = unsafe { &*(data.as_ref() as *const ThunkData) };
        let closure = Closure::new(cif, thunk_entry, userdata);

        Ok(Self {
            closure,
            _data: data,
        })
    }
}

impl NativeThunk for FfiThunk {
    fn address(&self) -> Address {
        let code = *self.closure.code_ptr() as *const () as *mut c_void;
        match Address::new(code) {
            Some(address) => address,
            None => contract_violation("libffi produced a null closure"),
        }
    }
}

unsafe extern "C" fn thunk_entry(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &ThunkData,
) {
    let values: Vec<NativeValue> = data
        .params
        .iter()
        .enumerate()
        .map(|(i, class)| read_native(*args.add(i), *class))
        .collect();

    let mut cursor = ArgCursor::new(&values);
    let value = (data.handler)(&mut cursor);
    write_result(result, data.ret, value);
}

/// Write a thunk result the way libffi expects it
///
/// Integers fill the whole return register, sign-extended; floats are
/// written at their own width.
unsafe fn write_result(result: &mut u64, ret: Class, value: NativeValue) {
    match (ret, value) {
        (Class::Void, _) => {}
        (Class::F32, NativeValue::F32(v)) => *(result as *mut u64 as *mut f32) = v,
        (Class::F64, NativeValue::F64(v)) => *(result as *mut u64 as *mut f64) = v,
        (Class::F32, other) => *(result as *mut u64 as *mut f32) = other.as_int() as f32,
        (Class::F64, other) => *(result as *mut u64 as *mut f64) = other.as_int() as f64,
        (Class::Pointer | Class::String, other) => {
            *(result as *mut u64 as *mut *mut c_void) = other.as_ptr()
        }
        (_, other) => *result = other.as_int() as i64 as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn scale(x: f64, by: f32) -> f64 {
        x * by as f64
    }

    extern "C" fn negate_byte(x: i8) -> i8 {
        -x
    }

    extern "C" fn apply(f: extern "C" fn(i32) -> i32, v: i32) -> i32 {
        f(v)
    }

    fn address_of(ptr: *const ()) -> Address {
        Address::new(ptr as *mut c_void).unwrap()
    }

    #[test]
    fn test_call_ints() {
        let mut vm = FfiVm::new(64);
        vm.push_i32(40);
        vm.push_i32(2);
        let result = unsafe { vm.call_i32(address_of(add as *const ())) };
        assert_eq!(result, 42);
    }

    #[test]
    fn test_call_mixed_floats() {
        let mut vm = FfiVm::new(64);
        vm.push_f64(1.5);
        vm.push_f32(4.0);
        let result = unsafe { vm.call_f64(address_of(scale as *const ())) };
        assert_eq!(result, 6.0);
    }

    #[test]
    fn test_narrow_return_is_truncated() {
        let mut vm = FfiVm::new(64);
        vm.push_i8(5);
        let result = unsafe { vm.call_i8(address_of(negate_byte as *const ())) };
        assert_eq!(result, -5);
    }

    #[test]
    fn test_call_resets_frame() {
        let mut vm = FfiVm::new(16);
        vm.push_i32(1);
        vm.push_i32(2);
        unsafe { vm.call_i32(address_of(add as *const ())) };
        vm.push_i32(3);
        vm.push_i32(4);
        let result = unsafe { vm.call_i32(address_of(add as *const ())) };
        assert_eq!(result, 7);
    }

    #[test]
    #[should_panic(expected = "call frame overflow")]
    fn test_overflow_is_contract_violation() {
        let mut vm = FfiVm::new(4);
        vm.push_i32(1);
        vm.push_i32(2);
    }

    #[test]
    fn test_thunk_round_trip() {
        let handler: ThunkHandler = Arc::new(|cursor: &mut ArgCursor<'_>| {
            let v = cursor.next_value().as_int() as i32;
            NativeValue::I32(v * 3)
        });
        let thunk = LibffiBackend
            .new_thunk(&[Class::I32], Class::I32, handler)
            .unwrap();

        let mut vm = FfiVm::new(64);
        vm.push_pointer(thunk.address().as_ptr());
        vm.push_i32(-7);
        let result = unsafe { vm.call_i32(address_of(apply as *const ())) };
        assert_eq!(result, -21);
    }

    #[test]
    fn test_void_parameter_rejected() {
        let handler: ThunkHandler = Arc::new(|_: &mut ArgCursor<'_>| NativeValue::Void);
        assert!(LibffiBackend
            .new_thunk(&[Class::Void], Class::Void, handler)
            .is_err());
    }
}
