//! Shared test fixtures
//!
//! - `FakeLoader`: a `Loader` serving in-memory symbol tables
//! - `RecordingBackend`: a `Backend` whose frames record every push and
//!   answer calls through a closure instead of jumping to native code

#![allow(dead_code)]

use runlink::callbacks::CallbackError;
use runlink::vm::{NativeThunk, ThunkHandler};
use runlink::{Address, Backend, CallVm, Class, LoadError, Loader, NativeLibrary, NativeValue};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

/// A made-up, never dereferenced address
pub fn fake_address(n: usize) -> Address {
    Address::new((0x1000 + n * 0x10) as *mut c_void).unwrap()
}

/// Address of an `extern "C"` function
pub fn address_of(f: *const ()) -> Address {
    Address::new(f as *mut c_void).unwrap()
}

pub struct FakeLibrary {
    name: String,
    symbols: HashMap<String, Address>,
}

impl NativeLibrary for FakeLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<Address> {
        self.symbols.get(name).copied()
    }
}

/// Loader over a fixed set of fake library files
#[derive(Default)]
pub struct FakeLoader {
    files: HashMap<String, Arc<FakeLibrary>>,
    opened: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn library(mut self, file: &str, symbols: &[(&str, Address)]) -> Self {
        let symbols = symbols
            .iter()
            .map(|(name, address)| (name.to_string(), *address))
            .collect();
        self.files.insert(
            file.to_string(),
            Arc::new(FakeLibrary {
                name: file.to_string(),
                symbols,
            }),
        );
        self
    }

    /// Files successfully opened, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl Loader for FakeLoader {
    fn open(&self, file: &str) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        match self.files.get(file) {
            Some(library) => {
                self.opened.lock().unwrap().push(file.to_string());
                let library: Arc<dyn NativeLibrary> = library.clone();
                Ok(library)
            }
            None => Err(LoadError::LibraryNotFound {
                location: file.to_string(),
                attempted: vec![file.to_string()],
            }),
        }
    }
}

/// One argument pushed onto a recording frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pushed {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl Pushed {
    pub fn as_ptr(&self) -> *mut c_void {
        match *self {
            Pushed::Pointer(p) => p,
            _ => panic!("expected a pointer argument, got {:?}", self),
        }
    }
}

// SAFETY: recorded pointers are only compared or read while the call is live
unsafe impl Send for Pushed {}

/// A completed call on a recording frame
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub target: Address,
    pub args: Vec<Pushed>,
    /// Index of the first variadic argument
    pub varargs_at: Option<usize>,
    pub ret: Class,
}

/// Answers a call; runs while the pushed arguments are still valid
pub type Responder = Arc<dyn Fn(Address, &[Pushed]) -> NativeValue + Send + Sync>;

#[derive(Clone)]
pub struct RecordingBackend {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    responder: Responder,
}

impl RecordingBackend {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(Address, &[Pushed]) -> NativeValue + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Backend for RecordingBackend {
    fn new_vm(&self, capacity: usize) -> Box<dyn CallVm> {
        Box::new(RecordingVm {
            capacity,
            args: Vec::new(),
            varargs_at: None,
            calls: Arc::clone(&self.calls),
            responder: Arc::clone(&self.responder),
        })
    }

    fn new_thunk(
        &self,
        _params: &[Class],
        _ret: Class,
        _handler: ThunkHandler,
    ) -> Result<Box<dyn NativeThunk>, CallbackError> {
        Err(CallbackError::Backend(
            "recording backend cannot create thunks".to_string(),
        ))
    }
}

struct RecordingVm {
    capacity: usize,
    args: Vec<Pushed>,
    varargs_at: Option<usize>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    responder: Responder,
}

impl RecordingVm {
    fn finish(&mut self, target: Address, ret: Class) -> NativeValue {
        let value = (self.responder)(target, &self.args);
        self.calls.lock().unwrap().push(RecordedCall {
            target,
            args: std::mem::take(&mut self.args),
            varargs_at: self.varargs_at.take(),
            ret,
        });
        value
    }
}

impl CallVm for RecordingVm {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.args.clear();
        self.varargs_at = None;
    }

    fn push_bool(&mut self, value: bool) {
        self.args.push(Pushed::Bool(value));
    }

    fn push_i8(&mut self, value: i8) {
        self.args.push(Pushed::I8(value));
    }

    fn push_i16(&mut self, value: i16) {
        self.args.push(Pushed::I16(value));
    }

    fn push_i32(&mut self, value: i32) {
        self.args.push(Pushed::I32(value));
    }

    fn push_i64(&mut self, value: i64) {
        self.args.push(Pushed::I64(value));
    }

    fn push_f32(&mut self, value: f32) {
        self.args.push(Pushed::F32(value));
    }

    fn push_f64(&mut self, value: f64) {
        self.args.push(Pushed::F64(value));
    }

    fn push_pointer(&mut self, value: *mut c_void) {
        self.args.push(Pushed::Pointer(value));
    }

    fn begin_varargs(&mut self) {
        self.varargs_at = Some(self.args.len());
    }

    unsafe fn call_void(&mut self, target: Address) {
        self.finish(target, Class::Void);
    }

    unsafe fn call_bool(&mut self, target: Address) -> bool {
        self.finish(target, Class::Bool).as_int() != 0
    }

    unsafe fn call_i8(&mut self, target: Address) -> i8 {
        self.finish(target, Class::I8).as_int() as i8
    }

    unsafe fn call_i16(&mut self, target: Address) -> i16 {
        self.finish(target, Class::I16).as_int() as i16
    }

    unsafe fn call_i32(&mut self, target: Address) -> i32 {
        self.finish(target, Class::I32).as_int() as i32
    }

    unsafe fn call_i64(&mut self, target: Address) -> i64 {
        self.finish(target, Class::I64).as_int() as i64
    }

    unsafe fn call_f32(&mut self, target: Address) -> f32 {
        match self.finish(target, Class::F32) {
            NativeValue::F32(v) => v,
            other => other.as_int() as f32,
        }
    }

    unsafe fn call_f64(&mut self, target: Address) -> f64 {
        match self.finish(target, Class::F64) {
            NativeValue::F64(v) => v,
            other => other.as_int() as f64,
        }
    }

    unsafe fn call_pointer(&mut self, target: Address) -> *mut c_void {
        self.finish(target, Class::Pointer).as_ptr()
    }
}
