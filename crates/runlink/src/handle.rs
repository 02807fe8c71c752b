//! Ownership-tagged handles for foreign memory
//!
//! Raw addresses never travel through the API bare. A [`Pointer`] records
//! how much memory sits behind it and who frees it, a [`Handle`] is an opaque
//! typed address (`FILE *`), a [`Buffer`] is byte storage owned by the caller
//! and lent to foreign code for one call, and [`AddressPassable`] lets an
//! aggregate be passed by its stable address.

use crate::tag::Ownership;
use std::cell::UnsafeCell;
use std::ffi::{c_void, CStr};
use std::fmt;
use std::os::raw::c_char;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Untyped foreign address with optional capacity and ownership
///
/// Capabilities:
/// - borrow: [`Pointer::as_ptr`] to hand the address to another call
/// - read-only view: [`Pointer::as_bytes`] / [`Pointer::read_c_str`]
/// - own-and-free: [`Pointer::free`] for memory sold to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    addr: usize,
    capacity: Option<usize>,
    ownership: Option<Ownership>,
}

impl Pointer {
    pub fn null() -> Self {
        Self::new(std::ptr::null_mut())
    }

    pub fn new(ptr: *mut c_void) -> Self {
        Self {
            addr: ptr as usize,
            capacity: None,
            ownership: None,
        }
    }

    /// Record the number of addressable bytes behind the pointer
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = Some(ownership);
        self
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.addr as *mut c_void
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.ownership
    }

    /// View the pointee as bytes
    ///
    /// Returns `None` for null pointers or when the capacity is unknown.
    ///
    /// # Safety
    ///
    /// The memory must be live and readable for `capacity` bytes for as long
    /// as the returned slice is used.
    pub unsafe fn as_bytes(&self) -> Option<&[u8]> {
        match self.capacity {
            Some(len) if !self.is_null() => {
                Some(std::slice::from_raw_parts(self.addr as *const u8, len))
            }
            _ => None,
        }
    }

    /// Copy the NUL-terminated string at this address
    ///
    /// # Safety
    ///
    /// The pointer must be null or point to a NUL-terminated byte sequence.
    pub unsafe fn read_c_str(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        Some(
            CStr::from_ptr(self.addr as *const c_char)
                .to_string_lossy()
                .into_owned(),
        )
    }

    /// Release memory that foreign code sold to the caller
    ///
    /// Gives the pointer back unchanged when it was not sold.
    ///
    /// # Safety
    ///
    /// The memory must have come from the C allocator and must not be used
    /// after this call.
    pub unsafe fn free(self) -> Result<(), Pointer> {
        if self.ownership != Some(Ownership::Sold) {
            return Err(self);
        }
        libc::free(self.as_ptr());
        Ok(())
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::null()
    }
}

/// Opaque typed address such as `FILE *` or `SDL_Window *`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    addr: usize,
    type_name: Arc<str>,
}

impl Handle {
    pub fn new(type_name: &str, ptr: *mut c_void) -> Self {
        Self {
            addr: ptr as usize,
            type_name: Arc::from(type_name),
        }
    }

    pub fn null(type_name: &str) -> Self {
        Self::new(type_name, std::ptr::null_mut())
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.addr as *mut c_void
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

/// Caller-owned byte storage lent to foreign code
///
/// Cloning shares the storage. The bytes are locked for the duration of each
/// call they are passed to.
#[derive(Clone, Default)]
pub struct Buffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Buffer {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Contents up to the first NUL byte, decoded lossily
    pub fn to_string_lossy(&self) -> String {
        let bytes = self.lock();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the bytes unless they are already locked, e.g. by a running call
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Vec<u8>>> {
        match self.bytes.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Both buffers share the same storage
    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub(crate) fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.bytes) as usize
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(bytes) => f.debug_struct("Buffer").field("len", &bytes.len()).finish(),
            None => f.debug_struct("Buffer").field("len", &"<locked>").finish(),
        }
    }
}

/// An aggregate that can be passed to foreign code by address
///
/// # Safety
///
/// `address` must stay valid and unmoved for the lifetime of the value and
/// point to at least `size` bytes laid out as the foreign code expects.
pub unsafe trait AddressPassable: Send + Sync {
    fn address(&self) -> *mut c_void;

    fn size(&self) -> usize;

    /// C type name of the aggregate, used for diagnostics
    fn type_name(&self) -> &str {
        "struct"
    }
}

/// A `#[repr(C)]` value boxed at a stable address
///
/// Foreign code may write through the address while a call runs, so reads
/// copy the value out instead of lending a reference.
pub struct Record<T: Copy + Send + 'static> {
    cell: Box<UnsafeCell<T>>,
}

impl<T: Copy + Send + 'static> Record<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Box::new(UnsafeCell::new(value)),
        }
    }

    pub fn get(&self) -> T {
        // SAFETY: the cell is only written by foreign calls that received the
        // address, which finish before control returns here
        unsafe { *self.cell.get() }
    }

    pub fn set(&self, value: T) {
        unsafe { *self.cell.get() = value }
    }
}

// SAFETY: access goes through copies; concurrent foreign writers are excluded
// by the call discipline documented on the type
unsafe impl<T: Copy + Send + 'static> Sync for Record<T> {}

unsafe impl<T: Copy + Send + 'static> AddressPassable for Record<T> {
    fn address(&self) -> *mut c_void {
        self.cell.get() as *mut c_void
    }

    fn size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn type_name(&self) -> &str {
        std::any::type_name::<T>()
    }
}

impl<T: Copy + Send + fmt::Debug + 'static> fmt::Debug for Record<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Record").field(&self.get()).finish()
    }
}
