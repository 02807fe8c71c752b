//! runlink - tag-driven dynamic binding of C libraries
//!
//! Native functions are described by compact tags such as
//! `puts func(&char)int<0;strerror`. The crate provides:
//! - the tag parser ([`tag`]) and the mapping from tags to language shapes ([`types`])
//! - a call frame builder over a pooled calling-convention VM ([`caller`], [`vm`])
//! - callback trampolines for passing language functions to C ([`callbacks`])
//! - library loading and name-major symbol resolution ([`loader`], [`resolver`])
//! - the binder that fills library descriptions with callable slots ([`binder`])

/// runlink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod binder;
pub mod callbacks;
pub mod caller;
pub mod handle;
pub mod loader;
pub mod logging;
pub mod marshal;
pub mod resolver;
pub mod safety;
pub mod tag;
pub mod types;
pub mod vm;

pub use binder::{BindError, BindEvent, BindReport, Binder, Library, LibraryNode, Node, Slot, Thunk};
pub use callbacks::{CallbackError, Trampoline};
pub use caller::{CallError, CallPlan, ForeignError, ForeignFunction, SignatureError};
pub use handle::{AddressPassable, Buffer, Handle, Pointer, Record};
pub use loader::{open_location, LibrarySet, LoadError, Loader, NativeLibrary, SystemLoader};
pub use resolver::{resolve, Address, MissingSymbol, Symbol};
pub use safety::AssertionError;
pub use tag::{ParseError, Signature, Tag, TypeDesc};
pub use types::{Class, FnShape, Kind, LanguageFn, NativeValue, Value};
pub use vm::{Backend, CallVm, FramePool, LibffiBackend};

pub use runlink_config::Config;

/// Abort on a broken calling contract (wrong arity, wrong value kind, an
/// unset slot). These are programming errors, not recoverable failures.
#[cold]
#[track_caller]
pub(crate) fn contract_violation(message: &str) -> ! {
    panic!("runlink contract violation: {}", message)
}
