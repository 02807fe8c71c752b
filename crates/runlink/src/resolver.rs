//! Symbol resolution across loaded libraries
//!
//! Resolution is name-major: the first candidate name is looked up in every
//! library before the second name is tried. This lets a tag such as
//! `atexit,__cxa_atexit` prefer the portable name wherever it exists.

use crate::loader::NativeLibrary;
use serde::Serialize;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Non-null address of a native symbol
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(NonNull<c_void>);

// SAFETY: an address is an immutable integer; dereferencing it is what
// requires care, and every such use is behind an `unsafe` API
unsafe impl Send for Address {}
unsafe impl Sync for Address {}

impl Address {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:p})", self.0)
    }
}

/// Outcome of resolving a candidate name list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    Resolved {
        address: Address,
        /// The candidate name that matched
        matched: String,
        attempted: Vec<String>,
    },
    Unresolved {
        attempted: Vec<String>,
    },
}

impl Symbol {
    pub fn address(&self) -> Option<Address> {
        match self {
            Symbol::Resolved { address, .. } => Some(*address),
            Symbol::Unresolved { .. } => None,
        }
    }

    pub fn attempted(&self) -> &[String] {
        match self {
            Symbol::Resolved { attempted, .. } | Symbol::Unresolved { attempted } => attempted,
        }
    }

    pub fn into_result(self) -> Result<(Address, String), MissingSymbol> {
        match self {
            Symbol::Resolved {
                address, matched, ..
            } => Ok((address, matched)),
            Symbol::Unresolved { attempted } => Err(MissingSymbol { attempted }),
        }
    }
}

/// None of the candidate names resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("symbol not found (tried {})", .attempted.join(", "))]
pub struct MissingSymbol {
    pub attempted: Vec<String>,
}

/// Resolve `names` against `libraries`, name-major
pub fn resolve(libraries: &[Arc<dyn NativeLibrary>], names: &[String]) -> Symbol {
    for name in names {
        for library in libraries {
            if let Some(address) = library.symbol(name) {
                return Symbol::Resolved {
                    address,
                    matched: name.clone(),
                    attempted: names.to_vec(),
                };
            }
        }
    }
    Symbol::Unresolved {
        attempted: names.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table {
        name: &'static str,
        symbols: HashMap<&'static str, usize>,
    }

    impl NativeLibrary for Table {
        fn name(&self) -> &str {
            self.name
        }

        fn symbol(&self, name: &str) -> Option<Address> {
            self.symbols
                .get(name)
                .and_then(|&addr| Address::new(addr as *mut c_void))
        }
    }

    fn table(name: &'static str, symbols: &[(&'static str, usize)]) -> Arc<dyn NativeLibrary> {
        Arc::new(Table {
            name,
            symbols: symbols.iter().copied().collect(),
        })
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_name_major_order() {
        let libs = [
            table("first", &[("fallback", 0x10)]),
            table("second", &[("preferred", 0x20)]),
        ];
        let symbol = resolve(&libs, &names(&["preferred", "fallback"]));
        match symbol {
            Symbol::Resolved {
                address, matched, ..
            } => {
                assert_eq!(matched, "preferred");
                assert_eq!(address.addr(), 0x20);
            }
            other => panic!("expected resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_first_library_wins_for_same_name() {
        let libs = [table("a", &[("f", 0x1)]), table("b", &[("f", 0x2)])];
        let symbol = resolve(&libs, &names(&["f"]));
        assert_eq!(symbol.address().map(|a| a.addr()), Some(0x1));
    }

    #[test]
    fn test_unresolved_keeps_attempts() {
        let libs = [table("a", &[])];
        let symbol = resolve(&libs, &names(&["x", "y"]));
        assert_eq!(symbol.attempted(), &["x".to_string(), "y".to_string()]);
        let err = symbol.into_result().unwrap_err();
        assert_eq!(err.to_string(), "symbol not found (tried x, y)");
    }

    #[test]
    fn test_null_address_is_rejected() {
        assert!(Address::new(std::ptr::null_mut()).is_none());
    }
}
