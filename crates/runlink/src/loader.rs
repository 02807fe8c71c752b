//! Dynamic library loading
//!
//! [`Loader`] opens a single library file; [`SystemLoader`] does so with
//! `libloading`, searching configured directories before handing the bare
//! name to the OS loader. [`open_location`] turns a location string such as
//! `"libSDL2-2.0.so.0 libSDL2.so, libSDL2.dylib"` into a [`LibrarySet`]:
//! spaces and commas both separate alternative file names for one library.

use crate::resolver::{self, Address, Symbol};
use libloading::Library;
use runlink_config::Config;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// No alternative of the location could be opened
    #[error("library not found: {location} (tried {})", .attempted.join(", "))]
    LibraryNotFound {
        location: String,
        attempted: Vec<String>,
    },

    /// The file exists but the OS loader rejected it
    #[error("failed to load library {file}: {reason}")]
    LoadFailed { file: String, reason: String },
}

/// A loaded library
pub trait NativeLibrary: Send + Sync {
    /// File name the library was opened as
    fn name(&self) -> &str;

    fn symbol(&self, name: &str) -> Option<Address>;
}

/// Opens one library file by name or path
pub trait Loader: Send + Sync {
    fn open(&self, file: &str) -> Result<Arc<dyn NativeLibrary>, LoadError>;
}

struct SystemLibrary {
    name: String,
    path: Option<PathBuf>,
    library: Library,
}

impl NativeLibrary for SystemLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<Address> {
        // SAFETY: the symbol is only read as an address, never called here
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        Address::new(*symbol)
    }
}

impl fmt::Debug for SystemLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Loader backed by the operating system's dynamic linker
///
/// # Safety
///
/// Opening a library runs its initialization code inside this process. Only
/// load libraries you trust.
pub struct SystemLoader {
    search_paths: Vec<PathBuf>,
    loaded: Mutex<HashMap<String, Arc<SystemLibrary>>>,
}

impl SystemLoader {
    /// Loader searching the platform's standard directories
    pub fn new() -> Self {
        Self::with_search_paths(Vec::new())
    }

    /// Loader searching `paths` before the platform's standard directories
    pub fn with_search_paths(paths: Vec<PathBuf>) -> Self {
        let mut search_paths = paths;
        for path in default_search_paths() {
            if !search_paths.contains(&path) {
                search_paths.push(path);
            }
        }
        Self {
            search_paths,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_search_paths(config.search_paths())
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Find `file` in the search paths
    ///
    /// Tries the name as given, then with the platform's prefix and
    /// extension. Paths with a directory component are used as is.
    fn find(&self, file: &str) -> Option<PathBuf> {
        let path = Path::new(file);
        if path.components().count() > 1 {
            return path.exists().then(|| path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let has_extension = extensions
            .iter()
            .any(|ext| file.ends_with(&format!(".{}", ext)) || file.contains(&format!(".{}.", ext)));

        for dir in &self.search_paths {
            let exact = dir.join(file);
            if exact.is_file() {
                return Some(exact);
            }
            if has_extension {
                continue;
            }
            for prefix in ["lib", ""] {
                for ext in extensions {
                    let candidate = dir.join(format!("{}{}.{}", prefix, file, ext));
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

impl Default for SystemLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemLoader")
            .field("search_paths", &self.search_paths)
            .field("loaded", &self.loaded_count())
            .finish()
    }
}

impl Loader for SystemLoader {
    fn open(&self, file: &str) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(library) = loaded.get(file) {
            let shared: Arc<dyn NativeLibrary> = library.clone();
            return Ok(shared);
        }

        let library = match self.find(file) {
            Some(path) => {
                // SAFETY: see the type-level safety note
                let library = unsafe { Library::new(&path) }.map_err(|e| LoadError::LoadFailed {
                    file: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                SystemLibrary {
                    name: file.to_string(),
                    path: Some(path),
                    library,
                }
            }
            None => {
                // Let the OS loader apply its own search rules (ld.so.cache etc.)
                let library = unsafe { Library::new(file) }.map_err(|e| {
                    trace!(file, error = %e, "OS loader could not open library");
                    LoadError::LibraryNotFound {
                        location: file.to_string(),
                        attempted: vec![file.to_string()],
                    }
                })?;
                SystemLibrary {
                    name: file.to_string(),
                    path: None,
                    library,
                }
            }
        };

        debug!(file, path = ?library.path, "opened library");
        let library = Arc::new(library);
        loaded.insert(file.to_string(), library.clone());
        let shared: Arc<dyn NativeLibrary> = library;
        Ok(shared)
    }
}

/// Standard library directories for the current platform
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        if cfg!(target_pointer_width = "64") {
            paths.push(PathBuf::from("/usr/lib64"));
            paths.push(PathBuf::from("/lib64"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(system_root) = std::env::var("SystemRoot") {
            paths.push(PathBuf::from(format!("{}\\System32", system_root)));
        }
    }

    paths
}

/// Libraries opened for one location string, plus a symbol cache
///
/// The cache is append-only: once a name list resolves it is never looked up
/// again in this set.
pub struct LibrarySet {
    location: String,
    libraries: Vec<Arc<dyn NativeLibrary>>,
    cache: RwLock<HashMap<Vec<String>, Symbol>>,
}

impl LibrarySet {
    pub fn new(location: impl Into<String>, libraries: Vec<Arc<dyn NativeLibrary>>) -> Self {
        Self {
            location: location.into(),
            libraries,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Location string the set was opened from
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn libraries(&self) -> &[Arc<dyn NativeLibrary>] {
        &self.libraries
    }

    /// Resolve a candidate name list, memoized per list
    pub fn resolve(&self, names: &[String]) -> Symbol {
        if let Some(symbol) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(names)
        {
            return symbol.clone();
        }

        let symbol = resolver::resolve(&self.libraries, names);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(names.to_vec())
            .or_insert(symbol)
            .clone()
    }

    pub fn cached_symbols(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for LibrarySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.libraries.iter().map(|l| l.name()).collect();
        f.debug_struct("LibrarySet")
            .field("location", &self.location)
            .field("libraries", &names)
            .finish()
    }
}

/// Open the library named by a location string
///
/// The location lists alternative file names separated by spaces or commas.
/// They are tried in order and the first one that opens is the library.
pub fn open_location(loader: &dyn Loader, location: &str) -> Result<LibrarySet, LoadError> {
    let alternatives: Vec<&str> = location
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|file| !file.is_empty())
        .collect();

    let mut last_failure = None;
    for file in &alternatives {
        match loader.open(file) {
            Ok(library) => {
                trace!(location, file, "location opened");
                return Ok(LibrarySet::new(location, vec![library]));
            }
            Err(err) => {
                trace!(file, error = %err, "alternative did not open");
                last_failure = Some(err);
            }
        }
    }

    Err(match last_failure {
        Some(failed @ LoadError::LoadFailed { .. }) if alternatives.len() == 1 => failed,
        _ => {
            warn!(location, "no alternative of the library opened");
            LoadError::LibraryNotFound {
                location: location.to_string(),
                attempted: alternatives.iter().map(|s| s.to_string()).collect(),
            }
        }
    })
}
