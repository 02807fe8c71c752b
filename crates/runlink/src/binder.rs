//! Library binder
//!
//! A library is a tree of [`LibraryNode`]s. Each node declares where its
//! native code lives and which [`Slot`]s it exposes. Binding walks the tree
//! once per node:
//!
//! 1. Discover a location string (override, the node's platform location,
//!    the first nested section's, or the parent's library set)
//! 2. Open it through the [`Loader`]
//! 3. Bind nested sections
//! 4. Resolve, validate and install each slot
//!
//! Problems with one slot or section are logged and recorded in the
//! [`BindReport`]; they never stop the rest of the tree from binding.

use crate::caller::{CallError, ForeignFunction};
use crate::contract_violation;
use crate::loader::{open_location, LibrarySet, LoadError, Loader, SystemLoader};
use crate::resolver::Symbol;
use crate::tag::Tag;
use crate::types::{FnShape, Value};
use crate::vm::{Backend, FramePool, LibffiBackend};
use runlink_config::Config;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, warn};

/// Installed implementation of a slot
pub type Thunk = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, CallError> + Send + Sync>;

/// A node of a library description
///
/// # Safety
///
/// Every slot tag declared by `describe` must match the native signature of
/// the symbol it names. Binding trusts the tags to build calls.
pub unsafe trait LibraryNode: Send {
    /// Declare this node's library, sections and slots
    ///
    /// May be called more than once per bind and must declare the same
    /// things each time.
    fn describe<'a>(&'a mut self, node: &mut Node<'a>);
}

/// What a [`LibraryNode`] declares
pub struct Node<'a> {
    library: Option<String>,
    locations: Vec<(String, String)>,
    sections: Vec<(String, &'a mut dyn LibraryNode)>,
    slots: Vec<(String, &'a mut Slot)>,
}

impl<'a> Node<'a> {
    fn new() -> Self {
        Self {
            library: None,
            locations: Vec::new(),
            sections: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Name used to look up configured location overrides
    pub fn library(&mut self, name: &str) -> &mut Self {
        self.library = Some(name.to_string());
        self
    }

    /// Location string to open on platform `os` (`std::env::consts::OS`)
    pub fn location(&mut self, os: &str, location: &str) -> &mut Self {
        self.locations.push((os.to_string(), location.to_string()));
        self
    }

    pub fn locations(&mut self, locations: &[(&str, &str)]) -> &mut Self {
        for (os, location) in locations {
            self.location(os, location);
        }
        self
    }

    pub fn section(&mut self, name: &str, section: &'a mut dyn LibraryNode) -> &mut Self {
        self.sections.push((name.to_string(), section));
        self
    }

    pub fn slot(&mut self, name: &str, slot: &'a mut Slot) -> &mut Self {
        self.slots.push((name.to_string(), slot));
        self
    }

    fn location_for(&self, platform: &str) -> Option<&str> {
        self.locations
            .iter()
            .find(|(os, _)| os == platform)
            .map(|(_, location)| location.as_str())
    }
}

/// A callable member of a library, bound to a tagged native symbol
pub struct Slot {
    tag: String,
    shape: Option<FnShape>,
    thunk: Option<Thunk>,
    function: Option<Arc<ForeignFunction>>,
}

impl Slot {
    /// A slot whose language shape is inferred from the tag
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            shape: None,
            thunk: None,
            function: None,
        }
    }

    /// A slot called with an explicit language shape
    pub fn with_shape(tag: &str, shape: FnShape) -> Self {
        Self {
            shape: Some(shape),
            ..Self::new(tag)
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn shape(&self) -> Option<&FnShape> {
        self.shape.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.thunk.is_some()
    }

    /// The bound foreign function, when bound by a [`Binder`]
    pub fn function(&self) -> Option<&ForeignFunction> {
        self.function.as_deref()
    }

    /// Install a custom implementation
    pub fn install(&mut self, thunk: Thunk) {
        self.thunk = Some(thunk);
        self.function = None;
    }

    pub fn clear(&mut self) {
        self.thunk = None;
        self.function = None;
    }

    /// Call the slot. Calling an unset slot is a contract violation.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, CallError> {
        match &self.thunk {
            Some(thunk) => thunk(args),
            None => contract_violation(&format!("slot `{}` is not bound", self.tag)),
        }
    }

    fn bind(&mut self, function: ForeignFunction, library: Arc<LibrarySet>) {
        let function = Arc::new(function);
        let target = Arc::clone(&function);
        self.thunk = Some(Arc::new(move |args: &[Value]| {
            let _library = &library;
            target.call(args)
        }));
        self.function = Some(function);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("tag", &self.tag)
            .field("set", &self.is_set())
            .finish()
    }
}

/// Something that happened while binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BindEvent {
    Bound {
        slot: String,
        symbol: String,
        shape: String,
    },
    SymbolMissing {
        slot: String,
        attempted: Vec<String>,
    },
    TagInvalid {
        slot: String,
        error: String,
    },
    Incompatible {
        slot: String,
        error: String,
    },
    LibraryNotFound {
        node: String,
        location: String,
        error: String,
    },
}

impl BindEvent {
    pub fn is_failure(&self) -> bool {
        !matches!(self, BindEvent::Bound { .. })
    }
}

/// Outcome of binding a library tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindReport {
    pub events: Vec<BindEvent>,
}

impl BindReport {
    pub fn bound(&self) -> usize {
        self.events.iter().filter(|e| !e.is_failure()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BindEvent> {
        self.events.iter().filter(|e| e.is_failure())
    }

    /// Every slot bound and every library opened
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn extend(&mut self, other: BindReport) {
        self.events.extend(other.events);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Errors returned by [`Binder::link`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("cannot open library `{library}`: {source}")]
    LibraryNotFound {
        library: String,
        #[source]
        source: LoadError,
    },
}

/// A bound library value
///
/// Owns the library sets its slots were bound from. Dropping it (or calling
/// [`Library::close`]) releases them once no slot thunk still holds one.
pub struct Library<L> {
    value: L,
    report: BindReport,
    sets: Vec<Arc<LibrarySet>>,
}

impl<L> Library<L> {
    pub fn report(&self) -> &BindReport {
        &self.report
    }

    pub fn library_sets(&self) -> &[Arc<LibrarySet>] {
        &self.sets
    }

    /// Unbind and release the native libraries
    pub fn close(self) {
        debug!(libraries = self.sets.len(), "closing library");
    }
}

impl<L> Deref for Library<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.value
    }
}

impl<L> DerefMut for Library<L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut self.value
    }
}

impl<L: fmt::Debug> fmt::Debug for Library<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("value", &self.value)
            .field("report", &self.report)
            .finish()
    }
}

/// Result of one bind pass
#[derive(Default)]
struct Binding {
    report: BindReport,
    sets: Vec<Arc<LibrarySet>>,
}

/// Binds library descriptions to native code
pub struct Binder {
    loader: Arc<dyn Loader>,
    pool: Arc<FramePool>,
    config: Config,
    platform: String,
}

impl Binder {
    /// A binder using the system loader, libffi and default configuration
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn from_config(config: Config) -> Self {
        let backend: Arc<dyn Backend> = Arc::new(LibffiBackend::new());
        Self {
            loader: Arc::new(SystemLoader::from_config(&config)),
            pool: Arc::new(FramePool::from_config(backend, &config)),
            platform: config.platform().to_string(),
            config,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.pool = Arc::new(FramePool::from_config(backend, &self.config));
        self
    }

    /// Platform identifier used to pick node locations
    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Create and bind a library value
    ///
    /// Each of `names` is tried as a full location string, then the configured
    /// override for the library's name, then the platform locations the value
    /// declares. Never fails: whatever could not be bound stays unset and is
    /// recorded in [`Library::report`].
    pub fn open<L: LibraryNode + Default>(&self, names: &[&str]) -> Library<L> {
        let mut value = L::default();
        let library_name = {
            let mut declared = Node::new();
            value.describe(&mut declared);
            declared.library
        };
        let configured = library_name
            .as_deref()
            .and_then(|name| self.config.library_override(name))
            .map(str::to_string);

        let candidates = names
            .iter()
            .map(|name| name.to_string())
            .chain(configured);
        for location in candidates {
            let mut binding = Binding::default();
            match self.bind_node(&mut value, "", Some(&location), None, &mut binding) {
                None => return Library::from_binding(value, binding),
                Some(err) => debug!(location = %location, error = %err, "location did not open, trying next"),
            }
        }

        let mut binding = Binding::default();
        self.bind_node(&mut value, "", None, None, &mut binding);
        Library::from_binding(value, binding)
    }

    /// Bind a batch of library values
    ///
    /// Stops at the first value whose own library cannot be opened. That
    /// value is left entirely unbound, sections included; values before it
    /// keep their bindings.
    pub fn link(&self, nodes: &mut [&mut dyn LibraryNode]) -> Result<BindReport, BindError> {
        let mut report = BindReport::default();
        for node in nodes.iter_mut() {
            let mut binding = Binding::default();
            if let Some(source) = self.bind_node(&mut **node, "", None, None, &mut binding) {
                let library = match binding.report.events.first() {
                    Some(BindEvent::LibraryNotFound { node, .. }) => node.clone(),
                    _ => String::new(),
                };
                clear_node(&mut **node);
                return Err(BindError::LibraryNotFound { library, source });
            }
            report.extend(binding.report);
        }
        Ok(report)
    }

    /// Bind one library tree, optionally forcing its location string
    pub fn bind(
        &self,
        node: &mut dyn LibraryNode,
        location: Option<&str>,
    ) -> (BindReport, Vec<Arc<LibrarySet>>) {
        let mut binding = Binding::default();
        self.bind_node(node, "", location, None, &mut binding);
        (binding.report, binding.sets)
    }

    /// Bind `node` and its sections; returns the error if the node's own
    /// location failed to open
    fn bind_node(
        &self,
        node: &mut dyn LibraryNode,
        path: &str,
        forced: Option<&str>,
        parent: Option<&Arc<LibrarySet>>,
        binding: &mut Binding,
    ) -> Option<LoadError> {
        let mut desc = Node::new();
        node.describe(&mut desc);

        let name = match (&desc.library, path) {
            (Some(library), "") => library.clone(),
            (_, path) => path.to_string(),
        };
        let location = self.discover(&mut desc, forced);

        let mut failure = None;
        let set = match location {
            Some(location) => match parent {
                Some(parent) if parent.location() == location => Some(Arc::clone(parent)),
                _ => match open_location(self.loader.as_ref(), &location) {
                    Ok(set) => {
                        debug!(node = %name, location = %location, "opened library");
                        let set = Arc::new(set);
                        binding.sets.push(Arc::clone(&set));
                        Some(set)
                    }
                    Err(err) => {
                        warn!(node = %name, location = %location, error = %err, "library not found");
                        binding.report.events.push(BindEvent::LibraryNotFound {
                            node: name.clone(),
                            location,
                            error: err.to_string(),
                        });
                        failure = Some(err);
                        None
                    }
                },
            },
            None => parent.cloned(),
        };

        if set.is_none() && failure.is_none() && !desc.slots.is_empty() {
            let err = LoadError::LibraryNotFound {
                location: String::new(),
                attempted: Vec::new(),
            };
            warn!(node = %name, platform = %self.platform, "no library location declared");
            binding.report.events.push(BindEvent::LibraryNotFound {
                node: name.clone(),
                location: String::new(),
                error: format!("no location declared for platform {}", self.platform),
            });
            failure = Some(err);
        }

        for (section, child) in desc.sections.iter_mut() {
            let child_path = join_path(path, section);
            self.bind_node(&mut **child, &child_path, forced, set.as_ref(), binding);
        }

        for (slot_name, slot) in desc.slots.iter_mut() {
            slot.clear();
            if let Some(set) = &set {
                let slot_path = join_path(path, slot_name);
                if let Some(event) = self.bind_slot(slot, &slot_path, set) {
                    binding.report.events.push(event);
                }
            }
        }

        failure
    }

    /// Location string for a node, or `None` to inherit the parent's set
    fn discover(&self, desc: &mut Node<'_>, forced: Option<&str>) -> Option<String> {
        if let Some(location) = forced {
            return Some(location.to_string());
        }
        if let Some(location) = desc
            .library
            .as_deref()
            .and_then(|name| self.config.library_override(name))
        {
            return Some(location.to_string());
        }
        if let Some(location) = desc.location_for(&self.platform) {
            return Some(location.to_string());
        }
        desc.sections.iter_mut().find_map(|(_, child)| {
            let mut declared = Node::new();
            child.describe(&mut declared);
            declared.location_for(&self.platform).map(str::to_string)
        })
    }

    fn bind_slot(&self, slot: &mut Slot, path: &str, set: &Arc<LibrarySet>) -> Option<BindEvent> {
        let tag = match Tag::parse(&slot.tag) {
            Ok(tag) => tag,
            Err(err) => {
                warn!(slot = %path, error = %err, "invalid tag");
                return Some(BindEvent::TagInvalid {
                    slot: path.to_string(),
                    error: err.to_string(),
                });
            }
        };

        let (address, matched) = match set.resolve(&tag.names) {
            Symbol::Resolved {
                address, matched, ..
            } => (address, matched),
            Symbol::Unresolved { attempted } => {
                warn!(slot = %path, attempted = %attempted.join(","), library = %set.location(), "symbol not found");
                return Some(BindEvent::SymbolMissing {
                    slot: path.to_string(),
                    attempted,
                });
            }
        };

        let failure = tag.signature.ret.failure.clone();
        // SAFETY: the tag describes the symbol, per the `LibraryNode` contract
        let function = unsafe {
            ForeignFunction::new(
                matched.clone(),
                address,
                tag.signature,
                slot.shape.clone(),
                Arc::clone(&self.pool),
            )
        };
        let mut function = match function {
            Ok(function) => function,
            Err(err) => {
                warn!(slot = %path, error = %err, "slot shape does not match its tag");
                return Some(BindEvent::Incompatible {
                    slot: path.to_string(),
                    error: err.to_string(),
                });
            }
        };

        if let Some(failure) = failure {
            match set.resolve(std::slice::from_ref(&failure.symbol)).address() {
                // SAFETY: the failure lookup is described by the same tag
                Some(lookup) => function = unsafe { function.with_failure_lookup(lookup) },
                None => warn!(
                    slot = %path,
                    lookup = %failure.symbol,
                    "failure lookup not found, errors will carry a generic message"
                ),
            }
        }

        let shape = function.shape().to_string();
        debug!(slot = %path, symbol = %matched, shape = %shape, "bound slot");
        slot.bind(function, Arc::clone(set));
        Some(BindEvent::Bound {
            slot: path.to_string(),
            symbol: matched,
            shape,
        })
    }
}

impl Default for Binder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binder")
            .field("platform", &self.platform)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<L> Library<L> {
    fn from_binding(value: L, binding: Binding) -> Self {
        Self {
            value,
            report: binding.report,
            sets: binding.sets,
        }
    }
}

/// Unset every slot of `node` and its sections
fn clear_node(node: &mut dyn LibraryNode) {
    let mut desc = Node::new();
    node.describe(&mut desc);
    for (_, child) in desc.sections.iter_mut() {
        clear_node(&mut **child);
    }
    for (_, slot) in desc.slots.iter_mut() {
        slot.clear();
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}
