//! Host instrumentation engine interface
//!
//! The tracer never injects code itself. Everything it needs from the
//! instrumentation engine (module events, export iteration, wrapping,
//! address lookups and guarded execution) is expressed by the traits here,
//! which a host engine implements.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// An application address (code or data) inside the traced process
pub type AppPc = u64;

/// Opaque engine-side handle used to iterate a module's exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(pub u64);

/// A loaded module (executable or shared library) as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleData {
    /// Lowest mapped address of the module
    pub start: AppPc,
    /// One past the highest mapped address of the module
    pub end: AppPc,
    /// Display name (soname or file name), if the engine knows one
    pub preferred_name: Option<String>,
    /// Backing file, if any
    pub path: Option<PathBuf>,
    /// Handle for export iteration
    pub handle: ModuleHandle,
}

impl ModuleData {
    /// Check if an address falls within this module's mapped range
    #[must_use]
    pub fn contains(&self, pc: AppPc) -> bool {
        pc >= self.start && pc < self.end
    }

    /// Display name, or the empty string when the module has none
    pub fn name(&self) -> &str {
        self.preferred_name.as_deref().unwrap_or("")
    }
}

/// One entry of a module's export table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSymbol {
    pub name: String,
    /// Entry address for code exports, resolver thunk for indirect ones
    pub addr: AppPc,
    /// Directly callable code
    pub is_code: bool,
    /// Indirect export: `addr` is a zero-argument resolver returning the
    /// real entry point. Always false on platforms without the feature.
    pub is_indirect_code: bool,
}

impl ExportSymbol {
    pub fn code(name: impl Into<String>, addr: AppPc) -> Self {
        Self {
            name: name.into(),
            addr,
            is_code: true,
            is_indirect_code: false,
        }
    }

    pub fn indirect(name: impl Into<String>, resolver: AppPc) -> Self {
        Self {
            name: name.into(),
            addr: resolver,
            is_code: false,
            is_indirect_code: true,
        }
    }

    pub fn data(name: impl Into<String>, addr: AppPc) -> Self {
        Self {
            name: name.into(),
            addr,
            is_code: false,
            is_indirect_code: false,
        }
    }
}

/// A platform fault caught by one of the engine's guarded operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("access violation at {0:#x}")]
    AccessViolation(AppPc),

    #[error("code at {0:#x} cannot be executed in this context")]
    NotExecutable(AppPc),

    #[error("call context unavailable: {0}")]
    ContextUnavailable(String),
}

/// Rejection of a wrap or unwrap request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WrapError {
    #[error("{0:#x} is already wrapped by this hook")]
    AlreadyWrapped(AppPc),

    #[error("{0:#x} is not wrapped by this hook")]
    NotWrapped(AppPc),

    #[error("engine rejected request for {pc:#x}: {reason}")]
    Rejected { pc: AppPc, reason: String },
}

/// Identity of an entry hook; registrations are keyed by (address, hook id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// Global wrapping mode flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrapFlags {
    /// Skip the engine's support for multiple wrappers and mid-run changes
    pub no_frills: bool,
    /// Skip saving the full application register context around hooks
    pub fast_cleancalls: bool,
}

/// Engine-side view of one intercepted call
pub trait WrapContext {
    /// Entry address of the function being called
    fn func(&self) -> AppPc;

    /// Return address of the call, captured in a guarded region
    fn return_address(&self) -> Result<AppPc, Fault>;
}

/// Callback run immediately before a wrapped entry point executes
pub trait EntryHook: Send + Sync {
    fn id(&self) -> HookId;

    /// `user_data` is the value passed when the address was wrapped
    fn on_entry(&self, engine: &dyn Engine, call: &dyn WrapContext, user_data: &str);
}

/// Process and module lifecycle notifications
pub trait EngineObserver: Send + Sync {
    /// `loaded` is true when the module was already present at attach time
    fn module_loaded(&self, module: &ModuleData, loaded: bool);

    fn module_unloaded(&self, module: &ModuleData);

    fn forked(&self) {}

    fn exiting(&self) {}
}

/// Token returned by [`Engine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The services the tracer consumes from its host engine
pub trait Engine: Send + Sync {
    /// The process's primary executable image
    fn main_module(&self) -> Option<ModuleData>;

    /// Module containing `pc`, if any
    fn lookup_module(&self, pc: AppPc) -> Option<ModuleData>;

    /// Iterate the export table of a loaded module
    fn exports<'a>(&'a self, module: &'a ModuleData) -> Box<dyn Iterator<Item = ExportSymbol> + 'a>;

    /// Invoke a zero-argument resolver thunk inside a guarded region
    fn call_resolver(&self, resolver: AppPc) -> Result<AppPc, Fault>;

    fn wrap(&self, func: AppPc, hook: Arc<dyn EntryHook>, user_data: Arc<str>) -> Result<(), WrapError>;

    fn unwrap(&self, func: AppPc, hook: HookId) -> Result<(), WrapError>;

    fn set_wrap_flags(&self, flags: WrapFlags);

    fn subscribe(&self, observer: Arc<dyn EngineObserver>) -> SubscriptionId;

    /// Returns false if the subscription was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
