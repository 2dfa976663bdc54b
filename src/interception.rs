//! Module-scoped interception management
//!
//! Keeps the engine's wrap registrations in step with the set of loaded
//! library modules: every resolved export of a library is wrapped when the
//! library loads and unwrapped when it unloads. The main executable is
//! never wrapped; executables often export huge numbers of global symbols
//! that have nothing to do with library calls.
//!
//! No locking happens here. The engine serializes load and unload
//! processing for any single module.

use std::sync::Arc;
use thiserror::Error;

use crate::engine::{AppPc, Engine, EntryHook, ModuleData, WrapError};
use crate::exports;

/// A wrap or unwrap request the engine refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptError {
    #[error("wrap request failed for {module}!{symbol}: {source}")]
    WrapFailed {
        module: String,
        symbol: String,
        #[source]
        source: WrapError,
    },

    #[error("unwrap request failed for {module}!{symbol}: {source}")]
    UnwrapFailed {
        module: String,
        symbol: String,
        #[source]
        source: WrapError,
    },
}

/// What to do when the engine refuses a wrap or unwrap request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyChecks {
    /// Stop at the first failure and report it; a failed load first
    /// removes the registrations it already installed for the module
    Abort,
    /// Log the failure and carry on with the remaining exports
    Ignore,
}

impl Default for ConsistencyChecks {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Abort
        } else {
            Self::Ignore
        }
    }
}

/// Installs and removes one registration per exported entry point
pub struct InterceptionManager {
    engine: Arc<dyn Engine>,
    hook: Arc<dyn EntryHook>,
    exe_start: Option<AppPc>,
    checks: ConsistencyChecks,
}

impl InterceptionManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        hook: Arc<dyn EntryHook>,
        exe_start: Option<AppPc>,
        checks: ConsistencyChecks,
    ) -> Self {
        Self {
            engine,
            hook,
            exe_start,
            checks,
        }
    }

    /// Whether `module` is the process's main executable
    pub fn is_main_executable(&self, module: &ModuleData) -> bool {
        self.exe_start == Some(module.start)
    }

    /// Wrap every resolved export of a newly loaded module
    ///
    /// Returns the number of registrations installed. When a failure is
    /// reported, none of this call's registrations remain.
    pub fn on_module_load(&self, module: &ModuleData) -> Result<usize, InterceptError> {
        if self.is_main_executable(module) {
            tracing::debug!("skipping exports of main executable {}", module.name());
            return Ok(0);
        }

        let mut installed = Vec::new();
        for export in exports::enumerate(self.engine.as_ref(), module) {
            match self
                .engine
                .wrap(export.entry, self.hook.clone(), export.name.clone())
            {
                Ok(()) => {
                    installed.push(export.entry);
                    match export.resolver {
                        Some(resolver) => tracing::trace!(
                            "wrapping export {}!{} @{:#x} (resolved via {:#x})",
                            module.name(),
                            export.name,
                            export.entry,
                            resolver
                        ),
                        None => tracing::trace!(
                            "wrapping export {}!{} @{:#x}",
                            module.name(),
                            export.name,
                            export.entry
                        ),
                    }
                }
                Err(source) => {
                    let err = InterceptError::WrapFailed {
                        module: module.name().to_string(),
                        symbol: export.name.to_string(),
                        source,
                    };
                    if let Err(err) = self.check(err) {
                        self.roll_back(module, &installed);
                        return Err(err);
                    }
                }
            }
        }

        tracing::debug!(
            "module {} loaded: {} exports wrapped",
            module.name(),
            installed.len()
        );
        Ok(installed.len())
    }

    /// Remove registrations installed by an aborted load
    fn roll_back(&self, module: &ModuleData, installed: &[AppPc]) {
        for &pc in installed {
            if let Err(e) = self.engine.unwrap(pc, self.hook.id()) {
                tracing::warn!("cannot roll back {}@{:#x}: {}", module.name(), pc, e);
            }
        }
        tracing::debug!(
            "module {}: rolled back {} registrations",
            module.name(),
            installed.len()
        );
    }

    /// Remove the registrations of a module about to be unloaded
    ///
    /// Returns the number of registrations removed.
    pub fn on_module_unload(&self, module: &ModuleData) -> Result<usize, InterceptError> {
        if self.is_main_executable(module) {
            return Ok(0);
        }

        let mut removed = 0;
        for export in exports::enumerate(self.engine.as_ref(), module) {
            match self.engine.unwrap(export.entry, self.hook.id()) {
                Ok(()) => removed += 1,
                Err(source) => {
                    let err = InterceptError::UnwrapFailed {
                        module: module.name().to_string(),
                        symbol: export.name.to_string(),
                        source,
                    };
                    self.check(err)?;
                }
            }
        }

        tracing::debug!("module {} unloaded: {} exports unwrapped", module.name(), removed);
        Ok(removed)
    }

    fn check(&self, err: InterceptError) -> Result<(), InterceptError> {
        match self.checks {
            ConsistencyChecks::Abort => Err(err),
            ConsistencyChecks::Ignore => {
                tracing::warn!("{}", err);
                Ok(())
            }
        }
    }
}
