//! Snapshot engine over a live Linux process
//!
//! [`ProcessImage`] implements [`Engine`] from a snapshot of a process's
//! mapped modules and their ELF export tables. It cannot run code in the
//! target, so wrap requests are kept in an in-memory registration table and
//! resolver thunks are never executed. This is what the `libtrace` binary
//! uses to show which entry points a session would intercept.

pub mod elf;
pub mod maps;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{
    AppPc, Engine, EngineObserver, EntryHook, ExportSymbol, Fault, HookId, ModuleData,
    ModuleHandle, SubscriptionId, WrapError, WrapFlags,
};
use elf::ElfImage;
use maps::MappedModule;

/// One installed wrap request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    pub pc: AppPc,
    pub hook: u64,
    pub module: String,
    pub symbol: String,
}

struct Registration {
    hook: Arc<dyn EntryHook>,
    user_data: Arc<str>,
}

#[derive(Default)]
struct EngineState {
    registrations: BTreeMap<(AppPc, HookId), Registration>,
    observers: HashMap<u64, Arc<dyn EngineObserver>>,
    next_subscription: u64,
    flags: WrapFlags,
}

/// A module of the snapshot plus what is needed to read its exports
struct ImageModule {
    data: ModuleData,
    base: Option<u64>,
}

/// [`Engine`] backed by a snapshot of a process's address space
pub struct ProcessImage {
    pid: i32,
    modules: Vec<ImageModule>,
    main: Option<usize>,
    state: Mutex<EngineState>,
}

fn preferred_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

impl ProcessImage {
    /// Snapshot the modules of a running process
    pub fn capture(pid: i32) -> Result<Self> {
        match kill(Pid::from_raw(pid), None) {
            // EPERM still proves the process exists
            Ok(()) | Err(Errno::EPERM) => {}
            Err(e) => return Err(e).context(format!("No such process: {pid}")),
        }

        let mapped = maps::read_maps(pid)?;
        let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
            .context(format!("Failed to resolve main executable of {pid}"))?;

        let image = Self::from_mapped(pid, mapped, Some(&exe));
        tracing::debug!(
            "captured {} modules of pid={} (main executable: {})",
            image.modules.len(),
            pid,
            exe.display()
        );
        Ok(image)
    }

    /// Build a snapshot from already parsed mappings
    pub fn from_mapped(pid: i32, mapped: Vec<MappedModule>, exe: Option<&Path>) -> Self {
        let mut main = None;
        let modules = mapped
            .into_iter()
            .enumerate()
            .map(|(index, module)| {
                if exe == Some(module.path.as_path()) {
                    main = Some(index);
                }
                ImageModule {
                    data: ModuleData {
                        start: module.start,
                        end: module.end,
                        preferred_name: preferred_name(&module.path),
                        path: Some(module.path),
                        handle: ModuleHandle(index as u64),
                    },
                    base: module.base,
                }
            })
            .collect();

        Self {
            pid,
            modules,
            main,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// All modules of the snapshot, in address-space order
    pub fn modules(&self) -> impl Iterator<Item = &ModuleData> {
        self.modules.iter().map(|m| &m.data)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observers(&self) -> Vec<Arc<dyn EngineObserver>> {
        self.state().observers.values().cloned().collect()
    }

    /// Deliver a load event for every module to all subscribers
    pub fn replay_loads(&self) {
        for observer in self.observers() {
            for module in &self.modules {
                observer.module_loaded(&module.data, true);
            }
        }
    }

    /// Deliver an unload event for every module, last loaded first
    pub fn replay_unloads(&self) {
        for observer in self.observers() {
            for module in self.modules.iter().rev() {
                observer.module_unloaded(&module.data);
            }
        }
    }

    /// Tell subscribers the process is exiting
    pub fn notify_exit(&self) {
        for observer in self.observers() {
            observer.exiting();
        }
    }

    /// Current registrations, ordered by address
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.state()
            .registrations
            .iter()
            .map(|(&(pc, _), registration)| RegistrationInfo {
                pc,
                hook: registration.hook.id().0,
                module: self
                    .lookup_module(pc)
                    .map(|m| m.name().to_string())
                    .unwrap_or_default(),
                symbol: registration.user_data.to_string(),
            })
            .collect()
    }

    pub fn wrap_flags(&self) -> WrapFlags {
        self.state().flags
    }

    fn read_exports(&self, module: &ImageModule) -> Result<Vec<ExportSymbol>> {
        let path: &PathBuf = module
            .data
            .path
            .as_ref()
            .context("module has no backing file")?;
        let image = ElfImage::open(path)?;
        let bias = match module.base {
            Some(base) => image.load_bias(base)?,
            None => 0,
        };
        Ok(image.exports(bias)?)
    }
}

impl Engine for ProcessImage {
    fn main_module(&self) -> Option<ModuleData> {
        self.main.map(|index| self.modules[index].data.clone())
    }

    fn lookup_module(&self, pc: AppPc) -> Option<ModuleData> {
        self.modules
            .iter()
            .find(|m| m.data.contains(pc))
            .map(|m| m.data.clone())
    }

    fn exports<'a>(&'a self, module: &'a ModuleData) -> Box<dyn Iterator<Item = ExportSymbol> + 'a> {
        let Some(image_module) = self.modules.get(module.handle.0 as usize) else {
            return Box::new(std::iter::empty());
        };
        match self.read_exports(image_module) {
            Ok(exports) => Box::new(exports.into_iter()),
            Err(e) => {
                tracing::debug!("cannot read exports of {}: {:#}", module.name(), e);
                Box::new(std::iter::empty())
            }
        }
    }

    fn call_resolver(&self, resolver: AppPc) -> Result<AppPc, Fault> {
        Err(Fault::NotExecutable(resolver))
    }

    fn wrap(&self, func: AppPc, hook: Arc<dyn EntryHook>, user_data: Arc<str>) -> Result<(), WrapError> {
        let key = (func, hook.id());
        let mut state = self.state();
        if state.registrations.contains_key(&key) {
            return Err(WrapError::AlreadyWrapped(func));
        }
        state
            .registrations
            .insert(key, Registration { hook, user_data });
        Ok(())
    }

    fn unwrap(&self, func: AppPc, hook: HookId) -> Result<(), WrapError> {
        self.state()
            .registrations
            .remove(&(func, hook))
            .map(|_| ())
            .ok_or(WrapError::NotWrapped(func))
    }

    fn set_wrap_flags(&self, flags: WrapFlags) {
        self.state().flags = flags;
    }

    fn subscribe(&self, observer: Arc<dyn EngineObserver>) -> SubscriptionId {
        let mut state = self.state();
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.observers.insert(id, observer);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state().observers.remove(&id.0).is_some()
    }
}
