// Scripted in-memory engine for integration tests
//
// Modules, exports and resolver outcomes are declared up front; load and
// unload events and wrapped calls are driven explicitly by the test.

#![allow(dead_code)]

use libtrace::engine::{
    AppPc, Engine, EngineObserver, EntryHook, ExportSymbol, Fault, HookId, ModuleData,
    ModuleHandle, SubscriptionId, WrapContext, WrapError, WrapFlags,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const EXE_START: AppPc = 0x40_0000;
pub const LIBFOO_START: AppPc = 0x7f00_0000;
pub const LIBBAR_START: AppPc = 0x7f10_0000;

pub const DO_WORK: AppPc = LIBFOO_START + 0x100;
pub const HELPER: AppPc = LIBFOO_START + 0x200;

type Registrations = BTreeMap<(AppPc, HookId), (Arc<dyn EntryHook>, Arc<str>)>;

#[derive(Default)]
pub struct ScriptedEngine {
    modules: Vec<(ModuleData, Vec<ExportSymbol>)>,
    main: Option<usize>,
    resolvers: HashMap<AppPc, Result<AppPc, Fault>>,
    resolver_calls: HashMap<AppPc, AtomicUsize>,
    registrations: Mutex<Registrations>,
    rejected: Mutex<HashSet<AppPc>>,
    observers: Mutex<HashMap<u64, Arc<dyn EngineObserver>>>,
    next_subscription: Mutex<u64>,
    flags: Mutex<WrapFlags>,
}

pub struct Call {
    pub func: AppPc,
    pub retaddr: Result<AppPc, Fault>,
}

impl WrapContext for Call {
    fn func(&self) -> AppPc {
        self.func
    }

    fn return_address(&self) -> Result<AppPc, Fault> {
        self.retaddr.clone()
    }
}

pub fn module(name: Option<&str>, start: AppPc, size: u64, handle: u64) -> ModuleData {
    ModuleData {
        start,
        end: start + size,
        preferred_name: name.map(str::to_string),
        path: None,
        handle: ModuleHandle(handle),
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Main executable `app` exporting two symbols, plus `libfoo`
    /// exporting `doWork` and `helper`
    pub fn with_libfoo() -> Self {
        Self::new()
            .with_main(
                module(Some("app"), EXE_START, 0x1_0000, 0),
                vec![
                    ExportSymbol::code("main", EXE_START + 0x10),
                    ExportSymbol::code("app_global", EXE_START + 0x20),
                ],
            )
            .with_module(
                module(Some("libfoo"), LIBFOO_START, 0x1_0000, 1),
                vec![
                    ExportSymbol::code("doWork", DO_WORK),
                    ExportSymbol::code("helper", HELPER),
                ],
            )
    }

    pub fn with_main(mut self, data: ModuleData, exports: Vec<ExportSymbol>) -> Self {
        self.main = Some(self.modules.len());
        self.modules.push((data, exports));
        self
    }

    pub fn with_module(mut self, data: ModuleData, exports: Vec<ExportSymbol>) -> Self {
        self.modules.push((data, exports));
        self
    }

    pub fn with_resolver(mut self, resolver: AppPc, outcome: Result<AppPc, Fault>) -> Self {
        self.resolvers.insert(resolver, outcome);
        self.resolver_calls.insert(resolver, AtomicUsize::new(0));
        self
    }

    /// How many times the resolver at `resolver` has been invoked
    pub fn resolver_calls(&self, resolver: AppPc) -> usize {
        self.resolver_calls
            .get(&resolver)
            .map_or(0, |calls| calls.load(Ordering::SeqCst))
    }

    /// Make the engine refuse wrap requests for `pc`
    pub fn reject(&self, pc: AppPc) {
        self.rejected.lock().unwrap().insert(pc);
    }

    pub fn module(&self, name: &str) -> ModuleData {
        self.modules
            .iter()
            .find(|(m, _)| m.preferred_name.as_deref() == Some(name))
            .map(|(m, _)| m.clone())
            .unwrap_or_else(|| panic!("no module {name}"))
    }

    fn observers(&self) -> Vec<Arc<dyn EngineObserver>> {
        self.observers.lock().unwrap().values().cloned().collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn load(&self, name: &str) {
        let module = self.module(name);
        for observer in self.observers() {
            observer.module_loaded(&module, false);
        }
    }

    pub fn unload(&self, name: &str) {
        let module = self.module(name);
        for observer in self.observers() {
            observer.module_unloaded(&module);
        }
    }

    pub fn load_all(&self) {
        for (module, _) in &self.modules {
            for observer in self.observers() {
                observer.module_loaded(module, true);
            }
        }
    }

    pub fn fork(&self) {
        for observer in self.observers() {
            observer.forked();
        }
    }

    pub fn exit(&self) {
        for observer in self.observers() {
            observer.exiting();
        }
    }

    /// Run the hooks registered at `func`, as the engine would on entry
    pub fn call(&self, func: AppPc, retaddr: Result<AppPc, Fault>) {
        let hooks: Vec<_> = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|((pc, _), _)| *pc == func)
            .map(|(_, (hook, data))| (hook.clone(), data.clone()))
            .collect();
        let call = Call { func, retaddr };
        for (hook, data) in hooks {
            hook.on_entry(self, &call, &data);
        }
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Registrations whose address lies inside `module`
    pub fn registrations_in(&self, module: &ModuleData) -> Vec<(AppPc, String)> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|((pc, _), _)| module.contains(*pc))
            .map(|((pc, _), (_, data))| (*pc, data.to_string()))
            .collect()
    }

    pub fn is_wrapped(&self, pc: AppPc) -> bool {
        self.registrations
            .lock()
            .unwrap()
            .keys()
            .any(|(wrapped, _)| *wrapped == pc)
    }

    pub fn flags(&self) -> WrapFlags {
        *self.flags.lock().unwrap()
    }
}

impl Engine for ScriptedEngine {
    fn main_module(&self) -> Option<ModuleData> {
        self.main.map(|i| self.modules[i].0.clone())
    }

    fn lookup_module(&self, pc: AppPc) -> Option<ModuleData> {
        self.modules
            .iter()
            .find(|(m, _)| m.contains(pc))
            .map(|(m, _)| m.clone())
    }

    fn exports<'a>(&'a self, module: &'a ModuleData) -> Box<dyn Iterator<Item = ExportSymbol> + 'a> {
        match self.modules.iter().find(|(m, _)| m.handle == module.handle) {
            Some((_, exports)) => Box::new(exports.iter().cloned()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn call_resolver(&self, resolver: AppPc) -> Result<AppPc, Fault> {
        if let Some(calls) = self.resolver_calls.get(&resolver) {
            calls.fetch_add(1, Ordering::SeqCst);
        }
        self.resolvers
            .get(&resolver)
            .cloned()
            .unwrap_or(Err(Fault::AccessViolation(resolver)))
    }

    fn wrap(&self, func: AppPc, hook: Arc<dyn EntryHook>, user_data: Arc<str>) -> Result<(), WrapError> {
        if self.rejected.lock().unwrap().contains(&func) {
            return Err(WrapError::Rejected {
                pc: func,
                reason: "scripted rejection".to_string(),
            });
        }
        let mut registrations = self.registrations.lock().unwrap();
        let key = (func, hook.id());
        if registrations.contains_key(&key) {
            return Err(WrapError::AlreadyWrapped(func));
        }
        registrations.insert(key, (hook, user_data));
        Ok(())
    }

    fn unwrap(&self, func: AppPc, hook: HookId) -> Result<(), WrapError> {
        self.registrations
            .lock()
            .unwrap()
            .remove(&(func, hook))
            .map(|_| ())
            .ok_or(WrapError::NotWrapped(func))
    }

    fn set_wrap_flags(&self, flags: WrapFlags) {
        *self.flags.lock().unwrap() = flags;
    }

    fn subscribe(&self, observer: Arc<dyn EngineObserver>) -> SubscriptionId {
        let mut next = self.next_subscription.lock().unwrap();
        let id = *next;
        *next += 1;
        self.observers.lock().unwrap().insert(id, observer);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.lock().unwrap().remove(&id.0).is_some()
    }
}
