//! Tracing session lifecycle
//!
//! A [`Session`] holds all process-wide tracer state: the parsed options,
//! the main executable's start address and the recorder hook. It is created
//! at process attach and torn down at detach; nothing lives in globals.

use std::sync::{Arc, Mutex};

use crate::engine::{AppPc, Engine, EngineObserver, ModuleData, SubscriptionId, WrapFlags};
use crate::interception::{ConsistencyChecks, InterceptError, InterceptionManager};
use crate::options::Options;
use crate::recorder::{CallRecorder, TraceSink};

/// Reaction to an internal-consistency failure reported by the manager
type FailureHandler = dyn Fn(&InterceptError) + Send + Sync;

/// Receives engine lifecycle events on behalf of a session
struct SessionObserver {
    manager: InterceptionManager,
    on_failure: Box<FailureHandler>,
    /// Set on process exit so detach does not unsubscribe twice
    subscription: Arc<Mutex<Option<SubscriptionId>>>,
    engine: Arc<dyn Engine>,
}

impl EngineObserver for SessionObserver {
    fn module_loaded(&self, module: &ModuleData, _loaded: bool) {
        if let Err(err) = self.manager.on_module_load(module) {
            (self.on_failure)(&err);
        }
    }

    fn module_unloaded(&self, module: &ModuleData) {
        if let Err(err) = self.manager.on_module_unload(module) {
            (self.on_failure)(&err);
        }
    }

    fn forked(&self) {
        // The child shares the parent's image layout, so the main
        // executable start carries over unchanged
        tracing::debug!("process forked; tracing continues in child");
    }

    fn exiting(&self) {
        tracing::debug!("process exiting");
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(id) = subscription.take() {
                self.engine.unsubscribe(id);
            }
        }
    }
}

fn abort_on_failure(err: &InterceptError) {
    tracing::error!("{}", err);
    std::process::abort();
}

/// Builder-style knobs for [`Session::attach_with`]
pub struct SessionConfig {
    pub checks: ConsistencyChecks,
    on_failure: Box<FailureHandler>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checks: ConsistencyChecks::default(),
            on_failure: Box::new(abort_on_failure),
        }
    }
}

impl SessionConfig {
    /// Set how refused wrap/unwrap requests are treated
    pub fn with_checks(mut self, checks: ConsistencyChecks) -> Self {
        self.checks = checks;
        self
    }

    /// Replace the default reaction to consistency failures (log and abort)
    ///
    /// The handler may return. A failed load has then already removed that
    /// module's partial registrations; a failed unload leaves the module's
    /// remaining registrations in place.
    pub fn with_failure_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InterceptError) + Send + Sync + 'static,
    {
        self.on_failure = Box::new(handler);
        self
    }
}

/// An attached tracing session
pub struct Session {
    engine: Arc<dyn Engine>,
    options: Arc<Options>,
    exe_start: Option<AppPc>,
    subscription: Arc<Mutex<Option<SubscriptionId>>>,
}

impl Session {
    /// Attach with default settings
    pub fn attach<S>(engine: Arc<dyn Engine>, options: Options, sink: S) -> Self
    where
        S: TraceSink + 'static,
    {
        Self::attach_with(engine, options, sink, SessionConfig::default())
    }

    /// Capture the main executable identity, configure the engine and start
    /// receiving module events
    pub fn attach_with<S>(
        engine: Arc<dyn Engine>,
        options: Options,
        sink: S,
        config: SessionConfig,
    ) -> Self
    where
        S: TraceSink + 'static,
    {
        let exe_start = engine.main_module().map(|exe| exe.start);
        match exe_start {
            Some(start) => tracing::debug!("main executable at {:#x}", start),
            None => tracing::warn!("no main executable reported; all modules will be wrapped"),
        }

        // Only this tracer wraps, always at load/unload, and never looks at
        // the application's registers
        engine.set_wrap_flags(WrapFlags {
            no_frills: true,
            fast_cleancalls: true,
        });

        let options = Arc::new(options);
        let recorder = Arc::new(CallRecorder::new(options.only_from_app, exe_start, sink));
        let manager = InterceptionManager::new(engine.clone(), recorder, exe_start, config.checks);

        let subscription = Arc::new(Mutex::new(None));
        let observer = Arc::new(SessionObserver {
            manager,
            on_failure: config.on_failure,
            subscription: subscription.clone(),
            engine: engine.clone(),
        });
        let id = engine.subscribe(observer);
        if let Ok(mut slot) = subscription.lock() {
            *slot = Some(id);
        }

        tracing::info!(
            "session attached (only_from_app={}, verbose={})",
            options.only_from_app,
            options.verbose
        );

        Self {
            engine,
            options,
            exe_start,
            subscription,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Start address of the main executable captured at attach
    pub fn exe_start(&self) -> Option<AppPc> {
        self.exe_start
    }

    /// Whether the session still receives engine events
    pub fn is_attached(&self) -> bool {
        self.subscription
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Stop receiving engine events. Dropping the session does the same.
    pub fn detach(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(id) = subscription.take() {
                self.engine.unsubscribe(id);
            }
        }
        tracing::info!("session detached");
    }
}
