//! Call recording
//!
//! [`CallRecorder`] is the entry hook installed on every wrapped export. It
//! runs before the real function body, optionally drops calls that did not
//! come from the application, and writes one trace line per call.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::engine::{AppPc, Engine, EntryHook, HookId, WrapContext};

/// Prefix of every trace line. External tooling greps for it.
pub const TRACE_PREFIX: &str = "~~~~ ";

/// Hook identity used for every registration made by the tracer
pub const RECORDER_HOOK_ID: HookId = HookId(0x6c74_7263);

/// Format one trace line: `~~~~ module!symbol\n`, or `~~~~ symbol\n` when
/// the module name is unknown
pub fn format_line(module_name: &str, symbol: &str) -> String {
    let mut line = String::with_capacity(TRACE_PREFIX.len() + module_name.len() + symbol.len() + 2);
    line.push_str(TRACE_PREFIX);
    if !module_name.is_empty() {
        line.push_str(module_name);
        line.push('!');
    }
    line.push_str(symbol);
    line.push('\n');
    line
}

/// Destination for trace lines
///
/// Implementations must write each line as a unit so that concurrent
/// callers never interleave within a line.
pub trait TraceSink: Send + Sync {
    fn emit(&self, line: &str);
}

impl<T: TraceSink + ?Sized> TraceSink for Arc<T> {
    fn emit(&self, line: &str) {
        (**self).emit(line);
    }
}

/// Writes trace lines to the process's stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl TraceSink for StderrSink {
    fn emit(&self, line: &str) {
        // One write_all under the stderr lock; stderr is unbuffered
        let _ = io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Collects trace lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines recorded so far, without trailing newlines
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().map(|l| l.trim_end_matches('\n').to_string()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

impl TraceSink for MemorySink {
    fn emit(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Where a call came from, judged by its return address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOrigin {
    /// Return address inside the main executable
    Application,
    /// Return address inside another module, identified by its start
    Library(AppPc),
    /// Return address captured but not inside any known module
    Unknown(AppPc),
    /// Return address could not be captured
    Ambiguous,
}

/// Entry hook that writes one trace line per call
pub struct CallRecorder<S: TraceSink> {
    only_from_app: bool,
    exe_start: Option<AppPc>,
    sink: S,
}

impl<S: TraceSink> CallRecorder<S> {
    /// `exe_start` is the start of the main executable, if the engine has one
    pub fn new(only_from_app: bool, exe_start: Option<AppPc>, sink: S) -> Self {
        Self {
            only_from_app,
            exe_start,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Classify the caller of an intercepted call
    pub fn call_origin(&self, engine: &dyn Engine, call: &dyn WrapContext) -> CallOrigin {
        let retaddr = match call.return_address() {
            Ok(pc) if pc != 0 => pc,
            // Nearly always an abnormal transition (callback dispatchers and
            // the like) rather than a real call from the application
            _ => return CallOrigin::Ambiguous,
        };
        match engine.lookup_module(retaddr) {
            Some(module) if Some(module.start) == self.exe_start => CallOrigin::Application,
            Some(module) => CallOrigin::Library(module.start),
            None => CallOrigin::Unknown(retaddr),
        }
    }

    /// Record one call to `symbol`. Returns whether a line was written.
    pub fn record(&self, engine: &dyn Engine, call: &dyn WrapContext, symbol: &str) -> bool {
        if self.only_from_app && self.call_origin(engine, call) != CallOrigin::Application {
            return false;
        }

        let module = engine.lookup_module(call.func());
        let module_name = module.as_ref().map(|m| m.name()).unwrap_or("");
        self.sink.emit(&format_line(module_name, symbol));
        true
    }
}

impl<S: TraceSink> EntryHook for CallRecorder<S> {
    fn id(&self) -> HookId {
        RECORDER_HOOK_ID
    }

    fn on_entry(&self, engine: &dyn Engine, call: &dyn WrapContext, user_data: &str) {
        self.record(engine, call, user_data);
    }
}
