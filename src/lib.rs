//! libtrace - library call tracer
//!
//! Wraps every exported entry point of each library a process loads and
//! writes one `~~~~ module!symbol` line to stderr per call. The
//! instrumentation engine that delivers module events and runs the hooks is
//! abstracted by the traits in [`engine`]; [`process`] provides a snapshot
//! engine over a live Linux process.

pub mod cli;
pub mod engine;
pub mod exports;
pub mod interception;
pub mod logging;
pub mod options;
pub mod plan_output;
pub mod process;
pub mod recorder;
pub mod session;

pub use options::{ConfigError, Options};
pub use recorder::TRACE_PREFIX;
pub use session::Session;
