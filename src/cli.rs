//! CLI argument parsing for libtrace

use clap::{Parser, ValueEnum};

/// Output format for the registration plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One `module!symbol @addr` line per registration (default)
    Text,
    /// JSON document for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "libtrace")]
#[command(version)]
#[command(
    about = "Library call tracer: shows which exported entry points a tracing session wraps",
    long_about = None
)]
pub struct Cli {
    /// Process to snapshot (defaults to libtrace itself)
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Tracer option string, e.g. "-only_from_app -verbose 1"
    #[arg(
        short = 'o',
        long = "options",
        value_name = "OPTIONS",
        env = "LIBTRACE_OPTIONS",
        default_value = "",
        allow_hyphen_values = true
    )]
    pub options: String,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable full diagnostic output regardless of -verbose
    #[arg(long = "debug")]
    pub debug: bool,
}
