//! Diagnostic logging for the tracer itself
//!
//! Diagnostics go through `tracing` to stderr. The `-verbose` threshold
//! picks the level; `RUST_LOG` overrides it when set. Trace lines are not
//! diagnostics and never pass through here.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Level filter for a `-verbose` threshold
///
/// 0 keeps warnings and errors, 1 adds per-module and indirection notices,
/// 2 and above add one notice per wrapped export.
pub fn level_for_verbose(verbose: u32) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the stderr subscriber
///
/// Does nothing if the host already installed a global subscriber.
pub fn init_logging(verbose: u32) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_for_verbose(verbose).into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_levels() {
        assert_eq!(level_for_verbose(0), LevelFilter::WARN);
        assert_eq!(level_for_verbose(1), LevelFilter::DEBUG);
        assert_eq!(level_for_verbose(2), LevelFilter::TRACE);
        assert_eq!(level_for_verbose(u32::MAX), LevelFilter::TRACE);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(0);
        init_logging(2);
    }
}
