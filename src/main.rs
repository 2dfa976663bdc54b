use anyhow::{Context, Result};
use clap::Parser;
use libtrace::cli::{Cli, OutputFormat};
use libtrace::engine::Engine;
use libtrace::plan_output::{self, PlanReport};
use libtrace::process::ProcessImage;
use libtrace::recorder::StderrSink;
use libtrace::{logging, Options, Session};
use std::io;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = Cli::parse();

    // Options are fully validated before anything else runs
    let options = Options::parse(&args.options).context("Invalid tracer options")?;

    let verbose = if args.debug {
        options.verbose.max(2)
    } else {
        options.verbose
    };
    logging::init_logging(verbose);

    let pid = args.pid.unwrap_or(std::process::id() as i32);
    let engine = Arc::new(ProcessImage::capture(pid)?);
    let only_from_app = options.only_from_app;
    let session = Session::attach(engine.clone(), options, StderrSink);

    engine.replay_loads();

    let main_module = engine
        .main_module()
        .and_then(|m| m.preferred_name);
    let report = PlanReport::new(pid, main_module, only_from_app, engine.registrations());
    let rendered = match args.format {
        OutputFormat::Text => report.to_text(),
        OutputFormat::Json => report.to_json()? + "\n",
    };
    plan_output::write_plan(&mut io::stdout().lock(), &rendered)
        .context("Failed to write registration plan")?;

    engine.replay_unloads();
    let remaining = engine.registrations().len();
    tracing::debug!("{} registrations left after unloading all modules", remaining);

    engine.notify_exit();
    session.detach();
    Ok(())
}
