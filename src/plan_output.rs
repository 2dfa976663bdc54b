//! Registration plan output for the `libtrace` binary
//!
//! Text: one `module!symbol @0xaddr` line per registration.
//! JSON: a single document with the same data plus a per-module count.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Write};

use crate::process::RegistrationInfo;

/// Everything a session wrapped in one process snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub pid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_module: Option<String>,
    pub only_from_app: bool,
    pub total: usize,
    pub per_module: BTreeMap<String, usize>,
    pub registrations: Vec<RegistrationInfo>,
}

impl PlanReport {
    pub fn new(
        pid: i32,
        main_module: Option<String>,
        only_from_app: bool,
        registrations: Vec<RegistrationInfo>,
    ) -> Self {
        let mut per_module = BTreeMap::new();
        for registration in &registrations {
            *per_module.entry(registration.module.clone()).or_insert(0) += 1;
        }
        Self {
            pid,
            main_module,
            only_from_app,
            total: registrations.len(),
            per_module,
            registrations,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for r in &self.registrations {
            if r.module.is_empty() {
                out.push_str(&format!("{} @{:#x}\n", r.symbol, r.pc));
            } else {
                out.push_str(&format!("{}!{} @{:#x}\n", r.module, r.symbol, r.pc));
            }
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Write rendered output in one piece
///
/// A reader that went away (`libtrace | head`) is not an error.
pub fn write_plan<W: Write>(out: &mut W, rendered: &str) -> io::Result<()> {
    match out.write_all(rendered.as_bytes()).and_then(|()| out.flush()) {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
        result => result,
    }
}
