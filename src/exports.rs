//! Export enumeration
//!
//! Walks a module's export table and produces one callable entry point per
//! exported function. Indirect exports are resolved by calling their
//! resolver thunk once through the engine's guarded call; a fault there
//! only drops that export.

use std::collections::HashSet;
use std::sync::Arc;

use crate::engine::{AppPc, Engine, ExportSymbol, ModuleData};

/// An export whose real entry address is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExport {
    /// Symbol name, shared with the interception registration as user data
    pub name: Arc<str>,
    /// Real entry address
    pub entry: AppPc,
    /// Resolver thunk the entry was obtained from, for indirect exports
    pub resolver: Option<AppPc>,
}

/// Entry address of one export table entry, if it has one
///
/// Direct code exports map to their own address. Indirect exports invoke
/// the resolver; a fault or a null result yields `None`. Data exports are
/// never callable.
pub fn resolve_entry(engine: &dyn Engine, symbol: &ExportSymbol) -> Option<AppPc> {
    if symbol.is_code {
        return Some(symbol.addr);
    }
    if !symbol.is_indirect_code {
        return None;
    }

    let entry = match engine.call_resolver(symbol.addr) {
        Ok(entry) => entry,
        Err(fault) => {
            tracing::debug!(
                "export {} resolver at {:#x} faulted: {}",
                symbol.name,
                symbol.addr,
                fault
            );
            0
        }
    };
    tracing::debug!(
        "export {} indirected from {:#x} to {:#x}",
        symbol.name,
        symbol.addr,
        entry
    );

    (entry != 0).then_some(entry)
}

/// Enumerate the callable exports of `module`, in export table order
///
/// Aliases (several names for one entry address) collapse into the first
/// name seen, so every entry point appears once.
pub fn enumerate(engine: &dyn Engine, module: &ModuleData) -> Vec<ResolvedExport> {
    let mut seen = HashSet::new();
    engine
        .exports(module)
        .filter_map(|symbol| {
            let entry = resolve_entry(engine, &symbol)?;
            if !seen.insert(entry) {
                tracing::trace!("export {} aliases {:#x}", symbol.name, entry);
                return None;
            }
            Some(ResolvedExport {
                resolver: (!symbol.is_code && symbol.is_indirect_code).then_some(symbol.addr),
                name: Arc::from(symbol.name),
                entry,
            })
        })
        .collect()
}
