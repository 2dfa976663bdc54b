//! `/proc/<pid>/maps` parsing
//!
//! Groups file-backed mappings by path to recover each loaded module's
//! address range.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Address range of one file-backed module in a process's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedModule {
    pub path: PathBuf,
    /// Lowest mapped address
    pub start: u64,
    /// Highest mapped address (exclusive)
    pub end: u64,
    /// Start of the mapping at file offset 0, used to compute the load bias
    pub base: Option<u64>,
}

/// Split off the next whitespace-delimited field
fn next_field(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some((&rest[..end], &rest[end..]))
}

struct MapsLine<'a> {
    start: u64,
    end: u64,
    offset: u64,
    path: &'a str,
}

/// Parse one line: `start-end perms offset dev inode [pathname]`
fn parse_line(line: &str) -> Option<MapsLine<'_>> {
    let (range, rest) = next_field(line)?;
    let (_perms, rest) = next_field(rest)?;
    let (offset, rest) = next_field(rest)?;
    let (_dev, rest) = next_field(rest)?;
    let (_inode, rest) = next_field(rest)?;

    let (start, end) = range.split_once('-')?;
    Some(MapsLine {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: rest.trim(),
    })
}

/// Parse maps text into modules, in order of first appearance
///
/// Anonymous and pseudo mappings (`[heap]`, `[vdso]`, ...) and files that
/// were deleted after mapping are skipped.
pub fn parse_maps(maps: &str) -> Vec<MappedModule> {
    let mut modules: Vec<MappedModule> = Vec::new();

    for line in maps.lines() {
        let Some(entry) = parse_line(line) else {
            continue;
        };
        if !entry.path.starts_with('/') || entry.path.ends_with(" (deleted)") {
            continue;
        }

        let base = (entry.offset == 0).then_some(entry.start);
        match modules.iter_mut().find(|m| m.path.as_os_str() == entry.path) {
            Some(module) => {
                module.start = module.start.min(entry.start);
                module.end = module.end.max(entry.end);
                if module.base.is_none() {
                    module.base = base;
                }
            }
            None => modules.push(MappedModule {
                path: PathBuf::from(entry.path),
                start: entry.start,
                end: entry.end,
                base,
            }),
        }
    }

    modules
}

/// Whether the file at `path` starts with the ELF magic
///
/// A file that cannot be opened is given the benefit of the doubt; one that
/// opens but is too short or has other magic is not an object file.
fn is_object_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return true;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && &magic == ELF_MAGIC
}

/// Drop mapped data files (locale archives, caches, fonts) that are not
/// loadable modules
pub fn retain_object_files(modules: Vec<MappedModule>) -> Vec<MappedModule> {
    modules
        .into_iter()
        .filter(|module| {
            let keep = is_object_file(&module.path);
            if !keep {
                tracing::trace!("ignoring non-object mapping {}", module.path.display());
            }
            keep
        })
        .collect()
}

/// Read and parse the maps of a live process, keeping object files only
pub fn read_maps(pid: i32) -> Result<Vec<MappedModule>> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    Ok(retain_object_files(parse_maps(&maps)))
}
