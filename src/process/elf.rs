//! ELF dynamic export tables
//!
//! Reads a module's dynamic symbol table with the `object` crate and turns
//! it into engine export descriptors at runtime addresses.

use object::{Object, ObjectSegment, ObjectSymbol, SymbolFlags, SymbolKind};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::ExportSymbol;

/// Mask of the page containing the first loadable segment
const PAGE_MASK: u64 = !0xfff;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: object::Error,
    },
}

/// A memory-mapped ELF file
pub struct ElfImage {
    path: PathBuf,
    mmap: memmap2::Mmap,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let io_err = |source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        // Read-only mapping of a file the target already has mapped
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(io_err)?;

        // Fail early on non-object files
        object::File::parse(&*mmap).map_err(|source| ImageError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    fn parse(&self) -> Result<object::File<'_>, ImageError> {
        object::File::parse(&*self.mmap).map_err(|source| ImageError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Page-aligned link-time address of the first loadable segment
    pub fn link_base(&self) -> Result<u64, ImageError> {
        let file = self.parse()?;
        Ok(file
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0)
            & PAGE_MASK)
    }

    /// Difference between runtime and link-time addresses when the file's
    /// offset-0 mapping starts at `mapped_base`
    pub fn load_bias(&self, mapped_base: u64) -> Result<u64, ImageError> {
        Ok(mapped_base.wrapping_sub(self.link_base()?))
    }

    /// Defined dynamic function symbols, rebased by `bias`
    ///
    /// `STT_GNU_IFUNC` symbols are reported as indirect code: their address
    /// is the resolver, not the function.
    pub fn exports(&self, bias: u64) -> Result<Vec<ExportSymbol>, ImageError> {
        let file = self.parse()?;
        let mut exports = Vec::new();

        for symbol in file.dynamic_symbols() {
            if symbol.is_undefined() || !symbol.is_global() {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            let st_type = match symbol.flags() {
                SymbolFlags::Elf { st_info, .. } => st_info & 0xf,
                _ => continue,
            };
            let addr = symbol.address().wrapping_add(bias);

            if st_type == object::elf::STT_GNU_IFUNC {
                exports.push(ExportSymbol::indirect(name, addr));
            } else if symbol.kind() == SymbolKind::Text {
                exports.push(ExportSymbol::code(name, addr));
            } else {
                exports.push(ExportSymbol::data(name, addr));
            }
        }

        Ok(exports)
    }
}
