// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Thin wrapper around the `object` crate giving the rest of the Binary
//! Inspector the two primitives it needs: symbol → file-offset translation,
//! and virtual-address → file-byte reads for build-metadata/DWARF parsing.

use object::{Object, ObjectSection, ObjectSymbol, SectionFlags, SectionKind};

use crate::errors::TargetError;

pub struct ElfImage<'data> {
    file: object::File<'data>,
}

impl<'data> ElfImage<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self, TargetError> {
        let file = object::File::parse(data).map_err(|source| TargetError::NotAnExecutable {
            path: String::new(),
            source,
        })?;
        Ok(Self { file })
    }

    pub fn object(&self) -> &object::File<'data> {
        &self.file
    }

    /// Sections with the `alloc+execinstr` flags: where function text
    /// lives, and the only sections the inspector is allowed to read
    /// instruction bytes from (spec.md §4.1, "Error conditions").
    pub fn executable_sections(&self) -> impl Iterator<Item = object::Section<'data, '_>> + '_ {
        self.file.sections().filter(|s| is_alloc_execinstr(s))
    }

    /// All sections, regardless of flags — build metadata and DWARF live
    /// in non-executable data sections.
    pub fn object_sections(&self) -> impl Iterator<Item = object::Section<'data, '_>> + '_ {
        self.file.sections()
    }

    /// Maps a runtime virtual address to the file offset that contains it,
    /// by finding the allocated section whose `[address, address+size)`
    /// range contains `va`.
    pub fn file_offset_for_va(&self, va: u64) -> Option<u64> {
        self.file.sections().find_map(|s| {
            let addr = s.address();
            let size = s.size();
            if size > 0 && va >= addr && va < addr + size {
                let file_range = s.file_range()?;
                Some(file_range.0 + (va - addr))
            } else {
                None
            }
        })
    }

    /// Reads `len` bytes starting at virtual address `va`, for parsing
    /// pointer-chased data (build metadata, DWARF `.debug_*` sections
    /// addressed relative to their load address).
    pub fn read_at_va(&self, va: u64, len: u64) -> Option<Vec<u8>> {
        self.file.sections().find_map(|s| {
            let addr = s.address();
            let size = s.size();
            if size > 0 && va >= addr && va + len <= addr + size {
                let data = s.data().ok()?;
                let start = (va - addr) as usize;
                let end = start + len as usize;
                data.get(start..end).map(|b| b.to_vec())
            } else {
                None
            }
        })
    }

    /// Computes the file offset for a named symbol: `symbol.value -
    /// section.addr + section.offset`, per spec.md §4.1 step 4.
    pub fn symbol_file_offset(&self, name: &str) -> Result<(u64, u64), TargetError> {
        let symbol = self
            .file
            .symbols()
            .find(|s| s.name() == Ok(name))
            .ok_or_else(|| TargetError::NoMatchingFunctions)?;

        let section_index = symbol
            .section_index()
            .ok_or_else(|| TargetError::NoMatchingFunctions)?;
        let section = self
            .file
            .section_by_index(section_index)
            .map_err(|source| TargetError::NotAnExecutable {
                path: String::new(),
                source,
            })?;
        let (file_start, _) = section
            .file_range()
            .ok_or_else(|| TargetError::NoMatchingFunctions)?;

        let offset = symbol
            .address()
            .checked_sub(section.address())
            .and_then(|rel| rel.checked_add(file_start))
            .ok_or_else(|| TargetError::NoMatchingFunctions)?;

        Ok((offset, symbol.size()))
    }

    pub fn has_symbol_table(&self) -> bool {
        self.file.symbols().next().is_some()
    }
}

fn is_alloc_execinstr(section: &object::Section) -> bool {
    if section.kind() == SectionKind::Text {
        return true;
    }
    match section.flags() {
        SectionFlags::Elf { sh_flags } => {
            const SHF_ALLOC: u64 = 0x2;
            const SHF_EXECINSTR: u64 = 0x4;
            sh_flags & SHF_ALLOC != 0 && sh_flags & SHF_EXECINSTR != 0
        }
        _ => false,
    }
}
