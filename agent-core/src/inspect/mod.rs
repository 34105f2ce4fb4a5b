// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Binary Inspector (spec.md §4.1): produces Function Records and the
//! Module Version Map for a target executable, given the symbol names the
//! catalogue cares about.

mod amd64;
mod arm64;
mod buildinfo;
pub mod dwarf;
mod elf;
mod linetable;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use object::Architecture;

pub use elf::ElfImage;

use crate::errors::TargetError;

/// A normalised semantic-version-ish string. Kept as an opaque newtype
/// rather than parsed into numeric fields: the sentinel values (`0.0.0-dev`,
/// `0.0.0+<hex>`) are not strict semver and the only operations the rest of
/// the crate needs are equality, ordering, and "does it start with 0.0.0".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(String);

impl Version {
    pub fn parse(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the dev-version sentinels produced when a target was built
    /// without a tagged module version (spec.md §4.2 step 2).
    pub fn is_dev(&self) -> bool {
        self.0.starts_with("0.0.0")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Version)
    }
}

/// Per-dependency versions discovered from embedded build metadata
/// (spec.md §4.1 step 3). Does not include the toolchain version, which
/// `inspect` returns separately.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleVersionMap(HashMap<String, Version>);

impl ModuleVersionMap {
    pub fn insert(&mut self, module: impl Into<String>, version: Version) {
        self.0.insert(module.into(), version);
    }

    pub fn get(&self, module: &str) -> Option<&Version> {
        self.0.get(module)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Version)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A located function: its file offset and every return-instruction offset
/// within it, as found by the architecture-specific scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub name: String,
    pub entry_offset: u64,
    pub return_offsets: Vec<u64>,
}

pub struct InspectOutput {
    pub function_records: Vec<FunctionRecord>,
    pub module_versions: ModuleVersionMap,
    pub toolchain_version: Version,
}

/// Normalises a raw toolchain version string per spec.md §4.1 step 2:
/// trims a leading `go`, a trailing `+`, and any trailing `" X:…"`
/// experimental-flags suffix; `devel +<hex> …` becomes `0.0.0+<hex>`.
fn normalise_toolchain_version(raw: &str) -> Version {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix("devel") {
        let rest = rest.trim_start();
        let hex = rest
            .strip_prefix('+')
            .and_then(|s| s.split_whitespace().next())
            .unwrap_or("");
        return Version::parse(&format!("0.0.0+{hex}"));
    }

    let mut s = raw.strip_prefix("go").unwrap_or(raw);
    // Drop a trailing " X:..." experimental-flags suffix, e.g.
    // "go1.20.1 X:nocoverage" -> "go1.20.1".
    if let Some(idx) = s.find(" X:") {
        s = &s[..idx];
    }
    let s = s.trim_end_matches('+');
    Version::parse(s)
}

/// Maps the embedded `(devel)` sentinel to `0.0.0-dev`, tolerating entries
/// that do not look like `module version` pairs by skipping them (spec.md
/// §4.1 step 3: "tolerating individual parse failures by accumulating
/// errors while continuing").
fn module_versions_from_deps(deps: &[(String, String)]) -> ModuleVersionMap {
    let mut map = ModuleVersionMap::default();
    for (module, raw_version) in deps {
        if module.is_empty() {
            log::warn!("skipping dependency entry with empty module path");
            continue;
        }
        let version = if raw_version == "(devel)" {
            Version::parse("0.0.0-dev")
        } else {
            Version::parse(raw_version)
        };
        map.insert(module.clone(), version);
    }
    map
}

pub fn inspect(
    path: &Path,
    interesting: &HashSet<String>,
) -> Result<InspectOutput, TargetError> {
    let data = std::fs::read(path).map_err(|source| TargetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let image = ElfImage::parse(&data)?;

    let raw_build_info = buildinfo::parse(&image).ok_or(TargetError::MissingBuildInfo)?;
    let toolchain_version = normalise_toolchain_version(&raw_build_info.toolchain_version);
    let module_versions = module_versions_from_deps(&raw_build_info.dependencies);

    let architecture = image.object().architecture();

    let mut function_records = Vec::new();
    if image.has_symbol_table() {
        for name in interesting {
            let Ok((entry_offset, size)) = image.symbol_file_offset(name) else {
                continue;
            };
            let Some(record) =
                scan_function(&data, name, entry_offset, size, architecture)?
            else {
                continue;
            };
            function_records.push(record);
        }
    } else {
        let candidates = linetable::recover_functions(&image, &data, interesting)?;
        for (name, entry_va, size) in candidates {
            let Some(entry_offset) = image.file_offset_for_va(entry_va) else {
                continue;
            };
            let Some(record) =
                scan_function(&data, &name, entry_offset, size, architecture)?
            else {
                continue;
            };
            function_records.push(record);
        }
    }

    if function_records.is_empty() {
        return Err(TargetError::NoMatchingFunctions);
    }

    Ok(InspectOutput {
        function_records,
        module_versions,
        toolchain_version,
    })
}

fn scan_function(
    data: &[u8],
    name: &str,
    entry_offset: u64,
    size: u64,
    architecture: Architecture,
) -> Result<Option<FunctionRecord>, TargetError> {
    if size == 0 {
        return Ok(None);
    }
    let start = entry_offset as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or(TargetError::NoMatchingFunctions)?;
    let bytes = data
        .get(start..end)
        .ok_or(TargetError::NoMatchingFunctions)?;

    let relative_returns = match architecture {
        Architecture::X86_64 | Architecture::I386 => amd64::find_return_offsets(bytes)?,
        Architecture::Aarch64 => arm64::find_return_offsets(bytes),
        other => {
            log::warn!("unsupported architecture {other:?}, skipping return scan for {name}");
            Vec::new()
        }
    };

    let return_offsets = relative_returns
        .into_iter()
        .map(|rel| entry_offset + rel as u64)
        .collect();

    Ok(Some(FunctionRecord {
        name: name.to_string(),
        entry_offset,
        return_offsets,
    }))
}
