// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Offset Resolution (spec.md §4.2): `offset_for` answers struct-field
//! offset questions with constant-time lookup for indexed entries and
//! best-effort discovery for unknown versions.

pub mod index;
pub mod resolve;

use serde::{Deserialize, Serialize};

use crate::inspect::Version;

/// Identifies a single struct field within a module's package, the unit
/// the Offset Index is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructFieldId {
    pub module: String,
    pub package: String,
    pub struct_name: String,
    pub field: String,
}

impl StructFieldId {
    pub fn new(
        module: impl Into<String>,
        package: impl Into<String>,
        struct_name: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            package: package.into(),
            struct_name: struct_name.into(),
            field: field.into(),
        }
    }
}

/// Whether a resolved field is actually present on a given version: the
/// index distinguishes "not present in this version" from "not indexed at
/// all" (spec.md §4.2, "Index representation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetEntry {
    pub bytes: u64,
    pub valid: bool,
}

impl OffsetEntry {
    pub fn valid(bytes: u64) -> Self {
        Self { bytes, valid: true }
    }

    pub fn invalid() -> Self {
        Self {
            bytes: 0,
            valid: false,
        }
    }
}

pub use index::OffsetIndex;

pub(crate) fn version_key(version: &Version) -> String {
    version.as_str().to_string()
}
