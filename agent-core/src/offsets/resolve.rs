// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The `offset_for` lookup algorithm (spec.md §4.2, "Lookup algorithm").

use crate::errors::ResolveError;
use crate::inspect::{dwarf, Version};

use super::{OffsetEntry, OffsetIndex, StructFieldId};

/// Resolves a struct field's byte offset for a given module version.
///
/// Falls back, in order: the dev-version single-distinct-offset rule, then
/// on-demand DWARF analysis of `object_file` (when supplied — a caller
/// that only has the Offset Index and no open executable handle skips
/// straight to a miss). A DWARF discovery is written back into `index` so
/// the next lookup for the same identifier/version is a plain hit.
pub fn offset_for(
    index: &mut OffsetIndex,
    id: &StructFieldId,
    version: &Version,
    object_file: Option<&object::File<'_>>,
) -> Result<OffsetEntry, ResolveError> {
    if let Some(entry) = index.lookup(id, version) {
        return Ok(entry);
    }

    if version.is_dev() {
        let distinct = index.distinct_valid_offsets(id);
        if distinct.len() == 1 {
            return Ok(OffsetEntry::valid(distinct[0]));
        }
    }

    let Some(object_file) = object_file else {
        return Err(ResolveError::NoDebugInfo);
    };

    let offset = dwarf::struct_field_offset(object_file, &id.package, &id.struct_name, &id.field)?;
    let entry = OffsetEntry::valid(offset);
    index.insert(id.clone(), version.clone(), entry);
    Ok(entry)
}
