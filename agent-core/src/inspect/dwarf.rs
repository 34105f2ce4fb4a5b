// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! DWARF-based struct field offset discovery (spec.md §4.2 step 3): the
//! fallback Offset Resolution reaches for when neither the Offset Index nor
//! the dev-version single-distinct-offset rule resolves a lookup.

use std::borrow::Cow;

use gimli::{EndianSlice, LittleEndian};
use object::{Object, ObjectSection};

use crate::errors::ResolveError;

/// Locates a struct entry named `<package path>.<struct name>`, then a
/// child member entry named `field`, and returns its
/// `DW_AT_data_member_location` as a byte offset.
pub fn struct_field_offset(
    object_file: &object::File<'_>,
    package: &str,
    struct_name: &str,
    field: &str,
) -> Result<u64, ResolveError> {
    let dwarf_sections = gimli::Dwarf::load(|id| load_section(object_file, id))
        .map_err(ResolveError::Dwarf)?;
    let dwarf = dwarf_sections.borrow(|section| EndianSlice::new(section, LittleEndian));

    let qualified_name = format!("{package}.{struct_name}");

    let mut units = dwarf.units();
    while let Some(header) = units.next().map_err(ResolveError::Dwarf)? {
        let unit = dwarf.unit(header).map_err(ResolveError::Dwarf)?;
        let mut entries = unit.entries();

        while let Some((_, entry)) = entries.next_dfs().map_err(ResolveError::Dwarf)? {
            if entry.tag() != gimli::DW_TAG_structure_type {
                continue;
            }
            if !entry_name_matches(&dwarf, &unit, entry, &qualified_name)? {
                continue;
            }

            let mut tree = unit
                .entries_tree(Some(entry.offset()))
                .map_err(ResolveError::Dwarf)?;
            let root = tree.root().map_err(ResolveError::Dwarf)?;
            let mut children = root.children();
            while let Some(child_node) = children.next().map_err(ResolveError::Dwarf)? {
                let child = child_node.entry();
                if child.tag() != gimli::DW_TAG_member {
                    continue;
                }
                if entry_name_matches(&dwarf, &unit, child, field)? {
                    return member_offset(child);
                }
            }
        }
    }

    Err(ResolveError::NoDebugInfo)
}

fn entry_name_matches<R: gimli::Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
    expected: &str,
) -> Result<bool, ResolveError> {
    let Some(attr) = entry.attr(gimli::DW_AT_name).map_err(ResolveError::Dwarf)? else {
        return Ok(false);
    };
    let name = dwarf
        .attr_string(unit, attr.value())
        .map_err(ResolveError::Dwarf)?;
    let name = name.to_string_lossy().map_err(ResolveError::Dwarf)?;
    Ok(name == expected)
}

fn member_offset<R: gimli::Reader>(
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<u64, ResolveError> {
    let Some(attr) = entry
        .attr(gimli::DW_AT_data_member_location)
        .map_err(ResolveError::Dwarf)?
    else {
        return Err(ResolveError::NoDebugInfo);
    };
    match attr.value() {
        gimli::AttributeValue::Udata(v) => Ok(v),
        gimli::AttributeValue::Sdata(v) if v >= 0 => Ok(v as u64),
        _ => Err(ResolveError::NoDebugInfo),
    }
}

fn load_section<'data>(
    object_file: &object::File<'data>,
    id: gimli::SectionId,
) -> Result<Cow<'data, [u8]>, gimli::Error> {
    match object_file.section_by_name(id.name()) {
        Some(section) => Ok(section
            .uncompressed_data()
            .unwrap_or(Cow::Borrowed(&[][..]))),
        None => Ok(Cow::Borrowed(&[][..])),
    }
}
