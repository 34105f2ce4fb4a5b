// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Offset Index storage and its on-disk JSON schema (spec.md §4.2, "Index
//! representation and serialisation"): a tree grouped by module → package →
//! struct → field → offset entries, each entry listing the versions it
//! applies to. Serialisation is hand-rolled rather than derived so the
//! output is grouped by offset value and sorted, for repeatable diffs.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use super::{OffsetEntry, StructFieldId};
use crate::inspect::Version;

#[derive(Debug, Clone, Default)]
pub struct OffsetIndex {
    entries: HashMap<StructFieldId, HashMap<Version, OffsetEntry>>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &StructFieldId, version: &Version) -> Option<OffsetEntry> {
        self.entries.get(id)?.get(version).copied()
    }

    pub fn insert(&mut self, id: StructFieldId, version: Version, entry: OffsetEntry) {
        self.entries.entry(id).or_default().insert(version, entry);
    }

    /// The set of distinct *valid* offsets indexed for `id`, across every
    /// version — used by the dev-version single-distinct-offset fallback
    /// rule (spec.md §4.2 step 2).
    pub fn distinct_valid_offsets(&self, id: &StructFieldId) -> Vec<u64> {
        let Some(by_version) = self.entries.get(id) else {
            return Vec::new();
        };
        let mut offsets: Vec<u64> = by_version
            .values()
            .filter(|e| e.valid)
            .map(|e| e.bytes)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }

    /// Loads a persisted index from `path` (spec.md §6, "Offset index
    /// file"). A missing file is not an error: the index just starts empty,
    /// the same way `bpfd`'s own config loading tolerates an absent file.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(std::io::Error::other),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err),
        }
    }

    /// Persists the index to `path`, creating any parent directory first.
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, raw)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    bytes: u64,
    valid: bool,
    versions: Vec<String>,
}

type WireTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<WireEntry>>>>>;

impl Serialize for OffsetIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tree: WireTree = BTreeMap::new();

        for (id, by_version) in &self.entries {
            // Group versions by (bytes, valid) so identical entries share
            // one JSON object instead of repeating per-version.
            let mut grouped: BTreeMap<(u64, bool), Vec<String>> = BTreeMap::new();
            for (version, entry) in by_version {
                grouped
                    .entry((entry.bytes, entry.valid))
                    .or_default()
                    .push(version.as_str().to_string());
            }

            let mut wire_entries: Vec<WireEntry> = grouped
                .into_iter()
                .map(|((bytes, valid), mut versions)| {
                    versions.sort();
                    WireEntry {
                        bytes,
                        valid,
                        versions,
                    }
                })
                .collect();
            wire_entries.sort_by(|a, b| (a.bytes, !a.valid).cmp(&(b.bytes, !b.valid)));

            tree.entry(id.module.clone())
                .or_default()
                .entry(id.package.clone())
                .or_default()
                .entry(id.struct_name.clone())
                .or_default()
                .insert(id.field.clone(), wire_entries);
        }

        let mut map = serializer.serialize_map(Some(tree.len()))?;
        for (k, v) in &tree {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OffsetIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tree = WireTree::deserialize(deserializer)?;
        let mut index = OffsetIndex::new();

        for (module, packages) in tree {
            for (package, structs) in packages {
                for (struct_name, fields) in structs {
                    for (field, wire_entries) in fields {
                        let id = StructFieldId::new(
                            module.clone(),
                            package.clone(),
                            struct_name.clone(),
                            field,
                        );
                        for wire_entry in wire_entries {
                            let entry = if wire_entry.valid {
                                OffsetEntry::valid(wire_entry.bytes)
                            } else {
                                OffsetEntry::invalid()
                            };
                            for version_str in wire_entry.versions {
                                let version = Version::parse(&version_str);
                                // Equal repeated entries collapse naturally:
                                // inserting the same (version, entry) pair
                                // twice is a no-op.
                                index.insert(id.clone(), version, entry);
                            }
                        }
                    }
                }
            }
        }

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut index = OffsetIndex::new();
        let id = StructFieldId::new("net/http", "http", "Request", "Method");
        index.insert(id.clone(), Version::parse("1.0.0"), OffsetEntry::valid(16));
        index.insert(id.clone(), Version::parse("1.1.0"), OffsetEntry::valid(16));
        index.insert(id.clone(), Version::parse("2.0.0"), OffsetEntry::invalid());

        let json = serde_json::to_string(&index).unwrap();
        let restored: OffsetIndex = serde_json::from_str(&json).unwrap();

        assert_eq!(
            restored.lookup(&id, &Version::parse("1.0.0")),
            Some(OffsetEntry::valid(16))
        );
        assert_eq!(
            restored.lookup(&id, &Version::parse("2.0.0")),
            Some(OffsetEntry::invalid())
        );
    }

    #[test]
    fn groups_equal_entries_in_output() {
        let mut index = OffsetIndex::new();
        let id = StructFieldId::new("net/http", "http", "Request", "Method");
        index.insert(id.clone(), Version::parse("1.0.0"), OffsetEntry::valid(16));
        index.insert(id, Version::parse("1.1.0"), OffsetEntry::valid(16));

        let json = serde_json::to_value(&index).unwrap();
        let entries = &json["net/http"]["http"]["Request"]["Method"];
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["versions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn distinct_valid_offsets_reports_single_value() {
        let mut index = OffsetIndex::new();
        let id = StructFieldId::new("net/http", "http", "Request", "Method");
        index.insert(id.clone(), Version::parse("1.0.0"), OffsetEntry::valid(16));
        index.insert(id.clone(), Version::parse("1.1.0"), OffsetEntry::valid(16));
        assert_eq!(index.distinct_valid_offsets(&id), vec![16]);
    }

    #[test]
    fn load_from_file_round_trips_a_saved_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let mut index = OffsetIndex::new();
        let id = StructFieldId::new("net/http", "http", "Request", "Method");
        index.insert(id.clone(), Version::parse("1.0.0"), OffsetEntry::valid(16));
        index.save_to_file(&path).unwrap();

        let loaded = OffsetIndex::load_from_file(&path).unwrap();
        assert_eq!(loaded.distinct_valid_offsets(&id), vec![16]);
    }

    #[test]
    fn load_from_file_tolerates_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");

        let loaded = OffsetIndex::load_from_file(&path).unwrap();
        let id = StructFieldId::new("net/http", "http", "Request", "Method");
        assert!(loaded.distinct_valid_offsets(&id).is_empty());
    }

    #[test]
    fn save_to_file_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.json");

        let index = OffsetIndex::new();
        index.save_to_file(&path).unwrap();
        assert!(path.exists());
    }
}
