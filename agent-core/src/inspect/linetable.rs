// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Stripped-binary fallback (spec.md §4.1 step 5): when no symbol table is
//! present, function entry and size are recovered from the toolchain's
//! embedded program-counter line table instead.
//!
//! Targets only the 64-bit little-endian table layout (the workspace only
//! ships `x86_64`/`aarch64` vendor platforms): an 8-byte-aligned header
//! followed by a sorted `(entry offset, func-record offset)` table, a
//! `_func`-style record per function, and a name string table. Function
//! size is derived from the gap to the next entry in the (sorted) table
//! rather than from the PC/SP table, since only entry+size are needed
//! here.

use std::collections::HashSet;

use super::ElfImage;
use crate::errors::TargetError;

const KNOWN_MAGICS: [u32; 4] = [0xfffffff0, 0xfffffff1, 0xfffffff2, 0xfffffff3];
const HEADER_LEN: usize = 72;

struct Header {
    text_start: u64,
    nfunc: u64,
    funcname_offset: u64,
    funcdata_offset: u64,
}

fn parse_header(blob: &[u8]) -> Option<Header> {
    if blob.len() < HEADER_LEN {
        return None;
    }
    let magic = u32::from_le_bytes(blob[0..4].try_into().ok()?);
    if !KNOWN_MAGICS.contains(&magic) {
        return None;
    }
    // bytes 4,5 = pad, 6 = quantum, 7 = ptrSize; only ptrSize 8 is handled.
    if blob[7] != 8 {
        return None;
    }
    let field = |i: usize| -> u64 {
        let start = 8 + i * 8;
        u64::from_le_bytes(blob[start..start + 8].try_into().unwrap())
    };
    Some(Header {
        nfunc: field(0),
        text_start: field(2),
        funcname_offset: field(3),
        funcdata_offset: field(6),
    })
}

fn read_u32(blob: &[u8], offset: u64) -> Option<u32> {
    let start = offset as usize;
    blob.get(start..start + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_cstr(blob: &[u8], offset: u64) -> Option<String> {
    let start = offset as usize;
    let bytes = blob.get(start..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    String::from_utf8(bytes[..end].to_vec()).ok()
}

/// Returns `(name, entry virtual address, size)` triples for every
/// requested name the line table describes.
pub(super) fn recover_functions(
    image: &ElfImage<'_>,
    _file_data: &[u8],
    interesting: &HashSet<String>,
) -> Result<Vec<(String, u64, u64)>, TargetError> {
    for section in image.object_sections() {
        let Ok(data) = section.data() else {
            continue;
        };
        let Some(idx) = find_magic(data) else {
            continue;
        };
        let blob = &data[idx..];
        let Some(header) = parse_header(blob) else {
            continue;
        };

        let functab_start = HEADER_LEN;
        let mut entries = Vec::with_capacity(header.nfunc as usize + 1);
        for i in 0..=header.nfunc {
            let entry_off_pos = functab_start as u64 + i * 8;
            let Some(entry_off) = read_u32(blob, entry_off_pos) else {
                break;
            };
            let func_off = read_u32(blob, entry_off_pos + 4);
            entries.push((entry_off as u64, func_off));
        }
        if entries.len() < 2 {
            continue;
        }

        let mut results = Vec::new();
        for w in 0..entries.len() - 1 {
            let (entry_off, func_off) = entries[w];
            let Some(func_off) = func_off else { continue };
            let (next_entry_off, _) = entries[w + 1];
            let size = next_entry_off.saturating_sub(entry_off);

            let record_base = header.funcdata_offset + func_off as u64;
            let Some(name_off) = read_u32(blob, record_base + 4) else {
                continue;
            };
            let Some(name) = read_cstr(blob, header.funcname_offset + name_off as u64) else {
                continue;
            };
            if interesting.contains(&name) {
                let entry_va = header.text_start + entry_off;
                results.push((name, entry_va, size));
            }
        }
        return Ok(results);
    }
    Err(TargetError::NoMatchingFunctions)
}

fn find_magic(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| {
        let v = u32::from_le_bytes(w.try_into().unwrap());
        KNOWN_MAGICS.contains(&v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-builds a minimal table: two functions, `foo` and `bar`, in a
    /// single synthetic section blob.
    fn synthetic_table() -> Vec<u8> {
        let funcnametab_off: u64 = HEADER_LEN as u64 + 3 * 8; // after 3 functab entries (2 funcs + sentinel)
        let names = b"foo\0bar\0";
        let funcdata_off = funcnametab_off + names.len() as u64;

        let mut blob = Vec::new();
        blob.extend_from_slice(&0xfffffff2u32.to_le_bytes()); // magic
        blob.push(0); // pad1
        blob.push(0); // pad2
        blob.push(1); // quantum
        blob.push(8); // ptrSize
        blob.extend_from_slice(&2u64.to_le_bytes()); // nfunc
        blob.extend_from_slice(&0u64.to_le_bytes()); // nfiles (unused)
        blob.extend_from_slice(&0x1000u64.to_le_bytes()); // textStart
        blob.extend_from_slice(&funcnametab_off.to_le_bytes()); // funcnameOffset
        blob.extend_from_slice(&0u64.to_le_bytes()); // cuOffset (unused)
        blob.extend_from_slice(&0u64.to_le_bytes()); // filetabOffset (unused)
        blob.extend_from_slice(&0u64.to_le_bytes()); // pctabOffset (unused)
        blob.extend_from_slice(&funcdata_off.to_le_bytes()); // funcdataOffset
        assert_eq!(blob.len(), HEADER_LEN);

        // functab: (entryOff, funcOff) x3 (2 funcs + end sentinel)
        blob.extend_from_slice(&0u32.to_le_bytes()); // foo at +0
        blob.extend_from_slice(&0u32.to_le_bytes()); // funcOff 0
        blob.extend_from_slice(&0x20u32.to_le_bytes()); // bar at +0x20
        blob.extend_from_slice(&8u32.to_le_bytes()); // funcOff 8 (second record)
        blob.extend_from_slice(&0x40u32.to_le_bytes()); // sentinel end
        blob.extend_from_slice(&0u32.to_le_bytes());

        blob.extend_from_slice(names);

        // _func records: [entryOff(unused, 4 bytes), nameOff(4 bytes)]
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // "foo" at nametab offset 0
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&4u32.to_le_bytes()); // "bar" at nametab offset 4

        blob
    }

    #[test]
    fn header_parses_known_magic() {
        let blob = synthetic_table();
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.nfunc, 2);
        assert_eq!(header.text_start, 0x1000);
    }

    #[test]
    fn reads_function_names_from_table() {
        let blob = synthetic_table();
        let header = parse_header(&blob).unwrap();
        let name0 = read_cstr(&blob, header.funcname_offset).unwrap();
        assert_eq!(name0, "foo");
    }
}
