// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Embedded build-metadata parser (spec.md §4.1 step 2-3): locates the
//! toolchain-embedded build-info record and decodes the toolchain version
//! string plus the module dependency table.

use super::ElfImage;

const MAGIC: &[u8] = b"\xff Go buildinf:";
const HEADER_LEN: usize = 32;

pub(super) struct RawBuildInfo {
    pub toolchain_version: String,
    pub dependencies: Vec<(String, String)>,
}

pub(super) fn parse(image: &ElfImage<'_>) -> Option<RawBuildInfo> {
    let (version, modinfo) = read_version_and_modinfo(image)?;
    let dependencies = parse_modinfo(&modinfo);
    Some(RawBuildInfo {
        toolchain_version: version,
        dependencies,
    })
}

/// Finds the build-info header in any allocated section and decodes the
/// version and module-info strings, following the header's `flags` byte
/// to choose between the inlined-string encoding (Go 1.18+) and the
/// pointer-to-string-header encoding used by earlier toolchains.
fn read_version_and_modinfo(image: &ElfImage<'_>) -> Option<(String, String)> {
    for section in image.object_sections() {
        let data = section.data().ok()?;
        let Some(idx) = find_subslice(data, MAGIC) else {
            continue;
        };
        if data.len() - idx < HEADER_LEN {
            continue;
        }
        let header = &data[idx..idx + HEADER_LEN];
        let ptr_size = header[14] as usize;
        let flags = header[15];
        let big_endian = flags & 0x1 != 0;
        let inlined = flags & 0x2 != 0;

        if ptr_size != 4 && ptr_size != 8 {
            continue;
        }

        if inlined {
            let rest = &data[idx + HEADER_LEN..];
            let (version, rest) = decode_inline_string(rest)?;
            let (modinfo, _) = decode_inline_string(rest)?;
            return Some((version, modinfo));
        }

        let ptr_field = &header[16..16 + 2 * ptr_size];
        let version_ptr = read_uint(&ptr_field[..ptr_size], big_endian);
        let modinfo_ptr = read_uint(&ptr_field[ptr_size..], big_endian);
        let version = read_go_string(image, version_ptr, ptr_size, big_endian)?;
        let modinfo = read_go_string(image, modinfo_ptr, ptr_size, big_endian)?;
        return Some((version, modinfo));
    }
    None
}

/// Dereferences a Go string header (`{data uintptr, len int}`) stored at
/// virtual address `header_va`.
fn read_go_string(
    image: &ElfImage<'_>,
    header_va: u64,
    ptr_size: usize,
    big_endian: bool,
) -> Option<String> {
    let header_bytes = image.read_at_va(header_va, 2 * ptr_size as u64)?;
    let data_ptr = read_uint(&header_bytes[..ptr_size], big_endian);
    let len = read_uint(&header_bytes[ptr_size..], big_endian);
    let bytes = image.read_at_va(data_ptr, len)?;
    String::from_utf8(bytes).ok()
}

fn read_uint(bytes: &[u8], big_endian: bool) -> u64 {
    let mut buf = [0u8; 8];
    if big_endian {
        buf[8 - bytes.len()..].copy_from_slice(bytes);
        u64::from_be_bytes(buf)
    } else {
        buf[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    }
}

/// Decodes a uvarint-length-prefixed string and returns it along with the
/// remaining bytes, for the inlined-string build-info encoding.
fn decode_inline_string(data: &[u8]) -> Option<(String, &[u8])> {
    let (len, consumed) = decode_uvarint(data)?;
    let rest = &data[consumed..];
    let bytes = rest.get(..len as usize)?;
    let s = String::from_utf8(bytes.to_vec()).ok()?;
    Some((s, &rest[len as usize..]))
}

fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses the `debug.modinfo`-style blob embedded alongside the version
/// string: tab-separated `path`/`mod`/`dep`/`=>` records, one per line.
/// `=>` (replace) lines override the path/version of the preceding `dep`.
fn parse_modinfo(modinfo: &str) -> Vec<(String, String)> {
    let mut deps = Vec::new();
    for line in modinfo.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            ["dep", path, version, ..] => deps.push((path.to_string(), version.to_string())),
            ["=>", path, version, ..] => {
                if let Some(last) = deps.last_mut() {
                    *last = (path.to_string(), version.to_string());
                }
            }
            _ => {}
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dep_and_replace_lines() {
        let blob = "path\texample.com/app\nmod\texample.com/app\t(devel)\t\ndep\tgolang.org/x/sys\tv0.1.0\th1:abc=\ndep\tgoogle.golang.org/grpc\tv1.50.0\th1:def=\n=>\tgoogle.golang.org/grpc\tv1.50.1\th1:ghi=\n";
        let deps = parse_modinfo(blob);
        assert_eq!(
            deps,
            vec![
                ("golang.org/x/sys".to_string(), "v0.1.0".to_string()),
                (
                    "google.golang.org/grpc".to_string(),
                    "v1.50.1".to_string()
                ),
            ]
        );
    }

    #[test]
    fn decodes_uvarint() {
        assert_eq!(decode_uvarint(&[0x05]), Some((5, 1)));
        assert_eq!(decode_uvarint(&[0xac, 0x02]), Some((300, 2)));
    }

    #[test]
    fn decodes_inline_string_and_leaves_remainder() {
        let mut data = vec![0x05];
        data.extend_from_slice(b"hello");
        data.extend_from_slice(b"trailer");
        let (s, rest) = decode_inline_string(&data).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(rest, b"trailer");
    }
}
