// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! ARM64 return-instruction scanning (spec.md §4.1): fixed 4-byte
//! instructions, so the scan never fails — unknown encodings are simply
//! skipped and the cursor advances by one instruction width.

/// `RET`, `RETAA`, and `RETAB` share the `1101011001011111000000xxxxx00000`
/// bit pattern (bits 31:25 = `1101011`, bit 24 = `0`, bits 23:21 = `10`,
/// bits 20:16 differ between the three, bits 9:0 = `00000`). Masking off
/// the register-select bits (20:16, always `11111` for a plain `ret`,
/// `11111`/`11110` for the pointer-auth variants) isolates the family.
const RET_FAMILY_MASK: u32 = 0b1111_1110_0001_1111_0000_0011_1111_1111;
const RET_FAMILY_VALUE: u32 = 0b1101_0110_0001_1111_0000_0000_0000_0000;

pub(super) fn find_return_offsets(bytes: &[u8]) -> Vec<u32> {
    let mut offsets = Vec::new();
    let mut cursor = 0usize;
    while cursor + 4 <= bytes.len() {
        let word = u32::from_le_bytes([
            bytes[cursor],
            bytes[cursor + 1],
            bytes[cursor + 2],
            bytes[cursor + 3],
        ]);
        if word & RET_FAMILY_MASK == RET_FAMILY_VALUE {
            offsets.push(cursor as u32);
        }
        cursor += 4;
    }
    offsets
}
