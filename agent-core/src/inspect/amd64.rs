// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! AMD64/i386 return-instruction scanning (spec.md §4.1, "Architecture-
//! specific return scanning"): a variable-length decode, recording every
//! `RET`, aborting on a decode failure.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};

use crate::errors::TargetError;

/// Returns the byte offsets, relative to the start of `bytes`, of every
/// `ret`/`retf` instruction found while decoding `bytes` as AMD64 (or
/// i386, callers pass 32-bit bytes unchanged) machine code.
pub(super) fn find_return_offsets(bytes: &[u8]) -> Result<Vec<u32>, TargetError> {
    let mut decoder = Decoder::new(64, bytes, DecoderOptions::NONE);
    let mut offsets = Vec::new();

    while decoder.can_decode() {
        let position = decoder.position() as u32;
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(TargetError::NoMatchingFunctions);
        }
        match instruction.mnemonic() {
            Mnemonic::Ret | Mnemonic::Retf => offsets.push(position),
            _ => {}
        }
    }

    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_single_ret() {
        // `mov eax, 0` ; `ret`
        let bytes = [0xb8, 0x00, 0x00, 0x00, 0x00, 0xc3];
        let offsets = find_return_offsets(&bytes).unwrap();
        assert_eq!(offsets, vec![5]);
    }

    #[test]
    fn finds_multiple_returns_across_branches() {
        // `test edi, edi` ; `jz +2` ; `ret` ; `nop` ; `ret`
        let bytes = [0x85, 0xff, 0x74, 0x02, 0xc3, 0x90, 0xc3];
        let offsets = find_return_offsets(&bytes).unwrap();
        assert_eq!(offsets, vec![4, 6]);
    }

    #[test]
    fn aborts_on_decode_failure() {
        // 0x0f 0xff is not a valid opcode encoding.
        let bytes = [0x0f, 0xff];
        assert!(find_return_offsets(&bytes).is_err());
    }
}
