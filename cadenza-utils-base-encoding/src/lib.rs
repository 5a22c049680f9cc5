// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The base32 variant used for store path hash parts.
//!
//! This is not RFC 4648: the alphabet omits `e`, `o`, `u` and `t` (to avoid
//! spelling anything regrettable in path names), bits are consumed least
//! significant first, and the encoded string is emitted reversed. The
//! combination means a digest and its textual form relate the same way they
//! do in every other store implementation, character for character.

use std::sync::LazyLock;

use data_encoding::{BitOrder, Encoding, Specification};
use thiserror::Error;

/// The 32-character alphabet for store-path base32.
///
/// Canonical source for the alphabet across the workspace — do not
/// duplicate the string elsewhere.
pub const ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

/// The alphabet as a byte slice (convenience alias).
pub const ALPHABET_BYTES: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

static NIX_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(ALPHABET);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().unwrap()
});

/// Number of characters needed to encode `len` bytes.
pub const fn encoded_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Number of bytes produced by decoding `len` characters.
///
/// Returns `None` when no byte string encodes to exactly `len` characters.
pub const fn decoded_len(len: usize) -> Option<usize> {
    let out = 5 * len / 8;
    if encoded_len(out) != len {
        return None;
    }
    Some(out)
}

/// Error decoding a nix-base32 string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base32 length {0}")]
    InvalidLength(usize),
    #[error("invalid base32 character at offset {0}")]
    InvalidChar(usize),
}

/// Encode `input` as nix-base32.
pub fn encode(input: &[u8]) -> String {
    let mut output = NIX_BASE32.encode(input).into_bytes();
    // The textual form is reversed relative to data-encoding's output.
    output.reverse();
    // The alphabet is pure ASCII, so the reversal cannot break UTF-8.
    String::from_utf8(output).unwrap()
}

/// Encode `input` into a caller-provided buffer of [`encoded_len`] bytes.
pub fn encode_into(input: &[u8], output: &mut [u8]) {
    NIX_BASE32.encode_mut(input, output);
    output.reverse();
}

/// Decode a nix-base32 string.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let out_len = decoded_len(input.len()).ok_or(DecodeError::InvalidLength(input.len()))?;
    let mut reversed = input.to_vec();
    reversed.reverse();
    let mut output = vec![0u8; out_len];
    NIX_BASE32
        .decode_mut(&reversed, &mut output)
        .map_err(|err| {
            // Positions refer to the reversed string; map them back.
            let pos = input.len().saturating_sub(err.error.position + 1);
            DecodeError::InvalidChar(pos)
        })?;
    Ok(output)
}

/// True when `byte` is a valid nix-base32 character.
#[inline]
pub const fn is_valid_char(byte: u8) -> bool {
    VALID_CHAR[byte as usize]
}

const VALID_CHAR: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0;
    while i < ALPHABET_BYTES.len() {
        table[ALPHABET_BYTES[i] as usize] = true;
        i += 1;
    }
    table
};

#[cfg(test)]
mod unittests {
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("", &[])]
    #[case::one("0z", &hex!("1f"))]
    #[case::two("0bqz", &hex!("1f2f"))]
    #[case::three("gy003", &hex!("0300 FF"))]
    #[case::four("0s14004", &hex!("0400 1234"))]
    #[case::five("aqs14005", &hex!("0500 1234 56"))]
    #[case::sha1("x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88", &hex!("0839 7037 8635 6bca 59b0 f4a3 2987 eb2e 6de4 3ae8"))]
    #[case::sha256("1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", &hex!("ba78 16bf 8f01 cfea 4141 40de 5dae 2223 b003 61a3 9617 7a9c b410 ff61 f200 15ad"))]
    #[case::sha512("2gs8k559z4rlahfx0y688s49m2vvszylcikrfinm30ly9rak69236nkam5ydvly1ai7xac99vxfc4ii84hawjbk876blyk1jfhkbbyx", &hex!("ddaf 35a1 9361 7aba cc41 7349 ae20 4131 12e6 fa4e 89a9 7ea2 0a9e eee6 4b55 d39a 2192 992a 274f c1a8 36ba 3c23 a3fe ebbd 454d 4423 643c e80e 2a9a c94f a54c a49f"))]
    fn roundtrip_vectors(#[case] text: &str, #[case] bytes: &[u8]) {
        assert_eq!(encode(bytes), text);
        assert_eq!(decode(text.as_bytes()).unwrap(), bytes);

        let mut buf = vec![0u8; encoded_len(bytes.len())];
        encode_into(bytes, &mut buf);
        assert_eq!(buf, text.as_bytes());
    }

    #[rstest]
    #[case::bad_trailing_bits("zz", DecodeError::InvalidChar(0))]
    #[case::bad_length_single("a", DecodeError::InvalidLength(1))]
    #[case::bad_char("czz|0", DecodeError::InvalidChar(3))]
    #[case::bad_first_char("|zz00", DecodeError::InvalidChar(0))]
    #[case::uppercase("CZZ00", DecodeError::InvalidChar(2))]
    fn decode_failures(#[case] text: &str, #[case] expected: DecodeError) {
        assert_eq!(decode(text.as_bytes()), Err(expected));
    }

    #[test]
    fn excluded_letters_rejected() {
        for c in ["e", "o", "u", "t"] {
            let text = format!("{c}zz00");
            assert!(decode(text.as_bytes()).is_err(), "{c} must not decode");
        }
    }

    #[test]
    fn length_tables() {
        assert_eq!(encoded_len(20), 32);
        assert_eq!(encoded_len(32), 52);
        assert_eq!(encoded_len(64), 103);
        assert_eq!(decoded_len(32), Some(20));
        assert_eq!(decoded_len(52), Some(32));
        assert_eq!(decoded_len(103), Some(64));
        assert_eq!(decoded_len(33), None);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    proptest! {
        #[test]
        fn proptest_roundtrip(data: Vec<u8>) {
            let encoded = encode(&data);
            prop_assert_eq!(encoded.len(), encoded_len(data.len()));
            let decoded = decode(encoded.as_bytes()).unwrap();
            prop_assert_eq!(data, decoded);
        }
    }
}
