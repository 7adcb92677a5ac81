//! Base58 text codec for addresses, signatures and hashes.
//!
//! Uses the Bitcoin alphabet (no `0`, `O`, `I`, `l`). Each leading zero byte
//! is written as a leading `'1'` so the byte length survives a round trip.

use super::CryptoError;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const INVALID: u8 = 0xFF;

/// ASCII -> digit lookup, `INVALID` for characters outside the alphabet
const DECODE_MAP: [u8; 128] = {
    let mut map = [INVALID; 128];
    let mut i = 0;
    while i < ALPHABET.len() {
        map[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    map
};

/// Encode bytes as base58 text
pub fn encode(bytes: &[u8]) -> String {
    let zeros = bytes.iter().take_while(|b| **b == 0).count();

    // Base58 digits, least significant first
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
    for &byte in &bytes[zeros..] {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('1').take(zeros));
    out.extend(digits.iter().rev().map(|d| ALPHABET[*d as usize] as char));
    out
}

/// Decode base58 text back into bytes
///
/// Fails on the first character outside the alphabet. The empty string
/// decodes to an empty byte vector.
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    let zeros = text.bytes().take_while(|b| *b == b'1').count();

    // Bytes, least significant first
    let mut bytes: Vec<u8> = Vec::with_capacity(text.len() * 733 / 1000 + 1);
    for (position, character) in text.chars().enumerate() {
        let value = match character {
            c if c.is_ascii() => DECODE_MAP[c as usize],
            _ => INVALID,
        };
        if value == INVALID {
            return Err(CryptoError::InvalidBase58 { character, position });
        }

        let mut carry = value as u32;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

/// Decode into a fixed-size array, failing when the length differs
pub fn decode_array<const N: usize>(text: &str) -> Result<[u8; N], CryptoError> {
    let bytes = decode(text)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidLength { expected: N, got })
}
