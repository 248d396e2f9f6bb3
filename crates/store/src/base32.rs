//! Nix-compatible base32 encoding.
//!
//! Not the RFC 4648 alphabet: Nix drops the characters `e`, `o`, `t`, `u` to
//! avoid accidentally spelling English words in store path hash parts.

// omitted: E O U T
const BASE32_CHARS: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Encode `bytes` as a nix32 string. Output length is `ceil(len(bytes) * 8 / 5)`.
pub fn encode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = Vec::with_capacity(len);
    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let v1 = bytes.get(i).copied().unwrap_or(0).checked_shr(j as u32).unwrap_or(0);
        let v2 = bytes.get(i + 1).copied().unwrap_or(0).checked_shl((8 - j) as u32).unwrap_or(0);
        let v = ((v1 | v2) & 0x1f) as usize;
        out.push(BASE32_CHARS[v]);
    }
    // Safety: BASE32_CHARS is all ASCII.
    String::from_utf8(out).expect("nix32 alphabet is ASCII")
}

/// Decode a nix32 string back to bytes. `expected_len` is the original byte
/// length (base32 does not self-describe padding).
pub fn decode(input: &str, expected_len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = vec![0u8; expected_len];
    for (n, c) in input.bytes().rev().enumerate() {
        let digit = BASE32_CHARS
            .iter()
            .position(|&b| b == c)
            .ok_or(DecodeError::InvalidChar(c as char))? as u16;
        let b = n * 5;
        let i = b / 8;
        let j = (b % 8) as u16;
        if i >= out.len() {
            if digit != 0 {
                return Err(DecodeError::Overflow);
            }
            continue;
        }
        out[i] |= (digit << j) as u8;
        if i + 1 < out.len() {
            let overflow = digit >> (8 - j);
            if overflow != 0 {
                out[i + 1] |= overflow as u8;
            }
        }
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid nix32 character: {0:?}")]
    InvalidChar(char),
    #[error("decoded value overflows expected length")]
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let input = b"the quick brown fox hash bytes!";
        let encoded = encode(input);
        let decoded = decode(&encoded, input.len()).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn empty_input_encodes_empty() {
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn rejects_unknown_characters() {
        assert_eq!(decode("oeut", 4), Err(DecodeError::InvalidChar('o')));
    }
}
