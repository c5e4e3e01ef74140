//! Hex text helpers for captures and diagnostics.

use crate::WireError;
use std::fmt::Write;

/// Encode bytes as lowercase hex
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Decode hex text, ignoring surrounding whitespace
pub fn decode(text: &str) -> Result<Vec<u8>, WireError> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(WireError::Hex(format!("odd length {}", text.len())));
    }

    text.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| WireError::Hex(String::from_utf8_lossy(pair).into_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0x0e, 0x74, 0xff];
        assert_eq!(encode(&bytes), "000e74ff");
        assert_eq!(decode("000E74ff").unwrap(), bytes.to_vec());
    }

    #[test]
    fn test_hex_errors() {
        assert!(matches!(decode("abc"), Err(WireError::Hex(_))));
        assert!(matches!(decode("zz"), Err(WireError::Hex(_))));
    }
}
