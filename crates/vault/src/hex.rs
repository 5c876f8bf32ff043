//! Lowercase hex codec for binary fields in the persisted JSON tree.

use crate::error::{Result, VaultError};

#[must_use]
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push(char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
        out.push(char::from_digit(u32::from(b & 0x0f), 16).unwrap_or('0'));
    }
    out
}

/// Decodes a hex string produced by [`encode`].
///
/// # Errors
/// Returns [`VaultError::Corrupt`] on odd length or non-hex characters, since
/// hex fields only ever come from the vault's own persisted state.
pub fn decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(VaultError::Corrupt("hex field has odd length".into()));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = hex_val(pair[0])?;
        let lo = hex_val(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(VaultError::Corrupt("hex field has non-hex character".into())),
    }
}

/// Serde adapter: `#[serde(with = "crate::hex::serde_hex")]` on `Vec<u8>`
/// fields keeps the JSON tree legible instead of emitting byte arrays.
pub mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        super::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = [0x00, 0x01, 0xab, 0xff, 0x10];
        let s = encode(&data);
        assert_eq!(s, "0001abff10");
        assert_eq!(decode(&s).unwrap(), data);
    }

    #[test]
    fn test_decode_accepts_uppercase() {
        assert_eq!(decode("ABFF").unwrap(), vec![0xab, 0xff]);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode("abc").is_err());
        assert!(decode("zz").is_err());
    }

    #[test]
    fn test_empty() {
        assert_eq!(encode(&[]), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }
}
