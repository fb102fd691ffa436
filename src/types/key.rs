//! Content key parsing
//!
//! A key is `0x` followed by exactly 64 hex digits, i.e. a 32-byte hash.
//! Keys are normalised to lowercase so that mixed-case spellings of the same
//! hash share one cache slot and one in-flight fetch.

use std::fmt;
use std::str::FromStr;

use super::RelayError;

/// Number of hex digits after the `0x` prefix
pub const KEY_HEX_LEN: usize = 64;

/// Identity of one immutable remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    /// Validate and normalise a raw key from a request path.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let hex_part = raw
            .strip_prefix("0x")
            .ok_or_else(|| RelayError::InvalidKey(format!("missing 0x prefix: {}", raw)))?;

        if hex_part.len() != KEY_HEX_LEN {
            return Err(RelayError::InvalidKey(format!(
                "expected {} hex digits, got {}",
                KEY_HEX_LEN,
                hex_part.len()
            )));
        }

        hex::decode(hex_part)
            .map_err(|e| RelayError::InvalidKey(format!("not hex: {}", e)))?;

        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    /// Full key including the `0x` prefix
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64 hex digits without the prefix
    pub fn hex(&self) -> &str {
        &self.0[2..]
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentKey {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a";

    #[test]
    fn test_parse_valid_key() {
        let key = ContentKey::parse(&format!("0x{}", HASH)).unwrap();
        assert_eq!(key.hex(), HASH);
        assert_eq!(key.as_str(), format!("0x{}", HASH));
        assert_eq!(key.short(), "0xa7ffc6f8bf");
    }

    #[test]
    fn test_parse_normalises_case() {
        let upper = ContentKey::parse(&format!("0x{}", HASH.to_ascii_uppercase())).unwrap();
        let lower = ContentKey::parse(&format!("0x{}", HASH)).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_parse_invalid_keys() {
        // No prefix
        assert!(ContentKey::parse(HASH).is_err());

        // Uppercase prefix is not accepted
        assert!(ContentKey::parse(&format!("0X{}", HASH)).is_err());

        // Too short / too long
        assert!(ContentKey::parse("0xabc123").is_err());
        assert!(ContentKey::parse(&format!("0x{}00", HASH)).is_err());

        // Non-hex characters
        assert!(ContentKey::parse(&format!("0x{}", "g".repeat(64))).is_err());

        // Empty
        assert!(ContentKey::parse("").is_err());
    }

    #[test]
    fn test_from_str() {
        let key: ContentKey = format!("0x{}", HASH).parse().unwrap();
        assert_eq!(key.to_string(), format!("0x{}", HASH));
    }
}
