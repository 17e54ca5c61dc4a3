//! User identity: the 16-byte UUID that keys every tunnel header.
//!
//! Accepts the canonical dashed form or 32 bare hex digits. Only version-4,
//! RFC 4122 variant ids are accepted as configuration.

use crate::error::{GatewayError, GatewayResult};
use std::fmt;

/// A parsed 16-byte user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId([u8; 16]);

impl UserId {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse a UUID string, dashed or not, and require version 4 / RFC 4122 variant.
    pub fn parse(s: &str) -> GatewayResult<Self> {
        let compact: String = s.trim().chars().filter(|c| *c != '-').collect();
        if compact.len() != 32 {
            return Err(GatewayError::Config(format!("invalid uuid: {s}")));
        }
        let decoded = hex::decode(&compact)
            .map_err(|e| GatewayError::Config(format!("invalid uuid {s}: {e}")))?;

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&decoded);

        if bytes[6] >> 4 != 4 {
            return Err(GatewayError::Config(format!("uuid is not version 4: {s}")));
        }
        if bytes[8] >> 6 != 2 {
            return Err(GatewayError::Config(format!(
                "uuid does not have RFC 4122 variant: {s}"
            )));
        }

        Ok(Self(bytes))
    }

    /// Compare against raw header bytes. Length mismatches never match.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == Self::LEN
            && candidate
                .iter()
                .zip(self.0.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "86c50e3a-5b87-49dd-bd20-03c7f2735e40";

    #[test]
    fn parse_dashed_and_compact() {
        let a = UserId::parse(ID).unwrap();
        let b = UserId::parse("86c50e3a5b8749ddbd2003c7f2735e40").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes()[0], 0x86);
        assert_eq!(a.as_bytes()[15], 0x40);
    }

    #[test]
    fn display_is_canonical() {
        let id = UserId::parse(&ID.to_uppercase()).unwrap();
        assert_eq!(id.to_string(), ID);
    }

    #[test]
    fn rejects_non_v4() {
        assert!(UserId::parse("550e8400-e29b-11d4-a716-446655440000").is_err());
    }

    #[test]
    fn rejects_wrong_variant() {
        assert!(UserId::parse("550e8400-e29b-41d4-c716-446655440000").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(UserId::parse("not-a-uuid").is_err());
        assert!(UserId::parse("zzc50e3a-5b87-49dd-bd20-03c7f2735e40").is_err());
    }

    #[test]
    fn matches_only_exact_bytes() {
        let id = UserId::parse(ID).unwrap();
        assert!(id.matches(id.as_bytes()));
        let mut other = *id.as_bytes();
        other[15] ^= 1;
        assert!(!id.matches(&other));
        assert!(!id.matches(&id.as_bytes()[..15]));
    }
}
