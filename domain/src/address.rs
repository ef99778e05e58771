use std::{fmt, str::FromStr};

use ethers::{
    types::{H160, H256},
    utils::to_checksum,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Sentinel used by wallets and token lists for the chain's native coin.
pub const NATIVE_TOKEN_ADDRESS: Address = Address(H160([0xee; 20]));

const HEX_LEN: usize = 40;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address must be 40 hex characters, got {0}")]
    Length(usize),
    #[error("address contains non-hex character {0:?}")]
    NonHex(char),
    #[error("address checksum mismatch, expected {expected}")]
    Checksum { expected: String },
}

/// A validated 20-byte account or contract identifier.
///
/// Displays and serializes in EIP-55 checksum casing; ordering and equality are
/// on the raw bytes so two spellings of the same address never diverge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(H160);

impl Address {
    /// Validates `raw` before anything else touches it.
    ///
    /// Accepts an optional `0x` prefix. All-lowercase and all-uppercase input
    /// carries no checksum and is accepted as is; mixed-case input must match
    /// its EIP-55 checksum exactly.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if body.len() != HEX_LEN {
            return Err(AddressError::Length(body.len()));
        }
        if let Some(bad) = body.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(AddressError::NonHex(bad));
        }

        let mut bytes = [0u8; 20];
        for (i, chunk) in body.as_bytes().chunks(2).enumerate() {
            // both characters are ascii hex digits at this point
            let pair = std::str::from_utf8(chunk).map_err(|_| AddressError::NonHex('?'))?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| AddressError::NonHex('?'))?;
        }
        let address = Address(H160(bytes));

        let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            let expected = address.checksum();
            if expected[2..] != *body {
                return Err(AddressError::Checksum { expected });
            }
        }
        Ok(address)
    }

    pub fn checksum(&self) -> String {
        to_checksum(&self.0, None)
    }

    pub fn as_h160(&self) -> H160 {
        self.0
    }

    /// Left-pads the address into a 32-byte indexed event topic.
    pub fn to_topic(&self) -> H256 {
        H256::from(self.0)
    }

    /// Reads the address out of the low 20 bytes of an indexed topic.
    pub fn from_topic(topic: &H256) -> Self {
        Address(H160::from_slice(&topic.as_bytes()[12..]))
    }

    pub fn is_native(&self) -> bool {
        *self == NATIVE_TOKEN_ADDRESS
    }
}

impl From<H160> for Address {
    fn from(value: H160) -> Self {
        Address(value)
    }
}

impl From<Address> for H160 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.checksum())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VITALIK: &str = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045";

    #[test]
    fn parse_lowercase_canonicalizes_to_checksum() {
        let address = Address::parse(&VITALIK.to_lowercase()).expect("valid");
        assert_eq!(address.to_string(), VITALIK);
    }

    #[test]
    fn parse_accepts_matching_checksum_and_missing_prefix() {
        assert!(Address::parse(VITALIK).is_ok());
        let without_prefix = &VITALIK[2..];
        assert_eq!(
            Address::parse(without_prefix).unwrap(),
            Address::parse(VITALIK).unwrap()
        );
        assert!(Address::parse(&VITALIK.to_uppercase().replace("0X", "0x")).is_ok());
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let broken = VITALIK.replacen("dA", "Da", 1);
        assert!(matches!(
            Address::parse(&broken),
            Err(AddressError::Checksum { .. })
        ));
    }

    #[test]
    fn parse_rejects_wrong_length_and_non_hex() {
        assert_eq!(Address::parse("0x1234"), Err(AddressError::Length(4)));
        assert_eq!(Address::parse("   "), Err(AddressError::Empty));
        let bad = "0xzz0000000000000000000000000000000000dead";
        assert_eq!(Address::parse(bad), Err(AddressError::NonHex('z')));
    }

    #[test]
    fn topic_round_trip_keeps_address() {
        let address = Address::parse(VITALIK).unwrap();
        let topic = address.to_topic();
        assert_eq!(&topic.as_bytes()[..12], &[0u8; 12]);
        assert_eq!(Address::from_topic(&topic), address);
    }

    #[test]
    fn native_sentinel_matches_token_list_spelling() {
        let parsed = Address::parse("0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE").unwrap();
        assert!(parsed.is_native());
    }

    #[test]
    fn serializes_as_checksum_string() {
        let address = Address::parse(&VITALIK.to_lowercase()).unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{VITALIK}\""));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
