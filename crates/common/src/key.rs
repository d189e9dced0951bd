//! cjdns public keys
//!
//! A key is written as 52 characters of cjdns base32 followed by `.k`. The
//! node's mesh address is the first 16 bytes of SHA-512(SHA-512(key)).

use crate::{Error, Result};
use data_encoding::{BitOrder, Encoding, Specification};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::LazyLock;

const SYMBOLS: &str = "0123456789bcdfghjklmnpqrstuvwxyz";
const LETTERS: &str = "bcdfghjklmnpqrstuvwxyz";
const KEY_LEN: usize = 32;
const ENCODED_LEN: usize = 52;
const SUFFIX: &str = ".k";

/// A cjdns Curve25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The fc00::/8 address cjdns derives for this key
    pub fn ipv6(&self) -> Ipv6Addr {
        let first = Sha512::digest(self.0);
        let second = Sha512::digest(first);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&second[..16]);
        Ipv6Addr::from(octets)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_suffix(SUFFIX)
            .ok_or_else(|| Error::InvalidKey(format!("missing {} suffix", SUFFIX)))?;
        if body.len() != ENCODED_LEN {
            return Err(Error::InvalidKey(format!(
                "expected {} base32 characters, got {}",
                ENCODED_LEN,
                body.len()
            )));
        }
        let bytes = CJDNS_BASE32
            .decode(body.as_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("wrong decoded length".to_string()))?;
        Ok(Self(key))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CJDNS_BASE32.encode(&self.0), SUFFIX)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Least-significant-bits-first base32 as used by cjdns
static CJDNS_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(SYMBOLS);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.check_trailing_bits = true;
    spec.translate.from.push_str(&LETTERS.to_ascii_uppercase());
    spec.translate.to.push_str(LETTERS);
    spec.encoding().expect("cjdns base32 alphabet is a valid specification")
});
