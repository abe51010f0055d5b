// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use generic_array::{typenum::U32, GenericArray};
use secrecy::Zeroize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::Conversion;

const HASH_BYTES: usize = 32;

/// A 32-byte SHA-256 digest, rendered on the wire as lowercase hex. May or
/// may not also carry secret data (the SRP session-key hash does; most
/// other hashes in this protocol are public evidence values).
#[derive(Debug, Default, Clone, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash([u8; HASH_BYTES]);

impl Hash {
    pub(crate) fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }
}

impl From<GenericArray<u8, U32>> for Hash {
    fn from(value: GenericArray<u8, U32>) -> Self {
        Self(value.into())
    }
}

impl From<Sha256> for Hash {
    fn from(value: Sha256) -> Self {
        value.finalize().into()
    }
}

impl From<&Hash> for String {
    fn from(value: &Hash) -> Self {
        let mut out = String::with_capacity(HASH_BYTES * 2);
        for byte in value.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl From<Hash> for String {
    fn from(value: Hash) -> Self {
        (&value).into()
    }
}

impl TryFrom<String> for Hash {
    type Error = Conversion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() != HASH_BYTES * 2 {
            return Err(Conversion::HashLength(HASH_BYTES, value.len() / 2));
        }

        let mut bytes = [0_u8; HASH_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
                .map_err(|_| Conversion::HexEncoding)?;
        }
        Ok(Self(bytes))
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).unwrap_u8() == 1
    }
}

impl Zeroize for Hash {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl secrecy::CloneableSecret for Hash {}
impl secrecy::SerializableSecret for Hash {}

#[cfg(test)]
mod tests {
    use serde_test::{assert_tokens, Token};

    use super::*;

    #[test]
    fn serializes_as_a_lowercase_hex_string_token() {
        let hash: Hash = Sha256::new_with_prefix(b"0").into();
        assert_tokens(
            &hash,
            &[Token::Str(
                "5feceb66ffc86f38d952786c6d696c79c2dbc239dd4e91b46729d73a27fb57e9",
            )],
        );
    }

    #[test]
    fn round_trips_through_hex() {
        let hash: Hash = Sha256::new_with_prefix(b"hello").into();
        let text = String::from(hash.clone());
        assert_eq!(text.len(), 64);
        assert_eq!(Hash::try_from(text).unwrap(), hash);
    }

    #[test]
    fn known_exploit_marker_matches() {
        let hash: Hash = Sha256::new_with_prefix(b"0").into();
        let text = String::from(hash);
        assert_eq!(
            text,
            "5feceb66ffc86f38d952786c6d696c79c2dbc239dd4e91b46729d73a27fb57e9"
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Hash::try_from("ab".to_owned()).is_err());
    }

    #[test]
    fn equality_is_constant_time_path() {
        let a: Hash = Sha256::new_with_prefix(b"a").into();
        let b: Hash = Sha256::new_with_prefix(b"b").into();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
