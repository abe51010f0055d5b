// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use num_bigint::BigUint;
use num_traits::Num;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::Conversion;

/// An arbitrary-precision non-negative integer carried on the wire as a
/// hex string (the SRP `A`, `B`, `s` fields). Hex case is not
/// normalized on the way in; it is always emitted lowercase.
#[derive(Debug, Clone, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexInt(BigUint);

impl HexInt {
    pub(crate) fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.0 == BigUint::from(0_u32)
    }

    pub(crate) fn to_bytes_be(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }
}

impl From<BigUint> for HexInt {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl From<HexInt> for BigUint {
    fn from(value: HexInt) -> Self {
        value.0
    }
}

impl From<&HexInt> for BigUint {
    fn from(value: &HexInt) -> Self {
        value.0.clone()
    }
}

impl From<&HexInt> for String {
    fn from(value: &HexInt) -> Self {
        value.0.to_str_radix(16)
    }
}

impl From<HexInt> for String {
    fn from(value: HexInt) -> Self {
        (&value).into()
    }
}

impl TryFrom<String> for HexInt {
    type Error = Conversion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(
            BigUint::from_str_radix(&value, 16).map_err(|_| Conversion::HexEncoding)?,
        ))
    }
}

impl PartialEq for HexInt {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.0.to_bytes_be(), other.0.to_bytes_be());
        a.len() == b.len() && a.ct_eq(&b).unwrap_u8() == 1
    }
}

#[cfg(test)]
mod tests {
    use serde_test::{assert_tokens, Token};

    use super::*;

    #[test]
    fn serializes_as_a_lowercase_hex_string_token() {
        let value = HexInt::from(BigUint::from(0xdead_beef_u32));
        assert_tokens(&value, &[Token::Str("deadbeef")]);
    }

    #[test]
    fn round_trips_through_hex() {
        let value = HexInt::from(BigUint::from(4_000_000_000_u64));
        let text = String::from(&value);
        assert_eq!(HexInt::try_from(text).unwrap(), value);
    }

    #[test]
    fn zero_is_recognized_regardless_of_case() {
        assert!(HexInt::try_from("0".to_owned()).unwrap().is_zero());
        assert!(HexInt::try_from("00".to_owned()).unwrap().is_zero());
    }
}
