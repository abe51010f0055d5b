// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{fmt::Debug, marker::PhantomData};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, Iv, IvSizeUser, Key, KeyIvInit, Unsigned};
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::{
    error::{self, Result},
    rng,
};

use super::hash::Hash;

/// Computes `SHA1(SHA1(key) || payload || iv)`.
///
/// This is not HMAC-SHA1. It is the exact digest construction the legacy
/// KeePassRPC wire format commits to, and every client in the ecosystem
/// this server talks to expects it verbatim. Do not "fix" this to a real
/// HMAC without also bumping the wire protocol version.
fn compute_digest<KeyT, PayloadT, IvT>(key: KeyT, payload: PayloadT, iv: IvT) -> [u8; 20]
where
    KeyT: AsRef<[u8]>,
    PayloadT: AsRef<[u8]>,
    IvT: AsRef<[u8]>,
{
    Sha1::new_with_prefix(Sha1::digest(key))
        .chain_update(payload)
        .chain_update(iv)
        .finalize()
        .into()
}

/// A JSON payload of type `T`, encrypted under the session key with
/// AES-256-CBC and authenticated with the legacy digest construction above.
#[serde_as]
#[derive(Deserialize, Serialize, PartialEq)]
pub(crate) struct EncryptedPayload<T> {
    #[serde_as(as = "Base64")]
    message: Vec<u8>,
    #[serde_as(as = "Base64")]
    iv: [u8; <cbc::Encryptor<aes::Aes256> as IvSizeUser>::IvSize::USIZE],
    #[serde_as(as = "Base64")]
    hmac: [u8; 20],
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> EncryptedPayload<T> {
    pub(crate) fn encrypt(session_key: &Secret<Hash>, msg: &T) -> Result<Self>
    where
        T: Serialize,
    {
        let key = session_key.expose_secret().as_bytes();

        let mut iv = Iv::<cbc::Encryptor<aes::Aes256>>::default();
        rng::map(|rng| rng.fill(&mut *iv));

        let plaintext = Secret::new(serde_json::to_vec(&msg)?);

        let encryptor = cbc::Encryptor::<aes::Aes256>::new(
            Key::<cbc::Encryptor<aes::Aes256>>::from_slice(key),
            &iv,
        );
        let message =
            encryptor.encrypt_padded_vec_mut::<block_padding::Pkcs7>(plaintext.expose_secret());

        let hmac = compute_digest(key, &message, &iv);

        Ok(Self {
            message,
            iv: iv.into(),
            hmac,
            _marker: PhantomData,
        })
    }

    pub(crate) fn decrypt(&self, session_key: &Secret<Hash>) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let key = session_key.expose_secret().as_bytes();

        let digest = compute_digest(key, &self.message, &self.iv);
        if digest.ct_eq(&self.hmac).unwrap_u8() != 1 {
            return Err(error::Cipher::AuthenticationFailed.into());
        }

        let decryptor = cbc::Decryptor::<aes::Aes256>::new(
            Key::<cbc::Decryptor<aes::Aes256>>::from_slice(key),
            Iv::<cbc::Decryptor<aes::Aes256>>::from_slice(&self.iv),
        );
        let plaintext = Secret::new(
            decryptor
                .decrypt_padded_vec_mut::<block_padding::Pkcs7>(&self.message)
                .map_err(error::Conversion::from)?,
        );

        Ok(serde_json::from_slice::<T>(plaintext.expose_secret())?)
    }
}

impl<T> Debug for EncryptedPayload<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPayload").finish()
    }
}

#[cfg(test)]
mod tests {
    use sha2::Digest;
    use serde_json::json;

    use super::*;

    fn key() -> Secret<Hash> {
        Secret::new(Hash::from(sha2::Sha256::new_with_prefix(b"session")))
    }

    #[test]
    fn round_trips_payload() {
        let k = key();
        let payload: EncryptedPayload<serde_json::Value> =
            EncryptedPayload::encrypt(&k, &json!({"method": "ping"})).unwrap();
        let decoded: serde_json::Value = payload.decrypt(&k).unwrap();
        assert_eq!(decoded, json!({"method": "ping"}));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let k = key();
        let mut payload: EncryptedPayload<serde_json::Value> =
            EncryptedPayload::encrypt(&k, &json!({"method": "ping"})).unwrap();
        payload.message[0] ^= 0xff;
        let result: Result<serde_json::Value> = payload.decrypt(&k);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let k = key();
        let payload: EncryptedPayload<serde_json::Value> =
            EncryptedPayload::encrypt(&k, &json!({"method": "ping"})).unwrap();
        let other = Secret::new(Hash::from(sha2::Sha256::new_with_prefix(b"different")));
        let result: Result<serde_json::Value> = payload.decrypt(&other);
        assert!(result.is_err());
    }
}
