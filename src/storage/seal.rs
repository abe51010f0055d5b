// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, Iv, IvSizeUser, Key, KeyIvInit, Unsigned};
use async_trait::async_trait;
use rand::Rng;
use sha1::{Digest as _, Sha1};
use sha2::Digest as _;
use subtle::ConstantTimeEq;

use crate::{
    error::{self, Result},
    model::hash::Hash,
    rng,
};

/// Hex rendering of the fixed entropy bytes `[172, 218, 37, 36, 15]`, the
/// way a Windows DPAPI caller would pass additional entropy to
/// `CryptProtectData`. Cross-platform backends here don't have that API,
/// so we fold this into the secret-store search attributes instead: it
/// still ties a sealed blob to this application specifically.
const ENTROPY_HEX: &str = "acda25240f";

const IV_LEN: usize = 16;
const TAG_LEN: usize = 20;

fn compute_tag(key: &[u8], payload: &[u8], iv: &[u8]) -> [u8; 20] {
    Sha1::new_with_prefix(Sha1::digest(key))
        .chain_update(payload)
        .chain_update(iv)
        .finalize()
        .into()
}

fn encrypt_raw(key: &Hash, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = Iv::<cbc::Encryptor<aes::Aes256>>::default();
    rng::map(|rng| rng.fill(&mut *iv));

    let encryptor = cbc::Encryptor::<aes::Aes256>::new(
        Key::<cbc::Encryptor<aes::Aes256>>::from_slice(key.as_bytes()),
        &iv,
    );
    let ciphertext = encryptor.encrypt_padded_vec_mut::<block_padding::Pkcs7>(plaintext);
    let tag = compute_tag(key.as_bytes(), &ciphertext, &iv);

    let mut out = Vec::with_capacity(iv.len() + tag.len() + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    out
}

fn decrypt_raw(key: &Hash, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(error::Cipher::AuthenticationFailed.into());
    }
    let (iv, rest) = sealed.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let expected = compute_tag(key.as_bytes(), ciphertext, iv);
    if expected.ct_eq(tag).unwrap_u8() != 1 {
        return Err(error::Cipher::AuthenticationFailed.into());
    }

    let decryptor = cbc::Decryptor::<aes::Aes256>::new(
        Key::<cbc::Decryptor<aes::Aes256>>::from_slice(key.as_bytes()),
        Iv::<cbc::Decryptor<aes::Aes256>>::from_slice(iv),
    );
    Ok(decryptor
        .decrypt_padded_vec_mut::<block_padding::Pkcs7>(ciphertext)
        .map_err(error::Conversion::from)?)
}

/// The OS per-user secret-store primitive backing Tier 2 persistence.
/// `seal`/`unseal` wrap an arbitrary byte blob (here, a base64'd XML
/// `KeyContainer`) under a wrapping key that itself never leaves the
/// platform secret store.
#[async_trait]
pub(crate) trait SecretSeal: Send + Sync {
    async fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(feature = "secret-service-linux")]
pub(crate) struct OsSeal {
    keyring: oo7::Keyring,
}

#[cfg(feature = "secret-service-linux")]
impl OsSeal {
    pub(crate) async fn new() -> Result<Self> {
        Ok(Self {
            keyring: oo7::Keyring::new().await.map_err(error::Storage::from)?,
        })
    }

    fn attributes() -> std::collections::HashMap<&'static str, &'static str> {
        std::collections::HashMap::from([
            ("keepassrpcd.kind", "os-seal-wrapping-key"),
            ("keepassrpcd.entropy", ENTROPY_HEX),
        ])
    }

    async fn wrapping_key(&self) -> Result<Hash> {
        let attrs = Self::attributes();
        let existing = self
            .keyring
            .search_items(attrs.clone())
            .await
            .map_err(error::Storage::from)?
            .into_iter()
            .next();

        if let Some(item) = existing {
            let secret = item.secret().await.map_err(error::Storage::from)?;
            if secret.len() == 32 {
                let mut buf = [0_u8; 32];
                buf.copy_from_slice(&secret);
                return Ok(Hash::from(sha2::Sha256::new_with_prefix(buf)));
            }
        }

        let fresh = rng::bytes::<32>();
        self.keyring
            .create_item("keepassrpcd OS seal", attrs, &fresh, true)
            .await
            .map_err(error::Storage::from)?;
        Ok(Hash::from(sha2::Sha256::new_with_prefix(fresh)))
    }
}

#[cfg(feature = "secret-service-linux")]
#[async_trait]
impl SecretSeal for OsSeal {
    async fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.wrapping_key().await?;
        Ok(encrypt_raw(&key, plaintext))
    }

    async fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let key = self.wrapping_key().await?;
        decrypt_raw(&key, sealed)
    }
}

#[cfg(all(feature = "keychain-macos", not(feature = "secret-service-linux")))]
pub(crate) struct OsSeal {
    delegate: security_framework::os::macos::keychain::SecKeychain,
}

#[cfg(all(feature = "keychain-macos", not(feature = "secret-service-linux")))]
impl OsSeal {
    pub(crate) async fn new() -> Result<Self> {
        use security_framework::os::macos::keychain::{SecKeychain, SecPreferencesDomain};

        Ok(Self {
            delegate: SecKeychain::default_for_domain(SecPreferencesDomain::User)
                .map_err(error::Storage::from)?,
        })
    }

    fn wrapping_key(&self) -> Result<Hash> {
        let service = "keepassrpcd-os-seal";
        let account = ENTROPY_HEX;

        let key = match self.delegate.find_generic_password(service, account) {
            Ok((password, _)) if password.len() == 32 => {
                let mut buf = [0_u8; 32];
                buf.copy_from_slice(&password);
                buf
            }
            _ => {
                let fresh = rng::bytes::<32>();
                self.delegate
                    .set_generic_password(service, account, &fresh)
                    .map_err(error::Storage::from)?;
                fresh
            }
        };
        Ok(Hash::from(sha2::Sha256::new_with_prefix(key)))
    }
}

#[cfg(all(feature = "keychain-macos", not(feature = "secret-service-linux")))]
#[async_trait]
impl SecretSeal for OsSeal {
    async fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.wrapping_key()?;
        Ok(encrypt_raw(&key, plaintext))
    }

    async fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let key = self.wrapping_key()?;
        decrypt_raw(&key, sealed)
    }
}

#[cfg(not(any(feature = "secret-service-linux", feature = "keychain-macos")))]
pub(crate) struct OsSeal;

#[cfg(not(any(feature = "secret-service-linux", feature = "keychain-macos")))]
impl OsSeal {
    pub(crate) async fn new() -> Result<Self> {
        Err(error::Storage::BackendUnavailable.into())
    }
}

#[cfg(not(any(feature = "secret-service-linux", feature = "keychain-macos")))]
#[async_trait]
impl SecretSeal for OsSeal {
    async fn seal(&self, _plaintext: &[u8]) -> Result<Vec<u8>> {
        Err(error::Storage::BackendUnavailable.into())
    }

    async fn unseal(&self, _sealed: &[u8]) -> Result<Vec<u8>> {
        Err(error::Storage::BackendUnavailable.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw_cipher() {
        let key = Hash::from(sha2::Sha256::new_with_prefix(b"wrapping"));
        let sealed = encrypt_raw(&key, b"hello world");
        let opened = decrypt_raw(&key, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn rejects_tampered_blob() {
        let key = Hash::from(sha2::Sha256::new_with_prefix(b"wrapping"));
        let mut sealed = encrypt_raw(&key, b"hello world");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(decrypt_raw(&key, &sealed).is_err());
    }
}
