// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{self, Result},
    model::{envelope::SecurityLevel, hash::Hash},
    storage::{ConfigStore, SecretSeal},
};

/// `SHA-256("0")`. A key container carrying this exact key is evidence of
/// a known pairing exploit from the legacy client ecosystem; we refuse to
/// persist or trust it.
fn exploit_marker() -> Hash {
    Sha256::new_with_prefix(b"0").into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "KeyContainerClass")]
struct KeyContainerXml {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "AuthExpires")]
    auth_expires: i64,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "ClientName")]
    client_name: String,
}

/// The long-term, reconnection-authenticating secret. Persisted across
/// process restarts at Tier 1/2; never at Tier 0/3.
#[derive(Debug, Clone)]
pub(crate) struct KeyContainer {
    key: Secret<Hash>,
    username: String,
    client_name: String,
    auth_expires: SystemTime,
}

impl KeyContainer {
    pub(crate) fn new(
        key: Secret<Hash>,
        username: String,
        client_name: String,
        expires_in: Duration,
    ) -> Self {
        Self {
            key,
            username,
            client_name,
            auth_expires: SystemTime::now() + expires_in,
        }
    }

    pub(crate) fn key(&self) -> &Secret<Hash> {
        &self.key
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn is_expired(&self) -> bool {
        SystemTime::now() > self.auth_expires
    }

    pub(crate) fn is_exploit_marker(&self) -> bool {
        self.key.expose_secret() == &exploit_marker()
    }

    fn to_xml(&self) -> Result<String> {
        let auth_expires = self
            .auth_expires
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let xml = KeyContainerXml {
            key: self.key.expose_secret().clone().into(),
            auth_expires,
            username: self.username.clone(),
            client_name: self.client_name.clone(),
        };
        quick_xml::se::to_string(&xml).map_err(|e| error::Storage::Xml(e.to_string()).into())
    }

    fn from_xml(text: &str) -> Result<Self> {
        let xml: KeyContainerXml =
            quick_xml::de::from_str(text).map_err(|e| error::Storage::Xml(e.to_string()))?;
        Ok(Self {
            key: Secret::new(Hash::try_from(xml.key)?),
            username: xml.username,
            client_name: xml.client_name,
            auth_expires: UNIX_EPOCH + Duration::from_secs(xml.auth_expires.max(0) as u64),
        })
    }
}

/// Where a [`KeyContainer`] lands, chosen by the *client's* declared
/// security level: counterintuitively, a higher security level means less
/// server-side persistence, because the user has opted out of long-term
/// convenience in favor of re-pairing every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Ephemeral,
    Plaintext,
    Sealed,
}

fn tier_for(level: SecurityLevel) -> Tier {
    match level {
        SecurityLevel::Low => Tier::Plaintext,
        SecurityLevel::Medium => Tier::Sealed,
        SecurityLevel::High | SecurityLevel::Unset => Tier::Ephemeral,
    }
}

fn config_key(username: &str) -> String {
    format!("KeePassRPC.Key.{username}")
}

/// Owns the config bag and the optional OS-sealing backend, and implements
/// the persist/retrieve half of C4 on top of them.
pub(crate) struct KeyContainerStore<C, S> {
    config: C,
    seal: Option<S>,
}

impl<C, S> KeyContainerStore<C, S>
where
    C: ConfigStore,
    S: SecretSeal,
{
    pub(crate) const fn new(config: C, seal: Option<S>) -> Self {
        Self { config, seal }
    }

    pub(crate) async fn persist(&self, container: &KeyContainer, level: SecurityLevel) -> Result<()> {
        if container.is_exploit_marker() {
            log::warn!(
                "refusing to persist key container for {}: matches known exploit marker",
                container.username()
            );
            return Err(error::Storage::ExploitMarker.into());
        }

        match tier_for(level) {
            Tier::Ephemeral => Ok(()),
            Tier::Plaintext => {
                let xml = container.to_xml()?;
                self.config
                    .set(&config_key(container.username()), &base64::encode(xml))
                    .await
            }
            Tier::Sealed => {
                let xml = container.to_xml()?;
                let sealed = match &self.seal {
                    Some(seal) => seal.seal(xml.as_bytes()).await,
                    None => Err(error::Storage::BackendUnavailable.into()),
                };
                match sealed {
                    Ok(blob) => {
                        self.config
                            .set(&config_key(container.username()), &base64::encode(blob))
                            .await
                    }
                    Err(e) => {
                        log::warn!(
                            "OS-sealing backend unavailable ({e}); degrading to plaintext persistence for {}",
                            container.username()
                        );
                        self.config
                            .set(&config_key(container.username()), &base64::encode(xml))
                            .await
                    }
                }
            }
        }
    }

    /// Never returns an error for "no usable stored key": every decode,
    /// unseal, or parse failure collapses to [`Retrieval::NotFound`] so the
    /// caller falls through to SRP pairing. [`Retrieval::ExploitMarker`] is
    /// broken out separately only so the caller can warn the user with the
    /// right message; both outcomes behave identically from here on.
    pub(crate) async fn retrieve(&self, username: &str) -> Result<Retrieval> {
        let Some(encoded) = self.config.get(&config_key(username)).await? else {
            return Ok(Retrieval::NotFound);
        };
        let Ok(blob) = base64::decode(encoded) else {
            return Ok(Retrieval::NotFound);
        };

        let xml_bytes = match &self.seal {
            Some(seal) => match seal.unseal(&blob).await {
                Ok(plain) => plain,
                Err(_) => blob,
            },
            None => blob,
        };

        let Ok(xml) = String::from_utf8(xml_bytes) else {
            return Ok(Retrieval::NotFound);
        };
        let Ok(container) = KeyContainer::from_xml(&xml) else {
            return Ok(Retrieval::NotFound);
        };

        if container.is_exploit_marker() {
            log::warn!("stored key container for {username} matches known exploit marker");
            return Ok(Retrieval::ExploitMarker);
        }

        Ok(Retrieval::Found(container))
    }
}

/// The outcome of a [`KeyContainerStore::retrieve`] call.
pub(crate) enum Retrieval {
    Found(KeyContainer),
    NotFound,
    ExploitMarker,
}
