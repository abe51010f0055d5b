// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{info, warn};
use secrecy::Secret;
use uuid::Uuid;

use crate::{
    challenge,
    config::Config,
    error::{self, Result},
    keycontainer::{KeyContainer, KeyContainerStore, Retrieval},
    model::{
        self,
        cipher::EncryptedPayload,
        envelope::{Envelope, KeyPayload, SrpPayload, SrpStage},
        hash::Hash,
    },
    srp,
    storage::{ConfigStore, SecretSeal},
    ui::UiHost,
};

/// The typestate SRP engine is only ever held in its post-identify state
/// here: `Init` is consumed the instant a connection receives
/// `identifyToServer`, so there is nothing to store before that.
enum SrpState {
    Identified(srp::Protocol<srp::Identified>),
}

enum Phase {
    AwaitSetup,
    Authorised,
}

/// What a handled envelope produces. `None` models the "silently
/// dropped" edge cases (a stage mismatch produces no wire traffic at all);
/// `Dispatch` hands a decrypted RPC request to the caller, which is
/// expected to produce a plaintext JSON response and call
/// [`Connection::encrypt_reply`] to turn it back into an `Envelope`.
pub(crate) enum Outcome {
    Reply(Envelope),
    Dispatch(serde_json::Value),
    None,
}

/// Owns all per-connection state and implements the gating and dispatch
/// rules in front of the SRP engine (C2), challenge engine (C3), key
/// container store (C4), and cipher (C5). One instance per open transport;
/// created when it opens, dropped when it closes.
pub(crate) struct Connection<C, S, U> {
    id: Uuid,
    config: Arc<Config>,
    store: Arc<KeyContainerStore<C, S>>,
    ui: Arc<U>,
    phase: Phase,
    authorised: Arc<AtomicBool>,
    features: Option<Vec<String>>,
    client_display_name: Option<String>,
    security_level: Option<model::SecurityLevel>,
    srp: Option<SrpState>,
    challenge: Option<(String, challenge::Challenge<challenge::Challenged>)>,
    session_key: Option<Secret<Hash>>,
    username: Option<String>,
}

impl<C, S, U> Connection<C, S, U>
where
    C: ConfigStore,
    S: SecretSeal,
    U: UiHost,
{
    pub(crate) fn new(
        id: Uuid,
        config: Arc<Config>,
        store: Arc<KeyContainerStore<C, S>>,
        ui: Arc<U>,
        authorised: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            config,
            store,
            ui,
            phase: Phase::AwaitSetup,
            authorised,
            features: None,
            client_display_name: None,
            security_level: None,
            srp: None,
            challenge: None,
            session_key: None,
            username: None,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i32 {
        self.config.protocol_version().as_i32()
    }

    fn error_envelope(&self, error: &error::Error) -> Envelope {
        let (code, params) = error.to_wire();
        Envelope::error(self.version(), code, params)
    }

    /// The client's declared `securityLevel`, latched the first time it
    /// appears on this connection and reused for every later envelope
    /// that omits it — a reconnect's `proofToServer`/`cc`+`cr` leg never
    /// repeats the level its first leg already declared, so re-reading
    /// each envelope in isolation and defaulting to `Unset` would wrongly
    /// reject the second leg and persist under the ephemeral tier.
    fn declared_security_level(&mut self, envelope: &Envelope) -> model::SecurityLevel {
        let level = envelope
            .srp
            .as_ref()
            .and_then(|srp| srp.security_level)
            .or_else(|| envelope.key.as_ref().and_then(|key| key.security_level));

        if let Some(level) = level {
            self.security_level = Some(level);
        }

        self.security_level.unwrap_or_default()
    }

    /// Handles one inbound envelope and produces the reply (if any) to
    /// send back. This is the single entry point the transport server
    /// calls for every decoded envelope on this connection.
    pub(crate) async fn handle(&mut self, envelope: Envelope) -> Outcome {
        match self.phase {
            Phase::AwaitSetup => self.handle_await_setup(envelope).await,
            Phase::Authorised => self.handle_authorised(envelope).await,
        }
    }

    async fn handle_await_setup(&mut self, envelope: Envelope) -> Outcome {
        if envelope.protocol != model::Protocol::Setup {
            return Outcome::Reply(self.error_envelope(&error::Codec::UnrecognisedProtocol.into()));
        }

        if let Some(features) = &envelope.features {
            if self.features.is_none() {
                self.features = Some(features.clone());
            }
        }

        if envelope.version != self.version()
            && !self
                .config
                .features_satisfy_requirement(self.features.as_deref())
        {
            let err = error::Error::UnsupportedVersion(self.version());
            return Outcome::Reply(self.error_envelope(&err));
        }

        let level = self.declared_security_level(&envelope);
        if level < self.config.security_level_client_minimum {
            let err =
                error::Error::SecurityLevelTooLow(self.config.security_level_client_minimum, level);
            return Outcome::Reply(self.error_envelope(&err));
        }

        if let Some(display_name) = &envelope.client_display_name {
            if self.client_display_name.is_none() {
                self.client_display_name = Some(display_name.clone());
            }
        }

        if let Some(srp) = envelope.srp.clone() {
            match srp.stage {
                Some(SrpStage::IdentifyToServer) => {
                    return self.handle_srp_identify(&envelope, &srp).await;
                }
                Some(SrpStage::ProofToServer) => {
                    return self.handle_srp_proof(&srp, level).await;
                }
                _ => {}
            }
        }

        if let Some(key) = envelope.key.clone() {
            if key.client_challenge.is_some() || key.client_response.is_some() {
                return self.handle_key_negotiate(&key, level).await;
            }
            if key.username.is_some() {
                return Outcome::Reply(self.handle_key_lookup(&key, level).await);
            }
        }

        Outcome::None
    }

    async fn handle_srp_identify(&mut self, envelope: &Envelope, srp: &SrpPayload) -> Outcome {
        let Some(client_public) = srp.client_public.clone() else {
            let err = error::Error::from(error::Srp::MissingParam("A"));
            return Outcome::Reply(self.error_envelope(&err));
        };
        let identity = srp.identity.clone().unwrap_or_default();

        match srp::Protocol::<srp::Init>::new(identity).pair(&client_public) {
            Ok((identified, visual_password, salt, server_public)) => {
                self.ui
                    .display_pairing(
                        envelope.client_display_name.as_deref(),
                        envelope.client_display_description.as_deref(),
                        &visual_password.to_string(),
                    )
                    .await;

                self.srp = Some(SrpState::Identified(identified));

                let reply = Envelope::setup(
                    self.version(),
                    Some(SrpPayload {
                        stage: Some(SrpStage::IdentifyToClient),
                        salt: Some(salt),
                        server_public: Some(server_public),
                        security_level: srp.security_level,
                        ..SrpPayload::default()
                    }),
                    None,
                )
                .with_features(self.config.features.clone());
                Outcome::Reply(reply)
            }
            Err(e) => Outcome::Reply(self.error_envelope(&e)),
        }
    }

    async fn handle_srp_proof(&mut self, srp: &SrpPayload, level: model::SecurityLevel) -> Outcome {
        let Some(SrpState::Identified(_)) = &self.srp else {
            // A proofToServer with no prior identifyToServer on this
            // connection is a stage mismatch: silently dropped.
            return Outcome::None;
        };
        let Some(client_evidence) = &srp.client_evidence else {
            let err = error::Error::from(error::Srp::MissingParam("M"));
            return Outcome::Reply(self.error_envelope(&err));
        };

        let Some(SrpState::Identified(identified)) = self.srp.take() else {
            unreachable!("checked above");
        };

        match identified.authenticate(client_evidence) {
            Ok(authenticated) => {
                let username = authenticated.identity().clone();
                let session_key = authenticated.session_key().clone();
                let server_evidence = authenticated.server_evidence().clone();

                let container = KeyContainer::new(
                    session_key.clone(),
                    username.clone(),
                    self.client_display_name.clone().unwrap_or_default(),
                    self.config.auth_expiry(),
                );
                if let Err(e) = self.store.persist(&container, level).await {
                    warn!("failed to persist key container for {username}: {e}");
                }

                self.session_key = Some(session_key);
                self.username = Some(username);
                self.phase = Phase::Authorised;
                self.authorised.store(true, Ordering::Release);

                Outcome::Reply(Envelope::setup(
                    self.version(),
                    Some(SrpPayload {
                        stage: Some(SrpStage::ProofToClient),
                        server_evidence: Some(server_evidence),
                        security_level: Some(level),
                        ..SrpPayload::default()
                    }),
                    None,
                ))
            }
            Err(e) => {
                self.srp = None;
                Outcome::Reply(self.error_envelope(&e))
            }
        }
    }

    async fn handle_key_lookup(&mut self, key: &KeyPayload, level: model::SecurityLevel) -> Envelope {
        let username = key.username.clone().unwrap_or_default();
        match self.store.retrieve(&username).await {
            Ok(Retrieval::Found(container)) => {
                if container.is_expired() {
                    return self.error_envelope(&error::Error::AuthExpired);
                }

                let challenge = challenge::Challenge::<challenge::Init>::new(container.key().clone());
                let server_challenge = challenge.server_challenge().to_owned();
                self.challenge = Some((username, challenge));

                Envelope::setup(
                    self.version(),
                    None,
                    Some(KeyPayload {
                        server_challenge: Some(server_challenge),
                        security_level: Some(level),
                        ..KeyPayload::default()
                    }),
                )
                .with_features(self.config.features.clone())
            }
            Ok(Retrieval::NotFound) => Envelope::error(
                self.version(),
                model::ErrorCode::AuthFailed,
                vec!["Stored key not found".to_owned()],
            ),
            Ok(Retrieval::ExploitMarker) => {
                self.ui.warn_exploit_marker(&username).await;
                Envelope::error(
                    self.version(),
                    model::ErrorCode::AuthFailed,
                    vec!["Stored key not found".to_owned()],
                )
            }
            Err(e) => {
                warn!("key container lookup failed for {username}: {e}");
                Envelope::error(
                    self.version(),
                    model::ErrorCode::AuthFailed,
                    vec!["Stored key not found".to_owned()],
                )
            }
        }
    }

    async fn handle_key_negotiate(
        &mut self,
        key: &KeyPayload,
        level: model::SecurityLevel,
    ) -> Outcome {
        let Some((username, _)) = &self.challenge else {
            // A cc/cr response with no prior server challenge issued on
            // this connection: silently dropped.
            return Outcome::None;
        };
        let (Some(client_challenge), Some(client_response)) =
            (&key.client_challenge, &key.client_response)
        else {
            return Outcome::None;
        };

        let username = username.clone();
        let Some((_, challenge)) = self.challenge.take() else {
            unreachable!("checked above");
        };

        match challenge.authenticate(client_challenge, client_response) {
            Ok(authenticated) => {
                let Ok(Retrieval::Found(container)) = self.store.retrieve(&username).await else {
                    // The key container disappeared between the challenge
                    // and the response; treat like any other auth failure.
                    let err = error::Error::from(error::ChallengeResponse::ClientResponseMismatch);
                    return Outcome::Reply(self.error_envelope(&err));
                };

                self.session_key = Some(container.key().clone());
                self.username = Some(username);
                self.phase = Phase::Authorised;
                self.authorised.store(true, Ordering::Release);

                Outcome::Reply(Envelope::setup(
                    self.version(),
                    None,
                    Some(KeyPayload {
                        server_response: Some(authenticated.server_response().clone()),
                        security_level: Some(level),
                        ..KeyPayload::default()
                    }),
                ))
            }
            Err(e) => Outcome::Reply(self.error_envelope(&e)),
        }
    }

    async fn handle_authorised(&mut self, envelope: Envelope) -> Outcome {
        match envelope.protocol {
            model::Protocol::Setup => {
                // The client is instructed to restart pairing explicitly;
                // we stay authorised until it actually does.
                Outcome::Reply(self.error_envelope(&error::Error::Cipher(
                    error::Cipher::AuthenticationFailed,
                )))
            }
            model::Protocol::Jsonrpc => self.handle_jsonrpc(envelope).await,
            model::Protocol::Error => {
                info!("connection {} reported an error envelope from the client", self.id);
                Outcome::None
            }
        }
    }

    async fn handle_jsonrpc(&mut self, envelope: Envelope) -> Outcome {
        let Some(payload) = envelope.jsonrpc else {
            return Outcome::Reply(self.error_envelope(&error::Codec::MissingField.into()));
        };
        let Some(session_key) = &self.session_key else {
            return Outcome::Reply(self.restart_auth());
        };

        match payload.decrypt(session_key) {
            Ok(value) => Outcome::Dispatch(value),
            Err(_) => Outcome::Reply(self.restart_auth()),
        }
    }

    /// A corrupt or tampered ciphertext on an otherwise-authorised
    /// connection renders the channel unusable: force the client back
    /// through pairing instead of limping along with a broken key.
    fn restart_auth(&mut self) -> Envelope {
        self.phase = Phase::AwaitSetup;
        self.authorised.store(false, Ordering::Release);
        self.session_key = None;
        self.username = None;
        Envelope::error(self.version(), model::ErrorCode::AuthRestart, Vec::new())
    }

    /// Encrypts an RPC response (or server-initiated signal) under the
    /// session key and wraps it as a `jsonrpc` envelope, for the caller to
    /// send after dispatching a [`Outcome::Dispatch`] request or pushing
    /// an outbound signal.
    pub(crate) fn encrypt_reply(&self, value: &serde_json::Value) -> Result<Envelope> {
        let session_key = self.session_key.as_ref().ok_or(error::Error::AuthExpired)?;
        let payload = EncryptedPayload::encrypt(session_key, value)?;
        Ok(Envelope::jsonrpc(self.version(), payload))
    }

    pub(crate) fn is_authorised(&self) -> bool {
        matches!(self.phase, Phase::Authorised)
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use secrecy::ExposeSecret;
    use sha2::{Digest, Sha256};

    use crate::{
        model::{bignum::HexInt, envelope::Protocol as EnvelopeProtocol},
        storage::Memory,
        ui::ConsoleUiHost,
    };

    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            security_level: model::SecurityLevel::Medium,
            security_level_client_minimum: model::SecurityLevel::Medium,
            auth_expiry_secs: 3600,
            persistence: crate::config::Persistence::Memory,
            config_dir: None,
            required_features: Vec::new(),
            features: vec!["KPRPC_FEATURE_VERSION_1_6".to_owned()],
        })
    }

    fn connection() -> Connection<Memory, crate::storage::OsSeal, ConsoleUiHost> {
        Connection::new(
            Uuid::new_v4(),
            test_config(),
            Arc::new(KeyContainerStore::new(Memory::new(), None)),
            Arc::new(ConsoleUiHost::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn rejects_non_setup_protocol_before_authorisation() {
        let mut conn = connection();
        let envelope = Envelope::jsonrpc(
            conn.version(),
            EncryptedPayload::encrypt(
                &Secret::new(Sha256::new_with_prefix(b"x").into()),
                &serde_json::json!({}),
            )
            .unwrap(),
        );
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.protocol, EnvelopeProtocol::Error);
                assert_eq!(
                    reply.error.unwrap().code,
                    model::ErrorCode::UnrecognisedProtocol
                );
            }
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn version_mismatch_without_required_features_is_rejected() {
        let mut conn = connection();
        let envelope = Envelope::setup(
            conn.version() - 1,
            Some(SrpPayload {
                stage: Some(SrpStage::IdentifyToServer),
                identity: Some("alice".to_owned()),
                client_public: Some(HexInt::from(BigUint::from(5_u32))),
                security_level: Some(model::SecurityLevel::Medium),
                ..SrpPayload::default()
            }),
            None,
        );
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(
                    reply.error.unwrap().code,
                    model::ErrorCode::VersionClientTooLow
                );
            }
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn security_level_below_minimum_is_rejected() {
        let mut conn = connection();
        let envelope = Envelope::setup(
            conn.version(),
            Some(SrpPayload {
                stage: Some(SrpStage::IdentifyToServer),
                identity: Some("alice".to_owned()),
                client_public: Some(HexInt::from(BigUint::from(5_u32))),
                security_level: Some(model::SecurityLevel::Low),
                ..SrpPayload::default()
            }),
            None,
        );
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(
                    reply.error.unwrap().code,
                    model::ErrorCode::AuthClientSecurityLevelTooLow
                );
            }
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn proof_before_identify_is_silently_dropped() {
        let mut conn = connection();
        let envelope = Envelope::setup(
            conn.version(),
            Some(SrpPayload {
                stage: Some(SrpStage::ProofToServer),
                client_evidence: Some(model::hash::Hash::default()),
                security_level: Some(model::SecurityLevel::Medium),
                ..SrpPayload::default()
            }),
            None,
        );
        assert!(matches!(conn.handle(envelope).await, Outcome::None));
    }

    #[tokio::test]
    async fn jsonrpc_before_authorisation_is_rejected() {
        let mut conn = connection();
        let key = Secret::new(Sha256::new_with_prefix(b"nope").into());
        let envelope = Envelope::jsonrpc(
            conn.version(),
            EncryptedPayload::encrypt(&key, &serde_json::json!({"method": "ping"})).unwrap(),
        );
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.protocol, EnvelopeProtocol::Error);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn setup_after_authorisation_yields_auth_restart() {
        let mut conn = connection();
        let key: Secret<Hash> = Secret::new(Sha256::new_with_prefix(b"longterm").into());
        conn.session_key = Some(key);
        conn.phase = Phase::Authorised;
        conn.authorised.store(true, Ordering::Release);

        let envelope = Envelope::setup(conn.version(), None, None);
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.error.unwrap().code, model::ErrorCode::AuthRestart);
            }
            _ => panic!("expected a reply"),
        }
        assert!(conn.is_authorised());
    }

    #[tokio::test]
    async fn tampered_jsonrpc_triggers_auth_restart_and_clears_authorisation() {
        let mut conn = connection();
        let key: Secret<Hash> = Secret::new(Sha256::new_with_prefix(b"longterm").into());
        conn.session_key = Some(key.clone());
        conn.phase = Phase::Authorised;
        conn.authorised.store(true, Ordering::Release);

        let mut payload =
            EncryptedPayload::encrypt(&key, &serde_json::json!({"method": "ping"})).unwrap();
        // Force a MAC failure by corrupting the ciphertext via re-serialization.
        let mut value = serde_json::to_value(&payload).unwrap();
        let message = value["message"].as_str().unwrap().to_owned();
        let mut decoded = base64::decode(&message).unwrap();
        decoded[0] ^= 0xff;
        value["message"] = serde_json::Value::String(base64::encode(decoded));
        payload = serde_json::from_value(value).unwrap();

        let envelope = Envelope::jsonrpc(conn.version(), payload);
        match conn.handle(envelope).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.error.unwrap().code, model::ErrorCode::AuthRestart);
            }
            _ => panic!("expected a reply"),
        }
        assert!(!conn.is_authorised());
        assert!(!conn.authorised.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn fresh_pairing_round_trips_to_authorised() {
        let mut conn = connection();

        let client_private = BigUint::from_bytes_be(&crate::rng::bytes::<32>());
        let generator = BigUint::from(2_u32);
        // A real client computes A = g^a mod N against the shared group;
        // here we only need *some* nonzero A to drive the identify leg,
        // since verifying the client's own math is out of scope for this
        // crate (it lives in the browser extension).
        let client_public = HexInt::from(generator.modpow(&client_private, &BigUint::from(65537_u32)));

        let identify = Envelope::setup(
            conn.version(),
            Some(SrpPayload {
                stage: Some(SrpStage::IdentifyToServer),
                identity: Some("alice".to_owned()),
                client_public: Some(client_public),
                security_level: Some(model::SecurityLevel::Medium),
                ..SrpPayload::default()
            }),
            None,
        )
        .with_features(vec!["KPRPC_FEATURE_VERSION_1_6".to_owned()]);

        match conn.handle(identify).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.protocol, EnvelopeProtocol::Setup);
                assert!(reply.srp.is_some());
            }
            _ => panic!("expected an identifyToClient reply"),
        }

        // We don't have the client's half of the SRP math here (that's the
        // extension's job), so we only exercise the mismatch path for the
        // proof leg and rely on the SRP engine's own unit tests for the
        // full honest-client completion property. The real wire shape
        // (scenario S1) omits `securityLevel` on this leg entirely; the
        // gate must reuse the level latched during `identifyToServer`
        // rather than default to `Unset` and reject it.
        let forged_proof = Envelope::setup(
            conn.version(),
            Some(SrpPayload {
                stage: Some(SrpStage::ProofToServer),
                client_evidence: Some(model::hash::Hash::default()),
                ..SrpPayload::default()
            }),
            None,
        );
        match conn.handle(forged_proof).await {
            Outcome::Reply(reply) => {
                assert_eq!(reply.error.unwrap().code, model::ErrorCode::AuthFailed);
            }
            _ => panic!("expected a reply"),
        }
        assert!(!conn.is_authorised());
    }

    fn expected_challenge_response(prefix: &str, key: &Hash, sc: &str, cc: &str) -> Hash {
        Sha256::new_with_prefix(prefix)
            .chain_update(String::from(key.clone()))
            .chain_update(sc)
            .chain_update(cc)
            .into()
    }

    #[tokio::test]
    async fn reconnect_response_omitting_security_level_reuses_latched_level() {
        let mut conn = connection();
        let key: Secret<Hash> = Secret::new(Sha256::new_with_prefix(b"longterm").into());
        let container = KeyContainer::new(
            key.clone(),
            "alice".to_owned(),
            "Browser".to_owned(),
            std::time::Duration::from_secs(3600),
        );
        conn.store
            .persist(&container, model::SecurityLevel::Low)
            .await
            .unwrap();

        // Scenario S2's lookup leg declares securityLevel; the response
        // leg below does not, matching the real wire shape.
        let lookup = Envelope::setup(
            conn.version(),
            None,
            Some(KeyPayload {
                username: Some("alice".to_owned()),
                security_level: Some(model::SecurityLevel::Medium),
                ..KeyPayload::default()
            }),
        );
        let sc = match conn.handle(lookup).await {
            Outcome::Reply(reply) => reply
                .key
                .expect("expected a key payload")
                .server_challenge
                .expect("expected a server challenge"),
            _ => panic!("expected a server challenge reply"),
        };

        let cc = "client-nonce";
        let cr = expected_challenge_response("1", key.expose_secret(), &sc, cc);
        let negotiate = Envelope::setup(
            conn.version(),
            None,
            Some(KeyPayload {
                client_challenge: Some(cc.to_owned()),
                client_response: Some(cr),
                ..KeyPayload::default()
            }),
        );
        match conn.handle(negotiate).await {
            Outcome::Reply(reply) => {
                let key_payload = reply.key.expect("expected a key payload");
                assert!(key_payload.server_response.is_some());
                assert_eq!(key_payload.security_level, Some(model::SecurityLevel::Medium));
            }
            _ => panic!("expected a server response reply"),
        }
        assert!(conn.is_authorised());
    }
}
