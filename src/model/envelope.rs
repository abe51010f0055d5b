// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{bignum::HexInt, cipher::EncryptedPayload, hash::Hash};

/// The three outer protocols multiplexed over one envelope. Unlike the
/// sub-payloads, this is a plain string on the wire, not a tagged enum, so
/// that an envelope can carry `error` alongside a `protocol` of `"setup"`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    Setup,
    Jsonrpc,
    Error,
}

#[derive(Debug, Clone, Copy, Deserialize_repr, Serialize_repr, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum SecurityLevel {
    Unset = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::Unset
    }
}

/// Stable numeric wire values. These must not be renumbered once a client
/// has shipped against them.
#[derive(Debug, Clone, Copy, Deserialize_repr, Serialize_repr, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidMessage = 0,
    UnrecognisedProtocol = 1,
    AuthFailed = 2,
    AuthExpired = 3,
    AuthRestart = 4,
    AuthClientSecurityLevelTooLow = 5,
    AuthMissingParam = 6,
    VersionClientTooLow = 7,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) enum SrpStage {
    IdentifyToServer,
    IdentifyToClient,
    ProofToServer,
    ProofToClient,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SrpPayload {
    pub(crate) stage: Option<SrpStage>,
    #[serde(rename = "I", skip_serializing_if = "Option::is_none")]
    pub(crate) identity: Option<String>,
    #[serde(rename = "A", skip_serializing_if = "Option::is_none")]
    pub(crate) client_public: Option<HexInt>,
    #[serde(rename = "B", skip_serializing_if = "Option::is_none")]
    pub(crate) server_public: Option<HexInt>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub(crate) salt: Option<HexInt>,
    #[serde(rename = "M", skip_serializing_if = "Option::is_none")]
    pub(crate) client_evidence: Option<Hash>,
    #[serde(rename = "M2", skip_serializing_if = "Option::is_none")]
    pub(crate) server_evidence: Option<Hash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) security_level: Option<SecurityLevel>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) username: Option<String>,
    #[serde(rename = "sc", skip_serializing_if = "Option::is_none")]
    pub(crate) server_challenge: Option<String>,
    #[serde(rename = "cc", skip_serializing_if = "Option::is_none")]
    pub(crate) client_challenge: Option<String>,
    #[serde(rename = "cr", skip_serializing_if = "Option::is_none")]
    pub(crate) client_response: Option<Hash>,
    #[serde(rename = "sr", skip_serializing_if = "Option::is_none")]
    pub(crate) server_response: Option<Hash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) security_level: Option<SecurityLevel>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorPayload {
    pub(crate) code: ErrorCode,
    #[serde(default)]
    pub(crate) message_params: Vec<String>,
}

/// The fixed outer message schema. Every field but `protocol` and
/// `version` is optional; unknown fields on the wire are ignored (we never
/// `deny_unknown_fields`) and absent optionals serialize as absent, not
/// `null`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    pub(crate) protocol: Protocol,
    pub(crate) version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) srp: Option<SrpPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) key: Option<KeyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) jsonrpc: Option<EncryptedPayload<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) client_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) client_display_description: Option<String>,
}

impl Envelope {
    pub(crate) fn error(version: i32, code: ErrorCode, message_params: Vec<String>) -> Self {
        Self {
            protocol: Protocol::Error,
            version,
            features: None,
            srp: None,
            key: None,
            jsonrpc: None,
            error: Some(ErrorPayload {
                code,
                message_params,
            }),
            client_display_name: None,
            client_display_description: None,
        }
    }

    pub(crate) fn setup(version: i32, srp: Option<SrpPayload>, key: Option<KeyPayload>) -> Self {
        Self {
            protocol: Protocol::Setup,
            version,
            features: None,
            srp,
            key,
            jsonrpc: None,
            error: None,
            client_display_name: None,
            client_display_description: None,
        }
    }

    pub(crate) fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = Some(features);
        self
    }

    pub(crate) fn jsonrpc(version: i32, payload: EncryptedPayload<serde_json::Value>) -> Self {
        Self {
            protocol: Protocol::Jsonrpc,
            version,
            features: None,
            srp: None,
            key: None,
            jsonrpc: Some(payload),
            error: None,
            client_display_name: None,
            client_display_description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_error_serializes_with_stable_code() {
        let envelope = Envelope::error(
            1,
            ErrorCode::VersionClientTooLow,
            vec!["2".to_owned()],
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["protocol"], "error");
        assert_eq!(json["error"]["code"], 7);
        assert_eq!(json["error"]["messageParams"][0], "2");
        assert!(json.get("srp").is_none());
    }

    #[test]
    fn decodes_canonical_schema() {
        let text = r#"{
            "protocol": "setup",
            "version": 1,
            "srp": {"stage": "identifyToServer", "I": "alice", "A": "1a"}
        }"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.protocol, Protocol::Setup);
        let srp = envelope.srp.unwrap();
        assert_eq!(srp.stage, Some(SrpStage::IdentifyToServer));
        assert_eq!(srp.identity.as_deref(), Some("alice"));
    }
}
