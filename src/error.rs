// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{convert::Infallible, io, result};

use thiserror::Error;

use crate::model;

pub(crate) type Result<T, E = Error> = result::Result<T, E>;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    Websocket(tokio_tungstenite::tungstenite::Error),
    #[error("JSON format error: {0}")]
    Json(serde_json::Error),
    #[error("data conversion error: {0}")]
    Conversion(#[from] Conversion),
    #[error("SRP negotiation error: {0}")]
    Srp(#[from] Srp),
    #[error("challenge-response authentication error: {0}")]
    ChallengeResponse(#[from] ChallengeResponse),
    #[error("message cipher error: {0}")]
    Cipher(#[from] Cipher),
    #[error("storage error: {0}")]
    Storage(#[from] Storage),
    #[error("envelope decoding error: {0}")]
    Codec(#[from] Codec),
    #[error("client security level {0:?} is below our configured minimum {1:?}")]
    SecurityLevelTooLow(model::SecurityLevel, model::SecurityLevel),
    #[error("client requested protocol version {0} which we do not support")]
    UnsupportedVersion(i32),
    #[error("authorised session has expired")]
    AuthExpired,
}

impl Error {
    /// Collapses any internal failure into the stable numeric code and
    /// message parameters we are willing to put on the wire. Never leaks
    /// which layer (SRP math, MAC check, storage backend) actually
    /// produced the failure: that distinction stays in our logs, not the
    /// client's face.
    pub(crate) fn to_wire(&self) -> (model::ErrorCode, Vec<String>) {
        // LINT: Deliberate fall-through that should catch future cases added
        // to the enum.
        #[allow(clippy::wildcard_enum_match_arm)]
        match self {
            Self::Srp(Srp::MissingParam(name)) => {
                (model::ErrorCode::AuthMissingParam, vec![(*name).to_owned()])
            }
            Self::Storage(Storage::ExploitMarker) => (
                model::ErrorCode::AuthFailed,
                vec!["Stored key not found".to_owned()],
            ),
            Self::Srp(_) | Self::ChallengeResponse(_) => (
                model::ErrorCode::AuthFailed,
                vec!["Keys do not match".to_owned()],
            ),
            Self::Cipher(_) => (model::ErrorCode::AuthRestart, Vec::new()),
            Self::UnsupportedVersion(server_version) => (
                model::ErrorCode::VersionClientTooLow,
                vec![server_version.to_string()],
            ),
            Self::SecurityLevelTooLow(minimum, _) => (
                model::ErrorCode::AuthClientSecurityLevelTooLow,
                vec![format!("{minimum:?}")],
            ),
            Self::AuthExpired => (model::ErrorCode::AuthExpired, Vec::new()),
            Self::Codec(Codec::UnrecognisedProtocol) => {
                (model::ErrorCode::UnrecognisedProtocol, Vec::new())
            }
            _ => (model::ErrorCode::InvalidMessage, Vec::new()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        // LINT: Deliberate fall-through that should catch future cases added to
        // the enum.
        #[allow(clippy::wildcard_enum_match_arm)]
        match value.classify() {
            serde_json::error::Category::Io => Self::Io(value.into()),
            _ => Self::Json(value),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Io(value.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        // LINT: Deliberate fall-through that should catch future cases added to
        // the enum.
        #[allow(clippy::wildcard_enum_match_arm)]
        match value {
            tokio_tungstenite::tungstenite::Error::Io(e) => Self::Io(e),
            _ => Self::Websocket(value),
        }
    }
}

impl From<Infallible> for Error {
    fn from(_: Infallible) -> Self {
        unreachable!()
    }
}

#[derive(Error, Debug)]
pub(crate) enum Conversion {
    #[error("unexpected hash length (wanted {0} bytes, but got {1} bytes)")]
    HashLength(usize, usize),
    #[error("input was not valid lowercase hexadecimal")]
    HexEncoding,
    #[error("input was not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unexpected non-UTF-8-encoded bytes in input: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("could not parse data as a number: {0}")]
    Range(#[from] num_bigint::ParseBigIntError),
    #[error("encrypted data has invalid padding: {0}")]
    Padding(#[from] block_padding::UnpadError),
}

#[derive(Error, Debug)]
pub(crate) enum Srp {
    #[error("setup envelope is missing the \"{0}\" parameter")]
    MissingParam(&'static str),
    #[error("client public key A was zero mod N, which is never valid")]
    ZeroPublicKey,
    #[error("client evidence value M did not match what we computed")]
    EvidenceMismatch,
}

#[derive(Error, Debug)]
pub(crate) enum ChallengeResponse {
    #[error("client response cr did not match expected value")]
    ClientResponseMismatch,
}

#[derive(Error, Debug)]
pub(crate) enum Cipher {
    #[error("message authentication failed")]
    AuthenticationFailed,
}

#[derive(Error, Debug)]
pub(crate) enum Storage {
    #[error("stored key material matches a known-compromised marker and was refused")]
    ExploitMarker,
    #[error("no OS-backed secret-store implementation is available on this platform")]
    BackendUnavailable,
    #[error("key container XML could not be processed: {0}")]
    Xml(String),
    #[cfg(feature = "secret-service-linux")]
    #[error("secret service error: {0}")]
    SecretService(#[from] oo7::Error),
    #[cfg(feature = "keychain-macos")]
    #[error("keychain error: {0}")]
    Keychain(#[from] security_framework::base::Error),
}

#[derive(Error, Debug)]
pub(crate) enum Codec {
    #[error("envelope referenced an unrecognised protocol identifier")]
    UnrecognisedProtocol,
    #[error("envelope was missing a required field for its current stage")]
    MissingField,
}
