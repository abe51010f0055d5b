// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{metadata, model::SecurityLevel};

/// Which [`crate::storage::ConfigStore`]/[`crate::storage::SecretSeal`]
/// combination backs key-container persistence. `OsSeal` is the daemon's
/// normal Tier 2 backend; `File` and `Memory` exist for running standalone
/// without a desktop secret-store, and for tests.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Persistence {
    Memory,
    File,
    OsSeal,
}

fn parse_security_level(s: &str) -> Result<SecurityLevel, String> {
    match s {
        "unset" => Ok(SecurityLevel::Unset),
        "low" => Ok(SecurityLevel::Low),
        "medium" => Ok(SecurityLevel::Medium),
        "high" => Ok(SecurityLevel::High),
        other => Err(format!(
            "unrecognised security level \"{other}\" (expected one of: unset, low, medium, high)"
        )),
    }
}

/// Startup configuration, built once from CLI flags and handed down by
/// `Arc` to the transport server and every connection it spawns. Nothing
/// downstream reaches for a global/lazy singleton instead.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub(crate) struct Config {
    /// The address to listen for incoming WebSocket connections on.
    #[clap(long, env = "KEEPASSRPC_BIND", default_value = "127.0.0.1:12546")]
    pub(crate) bind: SocketAddr,

    /// This server's own security posture, which selects how a paired
    /// client's long-term key is persisted (see `--security-level-client-minimum`
    /// for the client-facing floor).
    #[clap(long, env = "KEEPASSRPC_SECURITY_LEVEL", value_parser = parse_security_level, default_value = "medium")]
    pub(crate) security_level: SecurityLevel,

    /// The lowest `securityLevel` a client may declare during setup before
    /// we refuse it with `AUTH_CLIENT_SECURITY_LEVEL_TOO_LOW`.
    #[clap(long, env = "KEEPASSRPC_SECURITY_LEVEL_CLIENT_MINIMUM", value_parser = parse_security_level, default_value = "medium")]
    pub(crate) security_level_client_minimum: SecurityLevel,

    /// How long a freshly paired or reconnected key container remains
    /// valid, in seconds.
    #[clap(long, env = "KEEPASSRPC_AUTH_EXPIRY_SECS", default_value_t = 31_536_000)]
    pub(crate) auth_expiry_secs: u64,

    /// Which backend persists key containers at Tier 1/2.
    #[clap(long, env = "KEEPASSRPC_PERSISTENCE", value_enum, default_value_t = Persistence::OsSeal)]
    pub(crate) persistence: Persistence,

    /// Directory holding the file-backed config bag when `--persistence file`
    /// is selected.
    #[clap(long, env = "KEEPASSRPC_CONFIG_DIR", value_hint = clap::ValueHint::DirPath)]
    pub(crate) config_dir: Option<PathBuf>,

    /// Capability strings this server requires a client to advertise
    /// before tolerating a protocol version mismatch.
    #[clap(long = "required-feature", env = "KEEPASSRPC_REQUIRED_FEATURES", value_delimiter = ',')]
    pub(crate) required_features: Vec<String>,

    /// Capability strings advertised back to every client on setup replies.
    #[clap(
        long = "feature",
        env = "KEEPASSRPC_FEATURES",
        value_delimiter = ',',
        default_value = "KPRPC_FEATURE_VERSION_1_6"
    )]
    pub(crate) features: Vec<String>,
}

impl Config {
    pub(crate) fn auth_expiry(&self) -> Duration {
        Duration::from_secs(self.auth_expiry_secs)
    }

    pub(crate) fn protocol_version(&self) -> metadata::ProtocolVersion {
        metadata::ProtocolVersion::current()
    }

    /// True when `features` (the client's declared capability list, if
    /// any) covers every entry this server requires before it will
    /// tolerate a version mismatch. An empty `required_features` set
    /// offers no override at all: with nothing for the client to cover,
    /// there is no feature-based escape hatch from a version mismatch.
    pub(crate) fn features_satisfy_requirement(&self, features: Option<&[String]>) -> bool {
        if self.required_features.is_empty() {
            return false;
        }
        let declared = features.unwrap_or_default();
        self.required_features
            .iter()
            .all(|required| declared.iter().any(|f| f == required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(required_features: Vec<String>) -> Config {
        Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            security_level: SecurityLevel::Medium,
            security_level_client_minimum: SecurityLevel::Medium,
            auth_expiry_secs: 3600,
            persistence: Persistence::Memory,
            config_dir: None,
            required_features,
            features: Vec::new(),
        }
    }

    #[test]
    fn empty_required_features_never_tolerate_a_mismatch() {
        let config = config(Vec::new());
        assert!(!config.features_satisfy_requirement(None));
        assert!(!config.features_satisfy_requirement(Some(&["anything".to_owned()])));
    }

    #[test]
    fn covering_every_required_feature_tolerates_a_mismatch() {
        let config = config(vec!["A".to_owned(), "B".to_owned()]);
        assert!(!config.features_satisfy_requirement(Some(&["A".to_owned()])));
        assert!(config.features_satisfy_requirement(Some(&["A".to_owned(), "B".to_owned()])));
    }
}
