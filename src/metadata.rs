// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use directories::ProjectDirs;
use once_cell::sync::Lazy;

pub(crate) const SERVER_NAME: &str = "keepassrpcd";

pub(crate) static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("com", "NoahFontes", SERVER_NAME));

const fn parse_u8(s: &str) -> u8 {
    let bytes = s.as_bytes();
    let mut value: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value as u8
}

/// The wire protocol-compatibility token: a 32-bit little-endian
/// `[build, minor, major, 0]` quartet interpreted as a signed integer.
///
/// Built once from the crate's semantic version and threaded explicitly
/// into every connection rather than read from a global/lazy singleton, so
/// tests can construct a server with an arbitrary version to exercise the
/// version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(i32);

impl ProtocolVersion {
    pub const fn from_parts(major: u8, minor: u8, build: u8) -> Self {
        Self(i32::from_le_bytes([build, minor, major, 0]))
    }

    /// The version baked into this build from `Cargo.toml`.
    pub const fn current() -> Self {
        Self::from_parts(
            parse_u8(env!("CARGO_PKG_VERSION_MAJOR")),
            parse_u8(env!("CARGO_PKG_VERSION_MINOR")),
            parse_u8(env!("CARGO_PKG_VERSION_PATCH")),
        )
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<ProtocolVersion> for i32 {
    fn from(value: ProtocolVersion) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_little_endian_quartet() {
        let version = ProtocolVersion::from_parts(1, 2, 3);
        assert_eq!(version.as_i32(), i32::from_le_bytes([3, 2, 1, 0]));
    }
}
