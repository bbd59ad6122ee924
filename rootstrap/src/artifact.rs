// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Descriptors for the rootfs archive to acquire

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{discover::Discovery, environment};

/// Package completeness tier of a rootfs image
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Variant {
    /// Essential packages only
    Minimal,
    /// Essentials plus a few conveniences
    Nano,
    /// Desktop and the complete tool set
    Full,
}

/// CPU architecture of a rootfs image
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
    Arm64,
    Armhf,
    I386,
    Amd64,
}

impl Architecture {
    /// Architecture matching the userland this binary was built for,
    /// falling back to `arm64` for anything unrecognised
    pub const fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::Amd64
        } else if cfg!(target_arch = "x86") {
            Architecture::I386
        } else if cfg!(target_arch = "arm") {
            Architecture::Armhf
        } else {
            Architecture::Arm64
        }
    }
}

/// A lowercase hex encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hex characters in a SHA-256 digest
    pub const LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact-length, case-insensitive comparison with a hex string
    pub fn matches(&self, hex: &str) -> bool {
        self.0.len() == hex.len() && self.0.eq_ignore_ascii_case(hex)
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.len() != Self::LEN {
            return Err(ParseDigestError::Length(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseDigestError::NotHex(s.to_owned()));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Digest {
    type Error = ParseDigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ParseDigestError {
    #[error("expected {len} hex characters, got {0}", len = Digest::LEN)]
    Length(usize),
    #[error("not a hex string: {0}")]
    NotHex(String),
}

/// Everything needed to acquire one rootfs archive
///
/// Built once from flags and configuration before any network
/// access and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub variant: Variant,
    pub architecture: Architecture,
    /// Tried in order
    pub candidate_urls: Vec<Url>,
    pub expected_digest: Option<Digest>,
    /// Downloads below this size are rejected as error pages
    pub minimum_size_bytes: u64,
    /// `<digest>  <file>` list used when no digest is given
    pub checksum_list: Option<Url>,
    /// Best-effort lookup used when no candidate is usable
    pub discovery: Option<Discovery>,
}

impl ArtifactSpec {
    pub fn new(variant: Variant, architecture: Architecture, candidate_urls: Vec<Url>) -> Self {
        Self {
            variant,
            architecture,
            candidate_urls,
            expected_digest: None,
            minimum_size_bytes: environment::DEFAULT_MINIMUM_SIZE,
            checksum_list: None,
            discovery: None,
        }
    }

    pub fn with_digest(self, expected_digest: Option<Digest>) -> Self {
        Self {
            expected_digest,
            ..self
        }
    }

    pub fn with_minimum_size(self, minimum_size_bytes: u64) -> Self {
        Self {
            minimum_size_bytes,
            ..self
        }
    }

    pub fn with_checksum_list(self, checksum_list: Option<Url>) -> Self {
        Self { checksum_list, ..self }
    }

    pub fn with_discovery(self, discovery: Option<Discovery>) -> Self {
        Self { discovery, ..self }
    }

    /// Local file name for the download, taken from the first candidate
    pub fn file_name(&self) -> String {
        self.candidate_urls
            .first()
            .and_then(url_file_name)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("rootfs-{}-{}.tar.xz", self.variant, self.architecture))
    }
}

/// Last non-empty path segment of `url`
pub fn url_file_name(url: &Url) -> Option<&str> {
    url.path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_is_normalised() {
        let upper = "AE4040E0DC7C61171BE8EC677FD92C3D22748CF23EDD3E1F6D7D220C55897C09";
        let digest = upper.parse::<Digest>().unwrap();

        assert_eq!(digest.as_str(), upper.to_ascii_lowercase());
        assert!(digest.matches(upper));
        assert!(!digest.matches(&upper[..63]));
    }

    #[test]
    fn digest_rejects_bad_input() {
        assert!(matches!("abc123".parse::<Digest>(), Err(ParseDigestError::Length(6))));
        assert!(matches!(
            "z".repeat(Digest::LEN).parse::<Digest>(),
            Err(ParseDigestError::NotHex(_))
        ));
    }

    #[test]
    fn file_name_from_first_candidate() {
        let spec = ArtifactSpec::new(
            Variant::Minimal,
            Architecture::Amd64,
            vec![
                Url::parse("https://m1.example/rootfs/kali-minimal-amd64.tar.xz").unwrap(),
                Url::parse("https://m2.example/other.tar.xz").unwrap(),
            ],
        );
        assert_eq!(spec.file_name(), "kali-minimal-amd64.tar.xz");

        let spec = ArtifactSpec::new(
            Variant::Nano,
            Architecture::Armhf,
            vec![Url::parse("https://m1.example/").unwrap()],
        );
        assert_eq!(spec.file_name(), "rootfs-nano-armhf.tar.xz");
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(Variant::Minimal.to_string(), "minimal");
        assert_eq!("i386".parse::<Architecture>().unwrap(), Architecture::I386);
    }
}
