// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Known NetHunter rootfs releases and their published digests

use url::Url;

use crate::artifact::{Architecture, Variant};

/// Release used when none is configured
pub const DEFAULT_RELEASE: &str = "2025.3";

/// Mirrors tried in order when none are configured
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://kali.download/nethunter-images/",
    "https://old.kali.org/nethunter-images/",
];

const RELEASE_2025_3: &[(Variant, Architecture, &str)] = &[
    (
        Variant::Minimal,
        Architecture::Arm64,
        "8dd42a9c8eb6cb7efcb169a6824b2cdc61ff0f999e87b30effa11832c528916e",
    ),
    (
        Variant::Minimal,
        Architecture::Armhf,
        "709f131a7b8ca25073553b8ac8065cf9f9d113e764d1f5f4c03c54cb47fc4475",
    ),
    (
        Variant::Minimal,
        Architecture::I386,
        "8c58f2330cbf926c70dd17e34bbaab6a5e0ab618841c948ca1f59e277bc99466",
    ),
    (
        Variant::Minimal,
        Architecture::Amd64,
        "ae4040e0dc7c61171be8ec677fd92c3d22748cf23edd3e1f6d7d220c55897c09",
    ),
    (
        Variant::Nano,
        Architecture::Arm64,
        "771f511202c28074a1756859ac8211bed9d85a1cf4eddba19416b12e05492d24",
    ),
    (
        Variant::Nano,
        Architecture::Armhf,
        "ae1c75b78dd1c70f37fd748561a5272015a1ae054335d78de9f0a6ed49dc1bdb",
    ),
    (
        Variant::Nano,
        Architecture::I386,
        "5f9f73583a4343f100bc1a6b7f10e5e123c8fcb5d028c2fbfaa25c31d137fd9a",
    ),
    (
        Variant::Nano,
        Architecture::Amd64,
        "aa6f55cb5f7d39613d3af56d75b2373d0778a01e1db42b525a8e0c262bbfe808",
    ),
    (
        Variant::Full,
        Architecture::Arm64,
        "b7c60dd5a1db33b399afcecc40be39415f5593f7302b6573aece1265dae44d73",
    ),
    (
        Variant::Full,
        Architecture::Armhf,
        "11ee09de068493a6f7a2c8f6b1e0d5a18cb3cc511f25aca7db99e1ede82c0e15",
    ),
    (
        Variant::Full,
        Architecture::I386,
        "bcad19f1f2b68cdae0a6d773aa1fa21655e57889729c3e15b395d768ae0e33b7",
    ),
    (
        Variant::Full,
        Architecture::Amd64,
        "5ef7aebd3ac19ada2fdf8301d19096bc63f7e29c3aeb1d8b1b64491347e35c8d",
    ),
];

/// A release whose archives and digests are known ahead of time
#[derive(Debug, Clone, Copy)]
pub struct Release {
    pub version: &'static str,
    entries: &'static [(Variant, Architecture, &'static str)],
}

impl Release {
    /// Look up a built-in release
    pub fn builtin(version: &str) -> Option<Self> {
        match version {
            "2025.3" => Some(Self {
                version: "2025.3",
                entries: RELEASE_2025_3,
            }),
            _ => None,
        }
    }

    /// Published digest for the given archive
    pub fn digest(&self, variant: Variant, architecture: Architecture) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(v, a, _)| *v == variant && *a == architecture)
            .map(|(_, _, digest)| *digest)
    }

    /// All `(variant, architecture, digest)` entries
    pub fn entries(&self) -> impl Iterator<Item = (Variant, Architecture, &'static str)> + '_ {
        self.entries.iter().copied()
    }
}

/// Archive file name for a release
pub fn file_name(release: &str, variant: Variant, architecture: Architecture) -> String {
    format!("kali-nethunter-{release}-rootfs-{variant}-{architecture}.tar.xz")
}

/// Path of an archive relative to a mirror base
pub fn relative_path(release: &str, variant: Variant, architecture: Architecture) -> String {
    format!("kali-{release}/rootfs/{}", file_name(release, variant, architecture))
}

/// Expand each mirror base into a full archive URL, skipping
/// bases that cannot be joined
pub fn candidate_urls(mirrors: &[Url], release: &str, variant: Variant, architecture: Architecture) -> Vec<Url> {
    let relative = relative_path(release, variant, architecture);

    mirrors
        .iter()
        .filter_map(|mirror| with_trailing_slash(mirror).join(&relative).ok())
        .collect()
}

/// Parse the built-in mirror list
pub fn default_mirrors() -> Vec<Url> {
    DEFAULT_MIRRORS
        .iter()
        .filter_map(|mirror| Url::parse(mirror).ok())
        .collect()
}

// `Url::join` replaces the last segment unless the base ends in `/`
fn with_trailing_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut url = url.clone();
        let path = format!("{}/", url.path());
        url.set_path(&path);
        url
    }
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::artifact::Digest;

    #[test]
    fn builtin_release_is_complete() {
        let release = Release::builtin(DEFAULT_RELEASE).unwrap();

        for variant in Variant::iter() {
            for arch in Architecture::iter() {
                let digest = release.digest(variant, arch).unwrap();
                assert!(digest.parse::<Digest>().is_ok(), "{variant}/{arch}");
            }
        }
        assert!(Release::builtin("1999.1").is_none());
    }

    #[test]
    fn urls_keep_mirror_order() {
        let mirrors = vec![
            Url::parse("https://m1.example/images").unwrap(),
            Url::parse("https://m2.example/nethunter-images/").unwrap(),
        ];

        let urls = candidate_urls(&mirrors, "2025.3", Variant::Minimal, Architecture::Amd64);

        assert_eq!(
            urls.iter().map(Url::as_str).collect::<Vec<_>>(),
            vec![
                "https://m1.example/images/kali-2025.3/rootfs/kali-nethunter-2025.3-rootfs-minimal-amd64.tar.xz",
                "https://m2.example/nethunter-images/kali-2025.3/rootfs/kali-nethunter-2025.3-rootfs-minimal-amd64.tar.xz",
            ]
        );
    }
}
