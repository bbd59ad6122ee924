// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! SHA-256 verification of downloaded archives

use std::{
    collections::BTreeMap,
    io::{self, Read},
    path::{Path, PathBuf},
};

use fs_err::File;
use log::{debug, trace, warn};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use url::Url;

use crate::{artifact::Digest, environment, request};

/// Result of checking an archive against its expected digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// Lowercase hex digest of the file contents
    pub actual_digest: String,
    /// `false` when there was nothing to compare against
    pub verified: bool,
}

/// Stream `path` through SHA-256 and compare it with `expected`.
///
/// Without an expected digest the file is still hashed so the value
/// can be recorded, but the outcome is marked unverified.
pub fn verify(path: &Path, expected: Option<&Digest>) -> Result<VerificationOutcome, Error> {
    let actual_digest = sha256_file(path).map_err(|e| Error::UnreadableFile(path.to_owned(), e))?;

    let Some(expected) = expected else {
        warn!(
            "No published checksum for {}, continuing UNVERIFIED (sha256 {actual_digest})",
            path.display()
        );
        return Ok(VerificationOutcome {
            passed: true,
            actual_digest,
            verified: false,
        });
    };

    if !expected.matches(&actual_digest) {
        return Err(Error::DigestMismatch {
            path: path.to_owned(),
            expected: expected.to_string(),
            actual: actual_digest,
        });
    }

    debug!("{} matches sha256 {actual_digest}", path.display());

    Ok(VerificationOutcome {
        passed: true,
        actual_digest,
        verified: true,
    })
}

/// Hex encoded SHA-256 of a file, read in fixed-size chunks
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; environment::FILE_READ_BUFFER_SIZE];

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Parsed `<hex-digest>  <filename>` list, as published next to images
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumList {
    entries: BTreeMap<String, Digest>,
}

impl ChecksumList {
    /// Parse a checksum list, ignoring blank lines, comments and
    /// lines that do not match the format
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let parsed = line
                    .split_once("  ")
                    .and_then(|(digest, name)| Some((name.trim_end().to_owned(), digest.parse::<Digest>().ok()?)))
                    .filter(|(name, _)| !name.is_empty());

                if parsed.is_none() {
                    trace!("Skipping malformed checksum line {line:?}");
                }

                parsed
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, file_name: &str) -> Option<&Digest> {
        self.entries.get(file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Download and parse a checksum list
pub async fn fetch_list(url: &Url) -> Result<ChecksumList, request::Error> {
    let text = request::text(url).await?;
    Ok(ChecksumList::parse(&text))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("sha256 mismatch for {path:?}, expected {expected} got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("reading {0:?}")]
    UnreadableFile(PathBuf, #[source] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    // sha256("hello world\n")
    const HELLO: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    fn hello_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs_err::write(&path, b"hello world\n").unwrap();
        (dir, path)
    }

    #[test]
    fn matching_digest_passes() {
        let (_dir, path) = hello_file();
        let expected = HELLO.to_ascii_uppercase().parse::<Digest>().unwrap();

        let outcome = verify(&path, Some(&expected)).unwrap();

        assert!(outcome.passed);
        assert!(outcome.verified);
        assert_eq!(outcome.actual_digest, HELLO);
    }

    #[test]
    fn mismatched_digest_fails() {
        let (_dir, path) = hello_file();
        let expected = "0".repeat(Digest::LEN).parse::<Digest>().unwrap();

        let error = verify(&path, Some(&expected)).unwrap_err();

        assert!(matches!(error, Error::DigestMismatch { ref actual, .. } if actual == HELLO));
        assert!(path.exists());
    }

    #[test]
    fn missing_digest_is_unverified() {
        let (_dir, path) = hello_file();

        let outcome = verify(&path, None).unwrap();

        assert!(outcome.passed);
        assert!(!outcome.verified);
        assert_eq!(outcome.actual_digest, HELLO);
    }

    #[test]
    fn unreadable_file() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            verify(&dir.path().join("missing"), None),
            Err(Error::UnreadableFile(..))
        ));
    }

    #[test]
    fn parse_checksum_list() {
        let text = format!(
            "# SHA256SUMS\n\n{HELLO}  hello.txt\n{}  other.tar.xz\nnot-a-digest  broken\n{HELLO} single-space\n",
            "B".repeat(64)
        );

        let list = ChecksumList::parse(&text);

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("hello.txt").map(Digest::as_str), Some(HELLO));
        assert_eq!(list.get("other.tar.xz").map(Digest::as_str), Some("b".repeat(64).as_str()));
        assert!(list.get("broken").is_none());
        assert!(list.get("single-space").is_none());
    }
}
