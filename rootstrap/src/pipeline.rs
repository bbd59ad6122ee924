// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Lock, fetch, verify and extract, in that order
//!
//! Each stage only starts once the previous one succeeded. Nothing is
//! rolled back on failure: the archive stays on disk for the next run
//! to resume or reuse, and a partially written tree is overwritten by
//! the next extraction.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;
use url::Url;

use crate::{
    artifact::{ArtifactSpec, Digest},
    checksum::{self, VerificationOutcome},
    extract::{self, ExtractionPlan, ExtractionSummary},
    fetch::{self, DownloadResult, Fetcher, Progress},
    request, runtime,
};

pub use self::lockfile::Lock;

pub mod lockfile;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Wall-clock limit for a whole run
    pub timeout: Option<Duration>,
}

/// Notifications emitted while a run progresses
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// Downloaded bytes
    Download(Progress),
    /// Hashing the archive on disk
    Verify,
    /// Compressed bytes consumed by the extractor
    Extract(Progress),
}

/// A verified archive on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub download: DownloadResult,
    pub verification: VerificationOutcome,
}

/// Outcome of a successful [`Pipeline::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub archive: Archive,
    pub extraction: ExtractionSummary,
}

pub struct Pipeline {
    fetcher: Fetcher,
    options: Options,
}

impl Pipeline {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            options: Options::default(),
        }
    }

    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    /// Provision `plan.target_directory` from `spec`
    pub async fn run(&self, spec: &ArtifactSpec, plan: &ExtractionPlan) -> Result<Report, Error> {
        self.run_with(spec, plan, |_| {}).await
    }

    /// [`Pipeline::run`], reporting progress through `on_event`
    pub async fn run_with<F>(&self, spec: &ArtifactSpec, plan: &ExtractionPlan, on_event: F) -> Result<Report, Error>
    where
        F: Fn(Event) + Clone + Send + 'static,
    {
        self.limit(self.provision(spec, plan, on_event)).await
    }

    /// Fetch and verify the archive for `spec` without extracting it
    pub async fn acquire<F>(&self, spec: &ArtifactSpec, on_event: F) -> Result<Archive, Error>
    where
        F: Fn(Event) + Clone + Send + 'static,
    {
        self.limit(self.archive(spec, on_event)).await
    }

    async fn limit<T>(&self, task: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        match self.options.timeout {
            Some(duration) => tokio::time::timeout(duration, task)
                .await
                .map_err(|_| Error::TimedOut(duration))?,
            None => task.await,
        }
    }

    async fn provision<F>(&self, spec: &ArtifactSpec, plan: &ExtractionPlan, on_event: F) -> Result<Report, Error>
    where
        F: Fn(Event) + Clone + Send + 'static,
    {
        let lock_path = lockfile::path_for(&plan.target_directory);
        let lock = lockfile::acquire(&lock_path)?;
        debug!("Holding {}", lock_path.display());

        let archive = self.archive(spec, on_event.clone()).await?;

        let path = archive.download.local_path.clone();
        let plan = plan.clone();

        // The lock moves along so a timed out run keeps it until extraction ends
        let extraction = runtime::unblock(move || {
            let _lock = lock;
            extract::extract(&path, &plan, |progress| on_event(Event::Extract(progress)))
        })
        .await?;

        Ok(Report { archive, extraction })
    }

    async fn archive<F>(&self, spec: &ArtifactSpec, on_event: F) -> Result<Archive, Error>
    where
        F: Fn(Event) + Clone + Send + 'static,
    {
        let file_name = spec.file_name();
        let pinned = match expected_digest(spec, &file_name, true).await {
            // A discovered release may still be listed
            Err(Error::MissingChecksum { .. }) if spec.discovery.is_some() => None,
            result => result?,
        };
        let destination = self.fetcher.destination(spec);

        if let Some(archive) = cached(&destination, pinned.as_ref(), &on_event).await? {
            info!("Using cached {}", destination.display());
            return Ok(archive);
        }

        let download = self
            .fetcher
            .fetch(spec, |progress| on_event(Event::Download(progress)))
            .await?;

        let expected = match (download.discovered, pinned) {
            (true, _) => {
                let discovered = download
                    .local_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if spec.expected_digest.is_some() {
                    warn!("The digest for {file_name} does not apply to the discovered {discovered}");
                }
                expected_digest(spec, &discovered, false).await?
            }
            (false, Some(digest)) => Some(digest),
            (false, None) => expected_digest(spec, &file_name, true).await?,
        };

        on_event(Event::Verify);

        let path = download.local_path.clone();
        let verification = runtime::unblock(move || checksum::verify(&path, expected.as_ref())).await?;

        Ok(Archive { download, verification })
    }
}

/// The digest `file_name` must match. The explicit digest only covers the
/// archive `spec` names (`named`), the checksum list covers any file.
async fn expected_digest(spec: &ArtifactSpec, file_name: &str, named: bool) -> Result<Option<Digest>, Error> {
    if let Some(digest) = spec.expected_digest.as_ref().filter(|_| named) {
        return Ok(Some(digest.clone()));
    }

    let Some(url) = &spec.checksum_list else {
        return Ok(None);
    };

    let list = checksum::fetch_list(url).await.map_err(|source| Error::Checksums {
        url: url.clone(),
        source,
    })?;

    match list.get(file_name) {
        Some(digest) => {
            debug!("{file_name} is listed in {url} as {digest}");
            Ok(Some(digest.clone()))
        }
        None => Err(Error::MissingChecksum {
            file_name: file_name.to_owned(),
            url: url.clone(),
        }),
    }
}

/// A previous download that already matches `expected`
async fn cached(
    destination: &Path,
    expected: Option<&Digest>,
    on_event: &impl Fn(Event),
) -> Result<Option<Archive>, Error> {
    let Some(expected) = expected else {
        return Ok(None);
    };

    let byte_size = match fs_err::tokio::metadata(destination).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    on_event(Event::Verify);

    let path = destination.to_owned();
    let actual_digest = runtime::unblock(move || checksum::sha256_file(&path)).await?;

    if !expected.matches(&actual_digest) {
        debug!("{} does not match, fetching again", destination.display());
        return Ok(None);
    }

    Ok(Some(Archive {
        download: DownloadResult {
            local_path: destination.to_owned(),
            byte_size,
            resumed: false,
            was_cached: true,
            source: None,
            discovered: false,
        },
        verification: VerificationOutcome {
            passed: true,
            actual_digest,
            verified: true,
        },
    }))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("target is locked by {0:?}")]
    Locked(PathBuf),
    #[error("lock")]
    Lock(#[source] lockfile::Error),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("fetching checksum list {url}")]
    Checksums {
        url: Url,
        #[source]
        source: request::Error,
    },
    #[error("{file_name} is not listed in {url}")]
    MissingChecksum { file_name: String, url: Url },
    #[error("fetch")]
    Fetch(#[from] fetch::Error),
    #[error("verify")]
    Verify(#[from] checksum::Error),
    #[error("extract")]
    Extract(#[from] extract::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

impl From<lockfile::Error> for Error {
    fn from(error: lockfile::Error) -> Self {
        match error {
            lockfile::Error::Locked(path) => Error::Locked(path),
            error => Error::Lock(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        artifact::{Architecture, Variant},
        catalog::{self, Release},
        discover::{self, Discovery},
        extract::test::{gzip, sample_rootfs},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        mirror: PathBuf,
        downloads: PathBuf,
        target: PathBuf,
        digest: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror/rootfs-minimal-amd64.tar.gz");
        std::fs::create_dir_all(mirror.parent().unwrap()).unwrap();
        std::fs::write(&mirror, gzip(&sample_rootfs())).unwrap();
        let digest = checksum::sha256_file(&mirror).unwrap();

        Fixture {
            downloads: dir.path().join("downloads"),
            target: dir.path().join("chroot/kali"),
            mirror,
            digest,
            _dir: dir,
        }
    }

    impl Fixture {
        fn spec(&self, digest: &str) -> ArtifactSpec {
            ArtifactSpec::new(
                Variant::Minimal,
                Architecture::Amd64,
                vec![Url::from_file_path(&self.mirror).unwrap()],
            )
            .with_minimum_size(64)
            .with_digest(Some(digest.parse().unwrap()))
        }

        fn plan(&self) -> ExtractionPlan {
            ExtractionPlan::rootfs(&self.target, 1).unwrap()
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(Fetcher::new(&self.downloads))
        }

        fn archive(&self) -> PathBuf {
            self.downloads.join("rootfs-minimal-amd64.tar.gz")
        }
    }

    #[tokio::test]
    async fn provisions_target() {
        let fixture = fixture();

        let report = fixture
            .pipeline()
            .run(&fixture.spec(&fixture.digest), &fixture.plan())
            .await
            .unwrap();

        assert!(!report.archive.download.was_cached);
        assert!(report.archive.verification.verified);
        assert_eq!(report.archive.verification.actual_digest, fixture.digest);
        assert!(report.extraction.entries_written > 0);
        assert_eq!(std::fs::read(fixture.target.join("etc/hostname")).unwrap(), b"kali\n");
        assert!(fixture.target.join("dev/shm").is_dir());
        assert!(lockfile::path_for(&fixture.target).exists());
    }

    #[tokio::test]
    async fn rerun_uses_cached_archive() {
        let fixture = fixture();
        let pipeline = fixture.pipeline();
        let spec = fixture.spec(&fixture.digest);

        pipeline.run(&spec, &fixture.plan()).await.unwrap();

        // The mirror disappearing proves nothing is fetched again
        std::fs::remove_file(&fixture.mirror).unwrap();

        let report = pipeline.run(&spec, &fixture.plan()).await.unwrap();

        assert!(report.archive.download.was_cached);
        assert_eq!(report.archive.download.source, None);
        assert!(fixture.target.join("etc/hostname").exists());
    }

    #[tokio::test]
    async fn digest_mismatch_keeps_archive_and_target_untouched() {
        let fixture = fixture();
        let wrong = "0".repeat(Digest::LEN);

        let error = fixture
            .pipeline()
            .run(&fixture.spec(&wrong), &fixture.plan())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Verify(checksum::Error::DigestMismatch { .. })));
        assert!(fixture.archive().exists());
        assert!(!fixture.target.exists());
    }

    #[tokio::test]
    async fn held_lock_fails_fast() {
        let fixture = fixture();
        let _held = lockfile::acquire(lockfile::path_for(&fixture.target)).unwrap();

        let error = fixture
            .pipeline()
            .run(&fixture.spec(&fixture.digest), &fixture.plan())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Locked(_)));
        assert!(!fixture.archive().exists());
    }

    #[tokio::test]
    async fn digest_from_checksum_list() {
        let fixture = fixture();
        let list = fixture.mirror.with_file_name("SHA256SUMS");
        std::fs::write(&list, format!("{}  rootfs-minimal-amd64.tar.gz\n", fixture.digest)).unwrap();

        let spec = ArtifactSpec::new(
            Variant::Minimal,
            Architecture::Amd64,
            vec![Url::from_file_path(&fixture.mirror).unwrap()],
        )
        .with_minimum_size(64)
        .with_checksum_list(Some(Url::from_file_path(&list).unwrap()));

        let archive = fixture.pipeline().acquire(&spec, |_| {}).await.unwrap();

        assert!(archive.verification.verified);
        assert!(!fixture.target.exists());
    }

    #[tokio::test]
    async fn unlisted_file_is_fatal() {
        let fixture = fixture();
        let list = fixture.mirror.with_file_name("SHA256SUMS");
        std::fs::write(&list, format!("{}  something-else.tar.xz\n", fixture.digest)).unwrap();

        let spec = fixture
            .spec(&fixture.digest)
            .with_digest(None)
            .with_checksum_list(Some(Url::from_file_path(&list).unwrap()));

        let error = fixture.pipeline().acquire(&spec, |_| {}).await.unwrap_err();

        assert!(matches!(error, Error::MissingChecksum { .. }));
        assert!(!fixture.archive().exists());
    }

    /// Mirror that only carries 2025.4, with a listing and checksum file
    /// the way the public image index lays them out
    struct Newer {
        _dir: tempfile::TempDir,
        downloads: PathBuf,
        spec: ArtifactSpec,
        digest: String,
        sums: PathBuf,
    }

    fn newer_release_only() -> Newer {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror");
        let (variant, architecture) = (Variant::Minimal, Architecture::Amd64);

        let archive = mirror.join(discover::render(discover::DEFAULT_TEMPLATE, "2025.4", variant, architecture));
        std::fs::create_dir_all(archive.parent().unwrap()).unwrap();
        std::fs::write(&archive, gzip(&sample_rootfs())).unwrap();
        let digest = checksum::sha256_file(&archive).unwrap();

        let index = mirror.join("index.html");
        std::fs::write(
            &index,
            r#"<a href="kali-2025.3/">kali-2025.3/</a> <a href="kali-2025.4/">kali-2025.4/</a>"#,
        )
        .unwrap();

        let pinned = Release::builtin(catalog::DEFAULT_RELEASE).unwrap();
        let discovery = Discovery::new(
            Url::from_file_path(&index).unwrap(),
            discover::DEFAULT_PATTERN,
            discover::DEFAULT_TEMPLATE,
        )
        .unwrap();
        let mirror_url = Url::from_directory_path(&mirror).unwrap();

        let spec = ArtifactSpec::new(
            variant,
            architecture,
            catalog::candidate_urls(&[mirror_url], pinned.version, variant, architecture),
        )
        .with_minimum_size(64)
        .with_digest(pinned.digest(variant, architecture).map(|digest| digest.parse().unwrap()))
        .with_discovery(Some(discovery));

        Newer {
            downloads: dir.path().join("downloads"),
            sums: mirror.join("SHA256SUMS"),
            spec,
            digest,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn discovered_release_is_checked_against_its_own_listing() {
        let newer = newer_release_only();
        std::fs::write(
            &newer.sums,
            format!(
                "{}  {}\n",
                newer.digest,
                catalog::file_name("2025.4", Variant::Minimal, Architecture::Amd64)
            ),
        )
        .unwrap();
        let spec = newer
            .spec
            .clone()
            .with_checksum_list(Some(Url::from_file_path(&newer.sums).unwrap()));

        let archive = Pipeline::new(Fetcher::new(&newer.downloads))
            .acquire(&spec, |_| {})
            .await
            .unwrap();

        assert!(archive.download.discovered);
        assert_eq!(
            archive.download.local_path,
            newer
                .downloads
                .join(catalog::file_name("2025.4", Variant::Minimal, Architecture::Amd64))
        );
        assert!(archive.verification.verified);
        assert_eq!(archive.verification.actual_digest, newer.digest);
    }

    #[tokio::test]
    async fn pinned_digest_does_not_apply_to_discovered_release() {
        let newer = newer_release_only();

        let archive = Pipeline::new(Fetcher::new(&newer.downloads))
            .acquire(&newer.spec, |_| {})
            .await
            .unwrap();

        assert!(archive.download.discovered);
        assert!(archive.verification.passed);
        assert!(!archive.verification.verified);
        assert!(!newer.downloads.join(newer.spec.file_name()).exists());
    }

    #[tokio::test]
    async fn discovered_release_missing_from_listing_is_fatal() {
        let newer = newer_release_only();
        std::fs::write(&newer.sums, format!("{}  unrelated.tar.xz\n", newer.digest)).unwrap();
        let spec = newer
            .spec
            .clone()
            .with_digest(None)
            .with_checksum_list(Some(Url::from_file_path(&newer.sums).unwrap()));

        let error = Pipeline::new(Fetcher::new(&newer.downloads))
            .acquire(&spec, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(error, Error::MissingChecksum { ref file_name, .. } if file_name.contains("2025.4")));
    }
}
