// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Mirror selection and resumable download of rootfs archives

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use fs_err::tokio::{self as fs, File, OpenOptions};
use futures_util::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{
    artifact::{url_file_name, ArtifactSpec},
    environment,
    request::{self, Body, Probe},
};

/// Retry policy for transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Retries after the first attempt
    pub retries: u32,
    /// Multiplied by the attempt number before each retry
    pub retry_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retries: environment::DEFAULT_RETRIES,
            retry_delay: environment::DEFAULT_RETRY_DELAY,
        }
    }
}

/// Transfer progress for UI integration
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub delta: u64,
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Return the completion as a percentage, if the total is known
    pub fn pct(&self) -> Option<f32> {
        self.total.map(|total| self.completed as f32 / total as f32)
    }
}

/// A mirror that answered the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: Url,
    /// Declared size, if the mirror sent one
    pub size: Option<u64>,
    /// Found through release discovery rather than the candidate list
    pub discovered: bool,
}

/// An archive present on disk after [`Fetcher::fetch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub local_path: PathBuf,
    /// Size read back from disk
    pub byte_size: u64,
    /// Bytes already on disk were kept and continued
    pub resumed: bool,
    /// No transfer happened, the file on disk was already valid
    pub was_cached: bool,
    /// Mirror the bytes came from, `None` when cached
    pub source: Option<Url>,
    /// The archive is a discovered release, not the one `spec` names
    pub discovered: bool,
}

/// Downloads [`ArtifactSpec`]s into a single directory
#[derive(Debug, Clone)]
pub struct Fetcher {
    download_dir: PathBuf,
    options: Options,
}

impl Fetcher {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            options: Options::default(),
        }
    }

    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    /// Where the archive for `spec` is written
    pub fn destination(&self, spec: &ArtifactSpec) -> PathBuf {
        self.download_dir.join(spec.file_name())
    }

    /// Where `candidate` is written. A discovered release keeps its own name.
    pub fn destination_for(&self, spec: &ArtifactSpec, candidate: &Candidate) -> PathBuf {
        match url_file_name(&candidate.url) {
            Some(name) if candidate.discovered => self.download_dir.join(name),
            _ => self.destination(spec),
        }
    }

    /// Pick the first usable candidate for `spec`.
    ///
    /// Mirrors declaring a size at or above the floor win in list order.
    /// Failing that, release discovery is consulted and finally the first
    /// mirror that answered without declaring a size is used.
    pub async fn resolve(&self, spec: &ArtifactSpec) -> Result<Candidate, Error> {
        let minimum = spec.minimum_size_bytes;
        let mut undeclared = None;

        for url in &spec.candidate_urls {
            match request::probe(url).await {
                Ok(Probe::Available { size: Some(size) }) if size >= minimum => {
                    debug!("Using {url} ({size} bytes)");
                    return Ok(Candidate {
                        url: url.clone(),
                        size: Some(size),
                        discovered: false,
                    });
                }
                Ok(Probe::Available { size: Some(size) }) => {
                    warn!("{url} declares {size} bytes, below the {minimum} byte minimum");
                }
                Ok(Probe::Available { size: None }) => {
                    debug!("{url} did not declare a size");
                    undeclared.get_or_insert_with(|| url.clone());
                }
                Ok(Probe::Unavailable(status)) => warn!("{url} answered {status}"),
                Err(error) => warn!("{url} could not be probed: {error}"),
            }
        }

        if let Some(discovery) = &spec.discovery {
            match discovery.discover(spec.variant, spec.architecture).await {
                Ok(url) => match request::probe(&url).await {
                    Ok(Probe::Available { size }) if !matches!(size, Some(size) if size < minimum) => {
                        debug!("Using discovered {url}");
                        return Ok(Candidate {
                            url,
                            size,
                            discovered: true,
                        });
                    }
                    Ok(probe) => warn!("Discovered {url} is unusable: {probe:?}"),
                    Err(error) => warn!("Discovered {url} could not be probed: {error}"),
                },
                Err(error) => warn!("Release discovery failed: {error}"),
            }
        }

        if let Some(url) = undeclared {
            return Ok(Candidate {
                url,
                size: None,
                discovered: false,
            });
        }

        Err(Error::NoCandidateAvailable(spec.candidate_urls.clone()))
    }

    /// Resolve a mirror and download the archive for `spec`, continuing
    /// any partial file already at the destination.
    ///
    /// A failed download is left on disk so the next attempt can resume.
    pub async fn fetch(&self, spec: &ArtifactSpec, on_progress: impl Fn(Progress)) -> Result<DownloadResult, Error> {
        let candidate = self.resolve(spec).await?;
        let destination = self.destination_for(spec, &candidate);

        fs::create_dir_all(&self.download_dir).await?;

        let mut attempt = 0;
        let resumed = loop {
            match transfer(&candidate, &destination, &on_progress).await {
                Ok(resumed) => break resumed,
                Err(error) if error.is_transient() && attempt < self.options.retries => {
                    attempt += 1;
                    let delay = self.options.retry_delay * attempt;
                    warn!(
                        "Transfer of {} failed ({error}), retry {attempt}/{} in {delay:?}",
                        candidate.url, self.options.retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        };

        let byte_size = file_size(&destination).await?;
        if byte_size < spec.minimum_size_bytes {
            return Err(Error::SizeTooSmall {
                path: destination,
                size: byte_size,
                minimum: spec.minimum_size_bytes,
            });
        }

        info!("Downloaded {} ({byte_size} bytes) from {}", destination.display(), candidate.url);

        Ok(DownloadResult {
            local_path: destination,
            byte_size,
            resumed,
            was_cached: false,
            source: Some(candidate.url),
            discovered: candidate.discovered,
        })
    }
}

/// One transfer attempt, continuing from whatever is on disk.
///
/// Returns `true` if bytes were appended to an existing partial file.
async fn transfer(candidate: &Candidate, destination: &Path, on_progress: &impl Fn(Progress)) -> Result<bool, Error> {
    let network = |source| Error::Network {
        url: candidate.url.clone(),
        source,
    };

    let mut offset = file_size(destination).await?;

    if let Some(size) = candidate.size {
        if offset == size && offset > 0 {
            debug!("{} is already complete", destination.display());
            return Ok(false);
        }
        if offset > size {
            debug!("{} is larger than the remote file, restarting", destination.display());
            offset = 0;
        }
    }

    let mut response = request::get(&candidate.url, offset).await.map_err(network)?;

    let (mut out, start) = match response.body {
        Body::Complete => return Ok(false),
        Body::Partial => {
            debug!("Resuming {} at byte {offset}", destination.display());
            (OpenOptions::new().append(true).open(destination).await?, offset)
        }
        Body::Full => (File::create(destination).await?, 0),
    };

    let total = response.length.map(|length| length + start).or(candidate.size);
    let mut completed = start;

    while let Some(chunk) = response.stream.next().await {
        let bytes = chunk.map_err(network)?;
        let delta = bytes.len() as u64;
        completed += delta;
        out.write_all(&bytes).await?;

        (on_progress)(Progress { delta, completed, total });
    }

    out.flush().await?;

    Ok(start > 0)
}

async fn file_size(path: &Path) -> Result<u64, Error> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(Error::Io(error)),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no usable mirror among: {}", join_urls(.0))]
    NoCandidateAvailable(Vec<Url>),
    #[error("downloading {url}")]
    Network {
        url: Url,
        #[source]
        source: request::Error,
    },
    #[error("{path:?} is {size} bytes, below the {minimum} byte minimum; likely an error page")]
    SizeTooSmall { path: PathBuf, size: u64, minimum: u64 },
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// Worth retrying with the bytes downloaded so far
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { source, .. } if source.is_transient())
    }
}

fn join_urls(urls: &[Url]) -> String {
    if urls.is_empty() {
        return "(none configured)".to_owned();
    }

    urls.iter().map(Url::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{
        artifact::{Architecture, Variant},
        discover::{self, Discovery},
    };

    fn mirror(dir: &Path, name: &str, contents: &[u8]) -> Url {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        Url::from_file_path(path).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn spec(urls: Vec<Url>, minimum: u64) -> ArtifactSpec {
        ArtifactSpec::new(Variant::Minimal, Architecture::Amd64, urls).with_minimum_size(minimum)
    }

    #[tokio::test]
    async fn falls_through_missing_mirror() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let body = payload(4096);

        let missing = Url::from_file_path(mirrors.path().join("m1/rootfs.tar.xz")).unwrap();
        let present = mirror(mirrors.path(), "m2/rootfs.tar.xz", &body);

        let fetcher = Fetcher::new(downloads.path());
        let seen = AtomicU64::new(0);
        let result = fetcher
            .fetch(&spec(vec![missing, present.clone()], 1024), |progress| {
                seen.store(progress.completed, Ordering::Relaxed);
            })
            .await
            .unwrap();

        assert_eq!(result.source, Some(present));
        assert_eq!(result.byte_size, 4096);
        assert!(!result.resumed);
        assert_eq!(seen.load(Ordering::Relaxed), 4096);
        assert_eq!(std::fs::read(result.local_path).unwrap(), body);
    }

    #[tokio::test]
    async fn declared_size_below_floor_is_skipped() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();

        let small = mirror(mirrors.path(), "m1/rootfs.tar.xz", b"<html>404</html>");

        let error = Fetcher::new(downloads.path())
            .fetch(&spec(vec![small], 1024), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(error, Error::NoCandidateAvailable(ref urls) if urls.len() == 1));
        assert!(!downloads.path().join("rootfs.tar.xz").exists());
    }

    #[tokio::test]
    async fn resumes_partial_download() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let body = payload(10_000);

        let url = mirror(mirrors.path(), "m1/rootfs.tar.xz", &body);
        std::fs::write(downloads.path().join("rootfs.tar.xz"), &body[..3_333]).unwrap();

        let result = Fetcher::new(downloads.path())
            .fetch(&spec(vec![url], 1024), |_| {})
            .await
            .unwrap();

        assert!(result.resumed);
        assert_eq!(std::fs::read(result.local_path).unwrap(), body);
    }

    #[tokio::test]
    async fn oversized_partial_restarts() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let body = payload(2048);

        let url = mirror(mirrors.path(), "m1/rootfs.tar.xz", &body);
        std::fs::write(downloads.path().join("rootfs.tar.xz"), payload(4096)).unwrap();

        let result = Fetcher::new(downloads.path())
            .fetch(&spec(vec![url], 1024), |_| {})
            .await
            .unwrap();

        assert!(!result.resumed);
        assert_eq!(std::fs::read(result.local_path).unwrap(), body);
    }

    #[tokio::test]
    async fn discovery_fills_in_for_missing_mirrors() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let body = payload(4096);

        let discovered = mirror(mirrors.path(), "images/kali-2025.4/rootfs/newest.tar.xz", &body);
        let index = mirror(
            mirrors.path(),
            "images/index.html",
            br#"<a href="kali-2025.2/">kali-2025.2/</a><a href="kali-2025.4/">kali-2025.4/</a>"#,
        );
        let missing = vec![
            Url::from_file_path(mirrors.path().join("m1/pinned.tar.xz")).unwrap(),
            Url::from_file_path(mirrors.path().join("m2/pinned.tar.xz")).unwrap(),
        ];

        let discovery = Discovery::new(index, discover::DEFAULT_PATTERN, "kali-{version}/rootfs/newest.tar.xz").unwrap();
        let spec = spec(missing, 1024).with_discovery(Some(discovery));

        let result = Fetcher::new(downloads.path()).fetch(&spec, |_| {}).await.unwrap();

        assert!(result.discovered);
        assert_eq!(result.source, Some(discovered));
        assert_eq!(result.local_path, downloads.path().join("newest.tar.xz"));
        assert_eq!(std::fs::read(result.local_path).unwrap(), body);
    }

    #[tokio::test]
    async fn failed_discovery_reports_no_candidate() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();

        let index = mirror(mirrors.path(), "images/index.html", b"<html>nothing here</html>");
        let missing = vec![Url::from_file_path(mirrors.path().join("m1/pinned.tar.xz")).unwrap()];

        let discovery = Discovery::new(index, discover::DEFAULT_PATTERN, discover::DEFAULT_TEMPLATE).unwrap();
        let spec = spec(missing, 1024).with_discovery(Some(discovery));

        let error = Fetcher::new(downloads.path()).fetch(&spec, |_| {}).await.unwrap_err();

        assert!(matches!(error, Error::NoCandidateAvailable(ref urls) if urls.len() == 1));
    }

    #[tokio::test]
    async fn complete_file_is_not_resumed() {
        let mirrors = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let body = payload(2048);

        let url = mirror(mirrors.path(), "m1/rootfs.tar.xz", &body);
        std::fs::write(downloads.path().join("rootfs.tar.xz"), &body).unwrap();

        let result = Fetcher::new(downloads.path())
            .fetch(&spec(vec![url], 1024), |_| {})
            .await
            .unwrap();

        assert!(!result.resumed);
        assert_eq!(result.byte_size, 2048);
    }

    #[tokio::test]
    async fn empty_candidate_list() {
        let downloads = tempfile::tempdir().unwrap();

        let error = Fetcher::new(downloads.path())
            .fetch(&spec(vec![], 1), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(error, Error::NoCandidateAvailable(_)));
        assert!(error.to_string().contains("none configured"));
    }
}
