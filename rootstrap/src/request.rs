// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! HTTP(S) and `file://` access with range support

use std::{
    io::{self, SeekFrom},
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    StatusCode,
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncSeekExt};
use tokio_util::io::ReaderStream;
use url::Url;

/// Shared client for tcp socket reuse and connection limit
static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("build reqwest client")
});

/// Answer to a metadata probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Status 200, with the declared `Content-Length` if any
    Available { size: Option<u64> },
    /// Any other status
    Unavailable(StatusCode),
}

/// How the server answered a (possibly ranged) request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// The whole resource, from byte zero
    Full,
    /// The remainder of the resource from the requested offset
    Partial,
    /// Requested offset is at or past the end of the resource
    Complete,
}

/// Streaming response to [`get`]
pub struct Response {
    pub body: Body,
    /// Bytes the stream will yield, if declared
    pub length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, Error>>,
}

/// Issue a HEAD-equivalent request for the provided [`Url`]
pub async fn probe(url: &Url) -> Result<Probe, Error> {
    if let Some(path) = url_file(url) {
        return match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Probe::Available { size: Some(meta.len()) }),
            Ok(_) => Ok(Probe::Unavailable(StatusCode::FORBIDDEN)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Probe::Unavailable(StatusCode::NOT_FOUND)),
            Err(e) => Err(Error::Read(e)),
        };
    }

    let response = CLIENT.head(url.clone()).send().await?;

    if response.status() == StatusCode::OK {
        Ok(Probe::Available {
            size: declared_length(&response),
        })
    } else {
        Ok(Probe::Unavailable(response.status()))
    }
}

/// Fetch a resource at the provided [`Url`] starting at `offset`
/// and stream its response bytes
pub async fn get(url: &Url, offset: u64) -> Result<Response, Error> {
    match url_file(url) {
        Some(path) => read(path, offset).await,
        _ => fetch(url, offset).await,
    }
}

/// Fetch a small text resource, such as a checksum list or an index page
pub async fn text(url: &Url) -> Result<String, Error> {
    let response = get(url, 0).await?;
    let chunks = response.stream.try_collect::<Vec<_>>().await?;

    Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
}

async fn fetch(url: &Url, offset: u64) -> Result<Response, Error> {
    let mut request = CLIENT.get(url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }

    let response = request.send().await?;

    let body = match response.status() {
        StatusCode::OK => Body::Full,
        StatusCode::PARTIAL_CONTENT => match range_start(&response) {
            Some(start) if start == offset && offset > 0 => Body::Partial,
            Some(0) => Body::Full,
            returned => return Err(Error::RangeMismatch { requested: offset, returned }),
        },
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
            return Ok(Response {
                body: Body::Complete,
                length: Some(0),
                stream: futures_util::stream::empty().boxed(),
            })
        }
        status => return Err(Error::Status(status)),
    };

    let length = declared_length(&response);

    Ok(Response {
        body,
        length,
        stream: response.bytes_stream().map_err(Error::Fetch).boxed(),
    })
}

async fn read(path: PathBuf, offset: u64) -> Result<Response, Error> {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::Status(StatusCode::NOT_FOUND)),
        Err(e) => return Err(Error::Read(e)),
    };
    let len = file.metadata().await?.len();

    if offset > 0 && offset >= len {
        return Ok(Response {
            body: Body::Complete,
            length: Some(0),
            stream: futures_util::stream::empty().boxed(),
        });
    }

    file.seek(SeekFrom::Start(offset)).await?;

    Ok(Response {
        body: if offset > 0 { Body::Partial } else { Body::Full },
        length: Some(len - offset),
        stream: ReaderStream::with_capacity(file, crate::environment::FILE_READ_BUFFER_SIZE)
            .map_err(Error::Read)
            .boxed(),
    })
}

// `Response::content_length` reports the body size hint, which is zero for HEAD
fn declared_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// First byte of a `Content-Range: bytes <start>-<end>/<size>` answer
fn range_start(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range_start)
}

fn parse_range_start(value: &str) -> Option<u64> {
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

fn url_file(url: &Url) -> Option<PathBuf> {
    if url.scheme() == "file" {
        url.to_file_path().ok()
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("read error: {0}")]
    Read(#[from] io::Error),
    #[error("asked for bytes from {requested}, partial answer starts at {returned:?}")]
    RangeMismatch { requested: u64, returned: Option<u64> },
}

impl Error {
    /// Whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch(error) => {
                error.is_connect()
                    || error.is_timeout()
                    || error.is_body()
                    || error.is_request()
                    || error.status().is_some_and(|status| status.is_server_error())
            }
            Error::Status(status) => status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS,
            Error::Read(_) | Error::RangeMismatch { .. } => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn file_probe_and_ranged_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs_err::write(&path, b"0123456789").unwrap();
        let url = Url::from_file_path(&path).unwrap();

        assert_eq!(probe(&url).await.unwrap(), Probe::Available { size: Some(10) });

        let response = get(&url, 4).await.unwrap();
        assert_eq!(response.body, Body::Partial);
        assert_eq!(response.length, Some(6));
        let bytes = response.stream.try_collect::<Vec<_>>().await.unwrap().concat();
        assert_eq!(bytes, b"456789");

        let response = get(&url, 10).await.unwrap();
        assert_eq!(response.body, Body::Complete);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("missing")).unwrap();

        assert_eq!(probe(&url).await.unwrap(), Probe::Unavailable(StatusCode::NOT_FOUND));
        assert!(matches!(
            get(&url, 0).await,
            Err(Error::Status(StatusCode::NOT_FOUND))
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(Error::Status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(Error::Status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!Error::Status(StatusCode::NOT_FOUND).is_transient());
        assert!(!Error::RangeMismatch {
            requested: 10,
            returned: Some(0)
        }
        .is_transient());
    }

    #[test]
    fn content_range_start() {
        assert_eq!(parse_range_start("bytes 40000-99999/100000"), Some(40000));
        assert_eq!(parse_range_start("bytes 0-9/*"), Some(0));
        assert_eq!(parse_range_start("bytes */100000"), None);
        assert_eq!(parse_range_start("items 1-2/3"), None);
    }
}
