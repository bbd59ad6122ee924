// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Best-effort discovery of the newest release from a directory listing
//!
//! Listing pages have no stable format, so a failure here only means
//! there is no extra candidate to try.

use std::cmp::Ordering;

use log::debug;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::{
    artifact::{Architecture, Variant},
    request,
};

/// Default index of NetHunter images
pub const DEFAULT_INDEX: &str = "https://kali.download/nethunter-images/";
/// Matches release directories in the index listing
pub const DEFAULT_PATTERN: &str = r#"href="kali-(?P<version>\d{4}\.\d+)/""#;
/// Archive location relative to the index
pub const DEFAULT_TEMPLATE: &str = "kali-{version}/rootfs/kali-nethunter-{version}-rootfs-{variant}-{arch}.tar.xz";

/// Where and how to look for the newest release
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Listing page to scrape
    pub index: Url,
    /// Capture group `version`, or the first group, holds the version
    pub pattern: Regex,
    /// Rendered with `{version}`, `{variant}` and `{arch}`, then
    /// joined onto `index`
    pub template: String,
}

impl Discovery {
    pub fn new(index: Url, pattern: &str, template: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            index,
            pattern: Regex::new(pattern)?,
            template: template.into(),
        })
    }

    /// Discovery against the public NetHunter image index
    pub fn nethunter() -> Result<Self, Error> {
        Self::new(Url::parse(DEFAULT_INDEX)?, DEFAULT_PATTERN, DEFAULT_TEMPLATE)
    }

    /// Scrape the index and build the archive URL for the newest release
    pub async fn discover(&self, variant: Variant, architecture: Architecture) -> Result<Url, Error> {
        let page = request::text(&self.index).await?;

        let version = latest_version(&page, &self.pattern).ok_or_else(|| Error::NoMatch(self.index.clone()))?;
        debug!("Discovered release {version} from {}", self.index);

        let relative = render(&self.template, &version, variant, architecture);

        Ok(self.index.join(&relative)?)
    }
}

/// Highest version captured by `pattern` anywhere in `page`
pub fn latest_version(page: &str, pattern: &Regex) -> Option<String> {
    pattern
        .captures_iter(page)
        .filter_map(|captures| captures.name("version").or_else(|| captures.get(1)))
        .map(|m| m.as_str().to_owned())
        .max_by(|a, b| compare_versions(a, b))
}

/// Fill in `{version}`, `{variant}` and `{arch}`
pub fn render(template: &str, version: &str, variant: Variant, architecture: Architecture) -> String {
    template
        .replace("{version}", version)
        .replace("{variant}", &variant.to_string())
        .replace("{arch}", &architecture.to_string())
}

/// Compare dot separated versions, numerically where both parts are numbers
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-']);
    let mut right = b.split(['.', '-']);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetching index")]
    Request(#[from] request::Error),
    #[error("no release found in {0}")]
    NoMatch(Url),
    #[error("invalid pattern")]
    Pattern(#[from] regex::Error),
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),
}
