// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `rootstrap.yaml` settings
//!
//! Every field is optional so layers can be merged one field at a time.
//! Accessors fall back to the built-in defaults.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    artifact::{Architecture, Digest, Variant},
    catalog::{self, Release},
    discover::{self, Discovery},
    environment,
    extract::DEFAULT_EXCLUDES,
    fetch,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub release: Option<String>,
    pub mirrors: Option<Vec<Url>>,
    pub target: Option<PathBuf>,
    pub minimum_size: Option<u64>,
    pub strip_components: Option<usize>,
    /// Replaces the default exclusions when set
    pub exclude: Option<Vec<String>>,
    pub digests: BTreeMap<Variant, BTreeMap<Architecture, Digest>>,
    pub checksums: Option<Url>,
    pub discovery: Option<DiscoveryConfig>,
    pub retries: Option<u32>,
    /// Seconds
    pub retry_delay: Option<u64>,
    /// Seconds
    pub timeout: Option<u64>,
}

/// Overrides for the release index scrape, unset fields use the defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub index: Option<Url>,
    pub pattern: Option<String>,
    pub template: Option<String>,
}

impl ::config::Config for Config {
    fn domain() -> String {
        environment::PROGRAM.into()
    }

    fn merge(self, other: Self) -> Self {
        let mut digests = self.digests;
        for (variant, architectures) in other.digests {
            digests.entry(variant).or_default().extend(architectures);
        }

        let discovery = match (self.discovery, other.discovery) {
            (Some(base), Some(other)) => Some(DiscoveryConfig {
                index: other.index.or(base.index),
                pattern: other.pattern.or(base.pattern),
                template: other.template.or(base.template),
            }),
            (base, other) => other.or(base),
        };

        Self {
            release: other.release.or(self.release),
            mirrors: other.mirrors.or(self.mirrors),
            target: other.target.or(self.target),
            minimum_size: other.minimum_size.or(self.minimum_size),
            strip_components: other.strip_components.or(self.strip_components),
            exclude: other.exclude.or(self.exclude),
            digests,
            checksums: other.checksums.or(self.checksums),
            discovery,
            retries: other.retries.or(self.retries),
            retry_delay: other.retry_delay.or(self.retry_delay),
            timeout: other.timeout.or(self.timeout),
        }
    }
}

impl Config {
    pub fn release(&self) -> &str {
        self.release.as_deref().unwrap_or(catalog::DEFAULT_RELEASE)
    }

    pub fn mirrors(&self) -> Vec<Url> {
        self.mirrors.clone().unwrap_or_else(catalog::default_mirrors)
    }

    /// Configured digest, else the one built in for `release`
    pub fn digest(&self, release: &str, variant: Variant, architecture: Architecture) -> Option<Digest> {
        if let Some(digest) = self
            .digests
            .get(&variant)
            .and_then(|architectures| architectures.get(&architecture))
        {
            return Some(digest.clone());
        }

        Release::builtin(release)?
            .digest(variant, architecture)?
            .parse()
            .ok()
    }

    pub fn minimum_size(&self) -> u64 {
        self.minimum_size.unwrap_or(environment::DEFAULT_MINIMUM_SIZE)
    }

    pub fn strip_components(&self) -> usize {
        self.strip_components.unwrap_or(environment::DEFAULT_STRIP_COMPONENTS)
    }

    pub fn excludes(&self) -> Vec<String> {
        self.exclude
            .clone()
            .unwrap_or_else(|| DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect())
    }

    pub fn fetch_options(&self) -> fetch::Options {
        let defaults = fetch::Options::default();

        fetch::Options {
            retries: self.retries.unwrap_or(defaults.retries),
            retry_delay: self
                .retry_delay
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Discovery settings, if any were configured
    pub fn discovery(&self) -> Result<Option<Discovery>, discover::Error> {
        let Some(config) = &self.discovery else {
            return Ok(None);
        };

        let index = match &config.index {
            Some(index) => index.clone(),
            None => Url::parse(discover::DEFAULT_INDEX)?,
        };

        Discovery::new(
            index,
            config.pattern.as_deref().unwrap_or(discover::DEFAULT_PATTERN),
            config.template.as_deref().unwrap_or(discover::DEFAULT_TEMPLATE),
        )
        .map(Some)
    }
}
