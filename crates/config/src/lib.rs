// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Layered YAML configuration
//!
//! A [`Manager`] knows an ordered list of configuration directories. For a
//! [`Config`] with domain `foo`, every directory contributes `foo.yaml`
//! followed by `foo.d/*.yaml` (sorted by file name), and all documents found
//! are folded together with [`Config::merge`], later layers winning.

use std::path::{Path, PathBuf};

use fs_err as fs;
use log::trace;
use serde::de::DeserializeOwned;
use thiserror::Error;

const EXTENSION: &str = "yaml";

pub trait Config: DeserializeOwned {
    fn domain() -> String;

    /// Combine with a layer of higher precedence
    fn merge(self, other: Self) -> Self;
}

#[derive(Debug, Clone)]
pub struct Manager {
    layers: Vec<PathBuf>,
}

impl Manager {
    /// Config is loaded / merged from `usr/share/{program}` then
    /// `etc/{program}`, both relative to `root`
    pub fn system(root: impl AsRef<Path>, program: impl AsRef<str>) -> Self {
        let root = root.as_ref();
        let program = program.as_ref();

        Self {
            layers: vec![
                root.join("usr").join("share").join(program),
                root.join("etc").join(program),
            ],
        }
    }

    /// Vendor config from `/usr/share/{program}` overridden by
    /// `$XDG_CONFIG_HOME/{program}`
    pub fn user(program: impl AsRef<str>) -> Result<Self, CreateUserError> {
        let program = program.as_ref();
        let config = dirs::config_dir().ok_or(CreateUserError)?;

        Ok(Self {
            layers: vec![Path::new("/usr/share").join(program), config.join(program)],
        })
    }

    /// Config is loaded from `path` only
    pub fn custom(path: impl Into<PathBuf>) -> Self {
        Self {
            layers: vec![path.into()],
        }
    }

    /// Directories searched, lowest precedence first
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Every config document for `T`, lowest precedence first
    pub fn sources<T: Config>(&self) -> Vec<PathBuf> {
        let domain = T::domain();

        self.layers
            .iter()
            .flat_map(|dir| enumerate_paths(dir, &domain))
            .collect()
    }

    /// Load and merge all documents for `T`, returning `None`
    /// if no document exists.
    ///
    /// A document that cannot be read or parsed fails the whole load,
    /// since skipping it would silently drop the settings it carries.
    pub fn load<T: Config>(&self) -> Result<Option<T>, LoadError> {
        let layers = self
            .sources::<T>()
            .into_iter()
            .map(|path| read_config(&path))
            .collect::<Result<Vec<T>, _>>()?;

        Ok(layers.into_iter().reduce(T::merge))
    }
}

#[derive(Debug, Error)]
#[error("$HOME or $XDG_CONFIG_HOME env not set")]
pub struct CreateUserError;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {0:?}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("malformed config {0:?}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

fn enumerate_paths(dir: &Path, domain: &str) -> Vec<PathBuf> {
    let mut paths = vec![];

    let file = dir.join(format!("{domain}.{EXTENSION}"));
    if file.is_file() {
        paths.push(file);
    }

    if let Ok(read_dir) = fs::read_dir(dir.join(format!("{domain}.d"))) {
        let mut fragments = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(EXTENSION))
            .collect::<Vec<_>>();
        fragments.sort();

        paths.extend(fragments);
    }

    paths
}

fn read_config<T: Config>(path: &Path) -> Result<T, LoadError> {
    let bytes = fs::read(path).map_err(|error| LoadError::Read(path.to_owned(), error))?;
    let config = serde_yaml::from_slice(&bytes).map_err(|error| LoadError::Parse(path.to_owned(), error))?;

    trace!("Loaded config {path:?}");

    Ok(config)
}
