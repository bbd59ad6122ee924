// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::{environment, Config};

pub struct Env {
    pub cache_dir: PathBuf,
    pub config: config::Manager,
    is_root: bool,
}

impl Env {
    pub fn new(cache_dir: Option<PathBuf>, config_dir: Option<PathBuf>) -> Result<Self, Error> {
        let is_root = is_root();

        let config = if let Some(dir) = config_dir {
            config::Manager::custom(dir)
        } else if is_root {
            config::Manager::system("/", environment::PROGRAM)
        } else {
            config::Manager::user(environment::PROGRAM)?
        };

        let cache_dir = resolve_cache_dir(is_root, cache_dir)?;

        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            config,
            is_root,
        })
    }

    /// Merged configuration, or the defaults if none exists
    pub fn load_config(&self) -> Result<Config, Error> {
        Ok(self.config.load::<Config>()?.unwrap_or_default())
    }

    /// Where downloaded archives are kept
    pub fn download_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    /// Target used when neither the command line nor config names one
    pub fn default_target(&self) -> Result<PathBuf, Error> {
        if self.is_root {
            Ok(PathBuf::from("/var/lib").join(environment::PROGRAM).join("rootfs"))
        } else {
            Ok(dirs::data_dir()
                .ok_or(Error::UserData)?
                .join(environment::PROGRAM)
                .join("rootfs"))
        }
    }
}

fn resolve_cache_dir(is_root: bool, custom: Option<PathBuf>) -> Result<PathBuf, Error> {
    if let Some(dir) = custom {
        Ok(dir)
    } else if is_root {
        Ok(PathBuf::from("/var/cache").join(environment::PROGRAM))
    } else {
        Ok(dirs::cache_dir().ok_or(Error::UserCache)?.join(environment::PROGRAM))
    }
}

fn is_root() -> bool {
    use nix::unistd::Uid;

    Uid::effective().is_root()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find cache dir, $XDG_CACHE_HOME or $HOME env not set")]
    UserCache,
    #[error("cannot find config dir, $XDG_CONFIG_HOME or $HOME env not set")]
    UserConfig,
    #[error("cannot find data dir, $XDG_DATA_HOME or $HOME env not set")]
    UserData,
    #[error("loading config")]
    Config(#[from] config::LoadError),
    #[error("io")]
    Io(#[from] io::Error),
}

impl From<config::CreateUserError> for Error {
    fn from(_: config::CreateUserError) -> Self {
        Error::UserConfig
    }
}
