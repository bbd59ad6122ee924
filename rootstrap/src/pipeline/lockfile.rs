// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use fs_err::{self as fs, File};
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

/// An acquired file lock guaranteeing exclusive access
/// to a target directory.
///
/// The lock is automatically released once all instances
/// of this ref counted lock are dropped.
#[derive(Debug, Clone)]
#[allow(unused)]
pub struct Lock(Arc<File>);

/// Lock file guarding `target`: `<parent>/.<name>.lock`
pub fn path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_owned());

    let parent = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    parent.join(format!(".{name}.lock"))
}

/// Acquires a file lock at the provided path without waiting.
///
/// Returns the acquired [`Lock`] that will be held until dropped,
/// or [`Error::Locked`] if another process holds it.
pub fn acquire(path: impl Into<PathBuf>) -> Result<Lock, Error> {
    let path = path.into();

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => {}
        Err(nix::errno::Errno::EWOULDBLOCK) => return Err(Error::Locked(path)),
        Err(e) => Err(e)?,
    }

    Ok(Lock(Arc::new(file)))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} is held by another process")]
    Locked(PathBuf),
    #[error("io")]
    Io(#[from] io::Error),
    #[error("obtaining exclusive file lock")]
    Flock(#[from] nix::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_path_sits_beside_target() {
        assert_eq!(path_for(Path::new("/srv/chroot/kali")), Path::new("/srv/chroot/.kali.lock"));
        assert_eq!(path_for(Path::new("kali")), Path::new("./.kali.lock"));
    }

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".target.lock");

        let lock = acquire(&path).unwrap();
        assert!(matches!(acquire(&path), Err(Error::Locked(_))));

        drop(lock);
        assert!(acquire(&path).is_ok());
    }
}
