// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Post-extraction repairs of a rootfs tree
//!
//! Every action is best effort. Nothing existing is ever replaced.

use std::{
    fmt,
    fs::Permissions,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use log::{debug, warn};

use super::{resolve_inside, Error};

const SHELLS: &[&str] = &["usr/bin/bash", "usr/bin/dash", "usr/bin/sh", "usr/bin/zsh", "usr/bin/su"];

/// A single repair, with paths relative to the target directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupAction {
    EnsureDirectory(PathBuf),
    /// `link` is created pointing at `target`, verbatim
    CreateSymlinkIfMissing { link: PathBuf, target: PathBuf },
    /// Add execute permission for owner, group and others
    MarkExecutable(PathBuf),
}

impl fmt::Display for FixupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupAction::EnsureDirectory(path) => write!(f, "mkdir {}", path.display()),
            FixupAction::CreateSymlinkIfMissing { link, target } => {
                write!(f, "ln -s {} {}", target.display(), link.display())
            }
            FixupAction::MarkExecutable(path) => write!(f, "chmod +x {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupOutcome {
    Applied,
    AlreadySatisfied,
    /// The path a [`FixupAction::MarkExecutable`] targets does not exist
    NotPresent,
    Failed(String),
}

impl fmt::Display for FixupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupOutcome::Applied => write!(f, "applied"),
            FixupOutcome::AlreadySatisfied => write!(f, "already satisfied"),
            FixupOutcome::NotPresent => write!(f, "not present"),
            FixupOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Repairs applied to every rootfs tree
pub fn rootfs() -> Vec<FixupAction> {
    let directories = ["dev", "proc", "sys", "tmp", "run", "root", "dev/shm"]
        .into_iter()
        .map(|dir| FixupAction::EnsureDirectory(dir.into()));

    let links = [("bin", "usr/bin"), ("sbin", "usr/sbin"), ("lib", "usr/lib")]
        .into_iter()
        .map(|(link, target)| FixupAction::CreateSymlinkIfMissing {
            link: link.into(),
            target: target.into(),
        });

    let shells = SHELLS
        .iter()
        .map(|shell| FixupAction::MarkExecutable(shell.into()));

    directories.chain(links).chain(shells).collect()
}

/// Apply `actions` in order below the canonical `root`
pub fn apply_all(root: &Path, actions: &[FixupAction]) -> Vec<(FixupAction, FixupOutcome)> {
    actions
        .iter()
        .map(|action| {
            let outcome = apply(root, action);

            match &outcome {
                FixupOutcome::Failed(reason) => warn!("Fixup `{action}` failed: {reason}"),
                outcome => debug!("Fixup `{action}`: {outcome}"),
            }

            (action.clone(), outcome)
        })
        .collect()
}

/// Apply a single action below the canonical `root`
pub fn apply(root: &Path, action: &FixupAction) -> FixupOutcome {
    let result = match action {
        FixupAction::EnsureDirectory(path) => ensure_directory(root, path),
        FixupAction::CreateSymlinkIfMissing { link, target } => create_symlink(root, link, target),
        FixupAction::MarkExecutable(path) => mark_executable(root, path),
    };

    result.unwrap_or_else(|error| FixupOutcome::Failed(describe(&error)))
}

fn ensure_directory(root: &Path, relative: &Path) -> Result<FixupOutcome, Error> {
    let path = resolve_inside(root, relative, true)?;

    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(FixupOutcome::AlreadySatisfied),
        Ok(meta) if meta.file_type().is_symlink() => {
            let resolved = fs::canonicalize(&path).map_err(|e| write_error(&path, e))?;
            if resolved.starts_with(root) && resolved.is_dir() {
                Ok(FixupOutcome::AlreadySatisfied)
            } else {
                Ok(FixupOutcome::Failed(format!("{} is a symlink elsewhere", relative.display())))
            }
        }
        Ok(_) => Ok(FixupOutcome::Failed(format!(
            "{} exists and is not a directory",
            relative.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(&path).map_err(|e| write_error(&path, e))?;
            Ok(FixupOutcome::Applied)
        }
        Err(e) => Err(write_error(&path, e)),
    }
}

fn create_symlink(root: &Path, link: &Path, target: &Path) -> Result<FixupOutcome, Error> {
    let path = resolve_inside(root, link, true)?;

    match fs::symlink_metadata(&path) {
        Ok(_) => Ok(FixupOutcome::AlreadySatisfied),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::os::unix::fs::symlink(target, &path).map_err(|e| write_error(&path, e))?;
            Ok(FixupOutcome::Applied)
        }
        Err(e) => Err(write_error(&path, e)),
    }
}

fn mark_executable(root: &Path, relative: &Path) -> Result<FixupOutcome, Error> {
    let path = match resolve_inside(root, relative, false) {
        Ok(path) => path,
        Err(Error::PartialWrite { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Ok(FixupOutcome::NotPresent)
        }
        Err(e) => return Err(e),
    };

    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FixupOutcome::NotPresent),
        Err(e) => return Err(write_error(&path, e)),
    };

    // Follow symlinks such as `sh -> dash`, but only within the tree
    let path = if meta.file_type().is_symlink() {
        match fs::canonicalize(&path) {
            Ok(resolved) if resolved.starts_with(root) => resolved,
            Ok(_) => return Err(Error::PathTraversal(relative.to_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FixupOutcome::NotPresent),
            Err(e) => return Err(write_error(&path, e)),
        }
    } else {
        path
    };

    let meta = fs::metadata(&path).map_err(|e| write_error(&path, e))?;
    if !meta.is_file() {
        return Ok(FixupOutcome::Failed(format!("{} is not a regular file", relative.display())));
    }

    let mode = meta.permissions().mode();
    if mode & 0o111 == 0o111 {
        return Ok(FixupOutcome::AlreadySatisfied);
    }

    fs::set_permissions(&path, Permissions::from_mode(mode | 0o111)).map_err(|e| write_error(&path, e))?;

    Ok(FixupOutcome::Applied)
}

fn write_error(path: &Path, source: io::Error) -> Error {
    Error::PartialWrite {
        path: path.to_owned(),
        source,
    }
}

fn describe(error: &Error) -> String {
    match error {
        Error::PartialWrite { path, source } => format!("{}: {source}", path.display()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn default_actions() {
        let actions = rootfs();

        assert_eq!(actions.len(), 15);
        assert_eq!(actions[0], FixupAction::EnsureDirectory("dev".into()));
        assert!(actions.contains(&FixupAction::CreateSymlinkIfMissing {
            link: "bin".into(),
            target: "usr/bin".into(),
        }));
        assert!(actions.contains(&FixupAction::MarkExecutable("usr/bin/su".into())));
    }

    #[test]
    fn directories_are_created_once() {
        let (_dir, root) = root();
        let action = FixupAction::EnsureDirectory("dev/shm".into());

        assert_eq!(apply(&root, &action), FixupOutcome::Applied);
        assert!(root.join("dev/shm").is_dir());
        assert_eq!(apply(&root, &action), FixupOutcome::AlreadySatisfied);
    }

    #[test]
    fn existing_entries_are_never_replaced() {
        let (_dir, root) = root();
        std::fs::create_dir(root.join("lib")).unwrap();
        std::fs::write(root.join("lib/marker"), b"kept").unwrap();
        std::fs::write(root.join("tmp"), b"file").unwrap();

        let link = FixupAction::CreateSymlinkIfMissing {
            link: "lib".into(),
            target: "usr/lib".into(),
        };
        assert_eq!(apply(&root, &link), FixupOutcome::AlreadySatisfied);
        assert!(root.join("lib/marker").exists());

        let dir = FixupAction::EnsureDirectory("tmp".into());
        assert!(matches!(apply(&root, &dir), FixupOutcome::Failed(_)));
        assert_eq!(std::fs::read(root.join("tmp")).unwrap(), b"file");
    }

    #[test]
    fn dangling_symlink_is_created() {
        let (_dir, root) = root();
        let action = FixupAction::CreateSymlinkIfMissing {
            link: "sbin".into(),
            target: "usr/sbin".into(),
        };

        assert_eq!(apply(&root, &action), FixupOutcome::Applied);
        assert_eq!(std::fs::read_link(root.join("sbin")).unwrap(), Path::new("usr/sbin"));
    }

    #[test]
    fn executables_follow_relative_links() {
        let (_dir, root) = root();
        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::fs::write(root.join("usr/bin/dash"), b"dash").unwrap();
        std::fs::set_permissions(root.join("usr/bin/dash"), std::fs::Permissions::from_mode(0o644)).unwrap();
        std::os::unix::fs::symlink("dash", root.join("usr/bin/sh")).unwrap();

        let sh = FixupAction::MarkExecutable("usr/bin/sh".into());
        assert_eq!(apply(&root, &sh), FixupOutcome::Applied);
        assert_eq!(std::fs::metadata(root.join("usr/bin/dash")).unwrap().mode() & 0o777, 0o755);
        assert_eq!(apply(&root, &sh), FixupOutcome::AlreadySatisfied);

        let zsh = FixupAction::MarkExecutable("usr/bin/zsh".into());
        assert_eq!(apply(&root, &zsh), FixupOutcome::NotPresent);

        let missing_parent = FixupAction::MarkExecutable("opt/bin/tool".into());
        assert_eq!(apply(&root, &missing_parent), FixupOutcome::NotPresent);
    }

    #[test]
    fn links_out_of_the_tree_are_not_followed() {
        let (_dir, root) = root();
        let outside = tempfile::tempdir().unwrap();
        let host = outside.path().join("bash");
        std::fs::write(&host, b"host").unwrap();
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(0o600)).unwrap();

        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::os::unix::fs::symlink(&host, root.join("usr/bin/bash")).unwrap();

        let action = FixupAction::MarkExecutable("usr/bin/bash".into());
        assert!(matches!(apply(&root, &action), FixupOutcome::Failed(_)));
        assert_eq!(std::fs::metadata(&host).unwrap().mode() & 0o777, 0o600);
    }
}
