// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-process extraction of rootfs tarballs

use std::{
    fs::Permissions,
    io::{self, BufReader, Read, Seek},
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use fs_err::{self as fs, File};
use glob::{MatchOptions, Pattern};
use log::{debug, trace};
use nix::unistd::{linkat, LinkatFlags};
use tar::EntryType;
use thiserror::Error;

use crate::{environment, fetch::Progress};

pub use self::fixup::{FixupAction, FixupOutcome};

pub mod fixup;

/// Kept out of a rootfs: device nodes, pseudo filesystems and scratch space
pub const DEFAULT_EXCLUDES: &[&str] = &["dev/*", "proc/*", "sys/*", "tmp/*", "run/*"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// How to lay an archive out on disk
#[derive(Debug, Clone)]
pub struct ExtractionPlan {
    pub target_directory: PathBuf,
    /// Leading path components removed from every entry
    pub strip_leading_path_components: usize,
    /// Entries matching any pattern, or below a match, are skipped
    pub exclude_patterns: Vec<Pattern>,
    /// Applied in order once all entries are written
    pub post_fixups: Vec<FixupAction>,
}

impl ExtractionPlan {
    /// Plain extraction with no stripping, exclusions or fixups
    pub fn new(target_directory: impl Into<PathBuf>) -> Self {
        Self {
            target_directory: target_directory.into(),
            strip_leading_path_components: 0,
            exclude_patterns: vec![],
            post_fixups: vec![],
        }
    }

    /// Plan for a rootfs tarball: default exclusions and repairs
    pub fn rootfs(target_directory: impl Into<PathBuf>, strip: usize) -> Result<Self, glob::PatternError> {
        Ok(Self::new(target_directory)
            .with_strip(strip)
            .with_excludes(DEFAULT_EXCLUDES.iter().copied())?
            .with_fixups(fixup::rootfs()))
    }

    pub fn with_strip(self, strip_leading_path_components: usize) -> Self {
        Self {
            strip_leading_path_components,
            ..self
        }
    }

    /// Append exclusion globs
    pub fn with_excludes<'a>(mut self, patterns: impl IntoIterator<Item = &'a str>) -> Result<Self, glob::PatternError> {
        for pattern in patterns {
            self.exclude_patterns.push(Pattern::new(pattern)?);
        }
        Ok(self)
    }

    pub fn with_fixups(self, post_fixups: Vec<FixupAction>) -> Self {
        Self { post_fixups, ..self }
    }

    /// Whether `relative` (already stripped) or one of its ancestors is excluded
    pub fn excluded(&self, relative: &Path) -> bool {
        relative
            .ancestors()
            .filter(|path| !path.as_os_str().is_empty())
            .any(|path| {
                self.exclude_patterns
                    .iter()
                    .any(|pattern| pattern.matches_path_with(path, MATCH_OPTIONS))
            })
    }
}

/// What an extraction did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub entries_written: u64,
    pub entries_excluded: u64,
    /// Device nodes, FIFOs, and entries stripped to nothing
    pub entries_skipped: u64,
    pub fixups: Vec<(FixupAction, FixupOutcome)>,
}

/// Compression wrapping the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    Plain,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Bytes needed by [`Compression::detect`]
    pub const MAGIC_LEN: usize = 512;

    /// Identify the format from the first bytes of the file
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(Compression::Xz)
        } else if header.starts_with(&[0x1F, 0x8B]) {
            Some(Compression::Gzip)
        } else if header.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Some(Compression::Zstd)
        } else if header.get(257..262) == Some(b"ustar".as_slice()) {
            Some(Compression::Plain)
        } else {
            None
        }
    }

    fn decoder<'a>(self, reader: impl io::BufRead + 'a) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::Plain => Box::new(reader),
            Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
            Compression::Xz => Box::new(xz2::bufread::XzDecoder::new_multi_decoder(reader)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
        })
    }
}

/// Unpack `archive` according to `plan`, then apply its fixups.
///
/// Extraction stops at the first entry that would land outside the
/// target. Re-running over an existing tree overwrites entries in place.
pub fn extract(archive: &Path, plan: &ExtractionPlan, on_progress: impl Fn(Progress)) -> Result<ExtractionSummary, Error> {
    let mut file = File::open(archive).map_err(|e| Error::Read(archive.to_owned(), e))?;
    let total = file
        .metadata()
        .map_err(|e| Error::Read(archive.to_owned(), e))?
        .len();

    let magic = read_magic(&mut file).map_err(|e| Error::Read(archive.to_owned(), e))?;
    let compression = Compression::detect(&magic).ok_or_else(|| Error::UnsupportedFormat(archive.to_owned()))?;
    debug!("Extracting {} ({compression})", archive.display());

    let target = &plan.target_directory;
    fs::create_dir_all(target).map_err(|source| Error::PartialWrite {
        path: target.clone(),
        source,
    })?;
    let root = fs::canonicalize(target).map_err(|source| Error::PartialWrite {
        path: target.clone(),
        source,
    })?;

    let reader = BufReader::with_capacity(
        environment::ARCHIVE_READ_BUFFER_SIZE,
        ProgressReader {
            reader: file,
            total,
            read: 0,
            on_progress: &on_progress,
        },
    );
    let corrupt = |e| Error::Corrupt(archive.to_owned(), e);

    let mut tarball = tar::Archive::new(compression.decoder(reader).map_err(corrupt)?);
    tarball.set_preserve_permissions(true);
    tarball.set_preserve_mtime(true);
    tarball.set_unpack_xattrs(false);
    tarball.set_overwrite(true);

    let mut summary = ExtractionSummary::default();
    let mut directories = vec![];

    for entry in tarball.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let name = entry.path().map_err(corrupt)?.into_owned();

        let Some(relative) = sanitize(&name, target, &root, plan.strip_leading_path_components)? else {
            summary.entries_skipped += 1;
            continue;
        };

        if plan.excluded(&relative) {
            trace!("Excluded {relative:?}");
            summary.entries_excluded += 1;
            continue;
        }

        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory => {
                let dest = resolve_inside(&root, &relative, true)?;
                if ensure_directory(&dest)? {
                    let mode = entry.header().mode().map_err(corrupt)?;
                    directories.push((dest, mode));
                }
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                let dest = resolve_inside(&root, &relative, true)?;
                clear(&dest)?;
                entry.unpack(&dest).map_err(|source| unpack_error(archive, &dest, source))?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| corrupt(io::Error::new(io::ErrorKind::InvalidData, "symlink without target")))?;
                let dest = resolve_inside(&root, &relative, true)?;
                clear(&dest)?;
                fs::os::unix::fs::symlink(&link, &dest).map_err(|source| Error::PartialWrite { path: dest, source })?;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| corrupt(io::Error::new(io::ErrorKind::InvalidData, "hard link without target")))?
                    .into_owned();
                let Some(source_relative) = sanitize(&link, target, &root, plan.strip_leading_path_components)? else {
                    return Err(Error::PathTraversal(link));
                };
                let source = resolve_inside(&root, &source_relative, false)?;
                let dest = resolve_inside(&root, &relative, true)?;
                clear(&dest)?;
                hardlink_or_copy(&source, &dest)?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                debug!("Skipping special file {relative:?}");
                summary.entries_skipped += 1;
                continue;
            }
            other => {
                trace!("Skipping {other:?} entry {relative:?}");
                summary.entries_skipped += 1;
                continue;
            }
        }

        summary.entries_written += 1;
    }

    // Restrictive directory modes would block writing their children
    for (dest, mode) in directories.into_iter().rev() {
        fs::set_permissions(&dest, Permissions::from_mode(mode & 0o7777))
            .map_err(|source| Error::PartialWrite { path: dest, source })?;
    }

    summary.fixups = fixup::apply_all(&root, &plan.post_fixups);

    debug!(
        "Extracted {} entries into {} ({} excluded, {} skipped)",
        summary.entries_written,
        root.display(),
        summary.entries_excluded,
        summary.entries_skipped
    );

    Ok(summary)
}

/// Normalise an entry name into a path relative to the target.
///
/// Returns `None` when nothing is left after stripping.
fn sanitize(name: &Path, target: &Path, root: &Path, strip: usize) -> Result<Option<PathBuf>, Error> {
    let relative = if name.is_absolute() {
        name.strip_prefix(root)
            .or_else(|_| name.strip_prefix(target))
            .map_err(|_| Error::PathTraversal(name.to_owned()))?
    } else {
        name
    };

    let mut components = vec![];
    for component in relative.components() {
        match component {
            Component::Normal(part) => components.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(name.to_owned()));
            }
        }
    }

    if components.len() <= strip {
        return Ok(None);
    }

    Ok(Some(components[strip..].iter().collect()))
}

/// Resolve `relative` beneath the canonical `root`, refusing any
/// intermediate symlink that leads outside of it.
///
/// Missing parent directories are created when `create` is set,
/// otherwise they are reported as [`io::ErrorKind::NotFound`].
/// The final component is returned as-is and never followed.
pub(crate) fn resolve_inside(root: &Path, relative: &Path, create: bool) -> Result<PathBuf, Error> {
    let mut parts = vec![];
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            _ => return Err(Error::PathTraversal(relative.to_owned())),
        }
    }

    let Some((last, parents)) = parts.split_last() else {
        return Err(Error::PathTraversal(relative.to_owned()));
    };

    let mut current = root.to_path_buf();

    for part in parents {
        current.push(part);

        let write_error = |path: &Path, source| Error::PartialWrite {
            path: path.to_owned(),
            source,
        };

        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                let resolved = fs::canonicalize(&current).map_err(|e| write_error(&current, e))?;
                if !resolved.starts_with(root) {
                    return Err(Error::PathTraversal(relative.to_owned()));
                }
                if !resolved.is_dir() {
                    return Err(write_error(&current, not_a_directory()));
                }
                current = resolved;
            }
            Ok(_) => return Err(write_error(&current, not_a_directory())),
            Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                fs::create_dir(&current).map_err(|e| write_error(&current, e))?;
            }
            Err(e) => return Err(write_error(&current, e)),
        }
    }

    Ok(current.join(last))
}

/// Make `dest` a directory, returning `true` if it is a real one
/// whose permissions may be set
fn ensure_directory(dest: &Path) -> Result<bool, Error> {
    let write_error = |source| Error::PartialWrite {
        path: dest.to_owned(),
        source,
    };

    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => Ok(true),
        // An earlier symlink entry stands in for this directory
        Ok(meta) if meta.file_type().is_symlink() => Ok(false),
        Ok(_) => {
            fs::remove_file(dest).map_err(write_error)?;
            fs::create_dir(dest).map_err(write_error)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(dest).map_err(write_error)?;
            Ok(true)
        }
        Err(e) => Err(write_error(e)),
    }
}

/// Remove whatever non-directory sits at `dest` so writes never
/// go through an existing symlink
fn clear(dest: &Path) -> Result<(), Error> {
    let result = match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(dest),
        Ok(_) => fs::remove_file(dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };

    result.map_err(|source| Error::PartialWrite {
        path: dest.to_owned(),
        source,
    })
}

/// Hard link `source` to `dest`, copying when links are not permitted
fn hardlink_or_copy(source: &Path, dest: &Path) -> Result<(), Error> {
    let write_error = |source| Error::PartialWrite {
        path: dest.to_owned(),
        source,
    };

    let meta = fs::symlink_metadata(source).map_err(write_error)?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(source).map_err(write_error)?;
        return fs::os::unix::fs::symlink(target, dest).map_err(write_error);
    }

    if linkat(None, source, None, dest, LinkatFlags::NoSymlinkFollow).is_err() {
        trace!("Hard link to {source:?} refused, copying");
        fs::copy(source, dest).map_err(write_error)?;
    }

    Ok(())
}

/// Data errors come from the decoder, everything else from the filesystem
fn unpack_error(archive: &Path, dest: &Path, source: io::Error) -> Error {
    match source.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => Error::Corrupt(archive.to_owned(), source),
        _ => Error::PartialWrite {
            path: dest.to_owned(),
            source,
        },
    }
}

fn read_magic(file: &mut File) -> io::Result<Vec<u8>> {
    let mut magic = Vec::with_capacity(Compression::MAGIC_LEN);
    file.by_ref().take(Compression::MAGIC_LEN as u64).read_to_end(&mut magic)?;
    file.rewind()?;
    Ok(magic)
}

fn not_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory")
}

struct ProgressReader<'a, R> {
    reader: R,
    total: u64,
    read: u64,
    on_progress: &'a dyn Fn(Progress),
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.reader.read(buf)?;

        self.read += bytes as u64;

        (self.on_progress)(Progress {
            delta: bytes as u64,
            completed: self.read,
            total: Some(self.total),
        });

        Ok(bytes)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("reading archive {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("{0:?} is not a tar archive (plain, gzip, xz or zstd)")]
    UnsupportedFormat(PathBuf),
    #[error("corrupt archive {0:?}")]
    Corrupt(PathBuf, #[source] io::Error),
    #[error("entry {0:?} escapes the target directory")]
    PathTraversal(PathBuf),
    #[error("writing {path:?}")]
    PartialWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
