// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Parser;
use rootstrap::{
    env, extract,
    pipeline::{lockfile, Event},
    Env,
};
use thiserror::Error;
use tui::Styled;

use super::{print_extraction, Layout, Reporter};

#[derive(Debug, Parser)]
#[command(about = "Safely extract a local rootfs archive")]
pub struct Command {
    #[arg(help = "Tarball to extract (plain, gzip, xz or zstd)")]
    archive: PathBuf,
    #[arg(help = "Directory to extract into")]
    target: PathBuf,
    #[command(flatten)]
    layout: Layout,
}

pub fn handle(command: Command, env: Env) -> Result<(), Error> {
    let Command {
        archive,
        target,
        layout,
    } = command;

    let config = env.load_config()?;
    let plan = layout.plan(target, &config)?;

    let _lock = lockfile::acquire(lockfile::path_for(&plan.target_directory))?;

    println!("{} {} into {}", "Extracting".bold(), archive.display(), plan.target_directory.display());

    let name = archive
        .file_name()
        .map_or_else(|| archive.display().to_string(), |name| name.to_string_lossy().into_owned());

    let reporter = Reporter::new(name);
    let result = extract::extract(&archive, &plan, |progress| reporter.report(Event::Extract(progress)));
    reporter.finish();

    print_extraction(&plan.target_directory, &result?);

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("env")]
    Env(#[from] env::Error),
    #[error("invalid exclude pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("lock")]
    Lock(#[from] lockfile::Error),
    #[error("extract")]
    Extract(#[from] extract::Error),
}
