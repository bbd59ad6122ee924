// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Parser;
use rootstrap::{
    catalog::{self, Release},
    checksum, env, Digest, Env,
};
use thiserror::Error;
use tui::Styled;

#[derive(Debug, Parser)]
#[command(about = "Check an archive's SHA-256")]
pub struct Command {
    #[arg(help = "Archive to check")]
    path: PathBuf,
    #[arg(
        long,
        value_name = "HEX",
        help = "Expected SHA-256 [default: looked up by file name in the built-in catalog]"
    )]
    digest: Option<Digest>,
}

pub fn handle(command: Command, env: Env) -> Result<(), Error> {
    let Command { path, digest } = command;

    let digest = match digest {
        Some(digest) => Some(digest),
        None => {
            let config = env.load_config()?;
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|file_name| builtin_digest(config.release(), file_name))
        }
    };

    let outcome = checksum::verify(&path, digest.as_ref())?;

    if outcome.verified {
        println!("{} {} sha256 {}", "OK".green(), path.display(), outcome.actual_digest);
    } else {
        println!(
            "{} {} sha256 {} (nothing to compare against)",
            "Unverified".yellow(),
            path.display(),
            outcome.actual_digest
        );
    }

    Ok(())
}

/// Digest of the built-in catalog entry named `file_name`
fn builtin_digest(release: &str, file_name: &str) -> Option<Digest> {
    let release = Release::builtin(release)?;

    let digest = release
        .entries()
        .find(|(variant, architecture, _)| catalog::file_name(release.version, *variant, *architecture) == file_name)
        .and_then(|(_, _, digest)| digest.parse().ok());
    digest
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("env")]
    Env(#[from] env::Error),
    #[error("verify")]
    Verify(#[from] checksum::Error),
}
