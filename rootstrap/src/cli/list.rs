// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use rootstrap::{
    catalog::{self, Release},
    env, Architecture, Env,
};
use thiserror::Error;
use tui::Styled;

#[derive(Debug, Parser)]
#[command(about = "List the archives of a built-in release")]
pub struct Command {
    #[arg(long, help = "Release to list [default: from config, else the built-in release]")]
    release: Option<String>,
}

pub fn handle(command: Command, env: Env) -> Result<(), Error> {
    let config = env.load_config()?;
    let version = command.release.as_deref().unwrap_or(config.release());

    let release = Release::builtin(version).ok_or_else(|| Error::UnknownRelease(version.to_owned()))?;
    let host = Architecture::host();

    println!("{} {}", "Release".bold(), release.version);

    for (variant, architecture, digest) in release.entries() {
        let marker = if architecture == host { "*" } else { " " };

        println!(
            "{marker} {variant:<8} {architecture:<6} {}  {}",
            catalog::file_name(release.version, variant, architecture),
            digest.dim()
        );
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no built-in catalog for release {0}")]
    UnknownRelease(String),
    #[error("env")]
    Env(#[from] env::Error),
}
