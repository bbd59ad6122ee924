// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;

use clap::Parser;
use rootstrap::{discover, env, pipeline, runtime, Env, Fetcher, Pipeline};
use thiserror::Error;
use tui::Styled;

use super::{print_archive, Reporter, Selection};

#[derive(Debug, Parser)]
#[command(about = "Fetch and verify a rootfs archive without extracting it")]
pub struct Command {
    #[command(flatten)]
    selection: Selection,
}

pub fn handle(command: Command, env: Env) -> Result<(), Error> {
    let Command { selection } = command;

    let config = env.load_config()?;
    let spec = selection.spec(&config)?;

    let pipeline = Pipeline::new(Fetcher::new(env.download_dir()).with_options(config.fetch_options()))
        .with_options(pipeline::Options {
            timeout: selection.timeout(&config),
        });

    println!("{} {}", "Fetching".bold(), spec.file_name());

    let _guard = runtime::init()?;

    let reporter = Reporter::new(spec.file_name());
    let result = runtime::block_on(pipeline.acquire(&spec, {
        let reporter = reporter.clone();
        move |event| reporter.report(event)
    }));
    reporter.finish();

    print_archive(&result?);

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("env")]
    Env(#[from] env::Error),
    #[error("release discovery")]
    Discovery(#[from] discover::Error),
    #[error("pipeline")]
    Pipeline(#[from] pipeline::Error),
    #[error("runtime")]
    Runtime(#[from] io::Error),
}
