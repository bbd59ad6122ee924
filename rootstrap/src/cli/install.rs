// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use clap::Parser;
use rootstrap::{discover, env, pipeline, runtime, Env, Fetcher, Pipeline};
use thiserror::Error;
use tui::Styled;

use super::{print_archive, print_extraction, Layout, Reporter, Selection};

#[derive(Debug, Parser)]
#[command(about = "Fetch, verify and extract a rootfs into a target directory")]
pub struct Command {
    #[command(flatten)]
    selection: Selection,
    #[command(flatten)]
    layout: Layout,
    #[arg(long, value_name = "DIR", help = "Directory to extract into")]
    target: Option<PathBuf>,
}

pub fn handle(command: Command, env: Env) -> Result<(), Error> {
    let Command {
        selection,
        layout,
        target,
    } = command;

    let config = env.load_config()?;
    let spec = selection.spec(&config)?;

    let target = match target.or_else(|| config.target.clone()) {
        Some(target) => target,
        None => env.default_target()?,
    };
    let plan = layout.plan(target, &config)?;

    let pipeline = Pipeline::new(Fetcher::new(env.download_dir()).with_options(config.fetch_options()))
        .with_options(pipeline::Options {
            timeout: selection.timeout(&config),
        });

    println!(
        "{} {} {} into {}",
        "Installing".bold(),
        spec.variant,
        spec.architecture,
        plan.target_directory.display()
    );

    let _guard = runtime::init()?;

    let reporter = Reporter::new(spec.file_name());
    let result = runtime::block_on(pipeline.run_with(&spec, &plan, {
        let reporter = reporter.clone();
        move |event| reporter.report(event)
    }));
    reporter.finish();

    let report = result?;

    print_archive(&report.archive);
    print_extraction(&plan.target_directory, &report.extraction);

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("release discovery")]
    Discovery(#[from] discover::Error),
    #[error("invalid exclude pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("env")]
    Env(#[from] env::Error),
    #[error("pipeline")]
    Pipeline(#[from] pipeline::Error),
    #[error("runtime")]
    Runtime(#[from] io::Error),
}
