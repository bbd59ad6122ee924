// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::{Args, CommandFactory, Parser};
use rootstrap::{
    catalog, discover,
    discover::Discovery,
    env,
    extract::{fixup, ExtractionPlan},
    pipeline::{Archive, Event},
    Architecture, ArtifactSpec, Config, Digest, Env, ExtractionSummary, Variant,
};
use thiserror::Error;
use tui::{HumanBytes, ProgressBar, Styled};
use url::Url;

mod extract;
mod fetch;
mod install;
mod list;
mod verify;
mod version;

#[derive(Debug, Parser)]
#[command(about = "Fetch, verify and unpack Kali NetHunter root filesystems")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short,
        long = "verbose",
        help = "Prints additional information about what rootstrap is doing",
        default_value = "false",
        global = true
    )]
    pub verbose: bool,
    #[arg(long, global = true, help = "Where downloaded archives are kept")]
    pub cache_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Load configuration from this directory only")]
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Install(install::Command),
    Fetch(fetch::Command),
    Verify(verify::Command),
    Extract(extract::Command),
    List(list::Command),
    Version(version::Command),
}

pub fn process() -> Result<(), Error> {
    let Command { global, subcommand } = Command::parse();

    init_logging(global.verbose);

    let subcommand = match subcommand {
        Some(Subcommand::Version(command)) => {
            version::handle(command);
            return Ok(());
        }
        subcommand => subcommand,
    };

    let env = Env::new(global.cache_dir, global.config_dir)?;

    if global.verbose {
        version::print();
        println!("config layers: {:?}", env.config.layers());
        println!("cache directory: {:?}", env.cache_dir);
    }

    match subcommand {
        Some(Subcommand::Install(command)) => install::handle(command, env)?,
        Some(Subcommand::Fetch(command)) => fetch::handle(command, env)?,
        Some(Subcommand::Verify(command)) => verify::handle(command, env)?,
        Some(Subcommand::Extract(command)) => extract::handle(command, env)?,
        Some(Subcommand::List(command)) => list::handle(command, env)?,
        Some(Subcommand::Version(command)) => version::handle(command),
        None => Command::command().print_help()?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    env_logger::Builder::new()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();
}

/// Which archive to fetch and how to trust it
#[derive(Debug, Args)]
pub struct Selection {
    #[arg(long, value_enum, default_value_t = Variant::Minimal, help = "Rootfs variant")]
    pub variant: Variant,
    #[arg(long, value_enum, help = "Rootfs architecture [default: host]")]
    pub arch: Option<Architecture>,
    #[arg(long, help = "Release to fetch [default: from config, else the built-in release]")]
    pub release: Option<String>,
    #[arg(
        long = "mirror",
        value_name = "URL",
        help = "Mirror base URL, can be passed multiple times and is tried in order"
    )]
    pub mirrors: Vec<Url>,
    #[arg(
        long = "url",
        value_name = "URL",
        help = "Full archive URL, bypasses the mirror layout. Can be passed multiple times"
    )]
    pub urls: Vec<Url>,
    #[arg(long, value_name = "HEX", help = "Expected SHA-256 of the archive")]
    pub digest: Option<Digest>,
    #[arg(long, value_name = "URL", help = "Checksum list to look the archive up in")]
    pub checksums: Option<Url>,
    #[arg(long, value_name = "BYTES", help = "Reject archives smaller than this")]
    pub minimum_size: Option<u64>,
    #[arg(long, help = "Scrape the mirror index for a newer release if no mirror has the archive")]
    pub discover: bool,
    #[arg(long, value_name = "SECS", help = "Give up after this many seconds")]
    pub timeout: Option<u64>,
}

impl Selection {
    /// Build the artifact descriptor, command line winning over config
    pub fn spec(&self, config: &Config) -> Result<ArtifactSpec, discover::Error> {
        let variant = self.variant;
        let architecture = self.arch.unwrap_or_else(Architecture::host);
        let release = self.release.as_deref().unwrap_or(config.release());

        let urls = if self.urls.is_empty() {
            let mirrors = if self.mirrors.is_empty() {
                config.mirrors()
            } else {
                self.mirrors.clone()
            };
            catalog::candidate_urls(&mirrors, release, variant, architecture)
        } else {
            self.urls.clone()
        };

        // The list stays set alongside a digest so a discovered release can be looked up
        let checksums = self.checksums.clone().or_else(|| config.checksums.clone());
        let digest = match (&self.digest, &self.checksums) {
            (Some(digest), _) => Some(digest.clone()),
            (None, Some(_)) => None,
            (None, None) => config.digest(release, variant, architecture),
        };

        let discovery = match config.discovery()? {
            Some(discovery) => Some(discovery),
            None if self.discover => Some(Discovery::nethunter()?),
            None => None,
        };

        Ok(ArtifactSpec::new(variant, architecture, urls)
            .with_digest(digest)
            .with_checksum_list(checksums)
            .with_minimum_size(self.minimum_size.unwrap_or(config.minimum_size()))
            .with_discovery(discovery))
    }

    pub fn timeout(&self, config: &Config) -> Option<Duration> {
        self.timeout.map(Duration::from_secs).or(config.timeout())
    }
}

/// How the archive is laid out on disk
#[derive(Debug, Args)]
pub struct Layout {
    #[arg(long, value_name = "N", help = "Leading path components to remove [default: 1]")]
    pub strip_components: Option<usize>,
    #[arg(
        long = "exclude",
        value_name = "GLOB",
        help = "Skip matching paths and everything below them, in addition to the defaults"
    )]
    pub excludes: Vec<String>,
    #[arg(long, help = "Skip the post-extraction repairs")]
    pub no_fixups: bool,
}

impl Layout {
    pub fn plan(&self, target: PathBuf, config: &Config) -> Result<ExtractionPlan, glob::PatternError> {
        let excludes = config.excludes();

        let plan = ExtractionPlan::new(target)
            .with_strip(self.strip_components.unwrap_or(config.strip_components()))
            .with_excludes(excludes.iter().chain(&self.excludes).map(String::as_str))?;

        if self.no_fixups {
            Ok(plan)
        } else {
            Ok(plan.with_fixups(fixup::rootfs()))
        }
    }
}

/// Single progress bar following a run from stage to stage
#[derive(Clone)]
pub struct Reporter {
    bar: ProgressBar,
    name: Arc<str>,
    stage: Arc<AtomicU8>,
}

impl Reporter {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            bar: ProgressBar::new_spinner().with_style(tui::spinner_style()),
            name: name.into(),
            stage: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn report(&self, event: Event) {
        let (stage, verb, progress) = match event {
            Event::Download(progress) => (1, "Downloading", Some(progress)),
            Event::Verify => (2, "Verifying", None),
            Event::Extract(progress) => (3, "Extracting", Some(progress)),
        };

        if self.stage.swap(stage, Ordering::Relaxed) != stage {
            let total = progress.and_then(|progress| progress.total);

            self.bar.reset();
            self.bar.set_style(match total {
                Some(_) => tui::bytes_style(),
                None => tui::spinner_style(),
            });
            self.bar.set_message(format!("{} {}", verb.blue(), (*self.name).bold()));
            self.bar.enable_steady_tick(Duration::from_millis(150));
        }

        if let Some(progress) = progress {
            if let Some(total) = progress.total {
                self.bar.set_length(total);
            }
            self.bar.set_position(progress.completed);
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

pub fn print_archive(archive: &Archive) {
    let download = &archive.download;
    let verification = &archive.verification;

    let origin = match &download.source {
        _ if download.was_cached => "(cached)".dim().to_string(),
        Some(url) if download.discovered => format!("from discovered release {url}"),
        Some(url) if download.resumed => format!("resumed from {url}"),
        Some(url) => format!("from {url}"),
        None => String::new(),
    };

    println!(
        "{} {} ({}) {origin}",
        "Fetched".green(),
        download.local_path.display(),
        HumanBytes(download.byte_size)
    );

    if verification.verified {
        println!("{} sha256 {}", "Verified".green(), verification.actual_digest);
    } else {
        println!(
            "{} sha256 {} (no published checksum)",
            "Unverified".yellow(),
            verification.actual_digest
        );
    }
}

pub fn print_extraction(target: &Path, summary: &ExtractionSummary) {
    println!(
        "{} {} entries into {} ({} excluded, {} skipped)",
        "Extracted".green(),
        summary.entries_written,
        target.display(),
        summary.entries_excluded,
        summary.entries_skipped
    );

    for (action, outcome) in &summary.fixups {
        if let fixup::FixupOutcome::Failed(reason) = outcome {
            println!("  {} {action}: {reason}", "!".yellow());
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("install")]
    Install(#[from] install::Error),
    #[error("fetch")]
    Fetch(#[from] fetch::Error),
    #[error("verify")]
    Verify(#[from] verify::Error),
    #[error("extract")]
    Extract(#[from] extract::Error),
    #[error("list")]
    List(#[from] list::Error),
    #[error("env")]
    Env(#[from] env::Error),
    #[error("io error")]
    Io(#[from] std::io::Error),
}
