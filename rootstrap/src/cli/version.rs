// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use rootstrap::{catalog, environment, Architecture};

#[derive(Debug, Parser)]
#[command(about = "Print version info and exit")]
pub struct Command {
    #[arg(
        long = "full",
        help = "Print the full build and version info",
        default_value = "false"
    )]
    full: bool,
}

pub fn handle(command: Command) {
    if command.full {
        print_full()
    } else {
        print()
    }
}

/// Print program version
pub fn print() {
    println!("{} {}", environment::PROGRAM, environment::VERSION);
}

/// Print additional build information
pub fn print_full() {
    println!(
        "{} {} (host {}, built-in release {})",
        environment::PROGRAM,
        environment::VERSION,
        Architecture::host(),
        catalog::DEFAULT_RELEASE
    );
}
