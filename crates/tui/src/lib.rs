// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Terminal presentation shared by the rootstrap CLI

pub use self::reexport::*;
pub use self::styled::Styled;

mod styled;

/// Characters used to draw progress bars
pub const PROGRESS_CHARS: &str = "■≡=- ";
/// Spinner animation frames
pub const TICK_CHARS: &str = "--=≡■≡=--";

/// Style for a transfer of known size
pub fn bytes_style() -> ProgressStyle {
    ProgressStyle::with_template(" {spinner} {wide_msg} |{bar:20.cyan/blue}| {bytes:>10}/{total_bytes:<10} {binary_bytes_per_sec:>.dim} ")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS)
        .tick_chars(TICK_CHARS)
}

/// Style for work without a meaningful total
pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(" {spinner} {wide_msg} ")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS)
}

mod reexport {
    pub use indicatif::*;
}
