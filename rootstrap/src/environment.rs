// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

/// Program name, used for config and cache directories
pub const PROGRAM: &str = env!("CARGO_PKG_NAME");
/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Buffer size used when reading a file, 16KiB
pub const FILE_READ_BUFFER_SIZE: usize = 16 * 1024;
/// Buffer size used when decompressing an archive, 1MiB
pub const ARCHIVE_READ_BUFFER_SIZE: usize = 1024 * 1024;
/// Retries after the first attempt of a transfer
pub const DEFAULT_RETRIES: u32 = 3;
/// Backoff unit, multiplied by the attempt number
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Anything smaller is assumed to be an error page, not a rootfs
pub const DEFAULT_MINIMUM_SIZE: u64 = 50_000_000;
/// Rootfs tarballs wrap their content in a single top-level directory
pub const DEFAULT_STRIP_COMPONENTS: usize = 1;
