// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::artifact::{Architecture, ArtifactSpec, Digest, Variant};
pub use self::config::Config;
pub use self::env::Env;
pub use self::extract::{ExtractionPlan, ExtractionSummary};
pub use self::fetch::{DownloadResult, Fetcher};
pub use self::pipeline::Pipeline;

pub mod artifact;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod discover;
pub mod env;
pub mod environment;
pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod request;
pub mod runtime;
