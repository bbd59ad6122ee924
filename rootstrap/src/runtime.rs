// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide single threaded tokio runtime
//!
//! Network transfers are driven from the current thread; blocking
//! work such as archive extraction is handed to [`unblock`].

use std::{
    future::Future,
    io,
    sync::{OnceLock, RwLock},
};

use tokio::runtime::{self, Handle};

static RUNTIME: OnceLock<RwLock<Option<runtime::Runtime>>> = OnceLock::new();

/// One-time initialisation of the runtime, kept alive by the returned [`Guard`]
pub fn init() -> io::Result<Guard> {
    let runtime = runtime::Builder::new_current_thread().enable_all().build()?;

    let lock = RUNTIME.get_or_init(Default::default);
    *lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(runtime);

    Ok(Guard)
}

/// Scoped token for the runtime, which is shut down on drop
#[must_use = "runtime is dropped with guard"]
pub struct Guard;

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(lock) = RUNTIME.get() {
            let runtime = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
            drop(runtime);
        }
    }
}

/// Run the provided future to completion on the runtime.
///
/// # Panics
///
/// If [`init`] was not called or its [`Guard`] was dropped
pub fn block_on<T, F>(task: F) -> T
where
    F: Future<Output = T>,
{
    let guard = RUNTIME
        .get()
        .expect("runtime initialized")
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let runtime = guard.as_ref().expect("runtime initialized");
    runtime.block_on(task)
}

/// Runs the provided function on an executor dedicated to blocking.
pub async fn unblock<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let handle = Handle::current();
    handle.spawn_blocking(f).await.expect("spawn blocking")
}
