//! Tokio runtime for the session reactor
//!
//! The reactor holds non-`Send` device handles, so everything runs on a
//! single-threaded runtime. Decodes still go to the blocking pool.

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

/// Threads kept for blocking decode work
const MAX_BLOCKING_THREADS: usize = 4;

/// Build the current-thread runtime the session runs on
pub fn build() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .thread_name("parley-decode")
        .build()
        .context("Failed to create Tokio runtime")
}
