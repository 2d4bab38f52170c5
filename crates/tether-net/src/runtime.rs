//! Shared Tokio runtime driving socket I/O.
//!
//! The TCP and UDP services expose a blocking API. Internally they run their
//! sockets on one process-wide multi-threaded runtime, created on first use,
//! and bridge into it with [`block_on`].
//!
//! `block_on` must not be called from inside an async context (a Tokio
//! worker thread); the services are meant to be driven from plain threads.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};

use crate::error::{NetError, Result};

/// Global runtime instance, or the reason it could not be built.
static GLOBAL_RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Configuration for the shared runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads. Defaults to the number of CPU cores.
    pub worker_threads: Option<usize>,
    /// Name prefix for runtime threads.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "tether-net".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    fn build(&self) -> std::result::Result<Runtime, String> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name(self.thread_name.clone()).enable_all();
        if let Some(threads) = self.worker_threads {
            builder.worker_threads(threads);
        }
        builder.build().map_err(|e| e.to_string())
    }
}

/// Initialize the shared runtime with a custom configuration.
///
/// Returns `false` if the runtime was already initialized.
pub fn init(config: RuntimeConfig) -> bool {
    let mut initialized = false;
    GLOBAL_RUNTIME.get_or_init(|| {
        initialized = true;
        config.build()
    });
    initialized
}

/// The shared runtime, created with defaults on first use.
pub fn runtime() -> Result<&'static Runtime> {
    GLOBAL_RUNTIME
        .get_or_init(|| RuntimeConfig::default().build())
        .as_ref()
        .map_err(|e| NetError::Runtime(e.clone()))
}

/// Run a future to completion on the shared runtime, blocking the caller.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    Ok(runtime()?.block_on(future))
}
