//! The orchestration engine and its scheduling loop.
//!
//! ## Structure
//!
//! - [`handler`] - [`Engine`], the handle used to submit, inspect and cancel
//!   operations and to manage targets.
//! - [`dispatcher`] - the pass that claims slots and starts attempts.
//! - [`recorder`] - persists attempt outcomes and releases slots.

pub mod dispatcher;
pub mod handler;
pub mod recorder;

pub use handler::{Engine, EngineBuilder};

use core::time::Duration;
use vaultops_core::{Error, RecoveryPolicy, Result, RetryPolicy};

/// Scheduling knobs for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Most attempts running at once across all targets.
    pub num_workers: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub dispatch_interval: Duration,
    pub dispatch_batch_size: usize,
    pub shutdown_timeout: Duration,
    pub recovery: RecoveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            dispatch_interval: Duration::from_millis(250),
            dispatch_batch_size: 64,
            shutdown_timeout: Duration::from_secs(10),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Runs a store call on the blocking pool.
///
/// Store methods are synchronous and the SQLite store does file I/O under a
/// mutex, so async tasks never call them inline.
pub(crate) async fn blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .unwrap_or_else(|e| Err(Error::storage(format!("store task failed: {e}"))))
}
