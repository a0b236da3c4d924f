//! Server-side components of the vaultops engine.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration.
//! - [`pool`] - the bounded worker pool and the per-attempt executor.
//! - [`service`] - the [`Engine`](service::Engine) handle, dispatcher and
//!   outcome recorder.
//! - [`vault`] - the HTTP implementation of the vault client contract.
//! - [`seed`] - JSON target and submission files.
//! - [`telemetry`] - console logging and optional OpenTelemetry export.

pub mod config;
pub mod pool;
pub mod seed;
pub mod service;
pub mod telemetry;
pub mod vault;
