//! Error types for the orchestration core.
//!
//! This module defines the central `Error` enum shared by the stores, the
//! handler registry and the engine built on top of them. Execution failures
//! reported by vault clients are not errors of this kind: they are values
//! ([`ExecutionError`](crate::ExecutionError)) that the state machine turns
//! into transitions.
//!
//! ## Error Cases
//! - `Validation`: A submission or target definition was rejected.
//! - `OperationNotFound` / `TargetNotFound`: An unknown identifier was used.
//! - `Transition`: A state change was requested that the state machine
//!   forbids (for example, touching a terminal operation).
//! - `Storage`: The persistence layer failed.
//! - `ServiceShutdown`: A request arrived while the engine was shutting down.

use crate::TransitionError;
use vaultops::{OperationId, TargetId};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the orchestration core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The request was malformed and was rejected before it was stored.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("Target not found: {0}")]
    TargetNotFound(TargetId),

    /// The state machine refused the requested change.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The underlying store failed.
    #[error("Storage error: {context}")]
    Storage { context: String },

    /// The engine is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn storage(context: impl Into<String>) -> Self {
        Self::Storage {
            context: context.into(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(format!("payload encoding: {err}"))
    }
}

impl From<vaultops::Error> for Error {
    fn from(err: vaultops::Error) -> Self {
        Self::validation(err.to_string())
    }
}
