//! The contract between the engine and the external vault.
//!
//! The engine never talks to a vault directly. Each [`OperationKind`] has an
//! [`OperationHandler`] that decodes the payload and calls one capability of
//! a [`VaultApi`]. Handlers report failures as [`ExecutionError`] values,
//! already classified as permanent or transient.
//!
//! [`OperationKind`]: crate::OperationKind

mod credential;
mod handler;

pub use credential::*;
pub use handler::*;

use crate::{Outcome, Target};
use async_trait::async_trait;
use vaultops::TargetId;

/// A failed attempt, classified for the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Retrying cannot help (rejected request, bad payload, missing object).
    #[error("{0}")]
    Permanent(String),

    /// Worth retrying later (network trouble, timeout, target busy).
    #[error("{0}")]
    Transient(String),
}

impl ExecutionError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ExecutionError> for Outcome {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Permanent(message) => Self::PermanentFailure(message),
            ExecutionError::Transient(message) => Self::TransientFailure(message),
        }
    }
}

/// What an executor needs to reach a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConnection {
    pub target_id: TargetId,
    pub name: String,
    pub endpoint: String,
}

impl From<&Target> for TargetConnection {
    fn from(target: &Target) -> Self {
        Self {
            target_id: target.id,
            name: target.name.clone(),
            endpoint: target.endpoint.clone(),
        }
    }
}

/// The capabilities the engine needs from a vault.
///
/// Implementations must map their failures onto [`ExecutionError`]. None of
/// these calls should retry internally; the engine schedules retries.
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn provision_resource(
        &self,
        target: &TargetConnection,
        request: &ProvisionResource,
        credential: &Credential,
    ) -> Result<(), ExecutionError>;

    async fn grant_access(
        &self,
        target: &TargetConnection,
        request: &GrantAccess,
        credential: &Credential,
    ) -> Result<(), ExecutionError>;

    async fn sync_subject(
        &self,
        target: &TargetConnection,
        request: &SyncSubject,
        credential: &Credential,
    ) -> Result<(), ExecutionError>;

    async fn delete_resource(
        &self,
        target: &TargetConnection,
        request: &DeleteResource,
        credential: &Credential,
    ) -> Result<(), ExecutionError>;
}
