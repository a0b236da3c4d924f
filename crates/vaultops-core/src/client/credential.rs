use crate::{ExecutionError, Ids, SharedClock, TargetConnection};
use std::sync::Arc;
use vaultops::{OperationId, SessionId, SessionToken, TargetId, TimeSource, TokenGenerator};

/// A credential scoped to one attempt of one operation.
///
/// `Debug` output never contains the token.
#[derive(Debug, Clone)]
pub struct Credential {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pub target_id: Option<TargetId>,
    pub issued_at: u64,
    token: SessionToken,
}

impl Credential {
    pub fn new(
        session_id: SessionId,
        operation_id: OperationId,
        target_id: Option<TargetId>,
        token: SessionToken,
        issued_at: u64,
    ) -> Self {
        Self {
            session_id,
            operation_id,
            target_id,
            issued_at,
            token,
        }
    }

    /// The bearer secret to present to the vault.
    pub fn token(&self) -> &SessionToken {
        &self.token
    }
}

/// Issues a fresh [`Credential`] for every attempt.
pub trait CredentialProvider: Send + Sync {
    /// # Errors
    ///
    /// An issuer that is temporarily unavailable should return a transient
    /// error so the attempt is retried.
    fn issue(
        &self,
        operation: OperationId,
        target: Option<&TargetConnection>,
    ) -> Result<Credential, ExecutionError>;
}

/// Mints credentials locally: a `ses_` session identifier plus a random
/// session token.
pub struct SessionCredentials {
    ids: Arc<Ids>,
    tokens: TokenGenerator,
    clock: SharedClock,
}

impl SessionCredentials {
    pub fn new(ids: Arc<Ids>, clock: SharedClock) -> Self {
        Self {
            ids,
            tokens: TokenGenerator::default(),
            clock,
        }
    }
}

impl CredentialProvider for SessionCredentials {
    fn issue(
        &self,
        operation: OperationId,
        target: Option<&TargetConnection>,
    ) -> Result<Credential, ExecutionError> {
        Ok(Credential::new(
            self.ids.session_id(),
            operation,
            target.map(|t| t.target_id),
            self.tokens.generate(),
            self.clock.current_millis(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_clock;

    #[test]
    fn every_issue_is_a_new_session() {
        let clock = system_clock();
        let ids = Arc::new(Ids::new(clock.clone()));
        let provider = SessionCredentials::new(ids.clone(), clock);
        let target = TargetConnection {
            target_id: ids.target_id(),
            name: "vault-a".into(),
            endpoint: "https://vault-a.internal".into(),
        };
        let op = ids.operation_id();

        let first = provider.issue(op, Some(&target)).unwrap();
        let second = provider.issue(op, Some(&target)).unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(!first.token().verify(second.token().as_str()));
        assert_eq!(first.target_id, Some(target.target_id));
        assert_eq!(first.operation_id, op);
        assert!(!format!("{first:?}").contains(first.token().as_str()));
    }
}
