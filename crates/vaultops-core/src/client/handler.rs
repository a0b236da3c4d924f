use crate::{
    Credential, Error, ExecutionError, NewOperation, Operation, OperationKind, Result,
    TargetConnection, VaultApi,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// A payload shape with its own field checks.
pub trait Payload: DeserializeOwned {
    const KIND: OperationKind;

    /// # Errors
    ///
    /// Returns a human-readable reason when a field is unusable.
    fn check(&self) -> core::result::Result<(), String>;

    /// Decodes and checks a raw payload.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the payload has the wrong shape.
    fn decode(payload: &Value) -> core::result::Result<Self, String> {
        let decoded = Self::deserialize(payload)
            .map_err(|e| format!("invalid {} payload: {e}", Self::KIND))?;
        decoded.check()?;
        Ok(decoded)
    }
}

fn require(field: &str, value: &str) -> core::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("`{field}` must not be empty"))
    } else {
        Ok(())
    }
}

/// Create a secrets resource (safe, vault, folder) on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResource {
    pub resource_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Payload for ProvisionResource {
    const KIND: OperationKind = OperationKind::ProvisionResource;

    fn check(&self) -> core::result::Result<(), String> {
        require("resource_name", &self.resource_name)?;
        if self.retention_days == Some(0) {
            return Err("`retention_days` must be at least 1".into());
        }
        Ok(())
    }
}

/// Grant a member access to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantAccess {
    pub resource_name: String,
    pub member: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Payload for GrantAccess {
    const KIND: OperationKind = OperationKind::GrantAccess;

    fn check(&self) -> core::result::Result<(), String> {
        require("resource_name", &self.resource_name)?;
        require("member", &self.member)?;
        self.permissions
            .iter()
            .try_for_each(|p| require("permissions[]", p))
    }
}

/// Push a subject's (user or group) attributes to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSubject {
    pub subject: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Payload for SyncSubject {
    const KIND: OperationKind = OperationKind::SyncSubject;

    fn check(&self) -> core::result::Result<(), String> {
        require("subject", &self.subject)
    }
}

/// Remove a resource from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResource {
    pub resource_name: String,
}

impl Payload for DeleteResource {
    const KIND: OperationKind = OperationKind::DeleteResource;

    fn check(&self) -> core::result::Result<(), String> {
        require("resource_name", &self.resource_name)
    }
}

/// Everything a handler gets for one attempt.
pub struct ExecutionContext<'a> {
    pub operation: &'a Operation,
    pub target: Option<&'a TargetConnection>,
    pub credential: &'a Credential,
}

/// Runs one kind of operation.
///
/// New kinds are added by implementing this trait and registering the
/// handler; the scheduler never inspects kinds.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Whether submissions of this kind must name a target.
    fn requires_target(&self) -> bool {
        true
    }

    /// Checks a payload at submission time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the problem.
    fn validate(&self, payload: &Value) -> Result<()>;

    /// Performs one attempt. Must not retry internally.
    async fn execute(&self, ctx: ExecutionContext<'_>) -> core::result::Result<(), ExecutionError>;
}

macro_rules! vault_handler {
    ($(#[$meta:meta])* $name:ident, $payload:ty, $method:ident) => {
        $(#[$meta])*
        pub struct $name {
            api: Arc<dyn VaultApi>,
        }

        impl $name {
            pub fn new(api: Arc<dyn VaultApi>) -> Self {
                Self { api }
            }
        }

        #[async_trait]
        impl OperationHandler for $name {
            fn kind(&self) -> OperationKind {
                <$payload as Payload>::KIND
            }

            fn validate(&self, payload: &Value) -> Result<()> {
                <$payload>::decode(payload)
                    .map(drop)
                    .map_err(Error::validation)
            }

            async fn execute(
                &self,
                ctx: ExecutionContext<'_>,
            ) -> core::result::Result<(), ExecutionError> {
                let request =
                    <$payload>::decode(&ctx.operation.payload).map_err(ExecutionError::Permanent)?;
                let target = ctx
                    .target
                    .ok_or_else(|| ExecutionError::permanent("operation has no target"))?;
                self.api.$method(target, &request, ctx.credential).await
            }
        }
    };
}

vault_handler!(
    /// Runs `provision-resource` through [`VaultApi::provision_resource`].
    ProvisionResourceHandler, ProvisionResource, provision_resource
);
vault_handler!(
    /// Runs `grant-access` through [`VaultApi::grant_access`].
    GrantAccessHandler, GrantAccess, grant_access
);
vault_handler!(
    /// Runs `sync-subject` through [`VaultApi::sync_subject`].
    SyncSubjectHandler, SyncSubject, sync_subject
);
vault_handler!(
    /// Runs `delete-resource` through [`VaultApi::delete_resource`].
    DeleteResourceHandler, DeleteResource, delete_resource
);

/// Maps each operation kind to its handler. Built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the four built-in kinds wired to `api`.
    pub fn with_vault_api(api: Arc<dyn VaultApi>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ProvisionResourceHandler::new(api.clone())));
        registry.register(Arc::new(GrantAccessHandler::new(api.clone())));
        registry.register(Arc::new(SyncSubjectHandler::new(api.clone())));
        registry.register(Arc::new(DeleteResourceHandler::new(api)));
        registry
    }

    /// Registers `handler` for its kind, returning any handler it replaces.
    pub fn register(
        &mut self,
        handler: Arc<dyn OperationHandler>,
    ) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.insert(handler.kind(), handler)
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Arc<dyn OperationHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.handlers.keys().copied()
    }

    /// Checks a submission against its handler: the kind must be registered,
    /// the target present when required, and the payload well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`].
    pub fn validate(&self, request: &NewOperation) -> Result<()> {
        let handler = self.get(request.kind).ok_or_else(|| {
            Error::validation(format!("no handler registered for `{}`", request.kind))
        })?;
        if handler.requires_target() && request.target_id.is_none() {
            return Err(Error::validation(format!(
                "`{}` operations require a target",
                request.kind
            )));
        }
        handler.validate(&request.payload)
    }
}
