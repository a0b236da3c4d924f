//! Loads targets and submissions from JSON files at startup.
//!
//! Targets file:
//!
//! ```json
//! [
//!   { "name": "vault-a", "endpoint": "https://vault-a.internal/api", "max_concurrent_sessions": 1 },
//!   { "name": "vault-b", "endpoint": "https://vault-b.internal/api", "allow_concurrent_sessions": true }
//! ]
//! ```
//!
//! Submissions file (targets are referenced by name):
//!
//! ```json
//! [
//!   { "kind": "provision-resource", "target": "vault-a", "priority": "high",
//!     "payload": { "resource_name": "Finance" } }
//! ]
//! ```

use crate::server::service::Engine;
use anyhow::{Context, bail};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use std::path::Path;
use vaultops_core::{NewOperation, NewTarget, OperationKind, Priority, vaultops::OperationId};

/// One entry of the submissions file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submission {
    pub kind: OperationKind,
    /// Target name.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetSeedReport {
    pub registered: usize,
    /// Already present (from an earlier run against the same database).
    pub existing: usize,
    /// Already present, with the session limit changed to the file's.
    pub updated: usize,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_targets(path: &Path) -> anyhow::Result<Vec<NewTarget>> {
    read_json(path)
}

pub fn load_submissions(path: &Path) -> anyhow::Result<Vec<Submission>> {
    read_json(path)
}

/// Registers every target whose name is not already known. Known targets
/// keep their identity but take the session limit given in the file.
pub fn register_targets(
    engine: &Engine,
    targets: Vec<NewTarget>,
) -> anyhow::Result<TargetSeedReport> {
    let mut report = TargetSeedReport::default();
    for target in targets {
        if let Some(existing) = engine.find_target(&target.name)? {
            let limit = target
                .limit()
                .with_context(|| format!("invalid target `{}`", target.name))?;
            if existing.limit == limit {
                tracing::debug!(name = %target.name, "Target already registered");
                report.existing += 1;
            } else {
                engine.set_target_limit(existing.id, limit)?;
                tracing::info!(
                    name = %target.name,
                    from = %existing.limit,
                    to = %limit,
                    "Updated session limit of registered target"
                );
                report.updated += 1;
            }
            continue;
        }
        let name = target.name.clone();
        engine
            .register_target(target)
            .with_context(|| format!("invalid target `{name}`"))?;
        report.registered += 1;
    }
    Ok(report)
}

/// Submits every entry, stopping at the first one that is rejected.
pub fn submit_all(engine: &Engine, submissions: Vec<Submission>) -> anyhow::Result<Vec<OperationId>> {
    let mut ids = Vec::with_capacity(submissions.len());
    for (index, submission) in submissions.into_iter().enumerate() {
        let target_id = match &submission.target {
            Some(name) => match engine.find_target(name)? {
                Some(target) => Some(target.id),
                None => bail!("submission #{index}: unknown target `{name}`"),
            },
            None => None,
        };
        let request = NewOperation {
            kind: submission.kind,
            priority: submission.priority,
            target_id,
            payload: submission.payload,
        };
        let id = engine
            .submit(request)
            .with_context(|| format!("submission #{index} rejected"))?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::EngineConfig;
    use std::sync::Arc;
    use vaultops_core::{HandlerRegistry, MemoryStore, OperationStatus, SessionLimit};

    struct NoVault;

    #[async_trait::async_trait]
    impl vaultops_core::VaultApi for NoVault {
        async fn provision_resource(
            &self,
            _: &vaultops_core::TargetConnection,
            _: &vaultops_core::ProvisionResource,
            _: &vaultops_core::Credential,
        ) -> Result<(), vaultops_core::ExecutionError> {
            Ok(())
        }

        async fn grant_access(
            &self,
            _: &vaultops_core::TargetConnection,
            _: &vaultops_core::GrantAccess,
            _: &vaultops_core::Credential,
        ) -> Result<(), vaultops_core::ExecutionError> {
            Ok(())
        }

        async fn sync_subject(
            &self,
            _: &vaultops_core::TargetConnection,
            _: &vaultops_core::SyncSubject,
            _: &vaultops_core::Credential,
        ) -> Result<(), vaultops_core::ExecutionError> {
            Ok(())
        }

        async fn delete_resource(
            &self,
            _: &vaultops_core::TargetConnection,
            _: &vaultops_core::DeleteResource,
            _: &vaultops_core::Credential,
        ) -> Result<(), vaultops_core::ExecutionError> {
            Ok(())
        }
    }

    fn engine() -> Engine {
        Engine::builder(
            Arc::new(MemoryStore::new()),
            HandlerRegistry::with_vault_api(Arc::new(NoVault)),
        )
        .config(EngineConfig {
            num_workers: 1,
            ..EngineConfig::default()
        })
        .build()
    }

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn targets_are_registered_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "targets.json",
            r#"[
                {"name": "vault-a", "endpoint": "https://a", "max_concurrent_sessions": 1},
                {"name": "vault-b", "endpoint": "https://b", "allow_concurrent_sessions": true}
            ]"#,
        );
        let engine = engine();

        let first = register_targets(&engine, load_targets(&path).unwrap()).unwrap();
        assert_eq!(first.registered, 2);
        let second = register_targets(&engine, load_targets(&path).unwrap()).unwrap();
        assert_eq!(
            second,
            TargetSeedReport {
                registered: 0,
                existing: 2,
                updated: 0
            }
        );

        let b = engine.find_target("vault-b").unwrap().unwrap();
        assert_eq!(b.limit, SessionLimit::Unlimited);
    }

    #[test]
    fn changed_limits_are_applied_to_known_targets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let first = write(
            &dir,
            "targets.json",
            r#"[{"name": "vault-a", "endpoint": "https://a", "max_concurrent_sessions": 1}]"#,
        );
        register_targets(&engine, load_targets(&first).unwrap()).unwrap();
        let id = engine.find_target("vault-a").unwrap().unwrap().id;

        let second = write(
            &dir,
            "targets-2.json",
            r#"[{"name": "vault-a", "endpoint": "https://a", "max_concurrent_sessions": 3}]"#,
        );
        let report = register_targets(&engine, load_targets(&second).unwrap()).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.registered, 0);

        let target = engine.target(id).unwrap();
        assert_eq!(target.limit.max(), Some(3));
    }

    #[test]
    fn submissions_resolve_targets_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        engine
            .register_target(NewTarget::new("vault-a", "https://a"))
            .unwrap();
        let path = write(
            &dir,
            "submit.json",
            r#"[
                {"kind": "provision-resource", "target": "vault-a", "priority": "high",
                 "payload": {"resource_name": "Finance"}},
                {"kind": "delete-resource", "target": "vault-a",
                 "payload": {"resource_name": "Old"}}
            ]"#,
        );

        let ids = submit_all(&engine, load_submissions(&path).unwrap()).unwrap();
        assert_eq!(ids.len(), 2);
        let first = engine.operation(ids[0]).unwrap();
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.status, OperationStatus::Pending);
        assert_eq!(engine.operation(ids[1]).unwrap().priority, Priority::Normal);
    }

    #[test]
    fn unknown_target_names_are_rejected() {
        let engine = engine();
        let submissions = vec![Submission {
            kind: OperationKind::DeleteResource,
            target: Some("missing".into()),
            priority: Priority::Normal,
            payload: serde_json::json!({"resource_name": "x"}),
        }];
        let err = submit_all(&engine, submissions).unwrap_err();
        assert!(err.to_string().contains("unknown target `missing`"));
    }

    #[test]
    fn malformed_files_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.json", "{ not json");
        let err = load_targets(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
