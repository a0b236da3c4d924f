//! Operation and target records.
//!
//! Timestamps are milliseconds since the Unix epoch, taken from the engine's
//! [`Clock`](crate::Clock). Operations refer to their target by identifier
//! only; the target record owns the slot counter.

use crate::{Error, Result};
use core::{fmt, num::NonZeroU32, str::FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vaultops::{OperationId, TargetId};

/// The administrative actions the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    ProvisionResource,
    GrantAccess,
    SyncSubject,
    DeleteResource,
}

impl OperationKind {
    pub const ALL: [Self; 4] = [
        Self::ProvisionResource,
        Self::GrantAccess,
        Self::SyncSubject,
        Self::DeleteResource,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProvisionResource => "provision-resource",
            Self::GrantAccess => "grant-access",
            Self::SyncSubject => "sync-subject",
            Self::DeleteResource => "delete-resource",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown operation kind `{s}`")))
    }
}

/// Scheduling priority. Declaration order is ascending, so `Ord` sorts
/// `Low < Normal < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Normal, Self::Medium, Self::High];

    /// Numeric rank persisted by stores; higher dispatches first.
    pub const fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(usize::from(rank)).copied()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown priority `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl OperationStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Retrying,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// `succeeded` and `failed` never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown status `{s}`")))
    }
}

/// Why a failed operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The vault rejected the request with a permanent error.
    Rejected,
    /// The final allowed attempt ended in a transient failure.
    RetriesExhausted,
    /// An operator cancelled the operation.
    Cancelled,
}

impl FailureReason {
    pub const ALL: [Self; 3] = [Self::Rejected, Self::RetriesExhausted, Self::Cancelled];

    /// Stable key used by stores.
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_key() == key)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rejected => "rejected",
            Self::RetriesExhausted => "retries exhausted",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A queued administrative action and its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub priority: Priority,
    pub target_id: Option<TargetId>,
    pub payload: Value,
    pub status: OperationStatus,
    pub attempt_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
    /// Earliest dispatch time while backing off after a transient failure.
    pub not_before: Option<u64>,
    pub last_error: Option<String>,
    pub failure: Option<FailureReason>,
    /// Set when a running operation is cancelled; the executor honours it.
    pub cancel_requested: bool,
}

impl Operation {
    pub fn new(id: OperationId, request: NewOperation, now: u64) -> Self {
        Self {
            id,
            kind: request.kind,
            priority: request.priority,
            target_id: request.target_id,
            payload: request.payload,
            status: OperationStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            not_before: None,
            last_error: None,
            failure: None,
            cancel_requested: false,
        }
    }
}

/// A submission, before it is assigned an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub kind: OperationKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub payload: Value,
}

impl NewOperation {
    pub fn new(kind: OperationKind, target_id: TargetId, payload: Value) -> Self {
        Self {
            kind,
            priority: Priority::default(),
            target_id: Some(target_id),
            payload,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// How many operations may run against one target at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Option<u32>", into = "Option<u32>")]
pub enum SessionLimit {
    Bounded(NonZeroU32),
    Unlimited,
}

impl SessionLimit {
    pub const SINGLE: Self = Self::Bounded(NonZeroU32::MIN);

    /// # Errors
    ///
    /// Returns [`Error::Validation`] for zero.
    pub fn bounded(max: u32) -> Result<Self> {
        NonZeroU32::new(max)
            .map(Self::Bounded)
            .ok_or_else(|| Error::validation("max_concurrent_sessions must be at least 1"))
    }

    /// `allow_concurrent_sessions = true` lifts the limit; `false` is one
    /// session at a time.
    pub const fn from_allow_concurrent(allow: bool) -> Self {
        if allow { Self::Unlimited } else { Self::SINGLE }
    }

    pub const fn max(self) -> Option<u32> {
        match self {
            Self::Bounded(n) => Some(n.get()),
            Self::Unlimited => None,
        }
    }

    /// Returns `true` if one more session fits next to `in_flight`.
    pub const fn admits(self, in_flight: u32) -> bool {
        match self {
            Self::Bounded(n) => in_flight < n.get(),
            Self::Unlimited => true,
        }
    }
}

impl Default for SessionLimit {
    fn default() -> Self {
        Self::SINGLE
    }
}

impl TryFrom<Option<u32>> for SessionLimit {
    type Error = Error;

    fn try_from(value: Option<u32>) -> Result<Self> {
        value.map_or(Ok(Self::Unlimited), Self::bounded)
    }
}

impl From<SessionLimit> for Option<u32> {
    fn from(limit: SessionLimit) -> Self {
        limit.max()
    }
}

impl fmt::Display for SessionLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// An external vault instance and its concurrency budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub endpoint: String,
    pub limit: SessionLimit,
    /// Operations currently `running` against this target.
    pub in_flight: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Target {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the definition is incomplete or
    /// specifies its limit twice.
    pub fn new(id: TargetId, request: NewTarget, now: u64) -> Result<Self> {
        let limit = request.limit()?;
        if request.name.trim().is_empty() {
            return Err(Error::validation("target name must not be empty"));
        }
        if request.endpoint.trim().is_empty() {
            return Err(Error::validation("target endpoint must not be empty"));
        }
        Ok(Self {
            id,
            name: request.name,
            endpoint: request.endpoint,
            limit,
            in_flight: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub const fn has_capacity(&self) -> bool {
        self.limit.admits(self.in_flight)
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.has_capacity() {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// A target definition as supplied by an administrator.
///
/// The limit is given either as `max_concurrent_sessions` or as
/// `allow_concurrent_sessions`; neither means one session at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTarget {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub max_concurrent_sessions: Option<u32>,
    #[serde(default)]
    pub allow_concurrent_sessions: Option<bool>,
}

impl NewTarget {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_sessions(mut self, max: u32) -> Self {
        self.max_concurrent_sessions = Some(max);
        self
    }

    #[must_use]
    pub fn with_concurrent_sessions(mut self, allow: bool) -> Self {
        self.allow_concurrent_sessions = Some(allow);
        self
    }

    /// Resolves the configured limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when both forms are given or the numeric
    /// limit is zero.
    pub fn limit(&self) -> Result<SessionLimit> {
        match (self.max_concurrent_sessions, self.allow_concurrent_sessions) {
            (Some(_), Some(_)) => Err(Error::validation(
                "set either max_concurrent_sessions or allow_concurrent_sessions, not both",
            )),
            (Some(max), None) => SessionLimit::bounded(max),
            (None, Some(allow)) => Ok(SessionLimit::from_allow_concurrent(allow)),
            (None, None) => Ok(SessionLimit::SINGLE),
        }
    }
}

/// Selects operations when listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub target_id: Option<TargetId>,
}

impl OperationFilter {
    pub fn matches(&self, op: &Operation) -> bool {
        self.status.is_none_or(|s| s == op.status)
            && self.target_id.is_none_or(|t| op.target_id == Some(t))
    }
}

/// Operation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub retrying: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: OperationStatus) {
        *self.slot(status) += 1;
    }

    pub fn add(&mut self, status: OperationStatus, count: u64) {
        *self.slot(status) += count;
    }

    fn slot(&mut self, status: OperationStatus) -> &mut u64 {
        match status {
            OperationStatus::Pending => &mut self.pending,
            OperationStatus::Running => &mut self.running,
            OperationStatus::Retrying => &mut self.retrying,
            OperationStatus::Succeeded => &mut self.succeeded,
            OperationStatus::Failed => &mut self.failed,
        }
    }

    /// Operations that have not reached a terminal state.
    pub const fn active(&self) -> u64 {
        self.pending + self.running + self.retrying
    }

    pub const fn total(&self) -> u64 {
        self.active() + self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_orders_high_first_when_reversed() {
        let mut levels = vec![Priority::Normal, Priority::High, Priority::Low, Priority::Medium];
        levels.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            levels,
            [Priority::High, Priority::Medium, Priority::Normal, Priority::Low]
        );
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(4), None);
    }

    #[test]
    fn kinds_use_kebab_case_names() {
        for kind in OperationKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.as_str()));
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("provision_resource".parse::<OperationKind>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(!OperationStatus::Retrying.is_terminal());
    }

    #[test]
    fn retries_exhausted_reads_naturally() {
        assert_eq!(FailureReason::RetriesExhausted.to_string(), "retries exhausted");
        assert_eq!(
            FailureReason::from_key("retries_exhausted"),
            Some(FailureReason::RetriesExhausted)
        );
    }

    #[test]
    fn limit_forms_resolve() {
        let base = NewTarget::new("vault-a", "https://vault-a.internal");
        assert_eq!(base.limit().unwrap(), SessionLimit::SINGLE);
        assert_eq!(
            base.clone().with_concurrent_sessions(true).limit().unwrap(),
            SessionLimit::Unlimited
        );
        assert_eq!(
            base.clone().with_concurrent_sessions(false).limit().unwrap(),
            SessionLimit::SINGLE
        );
        assert_eq!(base.clone().with_max_sessions(4).limit().unwrap().max(), Some(4));
        assert!(base.clone().with_max_sessions(0).limit().is_err());
        assert!(
            base.with_max_sessions(2)
                .with_concurrent_sessions(true)
                .limit()
                .is_err()
        );
    }

    #[test]
    fn limit_serializes_as_optional_number() {
        assert_eq!(serde_json::to_value(SessionLimit::Unlimited).unwrap(), json!(null));
        assert_eq!(
            serde_json::from_value::<SessionLimit>(json!(3)).unwrap().max(),
            Some(3)
        );
        assert!(serde_json::from_value::<SessionLimit>(json!(0)).is_err());
    }

    #[test]
    fn bounded_target_refuses_slots_beyond_limit() {
        let ids = vaultops::IdGenerator::new(vaultops::MonotonicClock::default());
        let mut target = Target::new(
            ids.target_id(),
            NewTarget::new("vault-a", "https://vault-a.internal").with_max_sessions(2),
            0,
        )
        .unwrap();
        assert!(target.try_acquire());
        assert!(target.try_acquire());
        assert!(!target.try_acquire());
        assert_eq!(target.in_flight, 2);
        target.release();
        assert!(target.try_acquire());
    }

    #[test]
    fn target_definition_is_validated() {
        let ids = vaultops::IdGenerator::new(vaultops::MonotonicClock::default());
        assert!(Target::new(ids.target_id(), NewTarget::new(" ", "https://x"), 0).is_err());
        assert!(Target::new(ids.target_id(), NewTarget::new("x", ""), 0).is_err());
    }

    #[test]
    fn stats_count_active_operations() {
        let mut stats = QueueStats::default();
        stats.record(OperationStatus::Pending);
        stats.record(OperationStatus::Retrying);
        stats.add(OperationStatus::Succeeded, 3);
        assert_eq!(stats.active(), 2);
        assert_eq!(stats.total(), 5);
    }
}
