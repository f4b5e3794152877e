//! The human-in-the-loop approval queue (spec §4.5.2).
//!
//! Creating an approval persists the record and parks the calling task on a
//! `oneshot` waiter keyed by approval id. `resolve` completes the waiter;
//! if nobody resolves it before `timeout_deadline`, `wait` applies the
//! policy's configured `timeout_effect` itself and resolves the record to
//! `Timeout` in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::models::approval::{ApprovalRecord, ApprovalStatus};
use crate::models::policy::TimeoutEffect;
use crate::models::random_id;
use crate::trace_store::TraceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("unknown approval: {0}")]
    NotFound(String),
    #[error("approval {0} is not pending")]
    NotPending(String),
}

pub struct ApprovalQueue {
    store: Arc<TraceStore>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ApprovalStatus>>>,
}

impl ApprovalQueue {
    pub fn new(store: Arc<TraceStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Persists a new pending approval and returns its id. Call [`Self::wait`]
    /// separately to block on the outcome — callers that only need to enqueue
    /// (e.g. a management-API listing) don't pay for a waiter they won't use.
    pub async fn create(
        &self,
        session_id: &str,
        trace_id: &str,
        policy_name: &str,
        action_summary: serde_json::Value,
        timeout: Duration,
        timeout_effect: TimeoutEffect,
    ) -> Result<ApprovalRecord, sqlx::Error> {
        let now = Utc::now();
        let record = ApprovalRecord {
            id: random_id("apr", 16),
            session_id: session_id.to_string(),
            trace_id: trace_id.to_string(),
            policy_name: policy_name.to_string(),
            action_summary,
            created_time: now,
            timeout_deadline: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            status: ApprovalStatus::Pending,
            timeout_effect,
            approver: None,
            resolved_time: None,
        };
        self.store.insert_approval(&record).await?;
        Ok(record)
    }

    /// Blocks until the approval is resolved or its deadline passes, applying
    /// `timeout_effect` on expiry. Safe to drop: if the waiting task is
    /// cancelled, the sender is dropped and a later `resolve` call simply
    /// finds no receiver and is a no-op on the in-memory side (the store
    /// write still lands).
    pub async fn wait(&self, record: &ApprovalRecord) -> ApprovalOutcome {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(record.id.clone(), tx);

        let deadline = record
            .timeout_deadline
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(ApprovalStatus::Approved)) => ApprovalOutcome::Approved,
            Ok(Ok(_)) => ApprovalOutcome::Denied,
            Ok(Err(_)) => ApprovalOutcome::TimedOut,
            Err(_) => ApprovalOutcome::TimedOut,
        };

        self.waiters.lock().remove(&record.id);

        if matches!(outcome, ApprovalOutcome::TimedOut) {
            let status = match record.timeout_effect {
                TimeoutEffect::Allow => ApprovalStatus::Approved,
                TimeoutEffect::Deny => ApprovalStatus::Timeout,
            };
            if let Err(e) = self.store.resolve_approval(&record.id, status, None).await {
                tracing::error!(error = %e, approval_id = %record.id, "failed to persist approval timeout");
            }
            return match record.timeout_effect {
                TimeoutEffect::Allow => ApprovalOutcome::Approved,
                TimeoutEffect::Deny => ApprovalOutcome::TimedOut,
            };
        }

        outcome
    }

    /// Resolves a pending approval by id, waking its waiter if one is parked.
    pub async fn resolve(
        &self,
        id: &str,
        approve: bool,
        approver: Option<&str>,
    ) -> Result<(), ApprovalError> {
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };

        let record = self
            .store
            .get_approval(id)
            .await
            .map_err(|_| ApprovalError::NotFound(id.to_string()))?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        if record.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending(id.to_string()));
        }

        let moved = self
            .store
            .resolve_approval(id, status, approver)
            .await
            .map_err(|_| ApprovalError::NotFound(id.to_string()))?;
        if !moved {
            return Err(ApprovalError::NotPending(id.to_string()));
        }

        if let Some(tx) = self.waiters.lock().remove(id) {
            let _ = tx.send(status);
        }
        Ok(())
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalRecord>, sqlx::Error> {
        self.store.list_pending_approvals().await
    }

    pub async fn list_all(&self) -> Result<Vec<ApprovalRecord>, sqlx::Error> {
        self.store.list_approvals().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRecord>, sqlx::Error> {
        self.store.get_approval(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> Arc<ApprovalQueue> {
        let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
        ApprovalQueue::new(store)
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_as_approved() {
        let queue = queue().await;
        let record = queue
            .create(
                "ses-1",
                "trc-1",
                "policy-x",
                serde_json::json!({}),
                Duration::from_secs(30),
                TimeoutEffect::Deny,
            )
            .await
            .unwrap();

        let id = record.id.clone();
        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.wait(&record).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.resolve(&id, true, Some("alice")).await.unwrap();

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn timeout_applies_configured_effect() {
        let queue = queue().await;
        let record = queue
            .create(
                "ses-1",
                "trc-1",
                "policy-x",
                serde_json::json!({}),
                Duration::from_millis(20),
                TimeoutEffect::Allow,
            )
            .await
            .unwrap();

        let outcome = queue.wait(&record).await;
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn resolving_twice_errors() {
        let queue = queue().await;
        let record = queue
            .create(
                "ses-1",
                "trc-1",
                "policy-x",
                serde_json::json!({}),
                Duration::from_secs(30),
                TimeoutEffect::Deny,
            )
            .await
            .unwrap();

        queue.resolve(&record.id, true, None).await.unwrap();
        let err = queue.resolve(&record.id, true, None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending(_)));
    }
}
