//! Alert manager (spec §4.5.3): turns a [`Violation`] from a policy
//! terminate/deny, the kill switch, or a detector into a persisted,
//! deduplicated, dispatched [`Alert`].
//!
//! Dedup key is `"<kind>|<agent_id>|<session_id>"`; a key seen again inside
//! `dedup_ttl` (default 5 minutes) is suppressed — persisted as a violation
//! row for the audit trail, but not redispatched. The dedup map itself is
//! pruned at twice the TTL so it doesn't grow unbounded under many distinct
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::models::alert::{Alert, Violation};
use crate::models::random_id;
use crate::trace_store::TraceStore;

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

struct DedupEntry {
    last_sent: chrono::DateTime<Utc>,
}

pub struct AlertManager {
    store: Arc<TraceStore>,
    sinks: Vec<Arc<dyn AlertSink>>,
    dedup: Mutex<HashMap<String, DedupEntry>>,
    dedup_ttl: Duration,
}

impl AlertManager {
    pub fn new(store: Arc<TraceStore>, sinks: Vec<Arc<dyn AlertSink>>, dedup_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            sinks,
            dedup: Mutex::new(HashMap::new()),
            dedup_ttl,
        })
    }

    /// Persists the violation unconditionally, then dispatches to all sinks
    /// unless the dedup key was seen within `dedup_ttl`. Sink failures are
    /// logged, never propagated — a notification outage must not affect the
    /// governed request path (spec §4.5.3, "best-effort").
    pub async fn raise(&self, violation: Violation) {
        let dedup_key = Alert::dedup_key(
            &violation.kind,
            &violation.agent_id,
            &violation.session_id,
        );
        let alert_id = random_id("alt", 16);

        if let Err(e) = self.store.insert_violation(&alert_id, &violation).await {
            tracing::error!(error = %e, kind = %violation.kind, "failed to persist violation");
        }

        let suppressed = {
            let mut dedup = self.dedup.lock();
            self.prune_locked(&mut dedup);
            let now = Utc::now();
            match dedup.get(&dedup_key) {
                Some(entry)
                    if now.signed_duration_since(entry.last_sent).to_std().unwrap_or_default()
                        < self.dedup_ttl =>
                {
                    true
                }
                _ => {
                    dedup.insert(dedup_key, DedupEntry { last_sent: now });
                    false
                }
            }
        };

        if suppressed {
            tracing::debug!(kind = %violation.kind, "alert suppressed by dedup window");
            return;
        }

        let alert = Alert::from_violation(alert_id, violation);
        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert).await {
                tracing::warn!(error = %e, sink = sink.name(), alert_id = %alert.id, "alert dispatch failed");
            }
        }
    }

    fn prune_locked(&self, dedup: &mut HashMap<String, DedupEntry>) {
        let cutoff = self.dedup_ttl.saturating_mul(2);
        let now = Utc::now();
        dedup.retain(|_, entry| {
            now.signed_duration_since(entry.last_sent).to_std().unwrap_or_default() < cutoff
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alert::Severity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl AlertSink for CountingSink {
        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn violation(session_id: &str) -> Violation {
        Violation {
            kind: "loop".to_string(),
            severity: Severity::High,
            agent_id: "agent-1".to_string(),
            session_id: session_id.to_string(),
            policy_name: None,
            action_type: None,
            message: "repeated action".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_within_ttl_is_suppressed() {
        let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let manager = AlertManager::new(
            store,
            vec![Arc::new(CountingSink(count.clone()))],
            Duration::from_secs(300),
        );

        manager.raise(violation("ses-1")).await;
        manager.raise(violation("ses-1")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_sessions_are_not_deduplicated_together() {
        let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let manager = AlertManager::new(
            store,
            vec![Arc::new(CountingSink(count.clone()))],
            Duration::from_secs(300),
        );

        manager.raise(violation("ses-1")).await;
        manager.raise(violation("ses-2")).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
