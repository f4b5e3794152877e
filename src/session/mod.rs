//! In-memory session state: the active-session map and the per-session,
//! per-action-type sliding windows used by rate policies and detectors.
//!
//! Both live behind the same mutex (spec §5, "Rate-window counters: same
//! mutex as session state") so a single critical section handles both a
//! session mutation and its associated window update.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::session::{Agent, Session, SessionStatus};
use crate::models::trace::ActionType;
use crate::models::random_id;
use crate::trace_store::TraceStore;

/// Past this many timestamps, the oldest entries are pruned on the next
/// write — bounds memory use for long-lived sessions with chatty action
/// types (spec's "hard cap... with lazy GC").
const WINDOW_CAP: usize = 10_000;
const WINDOW_RETENTION: Duration = Duration::from_secs(24 * 3600);

struct Inner {
    sessions: HashMap<String, Session>,
    paused: HashMap<String, bool>,
    windows: HashMap<(String, ActionType), VecDeque<DateTime<Utc>>>,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
    store: Arc<TraceStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    NotFound(String),
}

impl SessionManager {
    pub fn new(store: Arc<TraceStore>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                paused: HashMap::new(),
                windows: HashMap::new(),
            }),
            store,
        })
    }

    /// `session_id` empty ⇒ always creates; a present id ⇒ in-memory hit,
    /// else a store lookup (pulling an active row into memory), else a
    /// fresh record. Always upserts both the session and agent rows.
    pub async fn get_or_create(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Session {
        let agent_id = if agent_id.is_empty() { Agent::ANONYMOUS } else { agent_id };

        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            if let Some(existing) = self.inner.lock().sessions.get(id).cloned() {
                self.spawn_upsert_agent(agent_id);
                return existing;
            }
            if let Ok(Some(stored)) = self.store.get_session(id).await {
                if stored.status == SessionStatus::Active {
                    self.inner.lock().sessions.insert(id.to_string(), stored.clone());
                    self.spawn_upsert_agent(agent_id);
                    return stored;
                }
            }
            let session = Session::new(id.to_string(), agent_id.to_string(), metadata);
            self.insert_and_persist(session.clone());
            self.spawn_upsert_agent(agent_id);
            return session;
        }

        let new_id = random_id("ses", 20);
        let session = Session::new(new_id, agent_id.to_string(), metadata);
        self.insert_and_persist(session.clone());
        self.spawn_upsert_agent(agent_id);
        session
    }

    fn insert_and_persist(&self, session: Session) {
        self.inner.lock().sessions.insert(session.id.clone(), session.clone());
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.upsert_session(&session).await {
                tracing::error!(error = %e, session_id = %session.id, "failed to persist new session");
            }
        });
    }

    fn spawn_upsert_agent(&self, agent_id: &str) {
        let store = self.store.clone();
        let agent = Agent::new(agent_id.to_string());
        tokio::spawn(async move {
            if let Err(e) = store.upsert_agent(&agent).await {
                tracing::error!(error = %e, agent_id = %agent.id, "failed to persist agent");
            }
        });
    }

    /// In-memory only — a session absent from the map is simply not active.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub async fn end(&self, session_id: &str) -> Result<(), SessionError> {
        let now = Utc::now();
        {
            let mut guard = self.inner.lock();
            let session = guard
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            session.status = SessionStatus::Completed;
            session.end_time = Some(now);
        }
        let removed = self.inner.lock().sessions.remove(session_id);
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Completed, Some(now))
            .await
        {
            tracing::error!(error = %e, session_id, "failed to persist session end");
        }
        drop(removed);
        Ok(())
    }

    /// Idempotent: terminating an already-terminated (or not-in-memory)
    /// session still succeeds by updating the store directly.
    pub async fn terminate(&self, session_id: &str) {
        let now = Utc::now();
        {
            let mut guard = self.inner.lock();
            if let Some(session) = guard.sessions.get_mut(session_id) {
                session.status = SessionStatus::Terminated;
                session.end_time = Some(now);
            }
            guard.sessions.remove(session_id);
        }
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Terminated, Some(now))
            .await
        {
            tracing::error!(error = %e, session_id, "failed to persist session termination");
        }
    }

    /// Monotonically increases `total_cost` and persists in the background.
    pub fn add_cost(self: &Arc<Self>, session_id: &str, amount: f64) {
        let new_total = {
            let mut guard = self.inner.lock();
            match guard.sessions.get_mut(session_id) {
                Some(session) => {
                    session.total_cost += amount.max(0.0);
                    session.total_cost
                }
                None => return,
            }
        };
        let store = self.store.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update_session_cost(&session_id, new_total).await {
                tracing::error!(error = %e, session_id, "failed to persist session cost");
            }
        });
    }

    /// Bumps the action count and appends to the sliding window for
    /// `(session_id, action_type)`, pruning entries older than the
    /// retention cap when the window exceeds [`WINDOW_CAP`].
    pub fn increment_actions(self: &Arc<Self>, session_id: &str, action_type: ActionType) {
        let now = Utc::now();
        let new_count = {
            let mut guard = self.inner.lock();
            let count = match guard.sessions.get_mut(session_id) {
                Some(session) => {
                    session.action_count += 1;
                    session.action_count
                }
                None => return,
            };
            let window = guard
                .windows
                .entry((session_id.to_string(), action_type))
                .or_default();
            window.push_back(now);
            if window.len() > WINDOW_CAP {
                let cutoff = now - chrono::Duration::from_std(WINDOW_RETENTION).unwrap();
                while window.front().is_some_and(|t| *t < cutoff) {
                    window.pop_front();
                }
            }
            count
        };
        let store = self.store.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update_session_action_count(&session_id, new_count).await {
                tracing::error!(error = %e, session_id, "failed to persist action count");
            }
        });
    }

    /// Count of timestamps within `[now - window, now]` for `(session_id, action_type)`.
    pub fn get_action_count(&self, session_id: &str, action_type: ActionType, window: Duration) -> i64 {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        let guard = self.inner.lock();
        guard
            .windows
            .get(&(session_id.to_string(), action_type))
            .map(|w| w.iter().filter(|t| **t >= cutoff).count() as i64)
            .unwrap_or(0)
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) {
        let mut guard = self.inner.lock();
        guard.paused.insert(session_id.to_string(), paused);
        if let Some(session) = guard.sessions.get_mut(session_id) {
            session.status = if paused {
                SessionStatus::Paused
            } else {
                SessionStatus::Active
            };
        }
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.inner.lock().paused.get(session_id).copied().unwrap_or(false)
    }

    pub fn total_cost(&self, session_id: &str) -> f64 {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.total_cost)
            .unwrap_or(0.0)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// A closure bindable into an [`crate::policy::expr::EvalContext`]
    /// without handing the policy engine a reference back into this
    /// manager's internals (spec §9: "model as a function value... not
    /// mutual ownership").
    pub fn count_in_window_fn<'a>(self: &'a Arc<Self>, session_id: &'a str) -> impl Fn(&str, Duration) -> i64 + 'a {
        move |action_type: &str, window: Duration| {
            let Some(action_type) = ActionType::parse(action_type) else {
                return 0;
            };
            self.get_action_count(session_id, action_type, window)
        }
    }
}
