//! Global/agent/session kill switch (spec §4.5.1).
//!
//! Precedence on check is global > agent > session: a global trigger blocks
//! everything regardless of any narrower scope's state. Triggering is
//! idempotent — tripping an already-tripped scope just appends another
//! history entry, it does not error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::alert::{Severity, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Agent,
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub scope: Scope,
    pub target: Option<String>,
    pub triggered: bool,
    pub reason: String,
    pub time: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    global: bool,
    agents: HashMap<String, bool>,
    sessions: HashMap<String, bool>,
    history: Vec<KillSwitchEvent>,
}

pub struct KillSwitch {
    state: RwLock<State>,
    sentinel_path: Option<PathBuf>,
}

impl KillSwitch {
    pub fn new(sentinel_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(State::default()),
            sentinel_path,
        })
    }

    /// Global > agent > session (spec §4.5.1 "Scope precedence").
    pub fn is_tripped(&self, agent_id: &str, session_id: &str) -> bool {
        let state = self.state.read();
        state.global
            || state.agents.get(agent_id).copied().unwrap_or(false)
            || state.sessions.get(session_id).copied().unwrap_or(false)
    }

    pub fn trigger_global(&self, reason: &str) -> Violation {
        let mut state = self.state.write();
        state.global = true;
        state.history.push(KillSwitchEvent {
            scope: Scope::Global,
            target: None,
            triggered: true,
            reason: reason.to_string(),
            time: Utc::now(),
        });
        Violation {
            kind: "killswitch".to_string(),
            severity: Severity::Critical,
            agent_id: String::new(),
            session_id: String::new(),
            policy_name: None,
            action_type: None,
            message: format!("global kill switch triggered: {reason}"),
        }
    }

    pub fn reset_global(&self, reason: &str) {
        let mut state = self.state.write();
        state.global = false;
        state.history.push(KillSwitchEvent {
            scope: Scope::Global,
            target: None,
            triggered: false,
            reason: reason.to_string(),
            time: Utc::now(),
        });
    }

    pub fn trigger_agent(&self, agent_id: &str, reason: &str) -> Violation {
        let mut state = self.state.write();
        state.agents.insert(agent_id.to_string(), true);
        state.history.push(KillSwitchEvent {
            scope: Scope::Agent,
            target: Some(agent_id.to_string()),
            triggered: true,
            reason: reason.to_string(),
            time: Utc::now(),
        });
        Violation {
            kind: "killswitch".to_string(),
            severity: Severity::Critical,
            agent_id: agent_id.to_string(),
            session_id: String::new(),
            policy_name: None,
            action_type: None,
            message: format!("kill switch triggered for agent: {reason}"),
        }
    }

    pub fn reset_agent(&self, agent_id: &str, reason: &str) {
        let mut state = self.state.write();
        state.agents.insert(agent_id.to_string(), false);
        state.history.push(KillSwitchEvent {
            scope: Scope::Agent,
            target: Some(agent_id.to_string()),
            triggered: false,
            reason: reason.to_string(),
            time: Utc::now(),
        });
    }

    pub fn trigger_session(&self, session_id: &str, reason: &str) -> Violation {
        let mut state = self.state.write();
        state.sessions.insert(session_id.to_string(), true);
        state.history.push(KillSwitchEvent {
            scope: Scope::Session,
            target: Some(session_id.to_string()),
            triggered: true,
            reason: reason.to_string(),
            time: Utc::now(),
        });
        Violation {
            kind: "killswitch".to_string(),
            severity: Severity::Critical,
            agent_id: String::new(),
            session_id: session_id.to_string(),
            policy_name: None,
            action_type: None,
            message: format!("kill switch triggered for session: {reason}"),
        }
    }

    pub fn reset_session(&self, session_id: &str, reason: &str) {
        let mut state = self.state.write();
        state.sessions.insert(session_id.to_string(), false);
        state.history.push(KillSwitchEvent {
            scope: Scope::Session,
            target: Some(session_id.to_string()),
            triggered: false,
            reason: reason.to_string(),
            time: Utc::now(),
        });
    }

    pub fn history(&self, limit: usize) -> Vec<KillSwitchEvent> {
        let state = self.state.read();
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn is_global_tripped(&self) -> bool {
        self.state.read().global
    }

    /// Polls the sentinel path, if configured, and trips the global switch
    /// exactly once the first time it appears — a second poll while the file
    /// still exists is a no-op since `trigger_global` already flipped the bit.
    pub fn poll_sentinel(&self) -> Option<Violation> {
        let path = self.sentinel_path.as_ref()?;
        if path.exists() && !self.is_global_tripped() {
            return Some(self.trigger_global("sentinel file detected"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_precedes_narrower_scopes() {
        let ks = KillSwitch::new(None);
        assert!(!ks.is_tripped("agent-1", "ses-1"));
        ks.trigger_global("test");
        assert!(ks.is_tripped("agent-1", "ses-1"));
        ks.reset_global("test");
        assert!(!ks.is_tripped("agent-1", "ses-1"));
    }

    #[test]
    fn agent_scope_does_not_leak_to_other_agents() {
        let ks = KillSwitch::new(None);
        ks.trigger_agent("agent-1", "test");
        assert!(ks.is_tripped("agent-1", "ses-1"));
        assert!(!ks.is_tripped("agent-2", "ses-2"));
    }

    #[test]
    fn sentinel_triggers_exactly_once() {
        let dir = std::env::temp_dir().join(format!("aw-ks-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sentinel = dir.join("STOP");
        let ks = KillSwitch::new(Some(sentinel.clone()));
        assert!(ks.poll_sentinel().is_none());
        std::fs::write(&sentinel, b"").unwrap();
        assert!(ks.poll_sentinel().is_some());
        assert!(ks.poll_sentinel().is_none());
        std::fs::remove_file(&sentinel).ok();
    }
}
