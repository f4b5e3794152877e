//! Persistent, append-only storage for agents, sessions, traces, approvals
//! and violations (spec §4.4). A single SQLite connection pool backs all of
//! it — the spec explicitly permits a single-writer SQLite connection for a
//! single-process governor, so there is no sharding or multi-writer story
//! here by design.
//!
//! The hash chain (spec §3, "Chain invariant") is computed and verified
//! entirely in this module: callers never see or set `prev_hash`/`hash`
//! themselves.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::alert::{Severity, Violation};
use crate::models::approval::{ApprovalRecord, ApprovalStatus};
use crate::models::policy::TimeoutEffect;
use crate::models::session::{Agent, Session, SessionStatus};
use crate::models::trace::{ActionType, Trace, TraceStatus};

pub struct TraceStore {
    pool: SqlitePool,
}

#[derive(Debug, Default, Clone)]
pub struct TraceFilter {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStats {
    pub agent_id: String,
    pub session_count: i64,
    pub total_cost: f64,
    pub action_count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStats {
    pub agent_count: i64,
    pub session_count: i64,
    pub active_session_count: i64,
    pub trace_count: i64,
    pub total_cost: f64,
    pub pending_approval_count: i64,
}

/// `seed(session_id) = SHA256(session_id)` — the `prev_hash` of a session's
/// first trace (spec §3).
pub fn seed(session_id: &str) -> String {
    hex::encode(Sha256::digest(session_id.as_bytes()))
}

/// `hash = SHA256(serialize(trace_without_hash))`. The serialization is a
/// fixed field order, deliberately not JSON — it must be stable across
/// serde/library versions since it is the thing external tampering is
/// detected against.
fn compute_hash(trace: &Trace) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trace.id.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.agent_id.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.timestamp.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(trace.action_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(trace.action_name.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.action_params.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(trace.target.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.request_body.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.response_body.as_bytes());
    hasher.update(b"|");
    hasher.update(trace.status.as_string().as_bytes());
    hasher.update(b"|");
    hasher.update(trace.model.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(trace.tokens_in.to_le_bytes());
    hasher.update(trace.tokens_out.to_le_bytes());
    hasher.update(trace.cost_usd.to_le_bytes());
    hasher.update(trace.latency_ms.to_le_bytes());
    hasher.update(b"|");
    hasher.update(trace.matched_policy.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(trace.policy_reason.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(trace.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_trace(row: &sqlx::sqlite::SqliteRow) -> Result<Trace, sqlx::Error> {
    let action_type: String = row.try_get("action_type")?;
    let status: String = row.try_get("status")?;
    let action_params: String = row.try_get("action_params")?;
    Ok(Trace {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        agent_id: row.try_get("agent_id")?,
        timestamp: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("timestamp")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        action_type: ActionType::parse(&action_type)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad action_type {action_type}").into()))?,
        action_name: row.try_get("action_name")?,
        action_params: serde_json::from_str(&action_params).unwrap_or(serde_json::Value::Null),
        target: row.try_get("target")?,
        request_body: row.try_get("request_body")?,
        response_body: row.try_get("response_body")?,
        status: TraceStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad status {status}").into()))?,
        model: row.try_get("model")?,
        tokens_in: row.try_get::<i64, _>("tokens_in")? as u32,
        tokens_out: row.try_get::<i64, _>("tokens_out")? as u32,
        cost_usd: row.try_get("cost_usd")?,
        latency_ms: row.try_get::<i64, _>("latency_ms")? as u64,
        matched_policy: row.try_get("matched_policy")?,
        policy_reason: row.try_get("policy_reason")?,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
    })
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    Ok(Session {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        start_time: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("start_time")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        end_time: end_time
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))
            })
            .transpose()?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad status {status}").into()))?,
        total_cost: row.try_get("total_cost")?,
        action_count: row.try_get::<i64, _>("action_count")? as u64,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Result<Agent, sqlx::Error> {
    Ok(Agent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("created_at")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
    })
}

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let timeout_effect: String = row.try_get("timeout_effect")?;
    let action_summary: String = row.try_get("action_summary")?;
    let resolved_time: Option<String> = row.try_get("resolved_time")?;
    Ok(ApprovalRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        trace_id: row.try_get("trace_id")?,
        policy_name: row.try_get("policy_name")?,
        action_summary: serde_json::from_str(&action_summary).unwrap_or(serde_json::Value::Null),
        created_time: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("created_time")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        timeout_deadline: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("timeout_deadline")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad status {status}").into()))?,
        timeout_effect: if timeout_effect == "allow" {
            TimeoutEffect::Allow
        } else {
            TimeoutEffect::Deny
        },
        approver: row.try_get("approver")?,
        resolved_time: resolved_time
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))
            })
            .transpose()?,
    })
}

impl TraceStore {
    pub async fn connect(db_path: &str) -> anyhow::Result<Self> {
        let options = if db_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            // A single writer connection serializes all mutations, which is
            // what gives us a clean append order for the hash chain without
            // explicit application-level locking (spec §5).
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    // ── Traces ───────────────────────────────────────────────────

    /// Fills `prev_hash`/`hash` when empty and inserts. Runs inside a
    /// transaction so the "most recent hash for this session" read and the
    /// insert are atomic with respect to other writers.
    pub async fn insert_trace(&self, mut trace: Trace) -> Result<Trace, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if trace.prev_hash.is_empty() {
            let row = sqlx::query(
                "SELECT hash FROM traces WHERE session_id = ? ORDER BY rowid DESC LIMIT 1",
            )
            .bind(&trace.session_id)
            .fetch_optional(&mut *tx)
            .await?;
            trace.prev_hash = match row {
                Some(r) => r.try_get("hash")?,
                None => seed(&trace.session_id),
            };
        }
        if trace.hash.is_empty() {
            trace.hash = compute_hash(&trace);
        }

        sqlx::query(
            r#"INSERT INTO traces
               (id, session_id, agent_id, timestamp, action_type, action_name, action_params,
                target, request_body, response_body, status, model, tokens_in, tokens_out,
                cost_usd, latency_ms, matched_policy, policy_reason, prev_hash, hash)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(&trace.id)
        .bind(&trace.session_id)
        .bind(&trace.agent_id)
        .bind(trace.timestamp.to_rfc3339())
        .bind(trace.action_type.as_str())
        .bind(&trace.action_name)
        .bind(trace.action_params.to_string())
        .bind(&trace.target)
        .bind(&trace.request_body)
        .bind(&trace.response_body)
        .bind(trace.status.as_string())
        .bind(&trace.model)
        .bind(trace.tokens_in as i64)
        .bind(trace.tokens_out as i64)
        .bind(trace.cost_usd)
        .bind(trace.latency_ms as i64)
        .bind(&trace.matched_policy)
        .bind(&trace.policy_reason)
        .bind(&trace.prev_hash)
        .bind(&trace.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO traces_fts (id, action_name, request_body, response_body, policy_reason) VALUES (?,?,?,?,?)",
        )
        .bind(&trace.id)
        .bind(&trace.action_name)
        .bind(&trace.request_body)
        .bind(&trace.response_body)
        .bind(trace.policy_reason.clone().unwrap_or_default())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(trace)
    }

    pub async fn get_trace(&self, id: &str) -> Result<Option<Trace>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM traces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_trace).transpose()
    }

    pub async fn list_traces(&self, filter: &TraceFilter) -> Result<(Vec<Trace>, i64), sqlx::Error> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM traces WHERE 1=1");
        let mut cb = sqlx::QueryBuilder::new("SELECT COUNT(*) as n FROM traces WHERE 1=1");
        for builder in [&mut qb, &mut cb] {
            if let Some(session_id) = &filter.session_id {
                builder.push(" AND session_id = ").push_bind(session_id.clone());
            }
            if let Some(agent_id) = &filter.agent_id {
                builder.push(" AND agent_id = ").push_bind(agent_id.clone());
            }
            if let Some(status) = &filter.status {
                builder.push(" AND status = ").push_bind(status.clone());
            }
            if let Some(since) = &filter.since {
                builder.push(" AND timestamp >= ").push_bind(since.to_rfc3339());
            }
            if let Some(until) = &filter.until {
                builder.push(" AND timestamp <= ").push_bind(until.to_rfc3339());
            }
        }
        qb.push(" ORDER BY rowid DESC LIMIT ").push_bind(filter.limit.max(1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let traces = rows.iter().map(row_to_trace).collect::<Result<Vec<_>, _>>()?;
        let total: i64 = cb.build().fetch_one(&self.pool).await?.try_get("n")?;
        Ok((traces, total))
    }

    pub async fn search_traces(&self, query: &str, limit: i64) -> Result<Vec<Trace>, sqlx::Error> {
        let rows = sqlx::query(
            r#"SELECT t.* FROM traces t
               JOIN traces_fts f ON f.id = t.id
               WHERE traces_fts MATCH ?
               ORDER BY t.rowid DESC LIMIT ?"#,
        )
        .bind(format!("{query}*"))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_trace).collect()
    }

    /// Iterates a session's traces in insertion order and recomputes both
    /// `prev_hash` and `hash`, reporting the first index at which either
    /// disagrees with what is stored (spec §4.4, §8 property 1).
    pub async fn verify_hash_chain(
        &self,
        session_id: &str,
    ) -> Result<(bool, Option<i64>), sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM traces WHERE session_id = ? ORDER BY rowid ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        let mut expected_prev = seed(session_id);
        for (idx, row) in rows.iter().enumerate() {
            let trace = row_to_trace(row)?;
            if trace.prev_hash != expected_prev {
                return Ok((false, Some(idx as i64)));
            }
            let recomputed = compute_hash(&trace);
            if recomputed != trace.hash {
                return Ok((false, Some(idx as i64)));
            }
            expected_prev = trace.hash;
        }
        Ok((true, None))
    }

    /// Deletes traces (and their FTS shadow rows) older than `days`, returning
    /// the number of trace rows removed.
    pub async fn prune_older_than(&self, days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let ids: Vec<String> = sqlx::query("SELECT id FROM traces WHERE timestamp < ?")
            .bind(cutoff.to_rfc3339())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &ids {
            sqlx::query("DELETE FROM traces_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM traces WHERE timestamp < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub async fn upsert_session(&self, session: &Session) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO sessions (id, agent_id, start_time, end_time, status, total_cost, action_count, metadata, created_at, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(id) DO UPDATE SET
                 agent_id = excluded.agent_id,
                 end_time = excluded.end_time,
                 status = excluded.status,
                 total_cost = excluded.total_cost,
                 action_count = excluded.action_count,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&session.id)
        .bind(&session.agent_id)
        .bind(session.start_time.to_rfc3339())
        .bind(session.end_time.map(|t| t.to_rfc3339()))
        .bind(session.status.as_str())
        .bind(session.total_cost)
        .bind(session.action_count as i64)
        .bind(session.metadata.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn update_session_cost(&self, id: &str, total_cost: f64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET total_cost = ?, updated_at = ? WHERE id = ?")
            .bind(total_cost)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_action_count(&self, id: &str, action_count: u64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET action_count = ?, updated_at = ? WHERE id = ?")
            .bind(action_count as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET status = ?, end_time = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(end_time.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn score_session(&self, id: &str, score: &serde_json::Value) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sessions SET metadata = json_patch(metadata, json(?)), updated_at = ? WHERE id = ?"#,
        )
        .bind(serde_json::json!({ "score": score }).to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<(Vec<Session>, i64), sqlx::Error> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM sessions WHERE 1=1");
        let mut cb = sqlx::QueryBuilder::new("SELECT COUNT(*) as n FROM sessions WHERE 1=1");
        for builder in [&mut qb, &mut cb] {
            if let Some(agent_id) = &filter.agent_id {
                builder.push(" AND agent_id = ").push_bind(agent_id.clone());
            }
            if let Some(status) = &filter.status {
                builder.push(" AND status = ").push_bind(status.clone());
            }
        }
        qb.push(" ORDER BY start_time DESC LIMIT ").push_bind(filter.limit.max(1));
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let sessions = rows.iter().map(row_to_session).collect::<Result<Vec<_>, _>>()?;
        let total: i64 = cb.build().fetch_one(&self.pool).await?.try_get("n")?;
        Ok((sessions, total))
    }

    // ── Agents ───────────────────────────────────────────────────

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO agents (id, name, created_at) VALUES (?,?,?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(agent.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    pub async fn get_agent_stats(&self, agent_id: &str) -> Result<AgentStats, sqlx::Error> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(DISTINCT s.id) as session_count,
                 COALESCE(SUM(s.total_cost), 0.0) as total_cost,
                 COALESCE(SUM(s.action_count), 0) as action_count
               FROM sessions s WHERE s.agent_id = ?"#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(AgentStats {
            agent_id: agent_id.to_string(),
            session_count: row.try_get("session_count")?,
            total_cost: row.try_get("total_cost")?,
            action_count: row.try_get("action_count")?,
        })
    }

    /// Today's cost for an agent, used as `agent.daily_cost` in policy
    /// evaluation (spec §4.2).
    pub async fn agent_daily_cost(&self, agent_id: &str) -> Result<f64, sqlx::Error> {
        let since = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0.0) as total FROM traces WHERE agent_id = ? AND timestamp >= ?",
        )
        .bind(agent_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        row.try_get("total")
    }

    // ── Approvals ────────────────────────────────────────────────

    pub async fn insert_approval(&self, approval: &ApprovalRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO approvals
               (id, session_id, trace_id, policy_name, action_summary, created_time,
                timeout_deadline, status, timeout_effect, approver, resolved_time)
               VALUES (?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(&approval.id)
        .bind(&approval.session_id)
        .bind(&approval.trace_id)
        .bind(&approval.policy_name)
        .bind(approval.action_summary.to_string())
        .bind(approval.created_time.to_rfc3339())
        .bind(approval.timeout_deadline.to_rfc3339())
        .bind(approval.status.as_str())
        .bind(if approval.timeout_effect == TimeoutEffect::Allow { "allow" } else { "deny" })
        .bind(&approval.approver)
        .bind(approval.resolved_time.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_approval).transpose()
    }

    /// Resolves a pending approval. Returns `Ok(false)` (no error) when the
    /// record is not currently pending — resolving a non-pending record is a
    /// caller-level error (spec §4.5.2), this just reports whether the row
    /// moved.
    pub async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        approver: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE approvals SET status = ?, approver = ?, resolved_time = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(approver)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM approvals WHERE status = 'pending' ORDER BY created_time ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_approval).collect()
    }

    pub async fn list_approvals(&self) -> Result<Vec<ApprovalRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM approvals ORDER BY created_time DESC LIMIT 200")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_approval).collect()
    }

    // ── Violations ───────────────────────────────────────────────

    pub async fn insert_violation(&self, id: &str, v: &Violation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO violations (id, kind, severity, agent_id, session_id, policy_name, action_type, message, time)
               VALUES (?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(id)
        .bind(&v.kind)
        .bind(v.severity.as_str())
        .bind(&v.agent_id)
        .bind(&v.session_id)
        .bind(&v.policy_name)
        .bind(v.action_type.map(|a| a.as_str()))
        .bind(&v.message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_violations(&self, agent_id: Option<&str>, limit: i64) -> Result<Vec<Violation>, sqlx::Error> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM violations WHERE 1=1");
        if let Some(agent_id) = agent_id {
            qb.push(" AND agent_id = ").push_bind(agent_id.to_string());
        }
        qb.push(" ORDER BY time DESC LIMIT ").push_bind(limit.max(1));
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let severity: String = row.try_get("severity")?;
                let action_type: Option<String> = row.try_get("action_type")?;
                Ok(Violation {
                    kind: row.try_get("kind")?,
                    severity: Severity::parse(&severity).unwrap_or(Severity::Low),
                    agent_id: row.try_get("agent_id")?,
                    session_id: row.try_get("session_id")?,
                    policy_name: row.try_get("policy_name")?,
                    action_type: action_type.and_then(|a| ActionType::parse(&a)),
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    // ── System stats ─────────────────────────────────────────────

    pub async fn get_system_stats(&self) -> Result<SystemStats, sqlx::Error> {
        let agent_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM agents")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let session_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM sessions")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let active_session_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM sessions WHERE status IN ('active','paused')")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let trace_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM traces")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let total_cost: f64 = sqlx::query("SELECT COALESCE(SUM(total_cost), 0.0) as n FROM sessions")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let pending_approval_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM approvals WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(SystemStats {
            agent_count,
            session_count,
            active_session_count,
            trace_count,
            total_cost,
            pending_approval_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::random_id;

    async fn test_store() -> TraceStore {
        TraceStore::connect(":memory:").await.unwrap()
    }

    fn sample_trace(session_id: &str, cost: f64) -> Trace {
        Trace {
            id: crate::models::trace::new_trace_id(),
            session_id: session_id.to_string(),
            agent_id: "agent-1".to_string(),
            timestamp: Utc::now(),
            action_type: ActionType::LlmChat,
            action_name: "chat_completion".to_string(),
            action_params: serde_json::json!({}),
            target: "gpt-4o".to_string(),
            request_body: "{}".to_string(),
            response_body: "{}".to_string(),
            status: TraceStatus::Allowed,
            model: Some("gpt-4o".to_string()),
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: cost,
            latency_ms: 100,
            matched_policy: None,
            policy_reason: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[tokio::test]
    async fn hash_chain_links_across_inserts() {
        let store = test_store().await;
        let session_id = random_id("ses", 10);
        let t1 = store.insert_trace(sample_trace(&session_id, 0.1)).await.unwrap();
        assert_eq!(t1.prev_hash, seed(&session_id));
        let t2 = store.insert_trace(sample_trace(&session_id, 0.2)).await.unwrap();
        assert_eq!(t2.prev_hash, t1.hash);

        let (valid, break_idx) = store.verify_hash_chain(&session_id).await.unwrap();
        assert!(valid);
        assert_eq!(break_idx, None);
    }

    #[tokio::test]
    async fn tampering_breaks_verification_at_the_right_index() {
        let store = test_store().await;
        let session_id = random_id("ses", 10);
        for i in 0..5 {
            store.insert_trace(sample_trace(&session_id, 0.1 * i as f64)).await.unwrap();
        }
        sqlx::query("UPDATE traces SET cost_usd = 999.0 WHERE session_id = ? AND rowid = (SELECT MIN(rowid) + 2 FROM traces WHERE session_id = ?)")
            .bind(&session_id)
            .bind(&session_id)
            .execute(&store.pool)
            .await
            .unwrap();

        let (valid, break_idx) = store.verify_hash_chain(&session_id).await.unwrap();
        assert!(!valid);
        assert_eq!(break_idx, Some(2));
    }

    #[tokio::test]
    async fn session_upsert_round_trips() {
        let store = test_store().await;
        let session = Session::new("ses_test".to_string(), "agent-1".to_string(), serde_json::json!({}));
        store.upsert_session(&session).await.unwrap();
        let fetched = store.get_session("ses_test").await.unwrap().unwrap();
        assert_eq!(fetched.agent_id, "agent-1");
        assert_eq!(fetched.status, SessionStatus::Active);
    }
}
