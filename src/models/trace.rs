use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The maximum number of bytes of request/response body stored in a trace.
/// Bodies above this are truncated for storage only — forwarding to the
/// upstream always uses the original, untruncated body.
pub const BODY_STORAGE_CAP: usize = 1024 * 1024;

/// Closed set of action types a trace can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[serde(rename = "llm.chat")]
    LlmChat,
    #[serde(rename = "llm.embedding")]
    LlmEmbedding,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "api.request")]
    ApiRequest,
    #[serde(rename = "db.query")]
    DbQuery,
    #[serde(rename = "file.write")]
    FileWrite,
    #[serde(rename = "file.read")]
    FileRead,
    #[serde(rename = "file.delete")]
    FileDelete,
    #[serde(rename = "code.exec")]
    CodeExec,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::LlmChat => "llm.chat",
            ActionType::LlmEmbedding => "llm.embedding",
            ActionType::ToolCall => "tool.call",
            ActionType::ApiRequest => "api.request",
            ActionType::DbQuery => "db.query",
            ActionType::FileWrite => "file.write",
            ActionType::FileRead => "file.read",
            ActionType::FileDelete => "file.delete",
            ActionType::CodeExec => "code.exec",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "llm.chat" => ActionType::LlmChat,
            "llm.embedding" => ActionType::LlmEmbedding,
            "tool.call" => ActionType::ToolCall,
            "api.request" => ActionType::ApiRequest,
            "db.query" => ActionType::DbQuery,
            "file.write" => ActionType::FileWrite,
            "file.read" => ActionType::FileRead,
            "file.delete" => ActionType::FileDelete,
            "code.exec" => ActionType::CodeExec,
            _ => return None,
        })
    }
}

/// Disposition of a traced action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceStatus {
    Allowed,
    Denied,
    Terminated,
    Throttled,
    Pending,
    Approved,
    /// `upstream_error:<http status>`
    UpstreamError(u16),
}

impl TraceStatus {
    pub fn as_string(&self) -> String {
        match self {
            TraceStatus::Allowed => "allowed".to_string(),
            TraceStatus::Denied => "denied".to_string(),
            TraceStatus::Terminated => "terminated".to_string(),
            TraceStatus::Throttled => "throttled".to_string(),
            TraceStatus::Pending => "pending".to_string(),
            TraceStatus::Approved => "approved".to_string(),
            TraceStatus::UpstreamError(code) => format!("upstream_error:{code}"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if let Some(code) = s.strip_prefix("upstream_error:") {
            return code.parse::<u16>().ok().map(TraceStatus::UpstreamError);
        }
        Some(match s {
            "allowed" => TraceStatus::Allowed,
            "denied" => TraceStatus::Denied,
            "terminated" => TraceStatus::Terminated,
            "throttled" => TraceStatus::Throttled,
            "pending" => TraceStatus::Pending,
            "approved" => TraceStatus::Approved,
            _ => return None,
        })
    }
}

/// The persisted, audit record of one action. `prev_hash`/`hash` are filled
/// in by the trace store on insert — callers leave them empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub action_name: String,
    pub action_params: serde_json::Value,
    pub target: String,
    pub request_body: String,
    pub response_body: String,
    pub status: TraceStatus,
    pub model: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub matched_policy: Option<String>,
    pub policy_reason: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// A monotonically-sortable trace id: `trc_<millis since epoch hex>_<4 random hex>`.
pub fn new_trace_id() -> String {
    use rand::Rng;
    let millis = Utc::now().timestamp_millis();
    let mut rng = rand::thread_rng();
    let rand_suffix: u16 = rng.gen();
    format!("trc_{millis:012x}_{rand_suffix:04x}")
}

/// Truncate a body for storage only. Forwarding to the upstream must use the
/// original bytes — this function is never applied to the forwarded copy.
pub fn truncate_for_storage(body: &[u8]) -> String {
    if body.len() <= BODY_STORAGE_CAP {
        String::from_utf8_lossy(body).into_owned()
    } else {
        let mut s = String::from_utf8_lossy(&body[..BODY_STORAGE_CAP]).into_owned();
        s.push_str("...[truncated]");
        s
    }
}
