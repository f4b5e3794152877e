use serde::Deserialize;

/// Detector thresholds, loaded once alongside the rest of [`Config`] but
/// consulted by `detection::*` rather than by the proxy handler directly.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    pub loop_enabled: bool,
    pub loop_threshold: u32,
    pub loop_window_secs: u64,
    pub cost_anomaly_enabled: bool,
    pub cost_multiplier: f64,
    pub spiral_enabled: bool,
    pub spiral_similarity: f64,
    pub spiral_min_consecutive: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub dashboard_enabled: bool,

    pub db_path: String,
    pub retention_days: i64,

    pub upstream_default: String,
    pub upstream_openai: String,
    pub upstream_anthropic: String,
    pub upstream_gemini: String,
    pub upstream_timeout_secs: u64,

    pub policy_file: String,

    pub slack_webhook_url: Option<String>,
    pub webhook_urls: Vec<String>,
    pub alert_dedup_ttl_secs: u64,

    pub killswitch_file: String,

    pub detection: DetectionConfig,

    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let db_path = env_or("AGENTWARDEN_DB_PATH", "agentwarden.sqlite3");
    let env_mode = std::env::var("AGENTWARDEN_ENV").unwrap_or_default();
    if db_path == ":memory:" && env_mode == "production" {
        anyhow::bail!(
            "AGENTWARDEN_DB_PATH is set to ':memory:' with AGENTWARDEN_ENV=production — \
             a production deployment must persist its trace store across restarts."
        );
    }

    let webhook_urls = std::env::var("AGENTWARDEN_WEBHOOK_URLS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    Ok(Config {
        port: env_parsed("AGENTWARDEN_PORT", 8088),
        dashboard_enabled: env_bool("AGENTWARDEN_DASHBOARD_ENABLED", false),

        db_path,
        retention_days: env_parsed("AGENTWARDEN_RETENTION_DAYS", 30),

        upstream_default: env_or("AGENTWARDEN_UPSTREAM_DEFAULT", "https://api.openai.com"),
        upstream_openai: env_or("AGENTWARDEN_UPSTREAM_OPENAI", "https://api.openai.com"),
        upstream_anthropic: env_or("AGENTWARDEN_UPSTREAM_ANTHROPIC", "https://api.anthropic.com"),
        upstream_gemini: env_or(
            "AGENTWARDEN_UPSTREAM_GEMINI",
            "https://generativelanguage.googleapis.com",
        ),
        upstream_timeout_secs: env_parsed("AGENTWARDEN_UPSTREAM_TIMEOUT_SECS", 60),

        policy_file: env_or("AGENTWARDEN_POLICY_FILE", "policies.toml"),

        slack_webhook_url: std::env::var("AGENTWARDEN_SLACK_WEBHOOK_URL").ok(),
        webhook_urls,
        alert_dedup_ttl_secs: env_parsed("AGENTWARDEN_ALERT_DEDUP_TTL_SECS", 300),

        killswitch_file: env_or("AGENTWARDEN_KILLSWITCH_FILE", ".agentwarden_killswitch"),

        detection: DetectionConfig {
            loop_enabled: env_bool("AGENTWARDEN_LOOP_ENABLED", true),
            loop_threshold: env_parsed("AGENTWARDEN_LOOP_THRESHOLD", 5),
            loop_window_secs: env_parsed("AGENTWARDEN_LOOP_WINDOW_SECS", 60),
            cost_anomaly_enabled: env_bool("AGENTWARDEN_COST_ANOMALY_ENABLED", true),
            cost_multiplier: env_parsed("AGENTWARDEN_COST_MULTIPLIER", 10.0),
            spiral_enabled: env_bool("AGENTWARDEN_SPIRAL_ENABLED", true),
            spiral_similarity: env_parsed("AGENTWARDEN_SPIRAL_SIMILARITY", 0.9),
            spiral_min_consecutive: env_parsed("AGENTWARDEN_SPIRAL_MIN_CONSECUTIVE", 3),
        },

        llm_base_url: std::env::var("AGENTWARDEN_LLM_BASE_URL").ok(),
        llm_api_key: std::env::var("AGENTWARDEN_LLM_API_KEY").ok(),
    })
}
