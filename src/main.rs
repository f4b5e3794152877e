use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::any;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod alert;
mod api;
mod approval;
mod cli;
mod config;
mod detection;
mod errors;
mod jobs;
mod killswitch;
mod models;
mod notification;
mod policy;
mod proxy;
mod session;
mod trace_store;

use alert::AlertManager;
use approval::ApprovalQueue;
use detection::DetectionEngine;
use killswitch::KillSwitch;
use policy::PolicyEngine;
use session::SessionManager;
use trace_store::TraceStore;

/// Shared application state passed to every handler.
///
/// Built once at startup and handed around as `Arc<AppState>`; every field
/// is itself already cheaply cloneable (an `Arc`, an `ArcSwap`-backed
/// engine, or a lock-free broadcast sender) so handlers clone what they
/// need rather than locking the whole struct.
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<TraceStore>,
    pub sessions: Arc<SessionManager>,
    pub policy: Arc<PolicyEngine>,
    pub killswitch: Arc<KillSwitch>,
    pub approvals: Arc<ApprovalQueue>,
    pub alerts: Arc<AlertManager>,
    pub detection: Arc<DetectionEngine>,
    pub router: proxy::upstream::Router,
    pub upstream: proxy::upstream::UpstreamClient,
    pub trace_tx: tokio::sync::broadcast::Sender<models::trace::Trace>,
}

const TRACE_BROADCAST_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "agentwarden"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agentwarden=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Policy { command }) => handle_policy_command(cfg, command).await,
        Some(cli::Commands::Approval { command }) => handle_approval_command(cfg, command).await,
        Some(cli::Commands::Killswitch { command }) => handle_killswitch_command(cfg, command).await,
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn build_state(cfg: config::Config) -> anyhow::Result<Arc<AppState>> {
    tracing::info!(path = %cfg.db_path, "opening trace store");
    let store = Arc::new(TraceStore::connect(&cfg.db_path).await?);

    let sessions = SessionManager::new(store.clone());
    let policy = PolicyEngine::new(
        cfg.policy_file.clone(),
        cfg.llm_base_url.clone().unwrap_or_default(),
        cfg.llm_api_key.clone(),
    )?;
    policy::reload::spawn_watcher(policy.clone(), cfg.policy_file.clone())?;

    let killswitch_file = (!cfg.killswitch_file.is_empty()).then(|| PathBuf::from(&cfg.killswitch_file));
    let killswitch = KillSwitch::new(killswitch_file);

    let approvals = ApprovalQueue::new(store.clone());

    let mut sinks: Vec<Arc<dyn alert::AlertSink>> = Vec::new();
    sinks.push(Arc::new(notification::slack::SlackNotifier::new(
        cfg.slack_webhook_url.clone(),
    )));
    if !cfg.webhook_urls.is_empty() {
        let targets = cfg.webhook_urls.iter().cloned().map(|url| (url, None)).collect();
        sinks.push(Arc::new(notification::webhook::WebhookNotifier::new(targets)));
    }
    let alerts = AlertManager::new(store.clone(), sinks, Duration::from_secs(cfg.alert_dedup_ttl_secs));

    let detection = DetectionEngine::from_config(&cfg.detection);

    let router = proxy::upstream::Router::from_config(&cfg);
    let upstream = proxy::upstream::UpstreamClient::new(Duration::from_secs(cfg.upstream_timeout_secs));

    let (trace_tx, _) = tokio::sync::broadcast::channel(TRACE_BROADCAST_CAPACITY);

    Ok(Arc::new(AppState {
        config: cfg,
        store,
        sessions,
        policy,
        killswitch,
        approvals,
        alerts,
        detection,
        router,
        upstream,
        trace_tx,
    }))
}

async fn run_server(cfg: config::Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);
    let state = build_state(cfg).await?;

    jobs::cleanup::spawn(state.store.clone(), state.config.retention_days, Duration::from_secs(3600));
    spawn_killswitch_sentinel(state.clone());

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(readiness_check))
        .nest("/api", api::management_router(state.clone()))
        .nest("/v1", api::event_router(state.clone()))
        .fallback(any(proxy::handler::proxy_handler))
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            let dashboard_origin =
                std::env::var("DASHBOARD_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == dashboard_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-agentwarden-agent-id"),
                    HeaderName::from_static("x-agentwarden-session-id"),
                    HeaderName::from_static("x-agentwarden-metadata"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true)
        })
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("AgentWarden listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Polls the kill-switch sentinel file every few seconds so an operator can
/// trip the global switch out-of-band (e.g. by touching a file from a
/// separate incident-response script) without going through the management
/// API (spec §4.5.1).
fn spawn_killswitch_sentinel(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if let Some(violation) = state.killswitch.poll_sentinel() {
                state.alerts.raise(violation).await;
            }
        }
    });
}

async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn readiness_check() -> &'static str {
    "ok"
}

async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-XSS-Protection", "1; mode=block".parse().unwrap());
    headers.insert("Cache-Control", "no-store".parse().unwrap());
    headers.insert("Referrer-Policy", "no-referrer".parse().unwrap());
    headers.insert(
        "Permissions-Policy",
        "camera=(), microphone=(), geolocation=()".parse().unwrap(),
    );
    headers.remove("Server");

    resp
}

async fn handle_policy_command(cfg: config::Config, cmd: cli::PolicyCommands) -> anyhow::Result<()> {
    match cmd {
        cli::PolicyCommands::Validate => {
            let policies = policy::config::load_and_compile(&cfg.policy_file)?;
            println!("{} policies loaded and validated from {}", policies.len(), cfg.policy_file);
        }
        cli::PolicyCommands::List => {
            let policies = policy::config::load_and_compile(&cfg.policy_file)?;
            if policies.is_empty() {
                println!("No policies found.");
            } else {
                println!("{:<24} {:<10} {:<10}", "NAME", "CATEGORY", "EFFECT");
                for p in policies {
                    println!("{:<24} {:<10?} {:<10?}", p.name, p.category, p.effect);
                }
            }
        }
    }
    Ok(())
}

async fn handle_approval_command(cfg: config::Config, cmd: cli::ApprovalCommands) -> anyhow::Result<()> {
    let store = Arc::new(TraceStore::connect(&cfg.db_path).await?);
    let queue = ApprovalQueue::new(store);

    match cmd {
        cli::ApprovalCommands::List => {
            let pending = queue.list_pending().await?;
            if pending.is_empty() {
                println!("No pending approvals.");
            } else {
                println!("{:<24} {:<16} {:<24} EXPIRES", "ID", "POLICY", "SESSION");
                for r in pending {
                    println!(
                        "{:<24} {:<16} {:<24} {}",
                        r.id, r.policy_name, r.session_id, r.timeout_deadline
                    );
                }
            }
        }
        cli::ApprovalCommands::Approve { approval_id } => {
            queue.resolve(&approval_id, true, Some("cli")).await?;
            println!("Approval {} approved.", approval_id);
        }
        cli::ApprovalCommands::Deny { approval_id } => {
            queue.resolve(&approval_id, false, Some("cli")).await?;
            println!("Approval {} denied.", approval_id);
        }
    }
    Ok(())
}

async fn handle_killswitch_command(cfg: config::Config, cmd: cli::KillswitchCommands) -> anyhow::Result<()> {
    let killswitch_file = (!cfg.killswitch_file.is_empty()).then(|| PathBuf::from(&cfg.killswitch_file));
    match cmd {
        cli::KillswitchCommands::TriggerGlobal { reason } => {
            std::fs::write(killswitch_file.as_deref().unwrap_or(std::path::Path::new(".agentwarden_killswitch")), &reason)?;
            println!("Global kill switch sentinel written: {reason}");
        }
        cli::KillswitchCommands::ResetGlobal { reason } => {
            if let Some(path) = &killswitch_file {
                std::fs::remove_file(path).ok();
            }
            println!("Global kill switch sentinel removed: {reason}");
        }
    }
    Ok(())
}
