use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};

use codechat_api_server::config::{LoggingConfig, Settings};
use codechat_api_server::extract::{ExtractionRules, GithubClient, ZipExtractor};
use codechat_api_server::handlers;
use codechat_api_server::services::{
    AnalysisService, ConversationRelay, ConversationStore, GeminiClient, LlmGateway, SessionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging; the guard keeps the file writer alive
    let _guard = init_tracing(&settings.logging);

    info!("🚀 Starting codechat API server...");
    info!("✅ Configuration loaded");

    // Extraction collaborators
    let rules = Arc::new(ExtractionRules::new(&settings.upload));
    let zip_extractor = Arc::new(ZipExtractor::new(rules.clone()));
    let github_client = Arc::new(GithubClient::new(&settings.github, rules));

    // LLM gateway and analysis
    let gemini = GeminiClient::new(&settings.gemini);
    if gemini.is_configured() {
        info!("✅ Gemini API key configured, code question answering available");
    } else {
        warn!("Gemini API key not set, code question answering will be unavailable");
        info!("set api_keys in config/settings.toml or the APP__GEMINI__API_KEY env var");
    }

    let analysis_service = Arc::new(AnalysisService::new(&settings.analysis));
    if analysis_service.is_configured() {
        info!("✅ Analysis API key configured, project analysis available");
    } else {
        warn!("analysis API key not set, project analysis will be skipped");
    }

    // Stores with independent TTL sweepers
    let sessions = SessionStore::new(Duration::from_secs(settings.session.session_ttl_secs));
    sessions.spawn_sweeper(Duration::from_secs(
        settings.session.session_sweep_interval_secs,
    ));

    let conversations =
        ConversationStore::new(Duration::from_secs(settings.session.conversation_ttl_secs));
    conversations.spawn_sweeper(Duration::from_secs(
        settings.session.conversation_sweep_interval_secs,
    ));

    let gateway: Arc<dyn LlmGateway> = Arc::new(gemini);
    let relay = Arc::new(ConversationRelay::new(
        sessions.clone(),
        conversations,
        gateway,
    ));

    // Build router
    let app = build_router(
        relay,
        sessions,
        zip_extractor,
        github_client,
        analysis_service,
        settings.upload.max_upload_bytes(),
    );

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);
    info!(
        upload = %format!("POST http://{addr}/api/context/upload"),
        github = %format!("GET http://{addr}/api/context/github?url=<repo_url>"),
        ask = %format!("GET/POST http://{addr}/api/ask?session_id=<id>&question=<question>&stream=true|false"),
        "API usage"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());

    if let Some(directory) = config.directory.as_deref().filter(|d| !d.is_empty()) {
        let appender = tracing_appender::rolling::daily(directory, "codechat-api-server.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .with_writer(writer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
        None
    }
}

fn build_router(
    relay: Arc<ConversationRelay>,
    sessions: SessionStore,
    zip_extractor: Arc<ZipExtractor>,
    github_client: Arc<GithubClient>,
    analysis_service: Arc<AnalysisService>,
    max_upload_bytes: usize,
) -> Router {
    // Public routes
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    // API routes with injected collaborators
    let api_routes = Router::new()
        .route("/api/context/upload", post(handlers::ingest::upload_handler))
        .route("/api/context/github", get(handlers::ingest::github_handler))
        .route(
            "/api/ask",
            post(handlers::ask::ask_handler).get(handlers::ask::ask_query_handler),
        )
        .layer(Extension(relay))
        .layer(Extension(sessions))
        .layer(Extension(zip_extractor))
        .layer(Extension(github_client))
        .layer(Extension(analysis_service));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        // CORS
        .layer(CorsLayer::permissive())
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CatchPanicLayer::new())
        // Body limit for uploads
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
