//! Webhook gateway binary: wires the token manager, subscriber store,
//! knowledge cache, and broadcast scheduler together behind one axum server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use oabot_knowledge::{KnowledgeCache, KnowledgeCacheConfig};
use oabot_oauth::{FileTokenStore, TokenManager, TokenManagerConfig};
use oabot_runtime::{
    BroadcastConfig, BroadcastScheduler, DispatchConfig, FallbackReplyGenerator,
    FileSubscriberStore, MessageClient, OutboundSender, RemoteKvSubscriberStore, SubscriberStore,
    WebhookDispatcher,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oabot-gateway", about = "Zalo OA webhook bot gateway", version)]
struct Cli {
    #[arg(long, env = "OABOT_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    #[arg(
        long,
        env = "OABOT_STATE_DIR",
        default_value = "./data",
        help = "Directory holding tokens.json and subscribers.json"
    )]
    state_dir: PathBuf,

    #[arg(long, env = "OA_APP_ID", default_value = "")]
    app_id: String,

    #[arg(long, env = "OA_APP_SECRET", hide_env_values = true, default_value = "")]
    app_secret: String,

    #[arg(long, env = "OA_OAUTH_BASE", default_value = "https://oauth.zaloapp.com")]
    oauth_base: String,

    #[arg(long, env = "OA_API_BASE", default_value = "https://openapi.zalo.me")]
    api_base: String,

    #[arg(
        long,
        env = "OA_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Pre-provisioned access token; used as-is when no refresh token is set"
    )]
    access_token: Option<String>,

    #[arg(long, env = "OA_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    #[arg(
        long,
        env = "OA_OAUTH_CODE",
        hide_env_values = true,
        help = "One-time authorization code used to bootstrap the stored token record"
    )]
    oauth_code: Option<String>,

    #[arg(long, env = "OA_REDIRECT_URI")]
    redirect_uri: Option<String>,

    #[arg(
        long,
        env = "OA_VERIFY_TOKEN",
        hide_env_values = true,
        help = "Shared token checked on webhook verification requests"
    )]
    verify_token: Option<String>,

    #[arg(long, env = "OABOT_KNOWLEDGE_URL")]
    knowledge_url: Option<String>,

    #[arg(long, env = "OABOT_KNOWLEDGE_TTL_MS", default_value_t = 1_800_000)]
    knowledge_ttl_ms: u64,

    #[arg(
        long,
        env = "OABOT_FALLBACK_REPLY",
        default_value = "Xin lỗi, hệ thống đang bận. Bạn vui lòng thử lại sau nhé."
    )]
    fallback_reply: String,

    #[arg(
        long,
        env = "OABOT_KV_BASE_URL",
        help = "Remote key-value set service for the subscriber list; falls back to the local file"
    )]
    kv_base_url: Option<String>,

    #[arg(long, env = "OABOT_KV_SET_KEY", default_value = "oa-subscribers")]
    kv_set_key: String,

    #[arg(long, env = "OABOT_BROADCAST_CRON", default_value = "0 0 * * * *")]
    broadcast_cron: String,

    #[arg(long, env = "OABOT_TIMEZONE", default_value = "Asia/Ho_Chi_Minh")]
    timezone: String,

    #[arg(long, env = "OABOT_BROADCAST_PACING_MS", default_value_t = 150)]
    broadcast_pacing_ms: u64,

    #[arg(
        long = "broadcast-message",
        env = "OABOT_BROADCAST_MESSAGES",
        value_delimiter = ';',
        help = "Rotation messages picked by hour of day; repeat the flag or separate with ';'"
    )]
    broadcast_messages: Vec<String>,

    #[arg(long, env = "OABOT_BROADCAST_FALLBACK")]
    broadcast_fallback: Option<String>,

    #[arg(
        long,
        env = "OABOT_SCHEDULE_URL",
        help = "Endpoint serving per-time-slot broadcast messages"
    )]
    schedule_url: Option<String>,

    #[arg(long, env = "OABOT_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    request_timeout_ms: u64,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<WebhookDispatcher>,
    verify_token: Option<String>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Platform verification callback: checks the shared token when one is
/// configured and echoes the challenge back.
async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    if let Some(expected) = &state.verify_token {
        if params.get("verify_token").map(String::as_str) != Some(expected.as_str()) {
            return (StatusCode::FORBIDDEN, "invalid verify token".to_string());
        }
    }
    let body = params
        .get("challenge")
        .cloned()
        .unwrap_or_else(|| "OK".to_string());
    (StatusCode::OK, body)
}

/// Acks the platform immediately; processing happens on a detached task so
/// slow token refreshes or sends never trip the webhook delivery timeout.
async fn receive_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> &'static str {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.handle_event(&payload).await;
    });
    "ok"
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse()).await
}

async fn run(cli: Cli) -> Result<()> {
    let token_store = Arc::new(FileTokenStore::new(cli.state_dir.join("tokens.json")));
    let tokens = Arc::new(TokenManager::new(
        TokenManagerConfig {
            app_id: cli.app_id.clone(),
            secret_key: cli.app_secret.clone(),
            oauth_base: cli.oauth_base.clone(),
            redirect_uri: cli.redirect_uri.clone(),
            static_access_token: cli.access_token.clone(),
            static_refresh_token: cli.refresh_token.clone(),
            bootstrap_code: cli.oauth_code.clone(),
            request_timeout_ms: cli.request_timeout_ms,
            ..TokenManagerConfig::default()
        },
        token_store,
    )?);

    let client = MessageClient::new(cli.api_base.clone(), cli.request_timeout_ms)?;
    let sender = Arc::new(OutboundSender::new(client, tokens));

    let local_subscribers = FileSubscriberStore::new(cli.state_dir.join("subscribers.json"));
    let subscribers: Arc<dyn SubscriberStore> = match &cli.kv_base_url {
        Some(base) => Arc::new(RemoteKvSubscriberStore::new(
            base.clone(),
            cli.kv_set_key.clone(),
            cli.request_timeout_ms,
            Some(local_subscribers),
        )?),
        None => Arc::new(local_subscribers),
    };

    let knowledge = Arc::new(KnowledgeCache::new(KnowledgeCacheConfig {
        source_url: cli.knowledge_url.clone().unwrap_or_default(),
        ttl_ms: cli.knowledge_ttl_ms,
        request_timeout_ms: cli.request_timeout_ms,
        strict_first_fetch: true,
    })?);
    // Fail fast at boot when a knowledge source is configured but unreachable.
    knowledge
        .refresh(false)
        .await
        .context("initial knowledge fetch failed")?;

    let dispatcher = Arc::new(WebhookDispatcher::new(
        subscribers.clone(),
        knowledge,
        Arc::new(FallbackReplyGenerator::new(cli.fallback_reply.clone())),
        sender.clone(),
        DispatchConfig {
            fallback_reply: cli.fallback_reply.clone(),
            ..DispatchConfig::default()
        },
    ));

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let broadcast_enabled = !cli.broadcast_messages.is_empty()
        || cli.broadcast_fallback.is_some()
        || cli.schedule_url.is_some();
    if broadcast_enabled {
        let scheduler = BroadcastScheduler::new(
            BroadcastConfig {
                cron_expression: cli.broadcast_cron.clone(),
                timezone: cli.timezone.clone(),
                pacing_ms: cli.broadcast_pacing_ms,
                rotation: cli.broadcast_messages.clone(),
                fallback_message: cli.broadcast_fallback.clone(),
                schedule_url: cli.schedule_url.clone(),
                request_timeout_ms: cli.request_timeout_ms,
            },
            sender,
            subscribers,
        )?;
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            scheduler.run(rx).await;
        });
    } else {
        println!("broadcast disabled: no rotation, fallback, or schedule url configured");
    }

    let state = AppState {
        dispatcher,
        verify_token: cli.verify_token.clone(),
    };
    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read local address")?;
    println!("oabot gateway listening on {local_addr}");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("webhook server exited unexpectedly")?;
    Ok(())
}
