use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use clap::Parser;
use hs_session::{
    manage_sessions, InMemorySessionStore, SessionConfig, SessionError, SessionHandle,
    SessionManager, SessionStoreRef, SessionValue, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "session-demo", about = "Demo HTTP server using encrypted sessions")]
struct Args {
    /// Path to a TOML session config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Secret key; repeat to rotate keys (first one is current)
    #[arg(short, long = "secret")]
    secrets: Vec<String>,

    /// Session cookie name
    #[arg(long)]
    cookie_name: Option<String>,

    /// HTTP server address
    #[arg(long, default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,

    /// Keep session data in process memory instead of the cookie
    #[arg(long)]
    memory_store: bool,

    /// Seconds between expired session sweeps of the memory store
    #[arg(long, default_value_t = 300)]
    cleanup_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Signed-in user, stored in the session under a stable type tag
#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    name: String,
    signed_in_at: DateTime<Utc>,
}

impl SessionValue for Profile {
    const TAG: &'static str = "demo.profile";
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level: Level = args
        .log_level
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid log level {}: {}", args.log_level, e))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    info!("Starting session demo");

    // Load config from file or use defaults
    let mut config = match &args.config {
        Some(path) => match SessionConfig::load_from_file(path) {
            Ok(cfg) => {
                info!("Loaded configuration from {}", path.display());
                cfg
            }
            Err(e) => {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                return Err(anyhow::anyhow!("Configuration error: {}", e));
            }
        },
        None => SessionConfig::default(),
    };

    // Update config from CLI args
    if !args.secrets.is_empty() {
        config.secret_keys = args.secrets.clone();
    }
    if let Some(name) = args.cookie_name.clone() {
        config.cookie_name = name;
    }

    let store = args.memory_store.then(|| {
        let store = InMemorySessionStore::with_ttl(config.max_age());
        spawn_cleanup(store.clone(), Duration::from_secs(args.cleanup_interval.max(1)));
        store
    });
    let store_ref = store.map(|store| Arc::new(store) as SessionStoreRef);

    let registry = TypeRegistry::new().with::<Profile>()?;
    let manager = SessionManager::with_registry(config, store_ref, registry)
        .map_err(|e| anyhow::anyhow!("Failed to configure sessions: {}", e))?;

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .route("/", get(visits))
        .route("/health", get(health))
        .route("/login/:name", get(login))
        .route("/whoami", get(whoami))
        .route("/logout", get(logout))
        .layer(
            ServiceBuilder::new()
                .layer(cors)
                .layer(from_fn_with_state(manager, manage_sessions)),
        );

    info!("Starting HTTP server on {}", args.http_addr);
    axum::Server::bind(&args.http_addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start HTTP server: {}", e))
}

fn spawn_cleanup(store: InMemorySessionStore, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = store.cleanup_expired_sessions() {
                warn!(error = %e, "Failed to clean up expired sessions");
            }
        }
    });
}

/// Health check handler
async fn health() -> impl IntoResponse {
    "session demo is running"
}

async fn visits(session: SessionHandle) -> Result<String, SessionError> {
    let count = session.get::<u64>("visits")?.unwrap_or(0) + 1;
    session.set("visits", &count)?;
    Ok(format!("You have visited {} time(s)", count))
}

async fn login(session: SessionHandle, Path(name): Path<String>) -> Result<String, SessionError> {
    let profile = Profile {
        name,
        signed_in_at: Utc::now(),
    };
    session.set_typed("profile", &profile)?;
    Ok(format!("Signed in as {}", profile.name))
}

async fn whoami(session: SessionHandle) -> Result<String, SessionError> {
    Ok(match session.get_typed::<Profile>("profile")? {
        Some(profile) => format!("{} (since {})", profile.name, profile.signed_in_at),
        None => "anonymous".to_string(),
    })
}

async fn logout(session: SessionHandle) -> &'static str {
    session.destroy();
    "Signed out"
}
