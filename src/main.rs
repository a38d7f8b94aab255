// src/main.rs
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vitals_ingest::{store, AppState, Config, Credentials};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    let credentials = Credentials::load(
        config.private_key_path.as_deref(),
        &config.public_key_path,
        config.token_ttl,
    )?;
    if !credentials.can_issue() {
        warn!("no JWT_PRIVATE_KEY_PATH, running verify-only: /register will fail");
    }

    let store = store::connect(&config.database_url, config.db_max_connections).await?;

    let state = AppState {
        store,
        credentials: Arc::new(credentials),
        policy: config.policy,
    };
    let app = vitals_ingest::router(state, config.request_timeout);

    info!(
        addr = %config.bind_addr,
        assignment_policy = ?config.policy.assignment,
        reregistration_policy = ?config.policy.reregistration,
        "vitals-ingest listening"
    );
    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
