mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use primitives_common::config::SandboxConfig;
use primitives_sandbox::Grader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

pub struct AppState {
    pub grader: Grader,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Sandbox API booting...");

    let config = SandboxConfig::from_env().map_err(anyhow::Error::msg)?;
    let grader = Grader::from_config(&config).context("Failed to initialise sandbox")?;

    info!(
        backend = grader.engine_name(),
        languages = ?grader.languages(),
        max_concurrency = config.max_concurrency,
        timeout_ms = config.default_timeout_ms,
        "Sandbox ready"
    );

    metrics::init();

    let state = Arc::new(AppState { grader });
    let app = routes::routes(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
