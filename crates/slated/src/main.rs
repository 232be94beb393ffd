mod routes;

use crate::routes::{delete_bits, delete_volume, health_check, instantiate_volume};
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Extension, Router};
use slate_agent_client::{callback_router, AgentClient, CALLBACK_PATH};
use slate_storage::{
    AgentBackupStorageMediator, BackendConfig, IscsiStorageBackend, LoggingCapacitySink,
    MemoryImageCacheRegistry, StaticAccountResolver,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct State {
    pub backend: IscsiStorageBackend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port: u16 = std::env::var("SLATE_PORT")
        .ok()
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(8080);
    // Address the agent can reach this process on; defaults to loopback for
    // single-host setups.
    let callback_base = optional_env("SLATE_CALLBACK_BASE")
        .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));

    let config = backend_config_from_env()?;
    info!(
        backend = %config.uuid,
        agent = %format!("{}:{}", config.hostname, config.agent_port),
        "configured storage backend"
    );

    let client = AgentClient::new(format!("{callback_base}{CALLBACK_PATH}"));
    let mediator = Arc::new(AgentBackupStorageMediator::for_backend(
        client.clone(),
        &config,
    ));
    let account = required_env("SLATE_ACCOUNT_UUID")?;
    let backend = IscsiStorageBackend::new(
        config,
        client.clone(),
        Arc::new(MemoryImageCacheRegistry::new()),
        Arc::new(StaticAccountResolver::new(account)),
        Arc::new(LoggingCapacitySink),
        mediator,
    );

    let state = State {
        backend: backend.clone(),
    };

    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .expect("Failed to parse bind/port for webserver");

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/volumes/instantiate", post(instantiate_volume))
        .route("/volumes/delete", post(delete_volume))
        .route("/bits/delete", post(delete_bits))
        .fallback(fallback)
        .layer(Extension(state))
        .merge(callback_router(client));

    let server = axum::Server::bind(&addr).serve(app.into_make_service());

    info!("Webserver running on http://{addr}");

    // The init command's response arrives through the callback route, so the
    // connect flow runs alongside the server rather than before it.
    tokio::spawn(async move {
        if let Err(e) = backend.connect().await {
            error!("Backend connect failed: {e}");
        }
    });

    let graceful = server.with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to create Ctrl+C shutdown signal");
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    Ok(())
}

fn backend_config_from_env() -> anyhow::Result<BackendConfig> {
    Ok(BackendConfig {
        uuid: required_env("SLATE_BACKEND_UUID")?,
        hostname: required_env("SLATE_AGENT_HOST")?,
        agent_port: std::env::var("SLATE_AGENT_PORT")
            .ok()
            .map(|p| p.parse::<u16>())
            .transpose()?
            .unwrap_or(7760),
        filesystem_type: optional_env("SLATE_FILESYSTEM_TYPE")
            .unwrap_or_else(|| "btrfs".to_string()),
        root_path: required_env("SLATE_ROOT_PATH")?,
        chap_username: optional_env("SLATE_CHAP_USERNAME"),
        chap_password: optional_env("SLATE_CHAP_PASSWORD"),
    })
}

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} must be set"))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}
