//! Serve command implementation.

use crate::api::{create_router, AppState};
use crate::cli::ServeArgs;
use crate::config::ServerListConfig;
use crate::registry::ServerRegistry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing from the CLI flags. `RUST_LOG` wins when set.
pub fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }

    Ok(())
}

/// Load the registry, degrading to an empty catalog on config errors so
/// the proxy still comes up and answers its service endpoints.
pub fn load_registry(path: &Path) -> Arc<ServerRegistry> {
    match ServerListConfig::load(path) {
        Ok(config) => Arc::new(ServerRegistry::from_config(&config)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "starting with an empty server catalog");
            Arc::new(ServerRegistry::from_config(&ServerListConfig::default()))
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel the background workers.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
}

/// Main serve command handler.
pub async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_level, args.log_json)?;

    let registry = load_registry(&args.config);
    if registry.servers().is_empty() && registry.fallback_backend().is_none() {
        tracing::warn!("no backends configured; requests will be answered 503");
    }
    tracing::info!(
        servers = registry.servers().len(),
        rules = registry.rules().len(),
        fallback = registry.fallback_backend().unwrap_or("-"),
        "loaded server catalog"
    );

    let state = Arc::new(AppState::new(registry));
    let cancel = CancellationToken::new();

    let monitor_handle = Arc::clone(&state.monitor).start(cancel.clone());
    let gauge_handle = Arc::clone(&state.gauge).start(cancel.clone());

    let app = create_router(Arc::clone(&state));

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!(addr = %addr, "baton listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    cancel.cancel();
    let _ = monitor_handle.await;
    let _ = gauge_handle.await;

    tracing::info!("baton stopped");
    Ok(())
}
