//! tendrild: Tendril mesh daemon.
//!
//! Usage: `tendrild [CONFIG_PATH]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use tendril_api::ApiState;
use tendril_core::config::TendrilConfig;
use tendril_services::peer::MeshSettings;
use tendril_services::probe::DEFAULT_WINDOW;
use tendril_services::{
    AccessControl, Credential, Dispatcher, HttpAccessControl, MeshEngine, MeshTimings,
    ReconnectController,
};

#[tokio::main]
async fn main() -> Result<()> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit.clone().unwrap_or_else(TendrilConfig::file_path);

    let written = TendrilConfig::write_default_if_missing(&config_path);
    let loaded = TendrilConfig::load_from(&config_path);
    let level = loaded
        .as_ref()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    if let Err(e) = written {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = match loaded {
        Ok(c) => c,
        // A file the operator named must load.
        Err(e) if explicit.is_some() => return Err(e).context("failed to load config"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            TendrilConfig::default()
        }
    };
    tracing::info!(path = %config_path.display(), server = config.mesh.server, "tendrild starting");

    // ── Mesh socket ──────────────────────────────────────────────────────────

    let dispatcher = Arc::new(
        Dispatcher::bind(config.network.listen_addr()?).context("failed to bind mesh socket")?,
    );
    let settings = MeshSettings {
        local_addr: config
            .network
            .advertised_addr()
            .context("no usable address to advertise")?,
        token: config.mesh.token,
        group: config.mesh.group,
        group_filter: config.mesh.group_filter,
        window: DEFAULT_WINDOW,
    };
    tracing::info!(
        listen = ?dispatcher.local_addr().ok(),
        advertised = %settings.local_addr,
        group = format_args!("{:#x}", settings.group),
        "mesh socket bound"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let engine = MeshEngine::new(
        dispatcher.socket(),
        &settings,
        MeshTimings::from(&config.timing),
        &config.network.bootstrap_addrs()?,
        shutdown_tx.clone(),
    );
    engine.install(&dispatcher);
    let _loops = engine.spawn_loops();

    // ── Health and reconnection (server nodes only) ──────────────────────────

    let controller = if config.mesh.server {
        let access: Arc<dyn AccessControl> = Arc::new(HttpAccessControl::new(&config.access.url)?);
        let credentials = config
            .access
            .credentials
            .iter()
            .map(|c| Credential::new(&c.name, &c.secret))
            .collect();
        let controller = Arc::new(ReconnectController::new(
            access,
            credentials,
            config.access.test_mode,
        ));
        engine.spawn_health_loop(controller.clone());
        tokio::spawn(controller.clone().rollover_loop(shutdown_tx.subscribe()));
        Some(controller)
    } else {
        None
    };

    // ── Receive loop and status API ──────────────────────────────────────────

    let dispatch_task = tokio::spawn(dispatcher.clone().run(shutdown_tx.subscribe()));

    let api_state = ApiState {
        engine: engine.clone(),
        controller,
    };
    let status_addr = config.network.status_addr()?;
    let api_task = tokio::spawn(async move {
        if let Err(e) = tendril_api::serve(api_state, status_addr).await {
            tracing::error!(error = %e, "status API failed");
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = dispatch_task      => tracing::error!("dispatcher exited: {:?}", r),
        r = api_task           => tracing::error!("status API exited: {:?}", r),
    }

    Ok(())
}
