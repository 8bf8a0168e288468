//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::config::{load_config, ControllerConfig, ServerConfig};
use crate::constants;
use crate::crd::CompositeController;
use crate::dynamic::{KubeStore, ObjectStore};
use crate::observability;
use crate::runtime::parent_controller::KubeControllerFactory;
use crate::runtime::server::{start_server, ServerState};
use crate::runtime::supervisor::Supervisor;
use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub supervisor: Supervisor,
    pub server_state: Arc<ServerState>,
    pub controller_config: ControllerConfig,
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Supervisor setup
pub async fn initialize() -> Result<InitializationResult> {
    // Required for rustls 0.23+ before anything opens a TLS connection
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(anyhow::anyhow!("Failed to install rustls crypto provider"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "composite_controller=info".into()),
        )
        .init();

    info!("Starting {} v{}", constants::CONTROLLER_NAME, env!("CARGO_PKG_VERSION"));

    let (controller_config, server_config) = load_config();
    info!(?controller_config, ?server_config, "configuration loaded");

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(port, server_state_clone).await {
            error!("HTTP server error: {:#}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    check_crd_installed(&client).await;

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let factory = KubeControllerFactory::new(client.clone(), store, controller_config.clone());
    let supervisor = Supervisor::new(Arc::new(factory));

    server_state.mark_ready();
    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        supervisor,
        server_state,
        controller_config,
    })
}

/// Wait for the HTTP server to bind
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_listening.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log a startup summary, or a hint when the CRD is missing
async fn check_crd_installed(client: &Client) {
    let api: Api<CompositeController> = Api::all(client.clone());
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            let mut names: Vec<String> = list
                .items
                .iter()
                .filter_map(|cc| cc.metadata.name.clone())
                .collect();
            names.sort();
            info!(
                "CRD is queryable, found {} CompositeControllers: {}",
                names.len(),
                names.join(", ")
            );
        }
        Err(e) => {
            error!("CRD is not queryable; {}. Is the CRD installed?", e);
            error!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            warn!("Continuing despite CRD queryability check failure - the watch will retry");
        }
    }
}
