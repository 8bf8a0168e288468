//! # Watch Loop
//!
//! Watches `CompositeController` objects and keeps the [`Supervisor`] in step
//! with them until the process is asked to stop.
//!
//! A controller that fails to start (for example because its parent CRD is
//! not installed yet) is retried on a fixed interval.

use crate::constants;
use crate::crd::CompositeController;
use crate::runtime::error_policy::handle_watch_stream_error;
use crate::runtime::supervisor::Supervisor;
use anyhow::Result;
use futures::StreamExt;
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::watcher::{self, Event};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Initial delay after a throttled watch; doubled up to the maximum
const WATCH_BACKOFF_INITIAL_MS: u64 = 1_000;
const WATCH_BACKOFF_MAX_MS: u64 = 30_000;

/// Run until SIGINT/SIGTERM, then stop every controller
pub async fn run_watch_loop(client: Client, mut supervisor: Supervisor) -> Result<()> {
    let api: Api<CompositeController> = Api::all(client);
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    let backoff = Arc::new(AtomicU64::new(WATCH_BACKOFF_INITIAL_MS));

    let mut failed: BTreeMap<String, CompositeController> = BTreeMap::new();
    let mut retry = tokio::time::interval(Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Watching CompositeControllers");
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received, stopping controllers");
                break;
            }
            _ = retry.tick(), if !failed.is_empty() => {
                for (name, config) in std::mem::take(&mut failed) {
                    info!(controller = %name, "retrying controller start");
                    start(&mut supervisor, &mut failed, config).await;
                }
            }
            event = stream.next() => match event {
                Some(Ok(Event::Apply(config) | Event::InitApply(config))) => {
                    start(&mut supervisor, &mut failed, config).await;
                }
                Some(Ok(Event::Delete(config))) => {
                    let name = config.name_any();
                    failed.remove(&name);
                    supervisor.stop(&name).await;
                }
                Some(Ok(Event::Init | Event::InitDone)) => {}
                Some(Err(e)) => {
                    handle_watch_stream_error(&e.to_string(), &backoff, WATCH_BACKOFF_MAX_MS).await;
                }
                None => {
                    warn!("CompositeController watch ended");
                    break;
                }
            }
        }
    }

    supervisor.shutdown().await;
    info!("All controllers stopped");
    Ok(())
}

async fn start(
    supervisor: &mut Supervisor,
    failed: &mut BTreeMap<String, CompositeController>,
    config: CompositeController,
) {
    let name = config.name_any();
    match supervisor.sync(&config).await {
        Ok(()) => {
            failed.remove(&name);
        }
        Err(e) => {
            error!(controller = %name, error = %e, "can't start controller");
            failed.insert(name, config);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
