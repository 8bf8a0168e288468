//! # Supervisor
//!
//! Owns one running task per `CompositeController`.
//!
//! A changed spec stops the old task and waits for it to exit before the
//! replacement starts, so two generations of the same controller never write
//! concurrently. Deleting a CompositeController stops its task the same way.

use crate::controller::ControllerError;
use crate::crd::CompositeController;
use crate::observability::metrics;
use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Starts the task that runs one CompositeController
#[async_trait]
pub trait ControllerFactory: Send + Sync {
    /// Spawn the controller; it must exit once `stop` turns true
    async fn start(
        &self,
        config: &CompositeController,
        stop: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ControllerError>;
}

struct RunningController {
    spec: Value,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningController {
    async fn shutdown(self, name: &str) {
        self.stop.send_replace(true);
        if let Err(e) = self.handle.await {
            error!(controller = %name, error = %e, "controller task failed");
        }
    }
}

/// Registry of running controllers keyed by CompositeController name
pub struct Supervisor {
    factory: Arc<dyn ControllerFactory>,
    running: BTreeMap<String, RunningController>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(factory: Arc<dyn ControllerFactory>) -> Self {
        Self {
            factory,
            running: BTreeMap::new(),
        }
    }

    /// Make sure a controller runs for the current spec of `config`
    pub async fn sync(&mut self, config: &CompositeController) -> Result<(), ControllerError> {
        let name = config.name_any();
        let spec = serde_json::to_value(&config.spec)
            .map_err(|e| ControllerError::Config(format!("can't encode spec of {name}: {e}")))?;

        if let Some(current) = self.running.get(&name) {
            if current.spec == spec && !current.handle.is_finished() {
                return Ok(());
            }
            info!(controller = %name, "spec changed, restarting controller");
        }
        self.stop(&name).await;

        let (stop, stop_rx) = watch::channel(false);
        let handle = self.factory.start(config, stop_rx).await?;
        info!(controller = %name, "controller started");
        self.running.insert(name, RunningController { spec, stop, handle });
        metrics::set_active_controllers(self.running.len());
        Ok(())
    }

    /// Stop and await the controller for `name`; false if none was running
    pub async fn stop(&mut self, name: &str) -> bool {
        let Some(running) = self.running.remove(name) else {
            return false;
        };
        running.shutdown(name).await;
        info!(controller = %name, "controller stopped");
        metrics::set_active_controllers(self.running.len());
        true
    }

    /// Stop every controller
    pub async fn shutdown(&mut self) {
        let names: Vec<String> = self.running.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.get(name).is_some_and(|r| !r.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records starts and stops; tasks run until told to stop
    #[derive(Default)]
    struct Recorder {
        started: AtomicUsize,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ControllerFactory for Recorder {
        async fn start(
            &self,
            config: &CompositeController,
            mut stop: watch::Receiver<bool>,
        ) -> Result<JoinHandle<()>, ControllerError> {
            let generation = self.started.fetch_add(1, Ordering::SeqCst);
            let label = format!("{}#{generation}", config.name_any());
            self.events.lock().unwrap().push(format!("start {label}"));
            let events = Arc::clone(&self.events);
            Ok(tokio::spawn(async move {
                let _ = stop.wait_for(|s| *s).await;
                tokio::task::yield_now().await;
                events.lock().unwrap().push(format!("exit {label}"));
            }))
        }
    }

    fn config(name: &str, resync: f64) -> CompositeController {
        serde_json::from_value(json!({
            "apiVersion": "metacontroller.k8s.io/v1alpha1",
            "kind": "CompositeController",
            "metadata": {"name": name},
            "spec": {
                "parentResource": {"apiVersion": "ctl.example.com/v1", "resource": "things"},
                "resyncPeriodSeconds": resync,
                "hooks": {}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_spec_keeps_running_task() {
        let recorder = Arc::new(Recorder::default());
        let mut supervisor = Supervisor::new(recorder.clone());

        supervisor.sync(&config("a", 1.0)).await.unwrap();
        supervisor.sync(&config("a", 1.0)).await.unwrap();

        assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
        assert!(supervisor.is_running("a"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_spec_awaits_old_task_before_starting_new() {
        let recorder = Arc::new(Recorder::default());
        let mut supervisor = Supervisor::new(recorder.clone());

        supervisor.sync(&config("a", 1.0)).await.unwrap();
        supervisor.sync(&config("a", 2.0)).await.unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["start a#0", "exit a#0", "start a#1"]);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_and_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let mut supervisor = Supervisor::new(recorder.clone());

        supervisor.sync(&config("a", 1.0)).await.unwrap();
        supervisor.sync(&config("b", 1.0)).await.unwrap();
        assert_eq!(supervisor.names(), vec!["a", "b"]);

        assert!(supervisor.stop("a").await);
        assert!(!supervisor.stop("a").await);
        assert_eq!(supervisor.names(), vec!["b"]);

        supervisor.shutdown().await;
        assert!(supervisor.names().is_empty());
        let events = recorder.events.lock().unwrap().clone();
        assert!(events.contains(&"exit b#1".to_string()));
    }
}
