//! Background workers for a running engine.
//!
//! The `Supervisor` spawns three tokio tasks against a shared [`Engine`]:
//! a dataset watcher that periodically rescans the dataset directory, a
//! dream worker that self-trains on simulated dialogue while the machine is
//! idle, and a tuning worker that runs a full retrain whenever the
//! perplexity monitor signals drift. All of them stop on
//! [`Supervisor::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::dream::measure_idle;
use crate::engine::Engine;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Schedule for the background workers.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Dataset directory scan interval (default: 60s).
    pub scan_interval: Duration,
    /// Dream worker wake-up interval (default: 5 min).
    pub dream_interval: Duration,
    /// How long CPU usage is sampled before deciding to dream.
    pub idle_sample: Duration,
    /// Idle share at or above which dreaming is allowed.
    pub idle_threshold: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            dream_interval: Duration::from_secs(300),
            idle_sample: Duration::from_secs(1),
            idle_threshold: 0.8,
        }
    }
}

impl DaemonConfig {
    /// Schedule taken from the engine's own configuration.
    pub fn from_engine(engine: &Engine) -> Self {
        let cfg = engine.config();
        Self {
            scan_interval: Duration::from_secs(cfg.scan_interval_secs.max(1)),
            dream_interval: Duration::from_secs(cfg.dream_interval_secs.max(1)),
            idle_threshold: cfg.idle_threshold,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the background worker tasks of one engine.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    /// Spawn all workers. Must be called inside a tokio runtime.
    pub fn start(engine: Arc<Engine>, config: DaemonConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let workers = vec![
            (
                "dataset-watcher",
                tokio::spawn(dataset_worker(Arc::clone(&engine), config.scan_interval, rx.clone())),
            ),
            (
                "dream",
                tokio::spawn(dream_worker(Arc::clone(&engine), config.clone(), rx.clone())),
            ),
            ("tuning", tokio::spawn(tuning_worker(engine, rx))),
        ];
        tracing::info!(workers = workers.len(), "background workers started");
        Self { shutdown, workers }
    }

    /// Signal every worker and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (task, handle) in self.workers {
            if let Err(e) = handle.await {
                let err = EngineError::Task {
                    task: task.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "worker did not stop cleanly");
            }
        }
        tracing::info!("background workers stopped");
    }
}

async fn dataset_worker(engine: Arc<Engine>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match engine.scan_datasets().await {
                    Ok(true) => tracing::info!("daemon: datasets retrained"),
                    Ok(false) => tracing::trace!("daemon: datasets unchanged"),
                    Err(e) => tracing::warn!(error = %e, "daemon: dataset scan failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn dream_worker(engine: Arc<Engine>, config: DaemonConfig, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(config.dream_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is not a dream.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match measure_idle(config.idle_sample).await {
                    Some(idle) if idle >= config.idle_threshold => {
                        let lines = engine.dream_cycle().await;
                        tracing::debug!(idle, lines, "daemon: dreamed");
                    }
                    Some(idle) => tracing::trace!(idle, "daemon: too busy to dream"),
                    None => tracing::trace!("daemon: idle measurement unavailable"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn tuning_worker(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = engine.tune_signal().notified() => {
                tracing::info!("daemon: perplexity drift, full retrain");
                if let Err(e) = engine.full_retrain().await {
                    tracing::warn!(error = %e, "daemon: retrain failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
