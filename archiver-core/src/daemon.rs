//! Composition root: queues, supervisors and consumers for one config

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, ArchiverResult};
use crate::observer::{Observer, ObserverUpdater};
use crate::registry::QueueRegistry;
use crate::supervisor::RotationSupervisor;
use crate::types::{Market, RunMode, StreamKind};
use crate::writer::{LoggingSink, MessageSink, StreamWriter};

pub struct ArchiverDaemon {
    config: ArchiverConfig,
    registry: Arc<QueueRegistry>,
    supervisors: Vec<Arc<RotationSupervisor>>,
    writers: Vec<Arc<StreamWriter>>,
    observer_updater: Option<Arc<ObserverUpdater>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ArchiverDaemon {
    /// Build the daemon with batches reported through the log
    pub fn new(config: ArchiverConfig) -> ArchiverResult<Self> {
        Self::with_sink(config, Arc::new(LoggingSink))
    }

    pub fn with_sink(config: ArchiverConfig, sink: Arc<dyn MessageSink>) -> ArchiverResult<Self> {
        config.validate()?;

        let registry = Arc::new(QueueRegistry::new(config.max_queue_instances_per_class, config.run_mode));
        registry.bootstrap(&config.markets())?;

        let cancel = CancellationToken::new();
        let endpoints = config.endpoint_resolver();
        let settings = config.rotation_settings();

        let mut supervisors = Vec::new();
        let mut writers = Vec::new();
        for queue in registry.queues() {
            let key = queue.key();
            supervisors.push(Arc::new(RotationSupervisor::new(
                queue.clone(),
                config.pairs(key.market),
                endpoints.clone(),
                settings.clone(),
                cancel.clone(),
            )?));

            if config.run_mode == RunMode::DataSink {
                writers.push(Arc::new(StreamWriter::new(
                    key,
                    queue.output().clone(),
                    sink.clone(),
                    config.file_duration(),
                )));
            }
        }

        let observer_updater = registry.fan_in().map(|fan_in| Arc::new(ObserverUpdater::new(fan_in)));

        Ok(Self {
            config,
            registry,
            supervisors,
            writers,
            observer_updater,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn supervisors(&self) -> &[Arc<RotationSupervisor>] {
        &self.supervisors
    }

    pub fn supervisor(&self, market: Market, kind: StreamKind) -> Option<&Arc<RotationSupervisor>> {
        self.supervisors
            .iter()
            .find(|s| s.market() == market && s.kind() == kind)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register an observer of the shared buffer; listener mode only
    pub fn add_observer(&self, observer: Arc<dyn Observer>) -> ArchiverResult<()> {
        match &self.observer_updater {
            Some(updater) => {
                updater.add_observer(observer);
                Ok(())
            }
            None => Err(ArchiverError::InvalidConfig(
                "observers need run_mode \"listener\"".to_string(),
            )),
        }
    }

    /// Add a pair to both streams of a market
    pub fn subscribe(&self, market: Market, pair: &str) -> ArchiverResult<()> {
        for supervisor in self.supervisors.iter().filter(|s| s.market() == market) {
            supervisor.subscribe(pair)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, market: Market, pair: &str) -> ArchiverResult<()> {
        for supervisor in self.supervisors.iter().filter(|s| s.market() == market) {
            supervisor.unsubscribe(pair)?;
        }
        Ok(())
    }

    /// Spawn every supervisor and consumer; returns once they are running
    pub fn run(&self) -> ArchiverResult<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(ArchiverError::InvalidConfig("daemon is already running".to_string()));
        }

        info!(
            "🚀 Starting archiver: {} markets, {} streams, {:?} mode",
            self.config.instruments.len(),
            self.supervisors.len(),
            self.config.run_mode
        );

        for supervisor in &self.supervisors {
            let name = format!("supervisor {} {}", supervisor.market(), supervisor.kind());
            let supervisor = supervisor.clone();
            let label = name.clone();
            tasks.push((
                name,
                tokio::spawn(async move {
                    if let Err(e) = supervisor.run().await {
                        error!("❌ {} failed: {}", label, e);
                    }
                }),
            ));
        }

        for writer in &self.writers {
            let writer = writer.clone();
            let cancel = self.cancel.clone();
            tasks.push(("writer".to_string(), tokio::spawn(async move { writer.run(cancel).await })));
        }

        if let Some(updater) = &self.observer_updater {
            let updater = updater.clone();
            let cancel = self.cancel.clone();
            tasks.push((
                "observer updater".to_string(),
                tokio::spawn(async move { updater.run(cancel).await }),
            ));
        }

        Ok(())
    }

    /// Cancel every loop and wait up to the grace period for them to finish
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down archiver");
        self.cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} still running after {:?}, aborting", name, grace);
                    handle.abort();
                }
            }
        }
        info!("✅ Archiver stopped");
    }
}
