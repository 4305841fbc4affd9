//! Engine wiring: store, lock, handlers, vetoes, processor, scheduler and
//! workers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use keel_core::store::{DataStore, MemoryStore, ResourceStore, SqliteStore};
use keel_core::veto::{RepeatedDiffVeto, UpstreamExistsVeto};
use keel_core::{
    ActuationPauser, ChannelDispatcher, CheckProcessor, CheckScheduler, EngineConfig,
    LockProvider, MemoryLock, Message, ResourceId, TelemetryEvent, TelemetrySink, VetoChain, Workers,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::handlers;
use crate::manifest;

/// Where desired state and the fleet lock live.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Process memory; a single engine, nothing persisted.
    Memory,
    /// SQLite database shared by every engine in the fleet.
    Sqlite(PathBuf),
}

pub struct AgentOptions {
    pub backend: Backend,
    pub holder: String,
    pub manifest: Option<PathBuf>,
    /// Resources whose checks start out paused.
    pub paused: Vec<ResourceId>,
    pub config: EngineConfig,
}

pub struct Agent {
    holder: String,
    store: Arc<dyn DataStore>,
    processor: Arc<CheckProcessor>,
    scheduler: Arc<CheckScheduler>,
    queue: mpsc::UnboundedReceiver<Message>,
    telemetry: TelemetrySink,
}

impl Agent {
    pub async fn build(options: AgentOptions) -> Result<Self> {
        let config = options.config;
        config.validate()?;

        let (store, lock): (Arc<dyn DataStore>, Arc<dyn LockProvider>) = match &options.backend {
            Backend::Memory => {
                info!("Using in-memory store");
                let store = MemoryStore::new().with_history_limit(config.history_limit);
                let lock = MemoryLock::new(options.holder.clone());
                (Arc::new(store), Arc::new(lock))
            }
            Backend::Sqlite(path) => {
                info!("Using SQLite store at {}", path.display());
                let store = SqliteStore::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?
                    .with_history_limit(config.history_limit);
                let lock = store.lock_provider(options.holder.clone());
                (Arc::new(store), Arc::new(lock))
            }
        };

        if let Some(path) = &options.manifest {
            let count = manifest::apply(store.as_ref(), path).await?;
            info!("Loaded {} resources from {}", count, path.display());
        }

        let registry = Arc::new(handlers::builtin_registry()?);
        info!("Registered handlers: {:?}", registry.kinds());

        let vetoes = VetoChain::new()
            .with(Arc::new(UpstreamExistsVeto::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                config.handler_timeout(),
            )))
            .with(Arc::new(RepeatedDiffVeto::new(
                Arc::clone(&store),
                config.max_repeated_actions,
            )));

        let telemetry = TelemetrySink::new(config.telemetry_capacity);
        let pauser = Arc::new(ActuationPauser::new());
        for id in options.paused {
            pauser.pause(id).await;
        }
        let processor = Arc::new(
            CheckProcessor::new(
                Arc::clone(&store),
                registry,
                Arc::new(vetoes),
                telemetry.clone(),
            )
            .with_pauser(pauser)
            .with_handler_timeout(config.handler_timeout())
            .with_propagation(config.propagate_to_dependents),
        );

        let (dispatcher, queue) = ChannelDispatcher::new();
        let scheduler = Arc::new(CheckScheduler::new(
            Arc::clone(&store),
            lock,
            Arc::new(dispatcher),
            telemetry.clone(),
            config.scheduler_settings(),
        ));

        Ok(Self {
            holder: options.holder,
            store,
            processor,
            scheduler,
            queue,
            telemetry,
        })
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    async fn resource_count(&self) -> usize {
        self.store.all_resources().count().await
    }

    /// Run a single cycle and process everything it enqueued.
    pub async fn run_once(mut self) -> Result<()> {
        let report = self.scheduler.tick().await;
        if !report.lock_acquired {
            info!("Check cycle lock held by another engine, nothing to do");
            return Ok(());
        }
        if report.truncated {
            warn!(
                "Cycle cut short by lease expiry, only {} resources enqueued",
                report.enqueued
            );
        }
        while let Ok(message) = self.queue.try_recv() {
            self.processor.handle(message).await;
        }
        Ok(())
    }

    /// Run until `shutdown` flips, then drain in-flight checks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Agent {} starting, managing {} resources",
            self.holder,
            self.resource_count().await
        );

        let telemetry_handle = tokio::spawn(log_telemetry(self.telemetry.subscribe()));

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let workers = Workers::new(Arc::clone(&self.processor));
        let queue = self.queue;
        let workers_handle = tokio::spawn(async move { workers.run(queue, stop_rx).await });

        self.scheduler.start().await;

        shutdown.changed().await.ok();
        info!("Agent {} shutting down", self.holder);

        self.scheduler.stop().await;
        let _ = stop_tx.send(()).await;
        workers_handle.await.context("Worker task failed")?;
        telemetry_handle.abort();

        info!("Agent {} stopped", self.holder);
        Ok(())
    }
}

async fn log_telemetry(mut events: broadcast::Receiver<TelemetryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(event = event.name(), "{:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Telemetry logger lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
