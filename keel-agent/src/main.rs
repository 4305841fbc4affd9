//! keel-agent: runs the keel reconciliation engine.
//!
//! Every agent pointed at the same database joins one fleet:
//! - Loads desired state from an optional manifest
//! - Competes for the check-cycle lock on each tick
//! - Checks every resource the winning agent enqueues
//! - Converges drift through the registered handlers

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use keel_core::{EngineConfig, ResourceId, ScheduleMode};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod handlers;
mod manifest;

use agent::{Agent, AgentOptions, Backend};

/// keel reconciliation agent
#[derive(Parser, Debug)]
#[command(name = "keel-agent", version, about)]
struct Args {
    /// SQLite database shared by the fleet
    #[arg(long, env = "KEEL_DB", default_value = "/var/lib/keel/keel.db")]
    db: PathBuf,

    /// Use an in-memory store and lock (single agent, nothing persisted)
    #[arg(long)]
    dev: bool,

    /// JSON engine config; command-line flags override it
    #[arg(long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// JSON manifest of resources to load at startup
    #[arg(long, env = "KEEL_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Check interval in seconds
    #[arg(long, env = "KEEL_INTERVAL")]
    interval: Option<u64>,

    /// Name of the fleet-wide check-cycle lock
    #[arg(long, env = "KEEL_LOCK_NAME")]
    lock_name: Option<String>,

    /// Lock holder ID (defaults to hostname plus a random suffix)
    #[arg(long, env = "KEEL_HOLDER")]
    holder: Option<String>,

    /// Per-call handler timeout in seconds
    #[arg(long)]
    handler_timeout: Option<u64>,

    /// Also check dependents after each checked resource
    #[arg(long)]
    propagate: bool,

    /// Only schedule resources without dependencies
    #[arg(long)]
    roots_only: bool,

    /// Skip checks for this resource ID (repeatable)
    #[arg(long = "pause", value_name = "ID")]
    paused: Vec<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };

        if let Some(interval) = self.interval {
            config.check_interval_secs = interval;
            // keep the lease inside the interval
            config.lease_duration_secs = config.lease_duration_secs.min(interval.max(2) - 1);
        }
        if let Some(lock_name) = &self.lock_name {
            config.lock_name = lock_name.clone();
        }
        if let Some(timeout) = self.handler_timeout {
            config.handler_timeout_secs = timeout;
        }
        if self.propagate {
            config.propagate_to_dependents = true;
        }
        if self.roots_only {
            config.schedule = ScheduleMode::Roots;
        }

        config.validate()?;
        Ok(config)
    }

    fn holder(&self) -> String {
        self.holder.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", host, &suffix[..8])
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_agent=info,keel_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;
    let holder = args.holder();

    let backend = if args.dev {
        Backend::Memory
    } else {
        if let Some(parent) = args.db.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Backend::Sqlite(args.db.clone())
    };

    info!("Starting keel-agent: {}", holder);
    info!(
        "Check interval {}s, lock {}, schedule {:?}",
        config.check_interval_secs, config.lock_name, config.schedule
    );

    let agent = Agent::build(AgentOptions {
        backend,
        holder,
        manifest: args.manifest.clone(),
        paused: args.paused.iter().map(|id| ResourceId::new(id.as_str())).collect(),
        config,
    })
    .await?;

    if args.once {
        return agent.run_once().await;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent_handle = tokio::spawn(agent.run(shutdown_rx));

    // Wait for shutdown signal
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    agent_handle.await.context("Agent task panicked")??;

    info!("keel-agent stopped");
    Ok(())
}
