//! Periodic check cycle.
//!
//! Each tick takes the fleet lock and, if this engine won it, enqueues a
//! check for every managed resource. The scheduler itself never calls a
//! handler; slow checks run on workers and cannot delay the next tick.
//! Enqueueing stops when the lease runs out, so a slow store cannot hold
//! the timer past the next interval either.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Message};
use crate::lock::LockProvider;
use crate::store::DataStore;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Enabled,
}

/// Which resources a cycle enqueues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    All,
    /// Only resources with no dependencies; pair with propagation.
    Roots,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub check_interval: Duration,
    pub lock_name: String,
    pub lease_duration: Duration,
    pub lock_timeout: Duration,
    pub mode: ScheduleMode,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            lock_name: "keel:check-cycle".to_string(),
            lease_duration: Duration::from_secs(55),
            lock_timeout: Duration::from_secs(5),
            mode: ScheduleMode::All,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub lock_acquired: bool,
    pub enqueued: usize,
    pub skipped: usize,
    /// The lease ran out before every resource was enqueued.
    pub truncated: bool,
}

pub struct CheckScheduler {
    store: Arc<dyn DataStore>,
    lock: Arc<dyn LockProvider>,
    dispatcher: Arc<dyn Dispatcher>,
    telemetry: TelemetrySink,
    settings: SchedulerSettings,
    state: watch::Sender<SchedulerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CheckScheduler {
    pub fn new(
        store: Arc<dyn DataStore>,
        lock: Arc<dyn LockProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        telemetry: TelemetrySink,
        settings: SchedulerSettings,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Disabled);
        Self {
            store,
            lock,
            dispatcher,
            telemetry,
            settings,
            state,
            timer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Enable the scheduler and arm its timer. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        self.state.send_replace(SchedulerState::Enabled);

        let mut timer = self.timer.lock().await;
        if timer.is_none() {
            info!(
                "Starting check scheduler (interval {:?}, lock {})",
                self.settings.check_interval, self.settings.lock_name
            );
            let scheduler = Arc::clone(self);
            *timer = Some(tokio::spawn(async move { scheduler.run_timer().await }));
        }
    }

    /// Disable the scheduler and disarm its timer. Idempotent.
    pub async fn stop(&self) {
        self.state.send_replace(SchedulerState::Disabled);
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            info!("Check scheduler stopped");
        }
    }

    async fn run_timer(&self) {
        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.on_timer().await;
        }
    }

    /// Timer callback. A no-op while disabled.
    pub async fn on_timer(&self) -> Option<TickReport> {
        if self.state() == SchedulerState::Disabled {
            debug!("Scheduler disabled, ignoring timer");
            return None;
        }
        Some(self.tick().await)
    }

    /// Run one cycle: take the lock, then enqueue checks until the
    /// resources run out or the lease does.
    pub async fn tick(&self) -> TickReport {
        let lease_expires = Instant::now() + self.settings.lease_duration;
        let acquired = match timeout(
            self.settings.lock_timeout,
            self.lock
                .try_acquire(&self.settings.lock_name, self.settings.lease_duration),
        )
        .await
        {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(e)) => {
                warn!("Lock provider unavailable, skipping cycle: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Lock acquisition timed out after {:?}, skipping cycle",
                    self.settings.lock_timeout
                );
                false
            }
        };
        self.telemetry
            .emit(TelemetryEvent::LockAttempt { success: acquired });

        if !acquired {
            debug!("Check cycle lock held elsewhere");
            return TickReport::default();
        }

        let mut report = TickReport {
            lock_acquired: true,
            ..Default::default()
        };
        let mut resources = match self.settings.mode {
            ScheduleMode::All => self.store.all_resources(),
            ScheduleMode::Roots => self.store.root_resources(),
        };

        let enqueue = async {
            while let Some(item) = resources.next().await {
                let header = match item {
                    Ok(header) => header,
                    Err(e) => {
                        warn!("Skipping unreadable resource: {}", e);
                        report.skipped += 1;
                        continue;
                    }
                };
                if let Err(e) = self
                    .dispatcher
                    .push(Message::CheckResource(header.id.clone()))
                    .await
                {
                    warn!(id = %header.id, "Failed to enqueue check, abandoning cycle: {}", e);
                    break;
                }
                report.enqueued += 1;
            }
        };
        if timeout_at(lease_expires, enqueue).await.is_err() {
            warn!(
                "Lease expired after enqueueing {} resources, abandoning cycle",
                report.enqueued
            );
            report.truncated = true;
        }

        info!(
            "Check cycle scheduled {} resources ({} skipped)",
            report.enqueued, report.skipped
        );
        self.telemetry.emit(TelemetryEvent::CycleScheduled {
            enqueued: report.enqueued,
            skipped: report.skipped,
        });
        report
    }
}
