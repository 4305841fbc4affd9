//! Engine telemetry events.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::resource::{Action, ResourceId, ResourceKind, ResourceState};

/// Events emitted by the scheduler and processor.
///
/// Delivery is best-effort: nothing is buffered for absent or lagging
/// subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A cycle tried to take the fleet lock.
    LockAttempt { success: bool },
    /// A cycle finished enqueueing checks.
    CycleScheduled { enqueued: usize, skipped: usize },
    /// A check completed and recorded `state`.
    ResourceChecked {
        id: ResourceId,
        kind: ResourceKind,
        state: ResourceState,
        duration: Duration,
    },
    /// A check did not run.
    ResourceCheckSkipped { id: ResourceId, reason: String },
    /// Desired or current state could not be fetched; state left unchanged.
    ResourceCheckUnresolvable { id: ResourceId, reason: String },
    /// A handler create/update/delete completed.
    ActuationLaunched { id: ResourceId, action: Action },
    /// Convergence was blocked by vetoes.
    ActuationVetoed { id: ResourceId, vetoes: Vec<String> },
    /// A check failed.
    ResourceCheckError {
        id: ResourceId,
        fatal: bool,
        message: String,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::LockAttempt { .. } => "lock_attempt",
            TelemetryEvent::CycleScheduled { .. } => "cycle_scheduled",
            TelemetryEvent::ResourceChecked { .. } => "resource_checked",
            TelemetryEvent::ResourceCheckSkipped { .. } => "resource_check_skipped",
            TelemetryEvent::ResourceCheckUnresolvable { .. } => "resource_check_unresolvable",
            TelemetryEvent::ActuationLaunched { .. } => "actuation_launched",
            TelemetryEvent::ActuationVetoed { .. } => "actuation_vetoed",
            TelemetryEvent::ResourceCheckError { .. } => "resource_check_error",
        }
    }
}

#[derive(Clone)]
pub struct TelemetrySink {
    events: broadcast::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { events }
    }

    /// Fire and forget.
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(1024)
    }
}
