//! Per-resource history events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{Action, ResourceId};

/// One entry in a resource's history.
///
/// History is kept for observability only; the check path never reads it back
/// to make decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub id: ResourceId,
    pub timestamp: DateTime<Utc>,
    pub kind: ResourceEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResourceEventKind {
    /// Desired spec stored for the first time.
    Created,
    /// Desired spec replaced.
    Updated { resource_version: u64 },
    /// Current state matches desired.
    Valid,
    /// Current state confirmed absent.
    Missing,
    /// Current state differs from desired.
    DeltaDetected { paths: Vec<String> },
    /// A handler create/update call completed.
    ActuationLaunched { action: Action, handler: String },
    /// One or more vetoes denied convergence.
    ActuationVetoed { vetoes: Vec<String>, message: String },
    /// The handler declined to act on the diff.
    DiffNotActionable { message: String },
    /// Convergence withheld because dependencies are not `Ok`.
    PreconditionsFailed { dependencies: Vec<ResourceId> },
    /// Current state could not be fetched; retried next cycle.
    CheckUnresolvable { reason: String },
    /// The check failed.
    CheckError { reason: String },
    /// The check did not run.
    CheckSkipped { reason: String },
}

impl ResourceEvent {
    pub fn now(id: ResourceId, kind: ResourceEventKind) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Short type name, e.g. `DeltaDetected`.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ResourceEventKind::Created => "Created",
            ResourceEventKind::Updated { .. } => "Updated",
            ResourceEventKind::Valid => "Valid",
            ResourceEventKind::Missing => "Missing",
            ResourceEventKind::DeltaDetected { .. } => "DeltaDetected",
            ResourceEventKind::ActuationLaunched { .. } => "ActuationLaunched",
            ResourceEventKind::ActuationVetoed { .. } => "ActuationVetoed",
            ResourceEventKind::DiffNotActionable { .. } => "DiffNotActionable",
            ResourceEventKind::PreconditionsFailed { .. } => "PreconditionsFailed",
            ResourceEventKind::CheckUnresolvable { .. } => "CheckUnresolvable",
            ResourceEventKind::CheckError { .. } => "CheckError",
            ResourceEventKind::CheckSkipped { .. } => "CheckSkipped",
        }
    }
}
