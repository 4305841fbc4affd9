//! DataStore trait definitions.
//!
//! The check path only talks to these traits; the backing implementation
//! (in-memory or SQLite) is chosen at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::diff::Fingerprint;
use crate::resource::{Resource, ResourceHeader, ResourceId, ResourceState};

use super::error::Result;
use super::event::ResourceEvent;

// =============================================================================
// DTOs
// =============================================================================

/// Last recorded check result for a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub state: ResourceState,
    pub recorded_at: DateTime<Utc>,
}

/// Tracking for a diff that has been seen on consecutive checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub fingerprint: Fingerprint,
    /// Consecutive checks that observed this exact diff.
    pub seen_count: u32,
    /// Create/update calls made while this diff was outstanding.
    pub actions_taken: u32,
}

impl DiffRecord {
    /// Folds a newly observed fingerprint into the previous record.
    pub fn observe(previous: Option<DiffRecord>, fingerprint: Fingerprint) -> Self {
        match previous {
            Some(prev) if prev.fingerprint == fingerprint => DiffRecord {
                seen_count: prev.seen_count.saturating_add(1),
                ..prev
            },
            _ => DiffRecord {
                fingerprint,
                seen_count: 1,
                actions_taken: 0,
            },
        }
    }
}

// =============================================================================
// Domain Store Traits
// =============================================================================

/// Desired specs plus last known state.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a resource by ID.
    async fn get(&self, id: &ResourceId) -> Result<Resource>;

    /// Upsert a resource, bumping its `resource_version`.
    ///
    /// A new resource starts with state `Unknown`. If the incoming resource
    /// carries a non-zero version it must equal the stored version.
    async fn store(&self, resource: Resource) -> Result<Resource>;

    /// Remove a resource together with its state and tracking records.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Last recorded state, `Unknown` if never checked.
    async fn last_known_state(&self, id: &ResourceId) -> Result<ResourceState>;

    /// Full state record, `None` if never checked.
    async fn state_record(&self, id: &ResourceId) -> Result<Option<StateRecord>>;

    /// Record a check result. Last writer wins.
    async fn update_state(&self, id: &ResourceId, state: ResourceState) -> Result<()>;

    /// Enumerate every resource. Items that cannot be read are yielded as
    /// errors so callers can skip them and continue.
    fn all_resources(&self) -> BoxStream<'_, Result<ResourceHeader>>;

    /// Enumerate resources with no dependencies.
    fn root_resources(&self) -> BoxStream<'_, Result<ResourceHeader>>;

    /// Resources whose `depends_on` contains `id`.
    async fn dependents(&self, id: &ResourceId) -> Result<Vec<ResourceId>>;
}

/// Append-only per-resource history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an event, trimming the oldest beyond the configured limit.
    async fn append_history(&self, event: ResourceEvent) -> Result<()>;

    /// Most recent events first.
    async fn event_history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>>;
}

/// Diff fingerprint tracking.
#[async_trait]
pub trait DiffStore: Send + Sync {
    /// Record an observed diff and return the updated tracking record.
    async fn record_diff(&self, id: &ResourceId, fingerprint: Fingerprint) -> Result<DiffRecord>;

    /// Current tracking record, if the resource has an outstanding diff.
    async fn diff_record(&self, id: &ResourceId) -> Result<Option<DiffRecord>>;

    /// Count a create/update call against the outstanding diff.
    async fn mark_action_taken(&self, id: &ResourceId) -> Result<()>;

    /// Forget the outstanding diff (resource converged).
    async fn clear_diff(&self, id: &ResourceId) -> Result<()>;
}

// =============================================================================
// Composite DataStore Trait
// =============================================================================

/// Composite store used by the processor, scheduler and vetoes.
pub trait DataStore: ResourceStore + HistoryStore + DiffStore + Send + Sync {}

impl<T> DataStore for T where T: ResourceStore + HistoryStore + DiffStore + Send + Sync {}
