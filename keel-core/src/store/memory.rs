//! In-memory store, used for tests and `--dev` mode.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use tokio::sync::RwLock;

use crate::diff::Fingerprint;
use crate::resource::{Resource, ResourceHeader, ResourceId, ResourceState};

use super::error::{Result, StoreError};
use super::event::{ResourceEvent, ResourceEventKind};
use super::traits::*;
use super::DEFAULT_HISTORY_LIMIT;

#[derive(Default)]
struct Inner {
    resources: BTreeMap<ResourceId, Resource>,
    states: HashMap<ResourceId, StateRecord>,
    history: HashMap<ResourceId, VecDeque<ResourceEvent>>,
    diffs: HashMap<ResourceId, DiffRecord>,
}

impl Inner {
    fn push_history(&mut self, event: ResourceEvent, limit: usize) {
        let events = self.history.entry(event.id.clone()).or_default();
        events.push_back(event);
        while events.len() > limit {
            events.pop_front();
        }
    }
}

/// Store backed by process memory. Nothing survives a restart.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    history_limit: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, id: &ResourceId) -> Result<Resource> {
        let inner = self.inner.read().await;
        inner
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn store(&self, mut resource: Resource) -> Result<Resource> {
        resource.validate()?;

        let mut inner = self.inner.write().await;
        let incoming = resource.metadata.resource_version;
        let kind = match inner.resources.get(&resource.id) {
            Some(existing) => {
                let current = existing.metadata.resource_version;
                if incoming != 0 && incoming != current {
                    return Err(StoreError::VersionMismatch {
                        expected: current,
                        actual: incoming,
                    });
                }
                resource.metadata.uid = existing.metadata.uid.clone();
                resource.metadata.resource_version = current + 1;
                ResourceEventKind::Updated {
                    resource_version: current + 1,
                }
            }
            None => {
                if resource.metadata.uid.is_empty() {
                    resource.metadata.uid = uuid::Uuid::new_v4().to_string();
                }
                resource.metadata.resource_version = 1;
                ResourceEventKind::Created
            }
        };

        inner
            .resources
            .insert(resource.id.clone(), resource.clone());
        inner.push_history(
            ResourceEvent::now(resource.id.clone(), kind),
            self.history_limit,
        );
        Ok(resource)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.resources.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        inner.states.remove(id);
        inner.history.remove(id);
        inner.diffs.remove(id);
        Ok(())
    }

    async fn last_known_state(&self, id: &ResourceId) -> Result<ResourceState> {
        Ok(self
            .state_record(id)
            .await?
            .map(|r| r.state)
            .unwrap_or_default())
    }

    async fn state_record(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.states.get(id).cloned())
    }

    async fn update_state(&self, id: &ResourceId, state: ResourceState) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.resources.contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        inner.states.insert(
            id.clone(),
            StateRecord {
                state,
                recorded_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn all_resources(&self) -> BoxStream<'_, Result<ResourceHeader>> {
        Box::pin(async_stream::stream! {
            let headers: Vec<ResourceHeader> = {
                let inner = self.inner.read().await;
                inner.resources.values().map(Resource::header).collect()
            };
            for header in headers {
                yield Ok(header);
            }
        })
    }

    fn root_resources(&self) -> BoxStream<'_, Result<ResourceHeader>> {
        Box::pin(async_stream::stream! {
            let headers: Vec<ResourceHeader> = {
                let inner = self.inner.read().await;
                inner
                    .resources
                    .values()
                    .filter(|r| r.depends_on.is_empty())
                    .map(Resource::header)
                    .collect()
            };
            for header in headers {
                yield Ok(header);
            }
        })
    }

    async fn dependents(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|r| r.depends_on.contains(id))
            .map(|r| r.id.clone())
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_history(&self, event: ResourceEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.resources.contains_key(&event.id) {
            return Err(StoreError::NotFound(event.id));
        }
        inner.push_history(event, self.history_limit);
        Ok(())
    }

    async fn event_history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .get(id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DiffStore for MemoryStore {
    async fn record_diff(&self, id: &ResourceId, fingerprint: Fingerprint) -> Result<DiffRecord> {
        let mut inner = self.inner.write().await;
        let record = DiffRecord::observe(inner.diffs.remove(id), fingerprint);
        inner.diffs.insert(id.clone(), record.clone());
        Ok(record)
    }

    async fn diff_record(&self, id: &ResourceId) -> Result<Option<DiffRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.diffs.get(id).cloned())
    }

    async fn mark_action_taken(&self, id: &ResourceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.diffs.get_mut(id) {
            record.actions_taken = record.actions_taken.saturating_add(1);
        }
        Ok(())
    }

    async fn clear_diff(&self, id: &ResourceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.diffs.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn resource(id: &str) -> Resource {
        Resource::new(id, "test", "Thing", json!({"size": 1}))
    }

    #[tokio::test]
    async fn test_store_assigns_uid_and_bumps_version() {
        let store = MemoryStore::new();
        let first = store.store(resource("a")).await.unwrap();
        assert_eq!(first.metadata.resource_version, 1);
        assert!(!first.metadata.uid.is_empty());

        let second = store.store(resource("a")).await.unwrap();
        assert_eq!(second.metadata.resource_version, 2);
        assert_eq!(second.metadata.uid, first.metadata.uid);
    }

    #[tokio::test]
    async fn test_store_rejects_stale_version() {
        let store = MemoryStore::new();
        store.store(resource("a")).await.unwrap();
        store.store(resource("a")).await.unwrap();

        let mut stale = resource("a");
        stale.metadata.resource_version = 1;
        let err = store.store(stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let mut fresh = resource("a");
        fresh.metadata.resource_version = 2;
        assert_eq!(
            store.store(fresh).await.unwrap().metadata.resource_version,
            3
        );
    }

    #[tokio::test]
    async fn test_store_rejects_self_dependency() {
        let store = MemoryStore::new();
        let err = store.store(resource("a").depends_on("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_state_defaults_to_unknown() {
        let store = MemoryStore::new();
        store.store(resource("a")).await.unwrap();
        assert_eq!(
            store.last_known_state(&"a".into()).await.unwrap(),
            ResourceState::Unknown
        );

        store
            .update_state(&"a".into(), ResourceState::Diff)
            .await
            .unwrap();
        store
            .update_state(&"a".into(), ResourceState::Ok)
            .await
            .unwrap();
        assert_eq!(
            store.last_known_state(&"a".into()).await.unwrap(),
            ResourceState::Ok
        );
    }

    #[tokio::test]
    async fn test_update_state_unknown_resource() {
        let store = MemoryStore::new();
        let err = store
            .update_state(&"ghost".into(), ResourceState::Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enumeration_and_dependents() {
        let store = MemoryStore::new();
        store.store(resource("sg")).await.unwrap();
        store.store(resource("lb").depends_on("sg")).await.unwrap();
        store
            .store(resource("asg").depends_on("lb").depends_on("sg"))
            .await
            .unwrap();

        let all: Vec<_> = store
            .all_resources()
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(all.len(), 3);

        let roots: Vec<_> = store
            .root_resources()
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(roots, vec![ResourceId::from("sg")]);

        let dependents = store.dependents(&"sg".into()).await.unwrap();
        assert_eq!(dependents, vec![ResourceId::from("asg"), ResourceId::from("lb")]);
    }

    #[tokio::test]
    async fn test_history_is_capped_and_newest_first() {
        let store = MemoryStore::new().with_history_limit(3);
        store.store(resource("a")).await.unwrap();
        for _ in 0..4 {
            store
                .append_history(ResourceEvent::now("a".into(), ResourceEventKind::Valid))
                .await
                .unwrap();
        }
        store
            .append_history(ResourceEvent::now("a".into(), ResourceEventKind::Missing))
            .await
            .unwrap();

        let history = store.event_history(&"a".into(), 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, ResourceEventKind::Missing);
    }

    #[tokio::test]
    async fn test_delete_clears_everything() {
        let store = MemoryStore::new();
        store.store(resource("a")).await.unwrap();
        store
            .update_state(&"a".into(), ResourceState::Missing)
            .await
            .unwrap();
        store
            .record_diff(&"a".into(), Fingerprint::from_hex("ff"))
            .await
            .unwrap();

        store.delete(&"a".into()).await.unwrap();
        assert!(matches!(
            store.get(&"a".into()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.diff_record(&"a".into()).await.unwrap().is_none());
        assert!(store.event_history(&"a".into(), 10).await.unwrap().is_empty());
        assert!(matches!(
            store.delete(&"a".into()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_diff_tracking() {
        let store = MemoryStore::new();
        let id = ResourceId::from("a");
        store.store(resource("a")).await.unwrap();

        store.record_diff(&id, Fingerprint::from_hex("01")).await.unwrap();
        store.mark_action_taken(&id).await.unwrap();
        let record = store.record_diff(&id, Fingerprint::from_hex("01")).await.unwrap();
        assert_eq!(record.seen_count, 2);
        assert_eq!(record.actions_taken, 1);

        store.clear_diff(&id).await.unwrap();
        assert!(store.diff_record(&id).await.unwrap().is_none());
    }
}
