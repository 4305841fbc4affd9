use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::resource::Resource;
use crate::store::DataStore;

use super::{ProposedChange, Veto, VetoResponse};

const NAME: &str = "RepeatedDiff";

/// Stops acting on a diff that keeps coming back unchanged after the
/// handler has already tried to fix it `max_actions` times.
pub struct RepeatedDiffVeto {
    store: Arc<dyn DataStore>,
    max_actions: u32,
}

impl RepeatedDiffVeto {
    pub fn new(store: Arc<dyn DataStore>, max_actions: u32) -> Self {
        Self { store, max_actions }
    }
}

#[async_trait]
impl Veto for RepeatedDiffVeto {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, resource: &Resource, change: &ProposedChange<'_>) -> VetoResponse {
        let record = match self.store.diff_record(&resource.id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(id = %resource.id, error = %e, "Failed to read diff record");
                return VetoResponse::deny(NAME, format!("diff record unavailable: {}", e));
            }
        };

        match record {
            Some(record)
                if record.fingerprint == change.diff.fingerprint()
                    && record.actions_taken >= self.max_actions =>
            {
                VetoResponse::deny(
                    NAME,
                    format!(
                        "same diff persisted after {} {} attempts",
                        record.actions_taken, change.action
                    ),
                )
            }
            _ => VetoResponse::allow(NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ResourceDiff;
    use crate::resource::Action;
    use crate::store::{DiffStore, MemoryStore, ResourceStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_denies_after_max_actions() {
        let store = Arc::new(MemoryStore::new());
        let r = store
            .store(Resource::new("a", "t", "Thing", json!({"x": 1})))
            .await
            .unwrap();
        let veto = RepeatedDiffVeto::new(store.clone(), 2);

        let diff = ResourceDiff::new(json!({"x": 1}), Some(json!({"x": 2})));
        let change = ProposedChange {
            action: Action::Update,
            diff: &diff,
        };

        for _ in 0..2 {
            store.record_diff(&r.id, diff.fingerprint()).await.unwrap();
            assert!(veto.check(&r, &change).await.allowed);
            store.mark_action_taken(&r.id).await.unwrap();
        }
        store.record_diff(&r.id, diff.fingerprint()).await.unwrap();
        let response = veto.check(&r, &change).await;
        assert!(!response.allowed);
        assert_eq!(response.veto_name, "RepeatedDiff");

        // a different diff starts over
        let other = ResourceDiff::new(json!({"x": 1}), Some(json!({"x": 3})));
        store.record_diff(&r.id, other.fingerprint()).await.unwrap();
        let change = ProposedChange {
            action: Action::Update,
            diff: &other,
        };
        assert!(veto.check(&r, &change).await.allowed);
    }
}
