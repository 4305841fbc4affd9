//! Operator-controlled actuation pause.

use std::collections::HashSet;

use tokio::sync::RwLock;
use tracing::info;

use crate::resource::ResourceId;

/// Resources whose checks are skipped until resumed.
#[derive(Default)]
pub struct ActuationPauser {
    paused: RwLock<HashSet<ResourceId>>,
}

impl ActuationPauser {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pause(&self, id: ResourceId) {
        info!(id = %id, "Pausing actuation");
        self.paused.write().await.insert(id);
    }

    pub async fn resume(&self, id: &ResourceId) -> bool {
        let removed = self.paused.write().await.remove(id);
        if removed {
            info!(id = %id, "Resuming actuation");
        }
        removed
    }

    pub async fn is_paused(&self, id: &ResourceId) -> bool {
        self.paused.read().await.contains(id)
    }

    pub async fn paused(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.paused.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }
}
