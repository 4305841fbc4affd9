//! Dependency graph queries over the store.
//!
//! Edges are read from `depends_on` at query time; there is no cached graph.
//! Cycles are tolerated: a traversal never revisits a node already on its
//! current path.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::resource::{ResourceId, ResourceState};
use crate::store::{self, DataStore, StoreError};

enum Frame {
    Enter { id: ResourceId, from: ResourceId },
    Exit(ResourceId),
}

#[derive(Clone)]
pub struct DependencyGraph {
    store: Arc<dyn DataStore>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Transitive dependencies of `id` whose last known state is not `Ok`.
    ///
    /// A dependency that is not in the store is reported as `Unknown`. An
    /// edge that closes a cycle is logged and otherwise ignored.
    pub async fn outdated_dependencies(
        &self,
        id: &ResourceId,
    ) -> store::Result<Vec<(ResourceId, ResourceState)>> {
        let root = self.store.get(id).await?;

        let mut outdated = Vec::new();
        let mut visited: HashSet<ResourceId> = HashSet::new();
        let mut path: HashSet<ResourceId> = HashSet::from([root.id.clone()]);
        let mut stack: Vec<Frame> = root
            .depends_on
            .iter()
            .rev()
            .map(|dep| Frame::Enter {
                id: dep.clone(),
                from: root.id.clone(),
            })
            .collect();

        while let Some(frame) = stack.pop() {
            let (id, from) = match frame {
                Frame::Exit(id) => {
                    path.remove(&id);
                    continue;
                }
                Frame::Enter { id, from } => (id, from),
            };

            if path.contains(&id) {
                warn!(from = %from, to = %id, root = %root.id, "Dependency cycle detected");
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }

            let dependency = match self.store.get(&id).await {
                Ok(r) => r,
                Err(StoreError::NotFound(_)) => {
                    outdated.push((id, ResourceState::Unknown));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let state = self.store.last_known_state(&id).await?;
            if state != ResourceState::Ok {
                outdated.push((id.clone(), state));
            }

            path.insert(id.clone());
            stack.push(Frame::Exit(id.clone()));
            for dep in dependency.depends_on.iter().rev() {
                stack.push(Frame::Enter {
                    id: dep.clone(),
                    from: id.clone(),
                });
            }
        }

        Ok(outdated)
    }

    /// Direct dependents of `id`.
    pub async fn dependents(&self, id: &ResourceId) -> store::Result<Vec<ResourceId>> {
        self.store.dependents(id).await
    }

    /// `root` followed by its transitive dependents, breadth first, each once.
    pub async fn validation_order(&self, root: &ResourceId) -> store::Result<Vec<ResourceId>> {
        let mut order = Vec::new();
        let mut seen: HashSet<ResourceId> = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(id) = queue.pop_front() {
            for dependent in self.store.dependents(&id).await? {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
            order.push(id);
        }

        Ok(order)
    }
}
