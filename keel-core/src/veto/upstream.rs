use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::handler::{HandlerRegistry, bounded};
use crate::resource::{Resource, ResourceId};
use crate::store::DataStore;

use super::{ProposedChange, Veto, VetoResponse};

const NAME: &str = "UpstreamExists";

/// Denies convergence unless every declared dependency currently exists
/// according to its own handler.
pub struct UpstreamExistsVeto {
    store: Arc<dyn DataStore>,
    registry: Arc<HandlerRegistry>,
    timeout: Duration,
}

impl UpstreamExistsVeto {
    pub fn new(store: Arc<dyn DataStore>, registry: Arc<HandlerRegistry>, timeout: Duration) -> Self {
        Self {
            store,
            registry,
            timeout,
        }
    }

    /// `None` if the dependency exists, otherwise why not.
    async fn missing(&self, id: &ResourceId) -> Option<String> {
        let dependency = match self.store.get(id).await {
            Ok(r) => r,
            Err(e) => return Some(format!("{}: {}", id, e)),
        };
        let handler = match self.registry.resolve_for(&dependency) {
            Ok(h) => h,
            Err(e) => return Some(format!("{}: {}", id, e)),
        };
        match bounded("current", self.timeout, handler.current(&dependency)).await {
            Ok(Some(_)) => None,
            Ok(None) => Some(format!("{} does not exist", id)),
            Err(e) => Some(format!("{}: {}", id, e)),
        }
    }
}

#[async_trait]
impl Veto for UpstreamExistsVeto {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, resource: &Resource, _change: &ProposedChange<'_>) -> VetoResponse {
        let problems: Vec<String> = join_all(resource.depends_on.iter().map(|id| self.missing(id)))
            .await
            .into_iter()
            .flatten()
            .collect();

        if problems.is_empty() {
            VetoResponse::allow(NAME)
        } else {
            VetoResponse::deny(NAME, problems.join(", "))
        }
    }
}
