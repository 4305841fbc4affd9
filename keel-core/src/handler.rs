//! Resource handlers and the kind → handler registry.
//!
//! A handler knows how to observe and converge one kind of resource. Handlers
//! talk to the outside world, so every call the engine makes into one is
//! bounded by a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::diff::ResourceDiff;
use crate::resource::{Resource, ResourceKind};

/// Whether a handler is prepared to act on a particular diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDecision {
    pub will_act: bool,
    pub message: Option<String>,
}

impl ActionDecision {
    pub fn act() -> Self {
        Self {
            will_act: true,
            message: None,
        }
    }

    pub fn decline(message: impl Into<String>) -> Self {
        Self {
            will_act: false,
            message: Some(message.into()),
        }
    }
}

/// Observes and converges resources of one kind.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Name used in logs and history.
    fn name(&self) -> &str;

    /// Finer-grained match than the registry key.
    fn supports(&self, _resource: &Resource) -> bool {
        true
    }

    /// Desired representation, comparable with what `current` returns.
    async fn desired(&self, resource: &Resource) -> Result<Value> {
        Ok(resource.spec.clone())
    }

    /// Current representation. `None` means confirmed absent.
    async fn current(&self, resource: &Resource) -> Result<Option<Value>>;

    /// Create the resource in its desired state.
    async fn create(&self, resource: &Resource) -> Result<()>;

    /// Bring an existing resource to its desired state.
    async fn update(&self, resource: &Resource, current: &Value) -> Result<()>;

    /// Remove the resource from the outside world.
    async fn delete(&self, resource: &Resource) -> Result<()> {
        bail!("{} does not support deleting {}", self.name(), resource.id)
    }

    async fn will_take_action(&self, _resource: &Resource, _diff: &ResourceDiff) -> ActionDecision {
        ActionDecision::act()
    }

    /// True while a previously launched action is still running.
    async fn actuation_in_progress(&self, _resource: &Resource) -> Result<bool> {
        Ok(false)
    }
}

/// Failure of a single handler call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("handler {op} failed: {reason}")]
    Failed { op: &'static str, reason: String },
}

impl HandlerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Timeout { .. })
    }
}

/// Run a handler call under `limit`, flattening its error.
pub async fn bounded<T, F>(op: &'static str, limit: Duration, call: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(HandlerError::Failed {
            op,
            reason: format!("{:#}", e),
        }),
        Err(_) => Err(HandlerError::Timeout { op, after: limit }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler already registered for {0}")]
    DuplicateKind(ResourceKind),

    #[error("no handler registered for {0}")]
    NoHandler(ResourceKind),

    #[error("handler {handler} does not support resource {id}")]
    Unsupported { handler: String, id: String },
}

/// Kind → handler lookup. Built once at startup, then shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ResourceKind, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: ResourceKind,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn resolve(&self, kind: &ResourceKind) -> Result<Arc<dyn ResourceHandler>, RegistryError> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::NoHandler(kind.clone()))
    }

    /// Resolve by kind, then confirm the handler accepts this resource.
    pub fn resolve_for(&self, resource: &Resource) -> Result<Arc<dyn ResourceHandler>, RegistryError> {
        let handler = self.resolve(&resource.resource_kind())?;
        if !handler.supports(resource) {
            return Err(RegistryError::Unsupported {
                handler: handler.name().to_string(),
                id: resource.id.to_string(),
            });
        }
        Ok(handler)
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop {
        only: Option<&'static str>,
    }

    #[async_trait]
    impl ResourceHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn supports(&self, resource: &Resource) -> bool {
            self.only.is_none_or(|id| resource.id.as_str() == id)
        }

        async fn current(&self, _resource: &Resource) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn create(&self, _resource: &Resource) -> Result<()> {
            Ok(())
        }

        async fn update(&self, _resource: &Resource, _current: &Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_rejects_duplicate_kind() {
        let mut registry = HandlerRegistry::new();
        let kind = ResourceKind::new("ec2", "SecurityGroup");
        registry
            .register(kind.clone(), Arc::new(Noop { only: None }))
            .unwrap();
        assert_eq!(
            registry
                .register(kind.clone(), Arc::new(Noop { only: None }))
                .err(),
            Some(RegistryError::DuplicateKind(kind.clone()))
        );
        assert_eq!(registry.kinds(), vec![kind]);
    }

    #[test]
    fn test_resolve() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                ResourceKind::new("ec2", "SecurityGroup"),
                Arc::new(Noop { only: Some("sg-1") }),
            )
            .unwrap();

        let sg = Resource::new("sg-1", "ec2", "SecurityGroup", json!({}));
        assert_eq!(registry.resolve_for(&sg).unwrap().name(), "noop");

        let other = Resource::new("sg-2", "ec2", "SecurityGroup", json!({}));
        assert!(matches!(
            registry.resolve_for(&other),
            Err(RegistryError::Unsupported { .. })
        ));

        let lb = Resource::new("lb-1", "ec2", "LoadBalancer", json!({}));
        assert!(matches!(
            registry.resolve_for(&lb),
            Err(RegistryError::NoHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_default_delete_is_unsupported() {
        let handler = Noop { only: None };
        let r = Resource::new("sg-1", "ec2", "SecurityGroup", json!({}));
        let err = bounded("delete", Duration::from_secs(1), handler.delete(&r))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed { op: "delete", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded("current", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }
}
