//! Check/converge processor.
//!
//! One `check` observes a single resource, records what it saw and, when
//! allowed, makes at most one create or update call to bring it in line.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::diff::ResourceDiff;
use crate::dispatch::Message;
use crate::graph::DependencyGraph;
use crate::handler::{HandlerError, HandlerRegistry, ResourceHandler, RegistryError, bounded};
use crate::pause::ActuationPauser;
use crate::resource::{Action, Resource, ResourceId, ResourceState};
use crate::store::{DataStore, ResourceEvent, ResourceEventKind, StoreError};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::veto::{ProposedChange, VetoChain, VetoVerdict};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    ActuationInProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Paused => f.write_str("ActuationPaused"),
            SkipReason::ActuationInProgress => f.write_str("ActuationInProgress"),
        }
    }
}

/// What a single check did.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The resource was deleted before the check ran.
    NotFound,
    Skipped(SkipReason),
    /// Dependencies not `Ok`; nothing observed or changed.
    PreconditionsFailed(Vec<(ResourceId, ResourceState)>),
    /// Desired or current state could not be fetched. State left unchanged.
    Unresolvable(HandlerError),
    Valid,
    Created,
    Updated,
    Vetoed {
        state: ResourceState,
        verdict: VetoVerdict,
    },
    NotActionable {
        state: ResourceState,
        message: Option<String>,
    },
}

impl CheckOutcome {
    /// State written to the store by this check, if any.
    pub fn recorded_state(&self) -> Option<ResourceState> {
        match self {
            CheckOutcome::PreconditionsFailed(_) => Some(ResourceState::FailedPreconditions),
            CheckOutcome::Valid => Some(ResourceState::Ok),
            CheckOutcome::Created => Some(ResourceState::Missing),
            CheckOutcome::Updated => Some(ResourceState::Diff),
            CheckOutcome::Vetoed { state, .. } | CheckOutcome::NotActionable { state, .. } => {
                Some(*state)
            }
            CheckOutcome::NotFound | CheckOutcome::Skipped(_) | CheckOutcome::Unresolvable(_) => {
                None
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{action} of {id} failed: {source}")]
    Actuation {
        id: ResourceId,
        action: Action,
        #[source]
        source: HandlerError,
    },
}

impl CheckError {
    /// Configuration problems that will not fix themselves on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CheckError::Registry(_) | CheckError::Store(StoreError::Invalid(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;

pub struct CheckProcessor {
    store: Arc<dyn DataStore>,
    registry: Arc<HandlerRegistry>,
    vetoes: Arc<VetoChain>,
    graph: DependencyGraph,
    telemetry: TelemetrySink,
    pauser: Option<Arc<ActuationPauser>>,
    handler_timeout: Duration,
    propagate: bool,
}

impl CheckProcessor {
    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<HandlerRegistry>,
        vetoes: Arc<VetoChain>,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            graph: DependencyGraph::new(Arc::clone(&store)),
            store,
            registry,
            vetoes,
            telemetry,
            pauser: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            propagate: false,
        }
    }

    pub fn with_pauser(mut self, pauser: Arc<ActuationPauser>) -> Self {
        self.pauser = Some(pauser);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Also check every transitive dependent after a `CheckResource`.
    pub fn with_propagation(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    /// Process one dispatched message. Errors are logged, never returned.
    pub async fn handle(&self, message: Message) {
        match message {
            Message::CheckResource(id) if self.propagate => {
                if let Err(e) = self.check_tree(&id).await {
                    warn!(id = %id, "Failed to walk dependents: {}", e);
                }
            }
            Message::CheckResource(id) | Message::ConvergeResource(id) => {
                let _ = self.check(&id).await;
            }
        }
    }

    /// Check `root`, then each of its transitive dependents once.
    pub async fn check_tree(
        &self,
        root: &ResourceId,
    ) -> Result<Vec<(ResourceId, Result<CheckOutcome>)>> {
        let order = self.graph.validation_order(root).await?;
        let mut results = Vec::with_capacity(order.len());
        for id in order {
            let outcome = self.check(&id).await;
            results.push((id, outcome));
        }
        Ok(results)
    }

    /// Check one resource and converge it if needed.
    pub async fn check(&self, id: &ResourceId) -> Result<CheckOutcome> {
        let started = Instant::now();

        let resource = match self.store.get(id).await {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => {
                info!(id = %id, "Resource no longer exists, skipping check");
                return Ok(CheckOutcome::NotFound);
            }
            Err(e) => {
                let e = CheckError::from(e);
                self.report_error(id, &e).await;
                return Err(e);
            }
        };

        match self.check_resource(&resource).await {
            Ok(outcome) => {
                if let CheckOutcome::Skipped(reason) = &outcome {
                    self.record(
                        id,
                        ResourceEventKind::CheckSkipped {
                            reason: reason.to_string(),
                        },
                    )
                    .await;
                    self.telemetry.emit(TelemetryEvent::ResourceCheckSkipped {
                        id: id.clone(),
                        reason: reason.to_string(),
                    });
                }
                if let Some(state) = outcome.recorded_state() {
                    self.telemetry.emit(TelemetryEvent::ResourceChecked {
                        id: id.clone(),
                        kind: resource.resource_kind(),
                        state,
                        duration: started.elapsed(),
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                self.report_error(id, &e).await;
                Err(e)
            }
        }
    }

    async fn check_resource(&self, resource: &Resource) -> Result<CheckOutcome> {
        let id = &resource.id;

        if let Some(pauser) = &self.pauser
            && pauser.is_paused(id).await
        {
            info!(id = %id, "Actuation paused, skipping check");
            return Ok(CheckOutcome::Skipped(SkipReason::Paused));
        }

        let outdated = self.graph.outdated_dependencies(id).await?;
        if !outdated.is_empty() {
            info!(
                id = %id,
                "Withholding convergence, {} dependencies not ready: {}",
                outdated.len(),
                describe(&outdated)
            );
            self.store
                .update_state(id, ResourceState::FailedPreconditions)
                .await?;
            self.record(
                id,
                ResourceEventKind::PreconditionsFailed {
                    dependencies: outdated.iter().map(|(dep, _)| dep.clone()).collect(),
                },
            )
            .await;
            return Ok(CheckOutcome::PreconditionsFailed(outdated));
        }

        let handler = self.registry.resolve_for(resource)?;

        match bounded(
            "actuation_in_progress",
            self.handler_timeout,
            handler.actuation_in_progress(resource),
        )
        .await
        {
            Ok(false) => {}
            Ok(true) => {
                debug!(id = %id, "Actuation already in progress, skipping check");
                return Ok(CheckOutcome::Skipped(SkipReason::ActuationInProgress));
            }
            Err(e) => return Ok(self.unresolvable(id, e).await),
        }

        let (desired, current) = tokio::join!(
            bounded("desired", self.handler_timeout, handler.desired(resource)),
            bounded("current", self.handler_timeout, handler.current(resource)),
        );
        let diff = match (desired, current) {
            (Ok(desired), Ok(current)) => ResourceDiff::new(desired, current),
            (Err(e), _) | (_, Err(e)) => return Ok(self.unresolvable(id, e).await),
        };

        let previous = self.store.last_known_state(id).await?;
        let state = diff.state();
        self.store.update_state(id, state).await?;

        if state == ResourceState::Ok {
            self.store.clear_diff(id).await?;
            if previous != ResourceState::Ok {
                info!(id = %id, "Resource is valid (was {})", previous);
                self.record(id, ResourceEventKind::Valid).await;
            } else {
                debug!(id = %id, "Resource is valid");
            }
            return Ok(CheckOutcome::Valid);
        }

        let tracked = self.store.record_diff(id, diff.fingerprint()).await?;
        let action = if diff.is_missing() {
            info!(id = %id, "Resource is missing");
            self.record(id, ResourceEventKind::Missing).await;
            Action::Create
        } else {
            let paths = diff.changed_paths();
            info!(id = %id, "Delta detected at {}", paths.join(", "));
            self.record(id, ResourceEventKind::DeltaDetected { paths })
                .await;
            Action::Update
        };
        debug!(
            id = %id,
            seen = tracked.seen_count,
            actions = tracked.actions_taken,
            "Diff tracked"
        );

        let change = ProposedChange {
            action,
            diff: &diff,
        };
        let verdict = self.vetoes.evaluate(resource, &change).await;
        if !verdict.allowed() {
            let message = verdict.message();
            info!(id = %id, "{} vetoed: {}", action, message);
            self.record(
                id,
                ResourceEventKind::ActuationVetoed {
                    vetoes: verdict.denied_by(),
                    message,
                },
            )
            .await;
            self.telemetry.emit(TelemetryEvent::ActuationVetoed {
                id: id.clone(),
                vetoes: verdict.denied_by(),
            });
            return Ok(CheckOutcome::Vetoed { state, verdict });
        }

        let decision = match tokio::time::timeout(
            self.handler_timeout,
            handler.will_take_action(resource, &diff),
        )
        .await
        {
            Ok(decision) => decision,
            Err(_) => {
                warn!(id = %id, "will_take_action timed out");
                return Ok(self
                    .unresolvable(
                        id,
                        HandlerError::Timeout {
                            op: "will_take_action",
                            after: self.handler_timeout,
                        },
                    )
                    .await);
            }
        };
        if !decision.will_act {
            info!(
                id = %id,
                "Handler {} declined to act: {}",
                handler.name(),
                decision.message.as_deref().unwrap_or("no reason given")
            );
            self.record(
                id,
                ResourceEventKind::DiffNotActionable {
                    message: decision.message.clone().unwrap_or_default(),
                },
            )
            .await;
            return Ok(CheckOutcome::NotActionable {
                state,
                message: decision.message,
            });
        }

        self.converge(resource, handler.as_ref(), &diff, action).await
    }

    async fn converge(
        &self,
        resource: &Resource,
        handler: &dyn ResourceHandler,
        diff: &ResourceDiff,
        action: Action,
    ) -> Result<CheckOutcome> {
        let id = &resource.id;
        let result = match &diff.current {
            None => bounded("create", self.handler_timeout, handler.create(resource)).await,
            Some(current) => {
                bounded(
                    "update",
                    self.handler_timeout,
                    handler.update(resource, current),
                )
                .await
            }
        };

        if let Err(source) = result {
            return Err(CheckError::Actuation {
                id: id.clone(),
                action,
                source,
            });
        }

        info!(id = %id, "Launched {} via {}", action, handler.name());
        if let Err(e) = self.store.mark_action_taken(id).await {
            warn!(id = %id, "Failed to count action against diff: {}", e);
        }
        self.record(
            id,
            ResourceEventKind::ActuationLaunched {
                action,
                handler: handler.name().to_string(),
            },
        )
        .await;
        self.telemetry.emit(TelemetryEvent::ActuationLaunched {
            id: id.clone(),
            action,
        });

        Ok(match action {
            Action::Create => CheckOutcome::Created,
            _ => CheckOutcome::Updated,
        })
    }

    /// Delete a resource from the outside world and then from the store.
    ///
    /// Refused while other resources still depend on it.
    pub async fn delete(&self, id: &ResourceId) -> Result<()> {
        let resource = self.store.get(id).await?;

        let dependents = self.store.dependents(id).await?;
        if !dependents.is_empty() {
            let names: Vec<&str> = dependents.iter().map(|d| d.as_str()).collect();
            return Err(StoreError::Conflict(format!(
                "{} is still depended on by {}",
                id,
                names.join(", ")
            ))
            .into());
        }

        let handler = self.registry.resolve_for(&resource)?;
        bounded("delete", self.handler_timeout, handler.delete(&resource))
            .await
            .map_err(|source| CheckError::Actuation {
                id: id.clone(),
                action: Action::Delete,
                source,
            })?;

        self.store.delete(id).await?;
        info!(id = %id, "Deleted resource via {}", handler.name());
        self.telemetry.emit(TelemetryEvent::ActuationLaunched {
            id: id.clone(),
            action: Action::Delete,
        });
        Ok(())
    }

    async fn unresolvable(&self, id: &ResourceId, e: HandlerError) -> CheckOutcome {
        warn!(id = %id, "Unable to resolve current state: {}", e);
        self.record(
            id,
            ResourceEventKind::CheckUnresolvable {
                reason: e.to_string(),
            },
        )
        .await;
        self.telemetry.emit(TelemetryEvent::ResourceCheckUnresolvable {
            id: id.clone(),
            reason: e.to_string(),
        });
        CheckOutcome::Unresolvable(e)
    }

    async fn report_error(&self, id: &ResourceId, e: &CheckError) {
        let fatal = e.is_fatal();
        if fatal {
            error!(id = %id, "Check failed: {}", e);
        } else {
            warn!(id = %id, "Check failed: {}", e);
        }
        self.record(
            id,
            ResourceEventKind::CheckError {
                reason: e.to_string(),
            },
        )
        .await;
        self.telemetry.emit(TelemetryEvent::ResourceCheckError {
            id: id.clone(),
            fatal,
            message: e.to_string(),
        });
    }

    /// Best-effort history append.
    async fn record(&self, id: &ResourceId, kind: ResourceEventKind) {
        let event = ResourceEvent::now(id.clone(), kind);
        if let Err(e) = self.store.append_history(event).await {
            warn!(id = %id, "Failed to append history: {}", e);
        }
    }
}

fn describe(outdated: &[(ResourceId, ResourceState)]) -> String {
    outdated
        .iter()
        .map(|(id, state)| format!("{} ({})", id, state))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ActionDecision;
    use crate::resource::ResourceKind;
    use crate::store::{HistoryStore, MemoryStore, ResourceStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        current: Mutex<Option<Value>>,
        in_progress: bool,
        decline: bool,
        fail_current: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ResourceHandler for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn current(&self, _resource: &Resource) -> anyhow::Result<Option<Value>> {
            if self.fail_current {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.current.lock().unwrap().clone())
        }

        async fn create(&self, _resource: &Resource) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("create");
            Ok(())
        }

        async fn update(&self, _resource: &Resource, _current: &Value) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("update");
            Ok(())
        }

        async fn delete(&self, _resource: &Resource) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("delete");
            Ok(())
        }

        async fn will_take_action(&self, _resource: &Resource, _diff: &ResourceDiff) -> ActionDecision {
            if self.decline {
                ActionDecision::decline("manual change window")
            } else {
                ActionDecision::act()
            }
        }

        async fn actuation_in_progress(&self, _resource: &Resource) -> anyhow::Result<bool> {
            Ok(self.in_progress)
        }
    }

    async fn setup(handler: Arc<Scripted>) -> (Arc<MemoryStore>, CheckProcessor) {
        let store = Arc::new(MemoryStore::new());
        store
            .store(Resource::new("a", "t", "Thing", json!({"x": 1})))
            .await
            .unwrap();
        let mut registry = HandlerRegistry::new();
        registry
            .register(ResourceKind::new("t", "Thing"), handler)
            .unwrap();
        let processor = CheckProcessor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(VetoChain::new()),
            TelemetrySink::default(),
        );
        (store, processor)
    }

    #[tokio::test]
    async fn test_in_progress_skips() {
        let handler = Arc::new(Scripted {
            in_progress: true,
            ..Default::default()
        });
        let (store, processor) = setup(handler.clone()).await;

        let outcome = processor.check(&"a".into()).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Skipped(SkipReason::ActuationInProgress));
        assert!(handler.calls.lock().unwrap().is_empty());
        assert_eq!(
            store.last_known_state(&"a".into()).await.unwrap(),
            ResourceState::Unknown
        );
    }

    #[tokio::test]
    async fn test_declined_diff_is_recorded_not_acted_on() {
        let handler = Arc::new(Scripted {
            decline: true,
            current: Mutex::new(Some(json!({"x": 2}))),
            ..Default::default()
        });
        let (store, processor) = setup(handler.clone()).await;

        let outcome = processor.check(&"a".into()).await.unwrap();
        assert!(matches!(
            outcome,
            CheckOutcome::NotActionable {
                state: ResourceState::Diff,
                ..
            }
        ));
        assert!(handler.calls.lock().unwrap().is_empty());

        let history = store.event_history(&"a".into(), 1).await.unwrap();
        assert_eq!(history[0].type_name(), "DiffNotActionable");
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_prior_state() {
        let handler = Arc::new(Scripted {
            fail_current: true,
            ..Default::default()
        });
        let (store, processor) = setup(handler.clone()).await;
        store
            .update_state(&"a".into(), ResourceState::Ok)
            .await
            .unwrap();

        let outcome = processor.check(&"a".into()).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Unresolvable(HandlerError::Failed { op: "current", .. })));
        assert_eq!(
            store.last_known_state(&"a".into()).await.unwrap(),
            ResourceState::Ok
        );
    }

    #[tokio::test]
    async fn test_delete_refused_with_dependents() {
        let handler = Arc::new(Scripted::default());
        let (store, processor) = setup(handler.clone()).await;
        store
            .store(Resource::new("b", "t", "Thing", json!({})).depends_on("a"))
            .await
            .unwrap();

        let err = processor.delete(&"a".into()).await.unwrap_err();
        assert!(matches!(err, CheckError::Store(StoreError::Conflict(_))));
        assert!(!err.is_fatal());

        processor.delete(&"b".into()).await.unwrap();
        processor.delete(&"a".into()).await.unwrap();
        assert_eq!(*handler.calls.lock().unwrap(), vec!["delete", "delete"]);
        assert!(matches!(
            store.get(&"a".into()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_check_deleted_resource() {
        let (_store, processor) = setup(Arc::new(Scripted::default())).await;
        assert_eq!(
            processor.check(&"ghost".into()).await.unwrap(),
            CheckOutcome::NotFound
        );
    }
}
