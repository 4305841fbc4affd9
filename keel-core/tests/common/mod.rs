//! Shared test utilities for keel-core integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::store::{DataStore, MemoryStore, ResourceStore};
use keel_core::{
    CheckProcessor, HandlerRegistry, LockError, LockProvider, Resource, ResourceHandler,
    ResourceId, ResourceKind, ResourceState, TelemetryEvent, TelemetrySink, VetoChain,
};
use serde_json::Value;
use tokio::sync::broadcast;

pub const API_VERSION: &str = "ec2";
pub const KIND: &str = "SecurityGroup";

/// A handler call, as seen by the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(ResourceId),
    Update(ResourceId, Value),
    Delete(ResourceId),
}

/// Handler whose view of the world is a map the test controls.
///
/// `create` and `update` only record the call; tests decide when the world
/// actually changes.
#[derive(Default)]
pub struct FakeHandler {
    world: Mutex<HashMap<ResourceId, Value>>,
    calls: Mutex<Vec<Call>>,
    /// State observed by `current` at the moment of each create/update.
    states_at_call: Mutex<Vec<ResourceState>>,
    store: Mutex<Option<Arc<dyn DataStore>>>,
    fail_current: AtomicBool,
    current_delay: Mutex<Option<Duration>>,
    current_calls: AtomicUsize,
}

impl FakeHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_current(&self, id: &str, value: Value) {
        self.world.lock().unwrap().insert(id.into(), value);
    }

    pub fn remove_current(&self, id: &str) {
        self.world.lock().unwrap().remove(&ResourceId::from(id));
    }

    pub fn fail_current(&self, fail: bool) {
        self.fail_current.store(fail, Ordering::SeqCst);
    }

    pub fn delay_current(&self, delay: Duration) {
        *self.current_delay.lock().unwrap() = Some(delay);
    }

    /// Lets the fake read back the recorded state when it is called.
    pub fn observe_store(&self, store: Arc<dyn DataStore>) {
        *self.store.lock().unwrap() = Some(store);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn states_at_call(&self) -> Vec<ResourceState> {
        self.states_at_call.lock().unwrap().clone()
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    async fn note_state(&self, id: &ResourceId) {
        let store = self.store.lock().unwrap().clone();
        if let Some(store) = store {
            let state = store.last_known_state(id).await.unwrap();
            self.states_at_call.lock().unwrap().push(state);
        }
    }
}

#[async_trait]
impl ResourceHandler for FakeHandler {
    fn name(&self) -> &str {
        "fake"
    }

    async fn current(&self, resource: &Resource) -> anyhow::Result<Option<Value>> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.current_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_current.load(Ordering::SeqCst) {
            anyhow::bail!("provider API unavailable");
        }
        Ok(self.world.lock().unwrap().get(&resource.id).cloned())
    }

    async fn create(&self, resource: &Resource) -> anyhow::Result<()> {
        self.note_state(&resource.id).await;
        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(resource.id.clone()));
        Ok(())
    }

    async fn update(&self, resource: &Resource, current: &Value) -> anyhow::Result<()> {
        self.note_state(&resource.id).await;
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update(resource.id.clone(), current.clone()));
        Ok(())
    }

    async fn delete(&self, resource: &Resource) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Delete(resource.id.clone()));
        Ok(())
    }
}

/// Lock that always answers the same way.
pub struct FixedLock {
    pub answer: Result<bool, &'static str>,
    pub attempts: AtomicUsize,
}

impl FixedLock {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(true),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(false),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            answer: Err("connection reset"),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LockProvider for FixedLock {
    async fn try_acquire(&self, _name: &str, _ttl: Duration) -> Result<bool, LockError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.answer
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }
}

/// Lock that never answers.
pub struct HangingLock;

#[async_trait]
impl LockProvider for HangingLock {
    async fn try_acquire(&self, _name: &str, _ttl: Duration) -> Result<bool, LockError> {
        std::future::pending().await
    }
}

pub fn sg(id: &str, spec: Value) -> Resource {
    Resource::new(id, API_VERSION, KIND, spec)
}

/// Store, fake handler and processor wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub handler: Arc<FakeHandler>,
    pub telemetry: TelemetrySink,
    pub events: broadcast::Receiver<TelemetryEvent>,
    pub processor: CheckProcessor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_vetoes(VetoChain::new())
    }

    pub fn with_vetoes(vetoes: VetoChain) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(store, vetoes, |p| p)
    }

    pub fn build(
        store: Arc<MemoryStore>,
        vetoes: VetoChain,
        configure: impl FnOnce(CheckProcessor) -> CheckProcessor,
    ) -> Self {
        let handler = FakeHandler::new();
        handler.observe_store(store.clone());

        let mut registry = HandlerRegistry::new();
        registry
            .register(ResourceKind::new(API_VERSION, KIND), handler.clone())
            .unwrap();

        let telemetry = TelemetrySink::new(256);
        let events = telemetry.subscribe();
        let processor = configure(CheckProcessor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(vetoes),
            telemetry.clone(),
        ));

        Self {
            store,
            handler,
            telemetry,
            events,
            processor,
        }
    }

    pub async fn put(&self, resource: Resource) -> Resource {
        self.store.store(resource).await.unwrap()
    }

    pub async fn state(&self, id: &str) -> ResourceState {
        self.store.last_known_state(&id.into()).await.unwrap()
    }

    pub async fn set_state(&self, id: &str, state: ResourceState) {
        self.store.update_state(&id.into(), state).await.unwrap();
    }

    /// Telemetry emitted so far.
    pub fn drain_events(&mut self) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
