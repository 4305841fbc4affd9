//! keel - declarative resource reconciliation.
//!
//! A fleet of engines periodically compares the desired spec of every managed
//! resource with what its handler observes, and converges the difference.
//! Convergence is gated on dependencies being `Ok` and may be blocked by
//! veto policies; observation never is.

pub mod config;
pub mod diff;
pub mod dispatch;
pub mod graph;
pub mod handler;
pub mod lock;
pub mod pause;
pub mod processor;
pub mod resource;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod veto;

pub use config::{ConfigError, EngineConfig};
pub use diff::{Fingerprint, ResourceDiff};
pub use dispatch::{ChannelDispatcher, DispatchError, Dispatcher, Message, Workers};
pub use graph::DependencyGraph;
pub use handler::{ActionDecision, HandlerError, HandlerRegistry, RegistryError, ResourceHandler};
pub use lock::{LockError, LockProvider, MemoryLock};
pub use pause::ActuationPauser;
pub use processor::{CheckError, CheckOutcome, CheckProcessor, SkipReason};
pub use resource::{Action, Resource, ResourceId, ResourceKind, ResourceState};
pub use scheduler::{CheckScheduler, ScheduleMode, SchedulerSettings, SchedulerState, TickReport};
pub use telemetry::{TelemetryEvent, TelemetrySink};
pub use veto::{Veto, VetoChain, VetoResponse, VetoVerdict};
