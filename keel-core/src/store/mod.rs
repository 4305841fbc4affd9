//! DataStore abstraction for the engine.
//!
//! Holds the desired spec of every resource, its last known state, a bounded
//! per-resource history and diff fingerprint tracking.
//!
//! # Architecture
//!
//! ```text
//! processor / scheduler / vetoes → Arc<dyn DataStore>
//!                                        ↓
//!                          MemoryStore (tests, --dev)
//!                          SqliteStore (shared by a fleet)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use keel_core::store::{DataStore, ResourceStore, SqliteStore};
//!
//! let store: Arc<dyn DataStore> = Arc::new(SqliteStore::open(&path).await?);
//! store.store(Resource::new("sg-1", "ec2", "SecurityGroup", spec)).await?;
//! let state = store.last_known_state(&"sg-1".into()).await?;
//! ```

mod error;
mod event;
mod memory;
mod sqlite;
mod traits;

pub use error::{Result, StoreError};
pub use event::{ResourceEvent, ResourceEventKind};
pub use memory::MemoryStore;
pub use sqlite::{SqliteLock, SqliteStore};
pub use traits::*;

/// Events kept per resource unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
