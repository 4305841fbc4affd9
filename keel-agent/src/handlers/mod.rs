//! Handlers built into the agent.

pub mod file;

use std::sync::Arc;

use anyhow::Result;
use keel_core::HandlerRegistry;

pub use file::FileHandler;

/// Registry with every built-in handler. Fails on duplicate kinds.
pub fn builtin_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(FileHandler::kind(), Arc::new(FileHandler))?;
    Ok(registry)
}
