//! Veto policies consulted before any convergence action.
//!
//! Every policy in the chain is evaluated, even after one has denied, so the
//! verdict carries the full set of reasons.

mod repeated;
mod upstream;

pub use repeated::RepeatedDiffVeto;
pub use upstream::UpstreamExistsVeto;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::diff::ResourceDiff;
use crate::resource::{Action, Resource};

/// One policy's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VetoResponse {
    pub allowed: bool,
    pub veto_name: String,
    pub message: Option<String>,
}

impl VetoResponse {
    pub fn allow(veto_name: impl Into<String>) -> Self {
        Self {
            allowed: true,
            veto_name: veto_name.into(),
            message: None,
        }
    }

    pub fn deny(veto_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            veto_name: veto_name.into(),
            message: Some(message.into()),
        }
    }
}

/// The action the processor intends to take.
#[derive(Debug, Clone, Copy)]
pub struct ProposedChange<'a> {
    pub action: Action,
    pub diff: &'a ResourceDiff,
}

/// A policy that may block an action.
///
/// Checks cannot fail: a policy that is unable to decide must deny.
#[async_trait]
pub trait Veto: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, resource: &Resource, change: &ProposedChange<'_>) -> VetoResponse;
}

/// Combined result of a chain evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VetoVerdict {
    pub responses: Vec<VetoResponse>,
}

impl VetoVerdict {
    /// True iff no policy denied. An empty chain allows.
    pub fn allowed(&self) -> bool {
        self.responses.iter().all(|r| r.allowed)
    }

    pub fn denials(&self) -> impl Iterator<Item = &VetoResponse> {
        self.responses.iter().filter(|r| !r.allowed)
    }

    pub fn denied_by(&self) -> Vec<String> {
        self.denials().map(|r| r.veto_name.clone()).collect()
    }

    pub fn message(&self) -> String {
        self.denials()
            .map(|r| match &r.message {
                Some(m) => format!("{}: {}", r.veto_name, m),
                None => r.veto_name.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Default, Clone)]
pub struct VetoChain {
    vetoes: Vec<Arc<dyn Veto>>,
}

impl VetoChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, veto: Arc<dyn Veto>) -> Self {
        self.vetoes.push(veto);
        self
    }

    pub fn add(&mut self, veto: Arc<dyn Veto>) {
        self.vetoes.push(veto);
    }

    pub async fn evaluate(&self, resource: &Resource, change: &ProposedChange<'_>) -> VetoVerdict {
        let responses = join_all(self.vetoes.iter().map(|v| v.check(resource, change))).await;
        VetoVerdict { responses }
    }
}
