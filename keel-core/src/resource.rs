//! Resource model: identity, desired spec, dependency edges and check state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable resource key, e.g. `ec2.SecurityGroup:prod:us-east-1:web`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Handler lookup key: API group/version plus kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKind {
    pub api_version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default)]
    pub name: String,
    /// Assigned by the store on first write.
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store on every write. A non-zero value on an incoming
    /// resource must match the stored version.
    #[serde(default)]
    pub resource_version: u64,
}

/// A declaratively managed entity with a desired spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceId,
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ResourceMetadata,
    pub spec: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,
}

/// Errors for resources that can never be stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidResource {
    #[error("resource id is empty")]
    EmptyId,

    #[error("resource {0} has no kind")]
    MissingKind(ResourceId),

    #[error("resource {0} depends on itself")]
    SelfDependency(ResourceId),
}

impl Resource {
    pub fn new(
        id: impl Into<ResourceId>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        spec: Value,
    ) -> Self {
        let id = id.into();
        Self {
            metadata: ResourceMetadata {
                name: id.as_str().rsplit(':').next().unwrap_or_default().to_string(),
                ..Default::default()
            },
            id,
            api_version: api_version.into(),
            kind: kind.into(),
            spec,
            depends_on: BTreeSet::new(),
        }
    }

    /// Adds a dependency edge.
    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::new(self.api_version.clone(), self.kind.clone())
    }

    pub fn header(&self) -> ResourceHeader {
        ResourceHeader {
            id: self.id.clone(),
            kind: self.resource_kind(),
        }
    }

    pub fn validate(&self) -> Result<(), InvalidResource> {
        if self.id.as_str().is_empty() {
            return Err(InvalidResource::EmptyId);
        }
        if self.kind.is_empty() {
            return Err(InvalidResource::MissingKind(self.id.clone()));
        }
        if self.depends_on.contains(&self.id) {
            return Err(InvalidResource::SelfDependency(self.id.clone()));
        }
        Ok(())
    }
}

/// Enumeration entry used by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHeader {
    pub id: ResourceId,
    pub kind: ResourceKind,
}

/// Result of the most recent check of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    /// Never checked.
    #[default]
    Unknown,
    /// Current matches desired.
    Ok,
    /// Current exists but differs from desired.
    Diff,
    /// Current confirmed absent.
    Missing,
    /// A dependency is missing or not `Ok`; convergence withheld.
    FailedPreconditions,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unknown => "Unknown",
            ResourceState::Ok => "Ok",
            ResourceState::Diff => "Diff",
            ResourceState::Missing => "Missing",
            ResourceState::FailedPreconditions => "FailedPreconditions",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(ResourceState::Unknown),
            "Ok" => Ok(ResourceState::Ok),
            "Diff" => Ok(ResourceState::Diff),
            "Missing" => Ok(ResourceState::Missing),
            "FailedPreconditions" => Ok(ResourceState::FailedPreconditions),
            other => Err(format!("unknown resource state '{}'", other)),
        }
    }
}

/// Convergence action taken by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Update => f.write_str("update"),
            Action::Delete => f.write_str("delete"),
        }
    }
}
