//! Handler for `local/File` resources: a file with fixed content.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::{Resource, ResourceHandler, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const API_VERSION: &str = "local";
pub const KIND: &str = "File";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileSpec {
    path: PathBuf,
    content: String,
}

impl FileSpec {
    fn parse(resource: &Resource) -> Result<Self> {
        serde_json::from_value(resource.spec.clone())
            .with_context(|| format!("invalid File spec for {}", resource.id))
    }
}

pub struct FileHandler;

impl FileHandler {
    pub fn kind() -> ResourceKind {
        ResourceKind::new(API_VERSION, KIND)
    }

    async fn write(spec: &FileSpec) -> Result<()> {
        if let Some(parent) = spec.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&spec.path, &spec.content)
            .await
            .with_context(|| format!("Failed to write {}", spec.path.display()))
    }
}

#[async_trait]
impl ResourceHandler for FileHandler {
    fn name(&self) -> &str {
        "local-file"
    }

    fn supports(&self, resource: &Resource) -> bool {
        FileSpec::parse(resource).is_ok()
    }

    async fn desired(&self, resource: &Resource) -> Result<Value> {
        Ok(serde_json::to_value(FileSpec::parse(resource)?)?)
    }

    async fn current(&self, resource: &Resource) -> Result<Option<Value>> {
        let spec = FileSpec::parse(resource)?;
        match tokio::fs::read_to_string(&spec.path).await {
            Ok(content) => Ok(Some(serde_json::to_value(FileSpec {
                path: spec.path,
                content,
            })?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", spec.path.display())),
        }
    }

    async fn create(&self, resource: &Resource) -> Result<()> {
        let spec = FileSpec::parse(resource)?;
        debug!("Creating {}", spec.path.display());
        Self::write(&spec).await
    }

    async fn update(&self, resource: &Resource, _current: &Value) -> Result<()> {
        let spec = FileSpec::parse(resource)?;
        debug!("Rewriting {}", spec.path.display());
        Self::write(&spec).await
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        let spec = FileSpec::parse(resource)?;
        match tokio::fs::remove_file(&spec.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", spec.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(path: &std::path::Path, content: &str) -> Resource {
        Resource::new(
            "local.File:motd",
            API_VERSION,
            KIND,
            json!({"path": path, "content": content}),
        )
    }

    #[tokio::test]
    async fn test_converges_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("motd");
        let r = file(&path, "hello\n");
        let handler = FileHandler;

        assert!(handler.supports(&r));
        assert_eq!(handler.current(&r).await.unwrap(), None);

        handler.create(&r).await.unwrap();
        let current = handler.current(&r).await.unwrap().unwrap();
        assert_eq!(current, handler.desired(&r).await.unwrap());

        std::fs::write(&path, "tampered").unwrap();
        let current = handler.current(&r).await.unwrap().unwrap();
        assert_ne!(current, handler.desired(&r).await.unwrap());
        handler.update(&r, &current).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");

        handler.delete(&r).await.unwrap();
        assert!(!path.exists());
        handler.delete(&r).await.unwrap();
    }

    #[test]
    fn test_rejects_malformed_spec() {
        let r = Resource::new("local.File:bad", API_VERSION, KIND, json!({"path": 3}));
        assert!(!FileHandler.supports(&r));
    }
}
