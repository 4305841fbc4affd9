//! Desired-state manifests: a JSON array of resources.

use std::path::Path;

use anyhow::{Context, Result};
use keel_core::store::{DataStore, ResourceStore};
use keel_core::Resource;
use tracing::info;

pub fn parse(json: &str) -> Result<Vec<Resource>> {
    let resources: Vec<Resource> = serde_json::from_str(json).context("Invalid manifest")?;
    for resource in &resources {
        resource.validate()?;
    }
    Ok(resources)
}

/// Store every resource in the manifest, replacing existing specs.
pub async fn apply(store: &dyn DataStore, path: &Path) -> Result<usize> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let resources = parse(&json)?;
    let count = resources.len();

    for mut resource in resources {
        resource.metadata.resource_version = 0;
        let stored = store
            .store(resource)
            .await
            .context("Failed to store resource")?;
        info!(
            "Applied {} {} (version {})",
            stored.resource_kind(),
            stored.id,
            stored.metadata.resource_version
        );
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::store::MemoryStore;
    use keel_core::ResourceId;

    #[tokio::test]
    async fn test_apply_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "dir", "apiVersion": "local", "kind": "File",
                 "spec": {"path": "/tmp/keel/a", "content": "a"}},
                {"id": "motd", "apiVersion": "local", "kind": "File",
                 "spec": {"path": "/tmp/keel/b", "content": "b"}, "dependsOn": ["dir"]}
            ]"#,
        )
        .unwrap();

        let store = MemoryStore::new();
        assert_eq!(apply(&store, &path).await.unwrap(), 2);
        assert_eq!(apply(&store, &path).await.unwrap(), 2);

        let motd = store.get(&"motd".into()).await.unwrap();
        assert_eq!(motd.metadata.resource_version, 2);
        assert_eq!(
            store.dependents(&"dir".into()).await.unwrap(),
            vec![ResourceId::from("motd")]
        );
    }

    #[test]
    fn test_rejects_self_dependency() {
        let err = parse(
            r#"[{"id": "a", "apiVersion": "local", "kind": "File", "spec": {}, "dependsOn": ["a"]}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }
}
