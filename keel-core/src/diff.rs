//! Desired-vs-current comparison and fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceState;

/// Content hash of a JSON document.
///
/// `serde_json` keeps object keys sorted, so equal documents always render to
/// the same bytes regardless of the order their fields were built in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(value: &Value) -> Self {
        Self(blake3::hash(value.to_string().as_bytes()).to_hex().to_string())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired and current state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub desired: Value,
    pub current: Option<Value>,
}

impl ResourceDiff {
    pub fn new(desired: Value, current: Option<Value>) -> Self {
        Self { desired, current }
    }

    pub fn is_missing(&self) -> bool {
        self.current.is_none()
    }

    pub fn has_changes(&self) -> bool {
        match &self.current {
            None => true,
            Some(current) => Fingerprint::of(current) != Fingerprint::of(&self.desired),
        }
    }

    /// The state this observation maps to.
    pub fn state(&self) -> ResourceState {
        if self.is_missing() {
            ResourceState::Missing
        } else if self.has_changes() {
            ResourceState::Diff
        } else {
            ResourceState::Ok
        }
    }

    /// Identifies this particular delta, so the same drift seen on repeated
    /// checks maps to the same value.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&serde_json::json!({
            "desired": self.desired,
            "current": self.current,
        }))
    }

    /// JSON-pointer style paths whose values differ, for logs and history.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        match &self.current {
            None => paths.push(String::new()),
            Some(current) => collect_paths(&self.desired, current, String::new(), &mut paths),
        }
        paths
    }
}

fn collect_paths(desired: &Value, current: &Value, prefix: String, out: &mut Vec<String>) {
    match (desired, current) {
        (Value::Object(d), Value::Object(c)) => {
            let mut keys: Vec<&String> = d.keys().chain(c.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = format!("{}/{}", prefix, key);
                match (d.get(key), c.get(key)) {
                    (Some(dv), Some(cv)) => collect_paths(dv, cv, path, out),
                    _ => out.push(path),
                }
            }
        }
        (d, c) if d != c => out.push(prefix),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [80, 443]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [80, 443], "b": 1}"#).unwrap();
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&json!({"a": [443, 80], "b": 1})));
    }

    #[test]
    fn test_state_from_diff() {
        let desired = json!({"ports": [80]});
        assert_eq!(
            ResourceDiff::new(desired.clone(), None).state(),
            ResourceState::Missing
        );
        assert_eq!(
            ResourceDiff::new(desired.clone(), Some(json!({"ports": [8080]}))).state(),
            ResourceState::Diff
        );
        assert_eq!(
            ResourceDiff::new(desired.clone(), Some(desired)).state(),
            ResourceState::Ok
        );
    }

    #[test]
    fn test_changed_paths() {
        let diff = ResourceDiff::new(
            json!({"ports": [80], "name": "web", "tags": {"env": "prod", "team": "a"}}),
            Some(json!({"ports": [80], "name": "web", "tags": {"env": "test"}, "extra": 1})),
        );
        assert_eq!(
            diff.changed_paths(),
            vec!["/extra", "/tags/env", "/tags/team"]
        );
    }

    #[test]
    fn test_same_drift_same_fingerprint() {
        let a = ResourceDiff::new(json!({"x": 1}), Some(json!({"x": 2})));
        let b = ResourceDiff::new(json!({"x": 1}), Some(json!({"x": 2})));
        let c = ResourceDiff::new(json!({"x": 1}), Some(json!({"x": 3})));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
