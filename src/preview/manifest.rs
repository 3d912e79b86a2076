//! Minimal `package.json` reader.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_json::Value;
use tracing::debug;

pub const MANIFEST_FILE: &str = "package.json";

/// The parts of a `package.json` the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Whether a `scripts` object was present at all.
    pub has_scripts_section: bool,
    pub scripts: BTreeMap<String, String>,
    /// Names from `dependencies` and `devDependencies`.
    pub dependencies: BTreeSet<String>,
}

impl Manifest {
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let root = value.as_object()?;

        let mut manifest = Manifest::default();
        if let Some(scripts) = root.get("scripts").and_then(Value::as_object) {
            manifest.has_scripts_section = true;
            for (name, body) in scripts {
                if let Some(body) = body.as_str() {
                    manifest.scripts.insert(name.clone(), body.to_string());
                }
            }
        }
        for section in ["dependencies", "devDependencies"] {
            if let Some(deps) = root.get(section).and_then(Value::as_object) {
                manifest.dependencies.extend(deps.keys().cloned());
            }
        }
        Some(manifest)
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.script(name).is_some_and(|s| !s.trim().is_empty())
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }
}

/// Read and parse `<dir>/package.json`. Missing or malformed manifests yield `None`.
pub async fn read_manifest(dir: &Path) -> Option<Manifest> {
    let path = dir.join(MANIFEST_FILE);
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    let manifest = Manifest::parse(&text);
    if manifest.is_none() {
        debug!(path = %path.display(), "ignoring unparseable package.json");
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scripts_and_deps() {
        let manifest = Manifest::parse(
            r#"{
                "name": "web",
                "scripts": { "build": "vite build", "dev": "vite", "lint": 3 },
                "dependencies": { "react": "^18.0.0" },
                "devDependencies": { "vite": "^5.0.0" }
            }"#,
        )
        .unwrap();
        assert!(manifest.has_scripts_section);
        assert_eq!(manifest.script("build"), Some("vite build"));
        assert!(manifest.has_script("dev"));
        assert!(!manifest.has_script("lint"));
        assert!(manifest.depends_on("react"));
        assert!(manifest.depends_on("vite"));
    }

    #[test]
    fn test_parse_without_scripts() {
        let manifest = Manifest::parse(r#"{"name": "lib"}"#).unwrap();
        assert!(!manifest.has_scripts_section);
        assert!(manifest.scripts.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(Manifest::parse("[1, 2]").is_none());
        assert!(Manifest::parse("{ not json").is_none());
    }

    #[tokio::test]
    async fn test_read_manifest_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_manifest(dir.path()).await.is_none());
        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{"start":"serve"}}"#).unwrap();
        let manifest = read_manifest(dir.path()).await.unwrap();
        assert!(manifest.has_script("start"));
    }
}
