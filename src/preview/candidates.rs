//! Application-root discovery inside a (possibly monorepo) checkout.
//!
//! Every directory that could hold the previewable app is scored from its
//! `package.json` scripts, its dependencies, and its name. Higher scores win.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::manifest::{Manifest, read_manifest};

pub const ROOT_BONUS: i32 = 20;
pub const BUILD_SCRIPT_BONUS: i32 = 30;
pub const DEV_SCRIPT_BONUS: i32 = 20;
pub const START_SCRIPT_BONUS: i32 = 10;
pub const FRAMEWORK_BONUS: i32 = 15;
pub const FRONTEND_NAME_BONUS: i32 = 60;
pub const FRONTEND_RANK_STEP: i32 = 5;
pub const FRONTEND_SUBSTRING_BONUS: i32 = 15;
pub const BACKEND_PENALTY: i32 = 40;

/// Conventional frontend directory names, best first.
pub const FRONTEND_DIR_RANKING: &[&str] = &[
    "frontend", "web", "client", "app", "ui", "site", "www", "dashboard",
];

const BACKEND_DIR_NAMES: &[&str] = &[
    "backend", "server", "api", "functions", "supabase", "worker", "workers", "lambda",
];

/// Directories checked directly under the workspace root.
pub const CONVENTIONAL_APP_DIRS: &[&str] = &[
    "frontend", "web", "client", "app", "ui", "site", "www", "dashboard", "webapp", "backend",
    "server", "api",
];

/// Containers whose immediate children are also candidates.
pub const MONOREPO_CONTAINERS: &[&str] = &["apps", "packages"];

/// Dependencies that identify a frontend framework.
pub const FRAMEWORK_DEPENDENCIES: &[&str] = &[
    "next",
    "react",
    "vue",
    "nuxt",
    "svelte",
    "@sveltejs/kit",
    "vite",
    "@angular/core",
    "solid-js",
    "astro",
    "preact",
    "gatsby",
    "@remix-run/react",
    "react-scripts",
];

pub const DEFAULT_MAX_CANDIDATES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Path relative to the workspace root, `.` for the root itself.
    pub relative_path: String,
    pub has_build: bool,
    pub has_dev: bool,
    pub has_start: bool,
    pub framework: Option<String>,
    pub score: i32,
}

impl Candidate {
    fn root_fallback() -> Self {
        Self {
            relative_path: ".".to_string(),
            has_build: false,
            has_dev: false,
            has_start: false,
            framework: None,
            score: 0,
        }
    }

    /// Absolute directory of this candidate.
    pub fn dir(&self, workspace_root: &Path) -> PathBuf {
        if self.relative_path == "." {
            workspace_root.to_path_buf()
        } else {
            workspace_root.join(&self.relative_path)
        }
    }
}

fn is_backend_name(name: &str) -> bool {
    BACKEND_DIR_NAMES.contains(&name)
        || name.contains("backend")
        || name.contains("server")
        || name.starts_with("api-")
        || name.ends_with("-api")
}

fn framework_hint(manifest: &Manifest) -> Option<String> {
    FRAMEWORK_DEPENDENCIES
        .iter()
        .find(|dep| manifest.depends_on(dep))
        .map(|dep| dep.to_string())
}

/// Score a directory. `name` is its final path component, ignored for the root.
pub fn score_candidate(name: Option<&str>, manifest: &Manifest) -> i32 {
    let mut score = 0;
    if name.is_none() {
        score += ROOT_BONUS;
    }
    if manifest.has_script("build") {
        score += BUILD_SCRIPT_BONUS;
    }
    if manifest.has_script("dev") {
        score += DEV_SCRIPT_BONUS;
    }
    if manifest.has_script("start") {
        score += START_SCRIPT_BONUS;
    }
    if framework_hint(manifest).is_some() {
        score += FRAMEWORK_BONUS;
    }
    if let Some(name) = name {
        let name = name.to_ascii_lowercase();
        if let Some(rank) = FRONTEND_DIR_RANKING.iter().position(|n| *n == name) {
            score += FRONTEND_NAME_BONUS - FRONTEND_RANK_STEP * rank as i32;
        } else if name.contains("frontend") || name.contains("web") {
            score += FRONTEND_SUBSTRING_BONUS;
        }
        if is_backend_name(&name) {
            score -= BACKEND_PENALTY;
        }
    }
    score
}

fn build_candidate(relative_path: &str, manifest: &Manifest) -> Candidate {
    let name = if relative_path == "." {
        None
    } else {
        relative_path.rsplit('/').next()
    };
    Candidate {
        relative_path: relative_path.to_string(),
        has_build: manifest.has_script("build"),
        has_dev: manifest.has_script("dev"),
        has_start: manifest.has_script("start"),
        framework: framework_hint(manifest),
        score: score_candidate(name, manifest),
    }
}

async fn child_dirs(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && !name.starts_with('.') && name != "node_modules" {
            names.push(name);
        }
    }
    names.sort();
    names
}

fn relative_to(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return Some(".".to_string());
    }
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.iter().any(|p| p == "..") {
        return None;
    }
    Some(parts.join("/"))
}

/// Ranked application-root candidates for a workspace.
///
/// `override_dir` (an absolute path inside the workspace) is ranked first when
/// it exists and carries a manifest. Returns at most `max` entries and never
/// an empty list: without any qualifying directory the root is returned.
pub async fn list_candidates(
    workspace_root: &Path,
    override_dir: Option<&Path>,
    max: usize,
) -> Vec<Candidate> {
    let mut paths: Vec<String> = vec![".".to_string()];
    paths.extend(CONVENTIONAL_APP_DIRS.iter().map(|d| d.to_string()));
    for container in MONOREPO_CONTAINERS {
        for child in child_dirs(&workspace_root.join(container)).await {
            paths.push(format!("{}/{}", container, child));
        }
    }

    let mut seen = BTreeSet::new();
    let mut scanned = Vec::new();
    for rel in paths {
        if !seen.insert(rel.clone()) {
            continue;
        }
        let dir = if rel == "." {
            workspace_root.to_path_buf()
        } else {
            workspace_root.join(&rel)
        };
        let Some(manifest) = read_manifest(&dir).await else {
            continue;
        };
        if !manifest.has_scripts_section
            || !["build", "dev", "start"].iter().any(|s| manifest.has_script(s))
        {
            continue;
        }
        scanned.push(build_candidate(&rel, &manifest));
    }
    scanned.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });

    let mut ranked = Vec::new();
    if let Some(dir) = override_dir
        && let Some(rel) = relative_to(workspace_root, dir)
        && let Some(manifest) = read_manifest(dir).await
    {
        scanned.retain(|c| c.relative_path != rel);
        ranked.push(build_candidate(&rel, &manifest));
    }
    ranked.extend(scanned);

    if ranked.is_empty() {
        ranked.push(Candidate::root_fallback());
    }
    ranked.truncate(max.max(1));
    debug!(
        workspace = %workspace_root.display(),
        candidates = ?ranked.iter().map(|c| (&c.relative_path, c.score)).collect::<Vec<_>>(),
        "ranked application candidates"
    );
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(root: &Path, rel: &str, body: &str) {
        let dir = if rel == "." { root.to_path_buf() } else { root.join(rel) };
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), body).unwrap();
    }

    const VITE_APP: &str = r#"{"scripts":{"build":"vite build","dev":"vite"},"devDependencies":{"vite":"^5"}}"#;
    const EXPRESS_API: &str = r#"{"scripts":{"build":"tsc","start":"node dist/index.js"},"dependencies":{"express":"^4"}}"#;

    #[test]
    fn test_scoring_weights() {
        let manifest = Manifest::parse(VITE_APP).unwrap();
        // root + build + dev + framework
        assert_eq!(score_candidate(None, &manifest), 20 + 30 + 20 + 15);
        // frontend rank 0, no root bonus
        assert_eq!(score_candidate(Some("frontend"), &manifest), 30 + 20 + 15 + 60);
        assert_eq!(score_candidate(Some("web"), &manifest), 30 + 20 + 15 + 55);
        assert_eq!(score_candidate(Some("my-webapp"), &manifest), 30 + 20 + 15 + 15);
        let api = Manifest::parse(EXPRESS_API).unwrap();
        assert_eq!(score_candidate(Some("backend"), &api), 30 + 10 - 40);
        assert_eq!(score_candidate(Some("billing-api"), &api), 30 + 10 - 40);
    }

    #[tokio::test]
    async fn test_monorepo_prefers_frontend_over_backend() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, ".", r#"{"name":"mono","private":true}"#);
        write_manifest(root, "apps/web", VITE_APP);
        write_manifest(root, "apps/server", EXPRESS_API);
        write_manifest(root, "packages/shared", r#"{"name":"shared"}"#);

        let candidates = list_candidates(root, None, 10).await;
        let paths: Vec<&str> = candidates.iter().map(|c| c.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["apps/web", "apps/server"]);
        assert_eq!(candidates[0].framework.as_deref(), Some("vite"));
        assert!(candidates[0].has_build && candidates[0].has_dev && !candidates[0].has_start);
    }

    #[tokio::test]
    async fn test_directory_without_lifecycle_scripts_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, "frontend", r#"{"scripts":{"lint":"eslint ."}}"#);
        write_manifest(root, "web", r#"{"scripts":{"start":"serve"}}"#);

        let candidates = list_candidates(root, None, 10).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].relative_path, "web");
    }

    #[tokio::test]
    async fn test_override_ranked_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, "frontend", VITE_APP);
        write_manifest(root, "tools/preview", r#"{"name":"preview"}"#);

        let override_dir = root.join("tools/preview");
        let candidates = list_candidates(root, Some(&override_dir), 10).await;
        assert_eq!(candidates[0].relative_path, "tools/preview");
        assert_eq!(candidates[1].relative_path, "frontend");
    }

    #[tokio::test]
    async fn test_override_without_manifest_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, "frontend", VITE_APP);
        let candidates = list_candidates(root, Some(&root.join("missing")), 10).await;
        assert_eq!(candidates[0].relative_path, "frontend");
    }

    #[tokio::test]
    async fn test_root_fallback_when_nothing_qualifies() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = list_candidates(dir.path(), None, 10).await;
        assert_eq!(candidates, vec![Candidate::root_fallback()]);
        assert_eq!(candidates[0].dir(dir.path()), dir.path());
    }

    #[tokio::test]
    async fn test_max_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, "frontend", VITE_APP);
        write_manifest(root, "web", VITE_APP);
        write_manifest(root, "client", VITE_APP);
        let candidates = list_candidates(root, None, 2).await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].relative_path, "frontend");
    }
}
