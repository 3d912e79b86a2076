//! Environment for the started application.
//!
//! Layering, lowest precedence first: the declared `previewEnv` map, then the
//! conventional env files of the workspace root, then those of the app
//! directory. Placeholder backend variables are added last and only where
//! nothing else defines them.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::manifest::read_manifest;
use super::project_config::{PlaceholderInjection, ResolvedConfig, is_env_key};

/// Env files read from each directory, later files override earlier ones.
pub const ENV_FILE_NAMES: &[&str] = &[".env", ".env.local", ".env.development", ".env.development.local"];

pub const SUPABASE_DEPENDENCIES: &[&str] = &[
    "@supabase/supabase-js",
    "@supabase/ssr",
    "@supabase/auth-helpers-nextjs",
    "@supabase/auth-helpers-react",
    "@supabase/auth-ui-react",
];

pub const SUPABASE_ENV_NAMES: &[&str] = &[
    "SUPABASE_URL",
    "SUPABASE_ANON_KEY",
    "VITE_SUPABASE_URL",
    "VITE_SUPABASE_ANON_KEY",
    "VITE_SUPABASE_PUBLISHABLE_KEY",
    "NEXT_PUBLIC_SUPABASE_URL",
    "NEXT_PUBLIC_SUPABASE_ANON_KEY",
];

const SOURCE_MARKERS: &[&str] = &["@supabase/", "createClient(", "SUPABASE_URL", "SUPABASE_ANON_KEY"];

/// Variables injected when placeholders are active, with their local values.
pub const PLACEHOLDER_VARS: &[(&str, &str)] = &[
    ("VITE_SUPABASE_URL", "http://127.0.0.1:54321"),
    ("VITE_SUPABASE_ANON_KEY", "preview-placeholder-anon-key"),
];

pub const SCAN_MAX_FILES: usize = 400;
pub const SCAN_MAX_DEPTH: usize = 6;
pub const SCAN_MAX_FILE_BYTES: u64 = 256 * 1024;

const SCAN_SKIP_DIRS: &[&str] = &[
    "node_modules", ".git", "dist", "build", "out", ".next", ".nuxt", ".svelte-kit", ".turbo",
    ".cache", "coverage", "vendor", "target",
];

const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs", "vue", "svelte", "astro"];

/// How the placeholder decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaceholderMode {
    ForcedOn,
    ForcedOff,
    AutoDetected,
    AutoNotDetected,
}

impl PlaceholderMode {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::ForcedOn | Self::AutoDetected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEnv {
    pub env: BTreeMap<String, String>,
    pub injected_keys: Vec<String>,
    pub placeholder_mode: PlaceholderMode,
    pub external_service_detected: bool,
}

/// Parse dotenv text with `dotenvy`. Lines it cannot parse and keys that are
/// not plain identifiers are skipped.
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    dotenvy::from_read_iter(text.as_bytes())
        .filter_map(|item| match item {
            Ok(pair) => Some(pair),
            Err(e) => {
                debug!(error = %e, "skipping unparsable env file line");
                None
            }
        })
        .filter(|(key, _)| is_env_key(key))
        .collect()
}

fn env_dirs(workspace_root: &Path, app_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![workspace_root.to_path_buf()];
    if app_dir != workspace_root {
        dirs.push(app_dir.to_path_buf());
    }
    dirs
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Bounded textual scan of source files for backend-service markers.
pub fn scan_sources_for_service(root: &Path) -> bool {
    let walker = WalkDir::new(root)
        .max_depth(SCAN_MAX_DEPTH)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SCAN_SKIP_DIRS.contains(&name)))
        });

    let mut inspected = 0;
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() || !has_source_extension(entry.path()) {
            continue;
        }
        if inspected >= SCAN_MAX_FILES {
            break;
        }
        inspected += 1;
        let Ok(file) = std::fs::File::open(entry.path()) else {
            continue;
        };
        let mut bytes = Vec::new();
        if file.take(SCAN_MAX_FILE_BYTES).read_to_end(&mut bytes).is_err() {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let mentions_supabase = text.contains("supabase") || text.contains("SUPABASE");
        if mentions_supabase && SOURCE_MARKERS.iter().any(|m| text.contains(m)) {
            debug!(file = %entry.path().display(), "backend service reference found in source");
            return true;
        }
    }
    false
}

/// Resolve the start environment using the engine's own process environment
/// for the "already defined" check.
pub async fn resolve_start_env(workspace_root: &Path, app_dir: &Path, config: &ResolvedConfig) -> StartEnv {
    resolve_start_env_with(workspace_root, app_dir, config, |key| std::env::var(key).ok()).await
}

pub async fn resolve_start_env_with<F>(
    workspace_root: &Path,
    app_dir: &Path,
    config: &ResolvedConfig,
    process_env: F,
) -> StartEnv
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = config.preview_env.clone();
    let mut file_keys = BTreeSet::new();
    let dirs = env_dirs(workspace_root, app_dir);

    for dir in &dirs {
        for name in ENV_FILE_NAMES {
            let Ok(text) = tokio::fs::read_to_string(dir.join(name)).await else {
                continue;
            };
            for (key, value) in parse_env_file(&text) {
                file_keys.insert(key.clone());
                env.insert(key, value);
            }
        }
    }

    let mut detected = false;
    for dir in &dirs {
        if let Some(manifest) = read_manifest(dir).await
            && SUPABASE_DEPENDENCIES.iter().any(|dep| manifest.depends_on(dep))
        {
            detected = true;
            break;
        }
    }
    if !detected {
        detected = SUPABASE_ENV_NAMES.iter().any(|name| file_keys.contains(*name));
    }
    if !detected {
        let root = workspace_root.to_path_buf();
        detected = tokio::task::spawn_blocking(move || scan_sources_for_service(&root))
            .await
            .unwrap_or(false);
    }

    let placeholder_mode = match config.placeholder_injection {
        PlaceholderInjection::On => PlaceholderMode::ForcedOn,
        PlaceholderInjection::Off => PlaceholderMode::ForcedOff,
        PlaceholderInjection::Auto if detected => PlaceholderMode::AutoDetected,
        PlaceholderInjection::Auto => PlaceholderMode::AutoNotDetected,
    };

    let mut injected_keys = Vec::new();
    if placeholder_mode.is_active() {
        for (key, value) in PLACEHOLDER_VARS {
            if env.contains_key(*key) || process_env(key).is_some() {
                continue;
            }
            env.insert(key.to_string(), value.to_string());
            injected_keys.push(key.to_string());
        }
    }
    if !injected_keys.is_empty() {
        info!(keys = ?injected_keys, mode = ?placeholder_mode, "injected placeholder environment");
    }

    StartEnv {
        env,
        injected_keys,
        placeholder_mode,
        external_service_detected: detected,
    }
}
