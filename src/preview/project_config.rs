//! Per-project build/start configuration from `preview.config.json`.
//!
//! The file is untrusted repository content. Each field is validated on its
//! own; a rejected value keeps whatever the previous layer (or the defaults)
//! provided and leaves a [`ConfigWarning`] behind.
//!
//! ```json
//! {
//!   "buildCommand": "pnpm install && pnpm run build",
//!   "startCommand": "npx vite preview",
//!   "fallbackStartCommand": "npx serve -s dist",
//!   "previewEnv": { "VITE_API_BASE": "https://staging.example.com" },
//!   "injectSupabasePlaceholders": true,
//!   "appDirectory": "apps/web",
//!   "port": 5173
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::command_safety::{is_safe, sanitize};
use crate::errors::ConfigWarning;

pub const CONFIG_FILE_NAME: &str = "preview.config.json";

pub const DEFAULT_BUILD_COMMAND: &str = "npm install && npm run build";
pub const DEFAULT_START_COMMAND: &str = "npx serve -s dist";
pub const DEFAULT_APP_PORT: u16 = 3000;

/// Lowest port a project may declare.
pub const MIN_APP_PORT: u16 = 1024;

static ENV_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Whether `key` is a valid environment variable identifier.
pub fn is_env_key(key: &str) -> bool {
    ENV_KEY_REGEX.is_match(key)
}

/// Tri-state switch for the backend-service placeholder variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderInjection {
    On,
    Off,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub build_command: String,
    pub start_command: String,
    pub fallback_start_command: Option<String>,
    pub preview_env: BTreeMap<String, String>,
    pub placeholder_injection: PlaceholderInjection,
    /// Relative to the workspace root, without leading `./` or trailing `/`.
    pub app_directory: Option<String>,
    pub port: u16,
    #[serde(skip)]
    pub warnings: Vec<ConfigWarning>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            start_command: DEFAULT_START_COMMAND.to_string(),
            fallback_start_command: None,
            preview_env: BTreeMap::new(),
            placeholder_injection: PlaceholderInjection::Auto,
            app_directory: None,
            port: DEFAULT_APP_PORT,
            warnings: Vec::new(),
        }
    }
}

impl ResolvedConfig {
    fn warn(&mut self, source: &str, field: &str, message: impl Into<String>) {
        let warning = ConfigWarning {
            source_file: source.to_string(),
            field: field.to_string(),
            message: message.into(),
        };
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn command_field(&mut self, source: &str, obj: &Map<String, Value>, field: &str) -> Option<String> {
        match obj.get(field)? {
            Value::String(cmd) if is_safe(cmd) => Some(cmd.trim().to_string()),
            Value::String(_) => {
                self.warn(source, field, "rejected by command safety validator");
                None
            }
            _ => {
                self.warn(source, field, "expected a string");
                None
            }
        }
    }

    /// Layer one parsed configuration document over the current values.
    pub fn apply_layer(&mut self, source: &str, document: &Value) {
        let Some(obj) = document.as_object() else {
            self.warn(source, "<root>", "expected a JSON object");
            return;
        };

        if let Some(cmd) = self.command_field(source, obj, "buildCommand") {
            self.build_command = cmd;
        }
        if let Some(cmd) = self.command_field(source, obj, "startCommand") {
            self.start_command = cmd;
        }
        if let Some(cmd) = self.command_field(source, obj, "fallbackStartCommand") {
            self.fallback_start_command = Some(cmd);
        }

        match obj.get("previewEnv") {
            None => {}
            Some(Value::Object(vars)) => {
                for (key, value) in vars {
                    match value {
                        Value::String(v) if is_env_key(key) => {
                            self.preview_env.insert(key.clone(), v.clone());
                        }
                        Value::String(_) => {
                            self.warn(source, "previewEnv", format!("invalid variable name '{}'", key))
                        }
                        _ => self.warn(source, "previewEnv", format!("value of '{}' is not a string", key)),
                    }
                }
            }
            Some(_) => self.warn(source, "previewEnv", "expected an object of strings"),
        }

        match obj.get("injectSupabasePlaceholders") {
            None | Some(Value::Null) => {}
            Some(Value::Bool(true)) => self.placeholder_injection = PlaceholderInjection::On,
            Some(Value::Bool(false)) => self.placeholder_injection = PlaceholderInjection::Off,
            Some(_) => self.warn(source, "injectSupabasePlaceholders", "expected a boolean"),
        }

        match obj.get("appDirectory") {
            None | Some(Value::Null) => {}
            Some(Value::String(dir)) => match normalize_app_directory(dir) {
                Some(dir) => self.app_directory = Some(dir),
                None => self.warn(source, "appDirectory", "must be a relative path inside the repository"),
            },
            Some(_) => self.warn(source, "appDirectory", "expected a string"),
        }

        match obj.get("port") {
            None => {}
            Some(value) => match value.as_u64() {
                Some(port) if (MIN_APP_PORT as u64..=u16::MAX as u64).contains(&port) => {
                    self.port = port as u16;
                }
                _ => self.warn(
                    source,
                    "port",
                    format!("expected an integer in {}-{}", MIN_APP_PORT, u16::MAX),
                ),
            },
        }
    }

    /// Force the install-script-disabling rewrite onto the build command.
    fn finalize(&mut self) {
        self.build_command = sanitize(&self.build_command)
            .or_else(|| sanitize(DEFAULT_BUILD_COMMAND))
            .unwrap_or_else(|| DEFAULT_BUILD_COMMAND.to_string());
    }
}

/// `./apps/web/` → `apps/web`. Absolute paths and parent references are rejected.
pub fn normalize_app_directory(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return None;
    }
    let parts: Vec<&str> = trimmed
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.iter().any(|p| *p == "..") {
        return None;
    }
    if parts.is_empty() {
        return Some(".".to_string());
    }
    Some(parts.join("/"))
}

async fn load_layer(config: &mut ResolvedConfig, dir: &Path, label: &str) {
    let path = dir.join(CONFIG_FILE_NAME);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            config.warn(label, "<file>", format!("unreadable: {}", e));
            return;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(document) => config.apply_layer(label, &document),
        Err(e) => config.warn(label, "<file>", format!("invalid JSON: {}", e)),
    }
}

/// Effective configuration for `app_dir`: defaults, then the root file, then
/// the app directory's own file when it differs from the root.
pub async fn resolve_config(app_dir: &Path, workspace_root: &Path) -> ResolvedConfig {
    let mut config = ResolvedConfig::default();
    load_layer(&mut config, workspace_root, CONFIG_FILE_NAME).await;
    if app_dir != workspace_root {
        let label = app_dir
            .strip_prefix(workspace_root)
            .map(|rel| format!("{}/{}", rel.display(), CONFIG_FILE_NAME))
            .unwrap_or_else(|_| CONFIG_FILE_NAME.to_string());
        load_layer(&mut config, app_dir, &label).await;
    }
    config.finalize();
    config
}
