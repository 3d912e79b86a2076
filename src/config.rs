use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};

use crate::preview::executor::ExecutorSettings;
use crate::preview::git::GitSettings;
use crate::preview::supervisor::SupervisorSettings;

/// How runs are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PreviewMode {
    /// Wait, then serve a simulated page. No git, no build.
    Stub,
    /// Clone, build, and start the real application.
    Real,
}

/// Engine settings. Every field is a `serve` flag with an environment
/// fallback, so the engine can be configured entirely from `.env`.
#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// Port for the control API
    #[arg(long, env = "PREVIEW_CONTROL_PORT", default_value_t = 4000)]
    pub control_port: u16,

    /// Address the control API binds to
    #[arg(long, env = "PREVIEW_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Shared secret for GitHub webhook signatures; unset means open mode
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Lowest port handed to runs
    #[arg(long, env = "PREVIEW_PORT_MIN", default_value_t = 4001)]
    pub port_min: u16,

    /// Highest port handed to runs
    #[arg(long, env = "PREVIEW_PORT_MAX", default_value_t = 4100)]
    pub port_max: u16,

    /// Preview URL; `{port}` is replaced with the run's port
    #[arg(long, env = "PREVIEW_URL_TEMPLATE", default_value = "http://localhost:{port}")]
    pub url_template: String,

    #[arg(long, env = "PREVIEW_MODE", value_enum, default_value_t = PreviewMode::Stub)]
    pub mode: PreviewMode,

    /// Simulated launch time in stub mode
    #[arg(long, env = "PREVIEW_STUB_DELAY_MS", default_value_t = 1500)]
    pub stub_delay_ms: u64,

    /// Directory holding one git working copy per project
    #[arg(long, env = "PREVIEW_WORKSPACE_ROOT", default_value = ".preview/workspaces")]
    pub workspace_root: PathBuf,

    /// Address applications and placeholder pages bind to
    #[arg(long, env = "PREVIEW_APP_HOST", default_value = "0.0.0.0")]
    pub app_host: String,

    #[arg(long, env = "GIT_BIN", default_value = "git")]
    pub git_bin: String,

    /// Token for private repositories
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[arg(long, env = "GIT_REMOTE_BASE", default_value = "https://github.com")]
    pub git_remote_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_port: 4000,
            bind_host: "0.0.0.0".to_string(),
            webhook_secret: None,
            port_min: 4001,
            port_max: 4100,
            url_template: "http://localhost:{port}".to_string(),
            mode: PreviewMode::Stub,
            stub_delay_ms: 1500,
            workspace_root: PathBuf::from(".preview/workspaces"),
            app_host: "0.0.0.0".to_string(),
            git_bin: "git".to_string(),
            github_token: None,
            git_remote_base: "https://github.com".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            bail!(
                "Invalid port range: min {} is greater than max {}",
                self.port_min,
                self.port_max
            );
        }
        if self.port_min < 1024 {
            bail!("Invalid port range: ports below 1024 are reserved (got {})", self.port_min);
        }
        if (self.port_min..=self.port_max).contains(&self.control_port) {
            bail!(
                "Control port {} overlaps the run port range {}-{}",
                self.control_port,
                self.port_min,
                self.port_max
            );
        }
        if !self.url_template.contains("{port}") {
            bail!("URL template must contain {{port}}: {}", self.url_template);
        }
        Ok(())
    }

    pub fn preview_url(&self, port: u16) -> String {
        self.url_template.replace("{port}", &port.to_string())
    }

    pub fn stub_delay(&self) -> Duration {
        Duration::from_millis(self.stub_delay_ms)
    }

    /// Secret with empty values treated as unset.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn git_settings(&self) -> GitSettings {
        GitSettings {
            git_bin: self.git_bin.clone(),
            token: self.github_token.clone().filter(|t| !t.is_empty()),
            remote_base: self.git_remote_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            app_host: self.app_host.clone(),
            engine_secrets: [self.github_token.clone(), self.webhook_secret.clone()]
                .into_iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .collect(),
            ..ExecutorSettings::default()
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            port_min: self.port_min,
            port_max: self.port_max,
            url_template: self.url_template.clone(),
        }
    }
}
