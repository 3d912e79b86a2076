//! One launch attempt for a run: sync → resolve → env → build → start.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::candidates::{DEFAULT_MAX_CANDIDATES, list_candidates};
use super::env::resolve_start_env;
use super::executor::{AppProcess, Executor};
use super::git::GitSynchronizer;
use super::project_config::resolve_config;
use crate::errors::PreviewError;

/// Everything an attempt needs to know about its run. Inputs are already
/// validated and normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub repo: String,
    pub branch: String,
    pub commit: Option<String>,
    pub project_id: String,
    pub port: u16,
    pub attempt: u32,
}

/// What a successful attempt produced.
#[derive(Debug)]
pub enum LaunchedApp {
    /// A real application process listening on the run's port.
    Process(AppProcess),
    /// Nothing was built; the supervisor serves a simulated page instead.
    Simulated,
}

#[async_trait]
pub trait PreviewPipeline: Send + Sync {
    async fn launch(&self, ctx: &RunContext) -> Result<LaunchedApp, PreviewError>;

    /// Soft check used by refresh-if-changed. Never fails.
    async fn has_new_commits(&self, ctx: &RunContext) -> bool;
}

/// Clones, builds, and starts the real application.
pub struct RealPipeline {
    git: GitSynchronizer,
    executor: Executor,
    workspace_root: PathBuf,
}

impl RealPipeline {
    pub fn new(git: GitSynchronizer, executor: Executor, workspace_root: PathBuf) -> Self {
        Self {
            git,
            executor,
            workspace_root,
        }
    }

    pub fn workspace_for(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join(project_id)
    }
}

#[async_trait]
impl PreviewPipeline for RealPipeline {
    async fn launch(&self, ctx: &RunContext) -> Result<LaunchedApp, PreviewError> {
        let workspace = self.workspace_for(&ctx.project_id);

        let outcome = self
            .git
            .sync_repository(&ctx.repo, &ctx.branch, &workspace)
            .await?;
        if let Some(sha) = &ctx.commit {
            self.git.checkout_commit(&workspace, sha, &ctx.branch).await?;
        }
        info!(run_id = %ctx.run_id, attempt = ctx.attempt, outcome = ?outcome, "workspace ready");

        let root_config = resolve_config(&workspace, &workspace).await;
        let override_dir = root_config
            .app_directory
            .as_deref()
            .filter(|dir| *dir != ".")
            .map(|dir| workspace.join(dir));
        let candidates = list_candidates(&workspace, override_dir.as_deref(), DEFAULT_MAX_CANDIDATES).await;
        let app_dir = candidates
            .first()
            .map(|c| c.dir(&workspace))
            .unwrap_or_else(|| workspace.clone());
        if let Some(chosen) = candidates.first() {
            info!(run_id = %ctx.run_id, app_dir = %chosen.relative_path, score = chosen.score, "selected application directory");
        }

        let config = resolve_config(&app_dir, &workspace).await;
        for warning in &config.warnings {
            warn!(run_id = %ctx.run_id, "{}", warning);
        }
        let env = resolve_start_env(&workspace, &app_dir, &config).await;

        self.executor.run_build(&app_dir, &config, &env).await?;
        let app = self
            .executor
            .start_app(&app_dir, ctx.port, &config, &env, &ctx.run_id)
            .await?;
        Ok(LaunchedApp::Process(app))
    }

    async fn has_new_commits(&self, ctx: &RunContext) -> bool {
        let workspace = self.workspace_for(&ctx.project_id);
        self.git.has_new_commits(&workspace, &ctx.branch).await
    }
}

/// Simulated mode: waits, then reports success without touching git or disk.
pub struct StubPipeline {
    delay: Duration,
}

impl StubPipeline {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl PreviewPipeline for StubPipeline {
    async fn launch(&self, ctx: &RunContext) -> Result<LaunchedApp, PreviewError> {
        info!(run_id = %ctx.run_id, delay_ms = self.delay.as_millis() as u64, "simulating preview launch");
        tokio::time::sleep(self.delay).await;
        Ok(LaunchedApp::Simulated)
    }

    async fn has_new_commits(&self, _ctx: &RunContext) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::preview::executor::ExecutorSettings;
    use crate::preview::git::GitSettings;
    use crate::preview::system::fakes::{FakeResponse, FakeRunner};
    use crate::preview::system::{System, SystemClock, TokioFilesystem};

    fn ctx(commit: Option<&str>) -> RunContext {
        RunContext {
            run_id: "run-1".into(),
            repo: "acme/app".into(),
            branch: "main".into(),
            commit: commit.map(str::to_string),
            project_id: "p1".into(),
            port: 4001,
            attempt: 1,
        }
    }

    fn real_pipeline(runner: Arc<FakeRunner>, root: PathBuf) -> RealPipeline {
        let system = System {
            runner,
            fs: Arc::new(TokioFilesystem),
            clock: Arc::new(SystemClock),
        };
        RealPipeline::new(
            GitSynchronizer::new(system.clone(), GitSettings::default()),
            Executor::new(
                system,
                ExecutorSettings {
                    start_grace: Duration::from_millis(20),
                    ..ExecutorSettings::default()
                },
            ),
            root,
        )
    }

    #[tokio::test]
    async fn test_real_pipeline_runs_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("p1");
        let web = workspace.join("web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(
            web.join("package.json"),
            r#"{"scripts":{"build":"vite build","dev":"vite"},"devDependencies":{"vite":"^5"}}"#,
        )
        .unwrap();
        std::fs::write(
            web.join("preview.config.json"),
            r#"{"startCommand":"npx vite preview"}"#,
        )
        .unwrap();

        let runner = Arc::new(FakeRunner::new().on("sh -c npx vite", FakeResponse::long_running("")));
        let pipeline = real_pipeline(runner.clone(), dir.path().to_path_buf());
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let launched = pipeline.launch(&ctx(Some(sha))).await.unwrap();
        assert!(matches!(launched, LaunchedApp::Process(_)));

        let lines = runner.command_lines();
        assert!(lines[0].starts_with("git fetch origin"));
        assert!(lines.contains(&format!("git checkout {}", sha)));
        assert!(lines.contains(&"sh -c npm install --ignore-scripts && npm run build".to_string()));
        assert_eq!(
            lines.last().unwrap(),
            "sh -c npx vite preview --host 0.0.0.0 --port 4001 --strictPort"
        );
        let build = runner
            .calls()
            .into_iter()
            .find(|c| c.command_line().contains("npm run build"))
            .unwrap();
        assert_eq!(build.cwd.as_deref(), Some(web.as_path()));
    }

    #[tokio::test]
    async fn test_real_pipeline_build_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p1")).unwrap();
        let runner = Arc::new(FakeRunner::new().on("sh -c npm", FakeResponse::fail(2, "tsc: error TS2304\n")));
        let pipeline = real_pipeline(runner.clone(), dir.path().to_path_buf());

        let err = pipeline.launch(&ctx(None)).await.unwrap_err();
        assert!(matches!(err, PreviewError::ExternalTool { ref tool, .. } if tool == "build"));
        assert!(!runner.command_lines().iter().any(|l| l.contains("serve")));
    }

    #[tokio::test]
    async fn test_stub_pipeline() {
        let pipeline = StubPipeline::new(Duration::from_millis(1));
        assert!(matches!(pipeline.launch(&ctx(None)).await.unwrap(), LaunchedApp::Simulated));
        assert!(!pipeline.has_new_commits(&ctx(None)).await);
    }
}
