//! Run registry, port ownership, and the run state machine.
//!
//! ```text
//!            start
//!              │
//!              ▼
//!   ┌──── starting ◀──── refresh ────┐
//!   │          │                     │
//!   │    ok    │   error             │
//!   ▼          ▼                     │
//! ready ──── failed ─────────────────┘
//!   │   app exits  │
//!   └──────┬───────┘
//!          ▼ stop (from any non-stopped state)
//!       stopped
//! ```
//!
//! All registry and port-pool mutation happens under one `std::sync::Mutex`
//! that is never held across an `.await`. Each pipeline attempt carries the
//! attempt number it was started with; results for an attempt that is no
//! longer current are discarded and their process or placeholder torn down.
//! Termination is fire-and-forget: stop frees the port without waiting for
//! the process to exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{AppProcess, tail_text};
use super::git::{normalize_repo_slug, validate_commit_sha, validate_ref};
use super::models::{Run, RunStatus, StartRequest, is_refreshable, is_valid_transition};
use super::output::BoundedOutput;
use super::pipeline::{LaunchedApp, PreviewPipeline, RunContext};
use super::placeholder::{PlaceholderHost, PlaceholderPage};
use super::ports::PortPool;
use super::redact::Redactor;
use super::system::{Clock, ExitCode, ProcessHandle};
use crate::errors::PreviewError;
use crate::util::{sanitize_project_id, tail_chars};

pub const DEFAULT_BRANCH: &str = "main";

/// Characters of app output kept in the error of a run whose app exited.
const ERROR_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub port_min: u16,
    pub port_max: u16,
    /// Preview URL with a `{port}` placeholder.
    pub url_template: String,
}

struct RunRecord {
    run: Run,
    process: Option<ProcessHandle>,
    tail: Option<Arc<Mutex<BoundedOutput>>>,
}

impl RunRecord {
    fn set_status(&mut self, to: RunStatus) {
        debug_assert!(
            is_valid_transition(self.run.status, to),
            "invalid transition {} -> {}",
            self.run.status,
            to
        );
        self.run.status = to;
    }

    fn terminate_process(&mut self) {
        if let Some(mut handle) = self.process.take() {
            handle.terminate();
        }
        self.tail = None;
    }
}

struct Registry {
    runs: HashMap<String, RunRecord>,
    ports: PortPool,
}

struct Inner {
    registry: Mutex<Registry>,
    pipeline: Arc<dyn PreviewPipeline>,
    placeholders: Arc<dyn PlaceholderHost>,
    clock: Arc<dyn Clock>,
    url_template: String,
}

/// Owner of all runs and ports. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn context_of(run: &Run) -> RunContext {
    RunContext {
        run_id: run.id.clone(),
        repo: run.repo.clone(),
        branch: run.branch.clone(),
        commit: run.commit.clone(),
        project_id: run.project_id.clone(),
        port: run.port,
        attempt: run.attempt,
    }
}

fn describe_exit(code: ExitCode) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<dyn PreviewPipeline>,
        placeholders: Arc<dyn PlaceholderHost>,
        clock: Arc<dyn Clock>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    runs: HashMap::new(),
                    ports: PortPool::new(settings.port_min, settings.port_max),
                }),
                pipeline,
                placeholders,
                clock,
                url_template: settings.url_template,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn preview_url(&self, port: u16) -> String {
        self.inner.url_template.replace("{port}", &port.to_string())
    }

    /// Validate, allocate a port, and register a run in `starting`. The
    /// pipeline runs in the background.
    pub fn start(&self, req: StartRequest) -> Result<Run, PreviewError> {
        let repo = normalize_repo_slug(&req.repo)?;
        let branch = req
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH)
            .to_string();
        validate_ref(&branch)?;
        let commit = match req.commit.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(sha) => {
                validate_commit_sha(sha)?;
                Some(sha.to_ascii_lowercase())
            }
            None => None,
        };
        // Only ids that are already in canonical form, so one workspace maps to one id.
        let project_id = match sanitize_project_id(&req.project_id) {
            Some(id) if id == req.project_id => id,
            _ => {
                return Err(PreviewError::InvalidProjectId {
                    input: req.project_id,
                });
            }
        };

        let run = {
            let mut reg = self.registry();
            let port = reg.ports.allocate()?;
            let run = Run {
                id: Uuid::new_v4().to_string(),
                status: RunStatus::Starting,
                port,
                preview_url: self.preview_url(port),
                repo,
                branch,
                commit,
                project_id,
                error: None,
                started_at: self.inner.clock.now(),
                ready_at: None,
                stopped_at: None,
                injected_env_keys: Vec::new(),
                placeholder_mode: None,
                external_service_detected: false,
                attempt: 1,
            };
            reg.runs.insert(
                run.id.clone(),
                RunRecord {
                    run: run.clone(),
                    process: None,
                    tail: None,
                },
            );
            run
        };

        info!(run_id = %run.id, repo = %run.repo, branch = %run.branch, port = run.port, "run created");
        self.spawn_attempt(context_of(&run));
        Ok(run)
    }

    fn spawn_attempt(&self, ctx: RunContext) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.inner.pipeline.launch(&ctx).await;
            this.complete_attempt(&ctx, result);
        });
    }

    fn serve_placeholder(&self, reg: &mut Registry, port: u16, page: PlaceholderPage) {
        match self.inner.placeholders.serve(port, page) {
            Ok(handle) => {
                reg.ports.attach_placeholder(handle);
            }
            Err(e) => warn!(port, error = %e, "failed to start placeholder responder"),
        }
    }

    fn complete_attempt(&self, ctx: &RunContext, result: Result<LaunchedApp, PreviewError>) {
        let mut reg = self.registry();
        let now = self.inner.clock.now();

        let Some(record) = reg
            .runs
            .get_mut(&ctx.run_id)
            .filter(|r| r.run.attempt == ctx.attempt && r.run.status == RunStatus::Starting)
        else {
            drop(reg);
            debug!(run_id = %ctx.run_id, attempt = ctx.attempt, "discarding result of superseded attempt");
            if let Ok(LaunchedApp::Process(mut app)) = result {
                app.handle.terminate();
            }
            return;
        };

        match result {
            Ok(LaunchedApp::Process(app)) => {
                let AppProcess {
                    handle,
                    exit,
                    tail,
                    command,
                    used_fallback,
                    metadata,
                } = app;
                record.set_status(RunStatus::Ready);
                record.run.ready_at = Some(now);
                record.run.error = None;
                record.run.injected_env_keys = metadata.injected_keys;
                record.run.placeholder_mode = Some(metadata.placeholder_mode);
                record.run.external_service_detected = metadata.external_service_detected;
                record.process = Some(handle);
                record.tail = Some(Arc::clone(&tail));
                drop(reg);

                info!(run_id = %ctx.run_id, attempt = ctx.attempt, command = %command, used_fallback, "run ready");
                self.watch_exit(ctx.run_id.clone(), ctx.attempt, exit, tail);
            }
            Ok(LaunchedApp::Simulated) => {
                record.set_status(RunStatus::Ready);
                record.run.ready_at = Some(now);
                record.run.error = None;
                let page = PlaceholderPage::Simulated {
                    repo: record.run.repo.clone(),
                    branch: record.run.branch.clone(),
                };
                self.serve_placeholder(&mut reg, ctx.port, page);
                info!(run_id = %ctx.run_id, attempt = ctx.attempt, "run ready (simulated)");
            }
            Err(err) => {
                let message = Redactor::default().redact(&err.to_string());
                record.set_status(RunStatus::Failed);
                record.run.error = Some(message.clone());
                self.serve_placeholder(&mut reg, ctx.port, PlaceholderPage::Error { message });
                warn!(run_id = %ctx.run_id, attempt = ctx.attempt, error = %err, "run failed");
            }
        }
    }

    fn watch_exit(
        &self,
        run_id: String,
        attempt: u32,
        exit: oneshot::Receiver<ExitCode>,
        tail: Arc<Mutex<BoundedOutput>>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let code = exit.await.unwrap_or(None);
            this.on_app_exit(&run_id, attempt, code, &tail);
        });
    }

    fn on_app_exit(&self, run_id: &str, attempt: u32, code: ExitCode, tail: &Mutex<BoundedOutput>) {
        let mut reg = self.registry();
        let Some(record) = reg
            .runs
            .get_mut(run_id)
            .filter(|r| r.run.attempt == attempt && r.run.status == RunStatus::Ready)
        else {
            return;
        };

        let message = format!(
            "application exited ({})\n{}",
            describe_exit(code),
            tail_chars(&tail_text(tail), ERROR_TAIL_CHARS)
        );
        record.set_status(RunStatus::Failed);
        record.run.error = Some(message.clone());
        record.process = None;
        record.tail = None;
        let port = record.run.port;
        warn!(run_id, attempt, exit = %describe_exit(code), "application exited on its own");
        self.serve_placeholder(&mut reg, port, PlaceholderPage::Error { message });
    }

    pub fn status(&self, run_id: &str) -> Result<Run, PreviewError> {
        self.registry()
            .runs
            .get(run_id)
            .map(|r| r.run.clone())
            .ok_or_else(|| PreviewError::RunNotFound { id: run_id.to_string() })
    }

    /// Every known run, oldest first.
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.registry().runs.values().map(|r| r.run.clone()).collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    /// Signal the process, release the port, and mark the run stopped.
    pub fn stop(&self, run_id: &str) -> Result<Run, PreviewError> {
        let mut reg = self.registry();
        let now = self.inner.clock.now();
        let record = reg
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PreviewError::RunNotFound { id: run_id.to_string() })?;
        if record.run.status == RunStatus::Stopped {
            return Err(PreviewError::InvalidTransition {
                id: run_id.to_string(),
                status: record.run.status.to_string(),
                action: "stop",
            });
        }
        record.terminate_process();
        record.set_status(RunStatus::Stopped);
        record.run.stopped_at = Some(now);
        let snapshot = record.run.clone();
        reg.ports.release(snapshot.port);
        info!(run_id, port = snapshot.port, "run stopped");
        Ok(snapshot)
    }

    fn refreshable_context(reg: &Registry, run_id: &str) -> Result<RunContext, PreviewError> {
        let record = reg
            .runs
            .get(run_id)
            .ok_or_else(|| PreviewError::RunNotFound { id: run_id.to_string() })?;
        if !is_refreshable(record.run.status) {
            return Err(PreviewError::InvalidTransition {
                id: run_id.to_string(),
                status: record.run.status.to_string(),
                action: "refresh",
            });
        }
        Ok(context_of(&record.run))
    }

    /// Re-run the pipeline for a ready or failed run, keeping its id and port.
    /// With `only_if_changed`, nothing happens unless upstream has new commits.
    /// Returns the run snapshot and whether a refresh was started.
    pub async fn refresh(&self, run_id: &str, only_if_changed: bool) -> Result<(Run, bool), PreviewError> {
        if only_if_changed {
            let ctx = Self::refreshable_context(&self.registry(), run_id)?;
            if !self.inner.pipeline.has_new_commits(&ctx).await {
                debug!(run_id, "no upstream changes; refresh skipped");
                return Ok((self.status(run_id)?, false));
            }
        }

        let (snapshot, ctx) = {
            let mut reg = self.registry();
            Self::refreshable_context(&reg, run_id)?;
            let Registry { runs, ports } = &mut *reg;
            let record = runs
                .get_mut(run_id)
                .ok_or_else(|| PreviewError::RunNotFound { id: run_id.to_string() })?;
            record.terminate_process();
            ports.detach_placeholder(record.run.port);
            record.set_status(RunStatus::Starting);
            record.run.attempt += 1;
            record.run.error = None;
            record.run.ready_at = None;
            (record.run.clone(), context_of(&record.run))
        };

        info!(run_id, attempt = ctx.attempt, "refresh started");
        self.spawn_attempt(ctx);
        Ok((snapshot, true))
    }

    /// Refresh every ready run of `repo` (and `branch`, when given). Returns
    /// the ids that were refreshed.
    pub async fn refresh_matching(&self, repo: &str, branch: Option<&str>) -> Vec<String> {
        let Ok(slug) = normalize_repo_slug(repo) else {
            return Vec::new();
        };
        let ids: Vec<String> = self
            .registry()
            .runs
            .values()
            .filter(|r| {
                r.run.status == RunStatus::Ready
                    && r.run.repo.eq_ignore_ascii_case(&slug)
                    && branch.is_none_or(|b| r.run.branch == b)
            })
            .map(|r| r.run.id.clone())
            .collect();

        let mut refreshed = Vec::new();
        for id in ids {
            match self.refresh(&id, false).await {
                Ok(_) => refreshed.push(id),
                Err(e) => debug!(run_id = %id, error = %e, "skipping webhook refresh"),
            }
        }
        refreshed
    }

    /// Terminate every live process and placeholder. Run records are kept.
    pub fn shutdown(&self) {
        let mut reg = self.registry();
        let mut terminated = 0;
        for record in reg.runs.values_mut() {
            if record.process.is_some() {
                terminated += 1;
            }
            record.terminate_process();
        }
        reg.ports.shutdown_placeholders();
        info!(terminated, "supervisor shut down");
    }
}
