//! Install, build, and launch of the previewed application.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::command_safety::{is_safe, sanitize};
use super::env::{PlaceholderMode, StartEnv};
use super::manifest::read_manifest;
use super::output::{APP_OUTPUT_CAP, BUILD_OUTPUT_CAP, BoundedOutput, OutputChunk, Stream};
use super::project_config::ResolvedConfig;
use super::redact::{LineRedactor, Redactor};
use super::system::{CommandSpec, ExitCode, ProcessHandle, System, run_to_completion};
use crate::errors::PreviewError;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a freshly started app must stay up before it counts as started.
pub const START_GRACE: Duration = Duration::from_secs(3);

/// Engine credentials that must never reach a previewed application.
pub const ENGINE_SECRET_VARS: &[&str] = &["GITHUB_TOKEN", "GITHUB_WEBHOOK_SECRET", "PREVIEW_WEBHOOK_SECRET"];

/// Bundlers that can be invoked through their node entry point, keyed by the
/// binary name used in `scripts.build`.
pub const KNOWN_BUNDLERS: &[(&str, &str)] = &[
    ("vite", "vite/bin/vite.js"),
    ("next", "next/dist/bin/next"),
    ("react-scripts", "react-scripts/bin/react-scripts.js"),
    ("webpack", "webpack/bin/webpack.js"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    pub const ALL: [PackageManager; 4] = [Self::Npm, Self::Pnpm, Self::Yarn, Self::Bun];

    pub fn binary(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Bun => "bun",
        }
    }

    /// Install arguments with lifecycle scripts disabled.
    pub fn install_args(&self, locked: bool) -> &'static [&'static str] {
        match (self, locked) {
            (Self::Npm, true) => &["ci", "--ignore-scripts"],
            (Self::Npm, false) => &["install", "--ignore-scripts"],
            (_, true) => &["install", "--frozen-lockfile", "--ignore-scripts"],
            (_, false) => &["install", "--ignore-scripts"],
        }
    }
}

const LOCKFILES: &[(&str, PackageManager)] = &[
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("bun.lockb", PackageManager::Bun),
    ("bun.lock", PackageManager::Bun),
    ("package-lock.json", PackageManager::Npm),
    ("npm-shrinkwrap.json", PackageManager::Npm),
];

fn is_bare_package_manager(script: &str) -> bool {
    matches!(script, "npm" | "pnpm" | "yarn" | "bun" | "npx" | "bunx")
}

fn is_plain_arg(arg: &str) -> bool {
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@._/=:,+%-".contains(c))
}

/// Append host/port flags for recognized dev-server shapes. Only the last
/// `&&` segment is considered, and flags already present are left alone.
pub fn augment_start_command(command: &str, host: &str, port: u16) -> String {
    let (head, last) = match command.rsplit_once("&&") {
        Some((head, last)) => (Some(head.trim()), last.trim()),
        None => (None, command.trim()),
    };
    let words: Vec<&str> = last.split_whitespace().collect();
    let mut tool_index = match words.as_slice() {
        ["npx" | "bunx", ..] => 1,
        ["npm" | "pnpm" | "yarn", "exec" | "dlx", ..] => 2,
        _ => 0,
    };
    if matches!(words.get(tool_index), Some(&"--yes" | &"-y")) {
        tool_index += 1;
    }
    let tool = words
        .get(tool_index)
        .copied()
        .and_then(|t| t.split('@').next())
        .unwrap_or_default();
    let has = |flags: &[&str]| words.iter().any(|w| flags.iter().any(|f| w == f || w.starts_with(&format!("{}=", f))));

    let mut extra: Vec<String> = Vec::new();
    match tool {
        "vite" => {
            if !has(&["--host"]) {
                extra.push(format!("--host {}", host));
            }
            if !has(&["--port"]) {
                extra.push(format!("--port {} --strictPort", port));
            }
        }
        "next" => {
            if !has(&["-H", "--hostname"]) {
                extra.push(format!("-H {}", host));
            }
            if !has(&["-p", "--port"]) {
                extra.push(format!("-p {}", port));
            }
        }
        "serve" => {
            if !has(&["-l", "--listen"]) {
                extra.push(format!("-l tcp://{}:{}", host, port));
            }
        }
        _ => {}
    }

    let mut last = last.to_string();
    for flag in extra {
        last.push(' ');
        last.push_str(&flag);
    }
    match head {
        Some(head) => format!("{} && {}", head, last),
        None => last,
    }
}

/// Result of a completed build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub command: String,
    /// Redacted, possibly truncated combined output.
    pub output: String,
}

/// Introspection data carried with a started app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchMetadata {
    pub injected_keys: Vec<String>,
    pub placeholder_mode: PlaceholderMode,
    pub external_service_detected: bool,
}

/// A launched application process.
#[derive(Debug)]
pub struct AppProcess {
    pub handle: ProcessHandle,
    pub exit: oneshot::Receiver<ExitCode>,
    /// Rolling tail of redacted output.
    pub tail: Arc<Mutex<BoundedOutput>>,
    pub command: String,
    pub used_fallback: bool,
    pub metadata: LaunchMetadata,
}

pub fn tail_text(tail: &Mutex<BoundedOutput>) -> String {
    tail.lock().unwrap_or_else(PoisonError::into_inner).to_text()
}

async fn forward_output(
    mut rx: mpsc::UnboundedReceiver<OutputChunk>,
    redactor: Arc<Redactor>,
    tail: Arc<Mutex<BoundedOutput>>,
    run_id: String,
) {
    let emit = |stream: Stream, text: String| {
        if text.is_empty() {
            return;
        }
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "preview::app", run_id = %run_id, stream = stream.as_str(), "{}", line);
        }
        tail.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.as_bytes());
    };
    let mut stdout = LineRedactor::new(&redactor);
    let mut stderr = LineRedactor::new(&redactor);
    while let Some(chunk) = rx.recv().await {
        let lines = match chunk.stream {
            Stream::Stdout => &mut stdout,
            Stream::Stderr => &mut stderr,
        };
        emit(chunk.stream, lines.feed(&chunk.bytes));
    }
    emit(Stream::Stdout, stdout.finish());
    emit(Stream::Stderr, stderr.finish());
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Interface previewed apps are told to bind.
    pub app_host: String,
    /// Engine credential values, redacted from everything the executor captures.
    pub engine_secrets: Vec<String>,
    pub start_grace: Duration,
    pub probe_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            app_host: "0.0.0.0".to_string(),
            engine_secrets: Vec::new(),
            start_grace: START_GRACE,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

pub struct Executor {
    system: System,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(system: System, settings: ExecutorSettings) -> Self {
        Self { system, settings }
    }

    fn redactor_for(&self, env: &BTreeMap<String, String>) -> Redactor {
        Redactor::from_env(env).with_literals(self.settings.engine_secrets.iter().cloned())
    }

    /// Working directory, resolved environment, and engine secrets stripped.
    fn child_spec(&self, spec: CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> CommandSpec {
        let mut spec = spec.current_dir(dir);
        for key in ENGINE_SECRET_VARS {
            spec = spec.env_remove(*key);
        }
        spec.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Run the configured build command through `sh -c`.
    pub async fn run_build(
        &self,
        app_dir: &Path,
        config: &ResolvedConfig,
        env: &StartEnv,
    ) -> Result<BuildOutcome, PreviewError> {
        let command = sanitize(&config.build_command).ok_or_else(|| PreviewError::ExternalTool {
            tool: "build".into(),
            exit_code: None,
            output: "build command rejected by command safety validator".into(),
        })?;
        let redactor = self.redactor_for(&env.env);
        let spec = self.child_spec(CommandSpec::shell(&command), app_dir, &env.env);

        info!(command = %command, dir = %app_dir.display(), "running build");
        let captured =
            run_to_completion(self.system.runner.as_ref(), &spec, BUILD_OUTPUT_CAP, &redactor).await?;
        let output = captured.output.to_text();
        if captured.success() {
            info!(command = %command, "build finished");
            Ok(BuildOutcome { command, output })
        } else {
            Err(PreviewError::ExternalTool {
                tool: "build".into(),
                exit_code: captured.exit_code,
                output,
            })
        }
    }

    async fn probe(&self, pm: PackageManager) -> bool {
        let spec = CommandSpec::new(pm.binary()).arg("--version");
        let redactor = Redactor::default();
        let probe = run_to_completion(self.system.runner.as_ref(), &spec, 256, &redactor);
        match tokio::time::timeout(self.settings.probe_timeout, probe).await {
            Ok(Ok(captured)) => captured.success(),
            Ok(Err(e)) => {
                debug!(tool = pm.binary(), error = %e, "package manager unavailable");
                false
            }
            Err(_) => {
                debug!(tool = pm.binary(), "package manager probe timed out");
                false
            }
        }
    }

    /// Lockfile-indicated package manager if it is installed, otherwise the
    /// first available one. The flag tells whether a matching lockfile exists.
    pub async fn detect_package_manager(&self, app_dir: &Path) -> Option<(PackageManager, bool)> {
        for (lockfile, pm) in LOCKFILES {
            if self.system.fs.exists(&app_dir.join(lockfile)).await {
                if self.probe(*pm).await {
                    return Some((*pm, true));
                }
                warn!(lockfile, tool = pm.binary(), "lockfile found but package manager unavailable");
                break;
            }
        }
        for pm in PackageManager::ALL {
            if self.probe(pm).await {
                return Some((pm, false));
            }
        }
        None
    }

    /// `node node_modules/<bundler entry> <args>` for a build script that only
    /// wraps a known bundler whose module is installed.
    async fn direct_bundler(&self, app_dir: &Path, script: &str) -> Option<CommandSpec> {
        let words: Vec<&str> = script.split_whitespace().collect();
        let (tool, args) = words.split_first()?;
        if !args.iter().all(|a| is_plain_arg(a)) {
            return None;
        }
        let (_, entry) = KNOWN_BUNDLERS.iter().find(|(name, _)| name == tool)?;
        if !self.system.fs.exists(&app_dir.join("node_modules").join(entry)).await {
            return None;
        }
        Some(
            CommandSpec::new("node")
                .arg(format!("node_modules/{}", entry))
                .args(args.iter().copied()),
        )
    }

    async fn run_step(
        &self,
        spec: &CommandSpec,
        tool: &str,
        redactor: &Redactor,
        transcript: &mut String,
    ) -> Result<(), PreviewError> {
        info!(command = %spec.command_line(), "running build step");
        let captured =
            run_to_completion(self.system.runner.as_ref(), spec, BUILD_OUTPUT_CAP, redactor).await?;
        let output = captured.output.to_text();
        transcript.push_str(&format!("$ {}\n{}", spec.command_line(), output));
        if !transcript.ends_with('\n') {
            transcript.push('\n');
        }
        if captured.success() {
            Ok(())
        } else {
            Err(PreviewError::ExternalTool {
                tool: tool.to_string(),
                exit_code: captured.exit_code,
                output,
            })
        }
    }

    /// Install and build a Node project without trusting its configured
    /// build command.
    pub async fn run_build_node_direct(&self, app_dir: &Path) -> Result<BuildOutcome, PreviewError> {
        let no_tool = |tool: &str, output: &str| PreviewError::ExternalTool {
            tool: tool.to_string(),
            exit_code: None,
            output: output.to_string(),
        };
        let (pm, locked) = self
            .detect_package_manager(app_dir)
            .await
            .ok_or_else(|| no_tool("package manager", "none of npm, pnpm, yarn, bun is available"))?;
        let redactor = Redactor::default().with_literals(self.settings.engine_secrets.iter().cloned());
        let no_env = BTreeMap::new();
        let mut transcript = String::new();

        let install = self.child_spec(
            CommandSpec::new(pm.binary()).args(pm.install_args(locked).iter().copied()),
            app_dir,
            &no_env,
        );
        self.run_step(&install, &format!("{} install", pm.binary()), &redactor, &mut transcript)
            .await?;

        let manifest = read_manifest(app_dir)
            .await
            .ok_or_else(|| no_tool("build", "package.json is missing or invalid"))?;
        let script = manifest
            .script("build")
            .map(str::trim)
            .filter(|s| !s.is_empty() && !is_bare_package_manager(s))
            .ok_or_else(|| no_tool("build", "package.json has no usable build script"))?
            .to_string();

        let step = match self.direct_bundler(app_dir, &script).await {
            Some(spec) => spec,
            None => CommandSpec::new(pm.binary()).args(["run", "build"]),
        };
        let step = self.child_spec(step, app_dir, &no_env);
        let result = match self.run_step(&step, "build", &redactor, &mut transcript).await {
            Err(PreviewError::SpawnFailed { program, .. }) if is_safe(&script) => {
                warn!(program = %program, "falling back to running the build script through sh");
                let fallback = self.child_spec(CommandSpec::shell(&script), app_dir, &no_env);
                self.run_step(&fallback, "build", &redactor, &mut transcript)
                    .await
                    .map(|()| fallback.command_line())
            }
            other => other.map(|()| step.command_line()),
        };
        let command = result?;
        Ok(BuildOutcome {
            command,
            output: transcript,
        })
    }

    async fn launch(
        &self,
        app_dir: &Path,
        port: u16,
        command: &str,
        env: &StartEnv,
        run_id: &str,
        redactor: Arc<Redactor>,
    ) -> Result<AppProcess, PreviewError> {
        if !is_safe(command) {
            return Err(PreviewError::ExternalTool {
                tool: "start".into(),
                exit_code: None,
                output: "start command rejected by command safety validator".into(),
            });
        }
        let spec = self
            .child_spec(CommandSpec::shell(command), app_dir, &env.env)
            .env("PORT", port.to_string());
        let mut spawned = self
            .system
            .runner
            .spawn(&spec)
            .map_err(|source| PreviewError::SpawnFailed {
                program: spec.program.clone(),
                source,
            })?;
        info!(run_id, command, port, pid = ?spawned.handle.pid(), "started application");

        let tail = Arc::new(Mutex::new(BoundedOutput::new(APP_OUTPUT_CAP)));
        let forwarder = tokio::spawn(forward_output(
            spawned.output,
            redactor,
            Arc::clone(&tail),
            run_id.to_string(),
        ));

        tokio::select! {
            code = &mut spawned.exit => {
                let _ = tokio::time::timeout(Duration::from_secs(1), forwarder).await;
                return Err(PreviewError::ExternalTool {
                    tool: "start".into(),
                    exit_code: code.unwrap_or(None),
                    output: tail_text(&tail),
                });
            }
            _ = tokio::time::sleep(self.settings.start_grace) => {}
        }

        Ok(AppProcess {
            handle: spawned.handle,
            exit: spawned.exit,
            tail,
            command: command.to_string(),
            used_fallback: false,
            metadata: LaunchMetadata {
                injected_keys: env.injected_keys.clone(),
                placeholder_mode: env.placeholder_mode,
                external_service_detected: env.external_service_detected,
            },
        })
    }

    /// Launch the app on `port`, trying the fallback start command when the
    /// primary one cannot be spawned or exits within the startup grace window.
    pub async fn start_app(
        &self,
        app_dir: &Path,
        port: u16,
        config: &ResolvedConfig,
        env: &StartEnv,
        run_id: &str,
    ) -> Result<AppProcess, PreviewError> {
        let redactor = Arc::new(self.redactor_for(&env.env));
        let host = &self.settings.app_host;
        let mut commands = vec![augment_start_command(&config.start_command, host, port)];
        if let Some(fallback) = &config.fallback_start_command {
            commands.push(augment_start_command(fallback, host, port));
        }

        let mut last_err = None;
        for (index, command) in commands.iter().enumerate() {
            match self
                .launch(app_dir, port, command, env, run_id, Arc::clone(&redactor))
                .await
            {
                Ok(mut app) => {
                    app.used_fallback = index > 0;
                    return Ok(app);
                }
                Err(e) => {
                    warn!(run_id, command = %command, error = %e, "start command failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            PreviewError::Other(anyhow::anyhow!("no start command configured"))
        }))
    }
}
