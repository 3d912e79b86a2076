//! Git working-copy synchronization for preview workspaces.
//!
//! All git access goes through the `git` binary with a fixed subcommand
//! allow-list. Credentials only ever travel as transient `GIT_CONFIG_*`
//! environment of the spawned process, never through the repository config,
//! and every captured line is redacted before it reaches an error or a log.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::redact::Redactor;
use super::system::{CommandSpec, System, run_to_completion};
use crate::errors::PreviewError;

/// Subcommands the synchronizer may run.
pub const ALLOWED_SUBCOMMANDS: &[&str] = &["clone", "fetch", "checkout", "pull", "rev-parse", "rev-list"];

/// An index lock at least this old is considered abandoned.
pub const STALE_LOCK_MINUTES: i64 = 5;

pub const MAX_REF_LEN: usize = 128;

const GIT_OUTPUT_CAP: usize = 32 * 1024;

const DIRTY_WORKSPACE_MARKERS: &[&str] = &[
    "unstaged changes",
    "uncommitted changes",
    "local changes",
    "would be overwritten",
    "commit your changes or stash them",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Cloned,
    Pulled,
    Recloned,
}

fn is_slug_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Normalize a repository reference to `owner/name`.
///
/// Accepts bare slugs, `https://host/owner/name(.git)`, `git@host:owner/name.git`
/// and `host/owner/name`.
pub fn normalize_repo_slug(input: &str) -> Result<String, PreviewError> {
    let invalid = || PreviewError::InvalidRepoFormat {
        input: input.to_string(),
    };
    let trimmed = input.trim();

    let mut rest = trimmed;
    let mut had_host = false;
    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped.split_once('/').map(|(_, path)| path).unwrap_or("");
            had_host = true;
            break;
        }
    }
    if !had_host && let Some(stripped) = rest.strip_prefix("git@") {
        rest = stripped.split_once(':').map(|(_, path)| path).ok_or_else(invalid)?;
        had_host = true;
    }

    let rest = rest.trim_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest).trim_matches('/');
    let mut parts: Vec<&str> = rest.split('/').collect();
    if !had_host && parts.len() == 3 && parts[0].contains('.') {
        parts.remove(0);
    }

    match parts.as_slice() {
        [owner, name] if is_slug_segment(owner) && is_slug_segment(name) => {
            Ok(format!("{}/{}", owner, name))
        }
        _ => Err(invalid()),
    }
}

/// Validate a branch or tag name before it is passed to git.
pub fn validate_ref(git_ref: &str) -> Result<(), PreviewError> {
    let reject = |reason| {
        Err(PreviewError::InvalidRef {
            input: git_ref.to_string(),
            reason,
        })
    };
    if git_ref.is_empty() {
        return reject("empty");
    }
    if git_ref.len() > MAX_REF_LEN {
        return reject("longer than 128 characters");
    }
    if git_ref.contains("..") {
        return reject("contains '..'");
    }
    if git_ref.starts_with('-') {
        return reject("starts with '-'");
    }
    if git_ref.starts_with('/') || git_ref.ends_with('/') {
        return reject("leading or trailing '/'");
    }
    if git_ref
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '*' | '?' | '[' | '~' | '^' | ':' | '\\'))
    {
        return reject("contains whitespace, glob, or control characters");
    }
    Ok(())
}

pub fn validate_commit_sha(sha: &str) -> Result<(), PreviewError> {
    if sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(PreviewError::InvalidCommitSha {
            input: sha.to_string(),
        })
    }
}

fn is_dirty_workspace_error(err: &PreviewError) -> bool {
    match err {
        PreviewError::ExternalTool { output, .. } => {
            let lower = output.to_lowercase();
            DIRTY_WORKSPACE_MARKERS.iter().any(|m| lower.contains(m))
        }
        _ => false,
    }
}

/// Settings for git access.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub git_bin: String,
    pub token: Option<String>,
    pub remote_base: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            git_bin: "git".to_string(),
            token: None,
            remote_base: "https://github.com".to_string(),
        }
    }
}

pub struct GitSynchronizer {
    system: System,
    settings: GitSettings,
    redactor: Redactor,
}

impl GitSynchronizer {
    pub fn new(system: System, settings: GitSettings) -> Self {
        let redactor = match &settings.token {
            Some(token) => Redactor::new([token.clone(), basic_auth_value(token)]),
            None => Redactor::default(),
        };
        Self {
            system,
            settings,
            redactor,
        }
    }

    pub fn clone_url(&self, slug: &str) -> String {
        format!("{}/{}.git", self.settings.remote_base.trim_end_matches('/'), slug)
    }

    fn auth_env(&self) -> Vec<(String, String)> {
        match self.settings.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => vec![
                ("GIT_CONFIG_COUNT".into(), "1".into()),
                ("GIT_CONFIG_KEY_0".into(), "http.extraHeader".into()),
                (
                    "GIT_CONFIG_VALUE_0".into(),
                    format!("Authorization: Basic {}", basic_auth_value(token)),
                ),
            ],
            None => Vec::new(),
        }
    }

    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, PreviewError> {
        let subcommand = args.first().copied().unwrap_or_default();
        if !ALLOWED_SUBCOMMANDS.contains(&subcommand) {
            return Err(PreviewError::GitSubcommandNotAllowed(subcommand.to_string()));
        }

        let mut spec = CommandSpec::new(&self.settings.git_bin)
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(self.auth_env());
        if let Some(cwd) = cwd {
            spec = spec.current_dir(cwd);
        }
        debug!(command = %spec.command_line(), "running git");

        let captured =
            run_to_completion(self.system.runner.as_ref(), &spec, GIT_OUTPUT_CAP, &self.redactor).await?;
        let text = captured.output.to_text();
        if captured.success() {
            Ok(text)
        } else {
            Err(PreviewError::ExternalTool {
                tool: format!("git {}", subcommand),
                exit_code: captured.exit_code,
                output: text.trim().to_string(),
            })
        }
    }

    async fn clone_into(&self, slug: &str, git_ref: &str, workspace: &Path) -> Result<(), PreviewError> {
        if let Some(parent) = workspace.parent() {
            self.system
                .fs
                .create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        let url = self.clone_url(slug);
        let target = workspace.to_string_lossy();
        self.git(None, &["clone", "--depth", "1", "--branch", git_ref, &url, &target])
            .await?;
        Ok(())
    }

    async fn update(&self, git_ref: &str, workspace: &Path) -> Result<(), PreviewError> {
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", git_ref);
        match self.git(Some(workspace), &["fetch", "origin", &refspec]).await {
            Ok(_) => {}
            // Not a branch: tags and other refs are pinned to whatever the remote names.
            Err(PreviewError::ExternalTool { output, .. }) if output.contains("couldn't find remote ref") => {
                self.git(Some(workspace), &["fetch", "origin", git_ref]).await?;
                self.git(Some(workspace), &["checkout", "--detach", "FETCH_HEAD"])
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.git(Some(workspace), &["checkout", git_ref]).await?;
        self.git(Some(workspace), &["pull", "--rebase", "origin", git_ref])
            .await?;
        Ok(())
    }

    async fn sync_once(&self, slug: &str, git_ref: &str, workspace: &Path) -> Result<SyncOutcome, PreviewError> {
        if self.system.fs.exists(workspace).await {
            self.update(git_ref, workspace).await?;
            Ok(SyncOutcome::Pulled)
        } else {
            self.clone_into(slug, git_ref, workspace).await?;
            Ok(SyncOutcome::Cloned)
        }
    }

    /// Remove `.git/index.lock` if it is older than the staleness threshold.
    async fn clear_stale_lock(&self, workspace: &Path) -> bool {
        let lock = workspace.join(".git").join("index.lock");
        if !self.system.fs.exists(&lock).await {
            return false;
        }
        let Ok(modified) = self.system.fs.modified(&lock).await else {
            return false;
        };
        let age = self.system.clock.now() - DateTime::<Utc>::from(modified);
        if age < Duration::minutes(STALE_LOCK_MINUTES) {
            return false;
        }
        match self.system.fs.remove_file(&lock).await {
            Ok(()) => {
                warn!(path = %lock.display(), age_secs = age.num_seconds(), "removed stale git index lock");
                true
            }
            Err(e) => {
                warn!(path = %lock.display(), error = %e, "failed to remove stale git index lock");
                false
            }
        }
    }

    /// Bring `workspace` to the tip of `git_ref` of `repo`.
    pub async fn sync_repository(
        &self,
        repo: &str,
        git_ref: &str,
        workspace: &Path,
    ) -> Result<SyncOutcome, PreviewError> {
        let slug = normalize_repo_slug(repo)?;
        validate_ref(git_ref)?;

        let mut lock_cleared = false;
        loop {
            let err = match self.sync_once(&slug, git_ref, workspace).await {
                Ok(outcome) => {
                    info!(repo = %slug, git_ref, outcome = ?outcome, "workspace synchronized");
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            if !lock_cleared && self.clear_stale_lock(workspace).await {
                lock_cleared = true;
                continue;
            }

            if is_dirty_workspace_error(&err) && self.system.fs.exists(workspace).await {
                warn!(repo = %slug, workspace = %workspace.display(), "workspace has local changes; re-cloning");
                self.system
                    .fs
                    .remove_dir_all(workspace)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to remove {}: {}", workspace.display(), e))?;
                self.clone_into(&slug, git_ref, workspace).await?;
                return Ok(SyncOutcome::Recloned);
            }

            return Err(err);
        }
    }

    /// Check out an exact commit, deepening a shallow clone first if possible.
    pub async fn checkout_commit(
        &self,
        workspace: &Path,
        commit_sha: &str,
        ref_for_fetch: &str,
    ) -> Result<(), PreviewError> {
        validate_commit_sha(commit_sha)?;
        validate_ref(ref_for_fetch)?;

        if let Err(e) = self
            .git(Some(workspace), &["fetch", "--unshallow", "origin", ref_for_fetch])
            .await
        {
            debug!(error = %e, "unshallow fetch failed; falling back to plain fetch");
            self.git(Some(workspace), &["fetch", "origin", ref_for_fetch])
                .await?;
        }
        self.git(Some(workspace), &["checkout", commit_sha]).await?;
        info!(commit = commit_sha, "checked out commit");
        Ok(())
    }

    /// Whether `git_ref` on the remote has commits that HEAD lacks. Any error
    /// counts as "no".
    pub async fn has_new_commits(&self, workspace: &Path, git_ref: &str) -> bool {
        if validate_ref(git_ref).is_err() {
            return false;
        }
        if let Err(e) = self.git(Some(workspace), &["fetch", "origin", git_ref]).await {
            debug!(error = %e, "fetch failed while checking for new commits");
            return false;
        }
        match self
            .git(
                Some(workspace),
                &["rev-list", "--left-right", "--count", "HEAD...FETCH_HEAD"],
            )
            .await
        {
            Ok(counts) => parse_behind_count(&counts).is_some_and(|behind| behind > 0),
            Err(e) => {
                debug!(error = %e, "rev-list failed while checking for new commits");
                false
            }
        }
    }
}

fn basic_auth_value(token: &str) -> String {
    BASE64.encode(format!("x-access-token:{}", token))
}

/// Parse the "behind" side of `rev-list --left-right --count` output.
fn parse_behind_count(output: &str) -> Option<u64> {
    let mut counts = output.split_whitespace();
    let _ahead: u64 = counts.next()?.parse().ok()?;
    counts.next()?.parse().ok()
}
