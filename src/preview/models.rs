use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::env::PlaceholderMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Whether a run may move from `from` to `to`.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    matches!(
        (from, to),
        (RunStatus::Starting, RunStatus::Ready)
            | (RunStatus::Starting, RunStatus::Failed)
            | (RunStatus::Ready, RunStatus::Starting)
            | (RunStatus::Failed, RunStatus::Starting)
            | (RunStatus::Ready, RunStatus::Failed)
            | (RunStatus::Starting, RunStatus::Stopped)
            | (RunStatus::Ready, RunStatus::Stopped)
            | (RunStatus::Failed, RunStatus::Stopped)
    )
}

pub fn is_refreshable(status: RunStatus) -> bool {
    matches!(status, RunStatus::Ready | RunStatus::Failed)
}

/// Snapshot of one orchestration session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub port: u16,
    pub preview_url: String,
    pub repo: String,
    pub branch: String,
    pub commit: Option<String>,
    pub project_id: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub injected_env_keys: Vec<String>,
    pub placeholder_mode: Option<PlaceholderMode>,
    pub external_service_detected: bool,
    pub attempt: u32,
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub run_id: String,
    #[serde(default)]
    pub only_if_changed: bool,
}

// ── Response payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    pub run_id: String,
    pub status: RunStatus,
    pub port: u16,
    pub preview_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(flatten)]
    pub run: Run,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub success: bool,
    pub run_id: String,
    pub refreshed: bool,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunListResponse {
    pub success: bool,
    pub runs: Vec<Run>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [RunStatus::Starting, RunStatus::Ready, RunStatus::Failed, RunStatus::Stopped] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        assert!(is_valid_transition(RunStatus::Starting, RunStatus::Ready));
        assert!(is_valid_transition(RunStatus::Failed, RunStatus::Starting));
        assert!(is_valid_transition(RunStatus::Ready, RunStatus::Stopped));
        assert!(!is_valid_transition(RunStatus::Stopped, RunStatus::Starting));
        assert!(!is_valid_transition(RunStatus::Stopped, RunStatus::Stopped));
        assert!(!is_valid_transition(RunStatus::Failed, RunStatus::Ready));
    }

    #[test]
    fn test_start_request_camel_case() {
        let req: StartRequest =
            serde_json::from_str(r#"{"repo":"acme/app","projectId":"p1","commit":null}"#).unwrap();
        assert_eq!(req.project_id, "p1");
        assert!(req.branch.is_none());
        assert!(req.commit.is_none());
    }

    #[test]
    fn test_run_response_flattens_run() {
        let run = Run {
            id: "r1".into(),
            status: RunStatus::Ready,
            port: 4001,
            preview_url: "http://localhost:4001".into(),
            repo: "acme/app".into(),
            branch: "main".into(),
            commit: None,
            project_id: "p1".into(),
            error: None,
            started_at: Utc::now(),
            ready_at: None,
            stopped_at: None,
            injected_env_keys: vec![],
            placeholder_mode: Some(PlaceholderMode::AutoNotDetected),
            external_service_detected: false,
            attempt: 1,
        };
        let value = serde_json::to_value(RunResponse { success: true, run }).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["status"], "ready");
        assert_eq!(value["previewUrl"], "http://localhost:4001");
        assert_eq!(value["placeholderMode"], "auto-not-detected");
    }
}
