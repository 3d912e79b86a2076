//! Typed error hierarchy for the preview engine.
//!
//! Two families cover the engine:
//! - `PreviewError`: validation, capacity, lifecycle, and external tool failures
//! - `ConfigWarning`: configuration values that were discarded in favour of a
//!   previous or default value (never surfaced to API callers)

use thiserror::Error;

/// Errors surfaced by the preview engine.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Invalid repository '{input}': expected owner/name")]
    InvalidRepoFormat { input: String },

    #[error("Invalid git ref '{input}': {reason}")]
    InvalidRef { input: String, reason: &'static str },

    #[error("Invalid commit sha '{input}': expected 40 hex characters")]
    InvalidCommitSha { input: String },

    #[error("Invalid project id '{input}'")]
    InvalidProjectId { input: String },

    #[error("No free preview port in range {min}-{max}")]
    CapacityExhausted { min: u16, max: u16 },

    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Run {id} is {status}; cannot {action}")]
    InvalidTransition {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("{tool} failed (exit {exit_code:?}): {output}")]
    ExternalTool {
        tool: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git subcommand '{0}' is not permitted")]
    GitSubcommandNotAllowed(String),

    #[error("Webhook signature missing or invalid")]
    Unauthorized,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PreviewError {
    /// Validation failures are rejected before any side effect happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRepoFormat { .. }
                | Self::InvalidRef { .. }
                | Self::InvalidCommitSha { .. }
                | Self::InvalidProjectId { .. }
        )
    }
}

/// A configuration value that was rejected and replaced by the prior value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_file}: ignoring {field}: {message}")]
pub struct ConfigWarning {
    pub source_file: String,
    pub field: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ref_carries_reason() {
        let err = PreviewError::InvalidRef {
            input: "../etc".into(),
            reason: "contains '..'",
        };
        assert!(err.to_string().contains("contains '..'"));
        assert!(err.is_validation());
    }

    #[test]
    fn capacity_error_names_range() {
        let err = PreviewError::CapacityExhausted { min: 4001, max: 4002 };
        assert_eq!(err.to_string(), "No free preview port in range 4001-4002");
        assert!(!err.is_validation());
    }

    #[test]
    fn spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "git not found");
        let err = PreviewError::SpawnFailed {
            program: "git".into(),
            source: io_err,
        };
        match &err {
            PreviewError::SpawnFailed { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn external_tool_error_includes_output() {
        let err = PreviewError::ExternalTool {
            tool: "build".into(),
            exit_code: Some(2),
            output: "vite: not found".into(),
        };
        let text = err.to_string();
        assert!(text.contains("exit Some(2)"));
        assert!(text.contains("vite: not found"));
    }

    #[test]
    fn config_warning_display() {
        let warning = ConfigWarning {
            source_file: "preview.config.json".into(),
            field: "buildCommand".into(),
            message: "rejected by command safety validator".into(),
        };
        assert_eq!(
            warning.to_string(),
            "preview.config.json: ignoring buildCommand: rejected by command safety validator"
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PreviewError::Unauthorized);
        assert_std_error(&ConfigWarning {
            source_file: "a".into(),
            field: "b".into(),
            message: "c".into(),
        });
    }
}
