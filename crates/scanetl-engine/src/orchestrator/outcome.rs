//! Stage and run outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::registry::TransformError;
use crate::provider::ProviderError;
use crate::sink::SinkError;

/// Stage state machine
///
/// ```text
/// Pending → SourcesInitializing → SinksStarting → Executing → SinksFinishing → Succeeded | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    SourcesInitializing,
    SinksStarting,
    Executing,
    SinksFinishing,
    Succeeded,
    Failed,
    /// Not attempted because an earlier stage failed with abort-on-error set
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::SourcesInitializing => "sources_initializing",
            StageStatus::SinksStarting => "sinks_starting",
            StageStatus::Executing => "executing",
            StageStatus::SinksFinishing => "sinks_finishing",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    /// At least one stage failed, the rest still ran
    CompletedWithErrors,
    /// A stage failed with abort-on-error set
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// The one terminal error of a failed stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("provider `{provider}` failed to initialize: {source}")]
    ProviderInit {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("sink `{sink}` failed to start: {source}")]
    SinkStart {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error("transformation failed: {0}")]
    Transform(#[source] TransformError),

    #[error("sink `{sink}` failed to finish: {source}")]
    SinkFinish {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error("cannot prepare stage: {0}")]
    Setup(String),
}

/// What happened to one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub index: usize,
    pub name: String,
    pub transform: String,
    pub status: StageStatus,
    /// State the stage was in when it failed
    pub failed_in: Option<StageStatus>,
    pub error: Option<String>,
    /// Flush errors accumulated by the stage's sinks
    pub sink_errors: Vec<String>,
    /// Per-entry errors recorded by the stage's providers
    pub provider_errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<PathBuf>,
}

impl StageOutcome {
    pub fn pending(index: usize, name: impl Into<String>, transform: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            transform: transform.into(),
            status: StageStatus::Pending,
            failed_in: None,
            error: None,
            sink_errors: Vec::new(),
            provider_errors: Vec::new(),
            started_at: None,
            finished_at: None,
            artifacts: Vec::new(),
        }
    }

    pub fn skipped(index: usize, name: impl Into<String>, transform: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::pending(index, name, transform)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    pub fn failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

/// Persisted run session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageOutcome>,
    pub artifacts: Vec<PathBuf>,
}

/// Report returned by [`super::Orchestrator::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: i64,
    pub pipeline: String,
    pub status: RunStatus,
    pub abort_on_error: bool,
    pub stages: Vec<StageOutcome>,
    /// Every provider and sink output path, in stage order
    pub artifacts: Vec<PathBuf>,
}

impl RunOutcome {
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|s| s.failed())
    }

    /// Non-zero only when a stage failed and the pipeline asked to abort on error
    pub fn exit_code(&self) -> i32 {
        if self.abort_on_error && self.failed_stages().next().is_some() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn outcome(abort_on_error: bool, failed: bool) -> RunOutcome {
        let mut stage = StageOutcome::pending(0, "s", "copy");
        stage.status = if failed {
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        RunOutcome {
            run_id: 1,
            pipeline: "p".to_string(),
            status: RunStatus::Succeeded,
            abort_on_error,
            stages: vec![stage],
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(outcome(false, false).exit_code(), 0);
        assert_eq!(outcome(false, true).exit_code(), 0);
        assert_eq!(outcome(true, false).exit_code(), 0);
        assert_eq!(outcome(true, true).exit_code(), 1);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(StageStatus::SinksFinishing.as_str(), "sinks_finishing");
        assert_eq!(
            serde_json::to_string(&StageStatus::SourcesInitializing).unwrap(),
            "\"sources_initializing\""
        );
        assert_eq!(RunStatus::CompletedWithErrors.as_str(), "completed_with_errors");
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Executing.is_terminal());
    }
}
