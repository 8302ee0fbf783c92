use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Grading Job State Machine
/// pending → running → {passed | failed | error}
/// Terminal states never transition again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Passed | JobStatus::Failed | JobStatus::Error)
    }

    /// Only forward edges of the state machine are legal
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Passed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Passed => write!(f, "passed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Outcome of one test case as reported by the build tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Qualified identifier, `Class#method`
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

impl TestOutcome {
    pub fn pass(name: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            passed: true,
            error_message: None,
            duration_seconds: duration_seconds.max(0.0),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            passed: false,
            error_message: Some(message.into()),
            duration_seconds: duration_seconds.max(0.0),
        }
    }
}

/// One static-analysis rule breach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleViolation {
    pub file: String,
    /// 0 when the report carries no usable line number
    pub line: u32,
    pub severity: String,
    pub message: String,
    pub rule: String,
}

/// Hidden fixture injected into the submission before execution
/// Immutable input supplied by the challenge owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenTestSpec {
    #[serde(alias = "className")]
    pub class_name: String,
    pub code: String,
}

/// Result of the synchronous grade() contract
///
/// List-valued fields are pre-serialized JSON arrays so callers
/// never need the internal record types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderResult {
    pub passed: bool,
    pub score: u32,
    pub visible_tests_json: String,
    pub hidden_tests_json: String,
    pub checkstyle_json: String,
    pub log: String,
}

impl GraderResult {
    /// Shape returned when grading could not run at all
    pub fn from_error(message: &str) -> Self {
        Self {
            passed: false,
            score: 0,
            visible_tests_json: "[]".to_string(),
            hidden_tests_json: "[]".to_string(),
            checkstyle_json: "[]".to_string(),
            log: format!("Grader error: {}", message),
        }
    }
}

/// Final data produced by a successful grading pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    pub passed: bool,
    pub score: u32,
    pub visible_results: Vec<TestOutcome>,
    pub hidden_results: Vec<TestOutcome>,
    pub style_violations: Vec<StyleViolation>,
}

/// Persisted Grading Job
/// Written only by the orchestrator, read by lookups and progress streams
///
/// ## Invariants:
/// - `completed_at` is set iff status is terminal
/// - `score` is set iff status is passed or failed
/// - `log` only grows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default)]
    pub visible_results: Vec<TestOutcome>,
    #[serde(default)]
    pub hidden_results: Vec<TestOutcome>,
    #[serde(default)]
    pub style_violations: Vec<StyleViolation>,
    #[serde(default)]
    pub log: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GradingJob {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            score: None,
            visible_results: Vec::new(),
            hidden_results: Vec::new(),
            style_violations: Vec::new(),
            log: String::new(),
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        if !line.ends_with('\n') {
            self.log.push('\n');
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)
    }

    pub fn complete(&mut self, outcome: GradeOutcome) -> Result<(), TransitionError> {
        let next = if outcome.passed {
            JobStatus::Passed
        } else {
            JobStatus::Failed
        };
        self.transition(next)?;
        self.score = Some(outcome.score);
        self.visible_results = outcome.visible_results;
        self.hidden_results = outcome.hidden_results;
        self.style_violations = outcome.style_violations;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_error(&mut self, message: &str) -> Result<(), TransitionError> {
        self.transition(JobStatus::Error)?;
        self.append_log(&format!("[ERROR] {}", message));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_consistent(&self) -> bool {
        let terminal = self.status.is_terminal();
        let scored = matches!(self.status, JobStatus::Passed | JobStatus::Failed);
        self.completed_at.is_some() == terminal && self.score.is_some() == scored
    }
}
