/// Grade Executor - One Grading Pipeline
///
/// **Responsibility:**
/// Coordinate archive loader, sandbox engine, report parsers and evaluator
/// to turn one submission into a scored report.
///
/// **Architecture:**
/// 1. Extract the archive into a job-scoped workspace (archive.rs)
/// 2. Inject hidden test fixtures (archive.rs)
/// 3. Run the build in the sandbox (engine.rs)
/// 4. Parse test and style reports (reports.rs)
/// 5. Score (evaluator.rs)
///
/// This module is the glue layer - it knows nothing about:
/// - How the build executes (engine's job)
/// - How scoring works (evaluator's job)
/// - Where job records live (orchestrator's job)
///
/// The workspace directory is removed on every exit path.

use crate::archive::{self, ArchiveError, ArchiveLimits};
use crate::config::ProjectLayout;
use crate::engine::{ContainerRuntime, SandboxEngine, SandboxError};
use crate::evaluator::{self, ScoreBreakdown};
use crate::reports;
use async_trait::async_trait;
use grader_common::{GradeOutcome, GraderResult, HiddenTestSpec, StyleViolation, TestOutcome};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("submission rejected: {0}")]
    Validation(#[from] ArchiveError),
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("workspace setup failed: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GradeError {
    /// Validation errors are the submitter's fault; everything else is ours
    pub fn is_validation(&self) -> bool {
        matches!(self, GradeError::Validation(_))
    }
}

/// Inputs of one grading run
#[derive(Debug, Clone)]
pub struct GradeRequest {
    pub archive: Vec<u8>,
    pub hidden_tests: Vec<HiddenTestSpec>,
    /// Opaque style configuration; recorded, not interpreted
    pub style_rules: serde_json::Value,
}

/// Everything one successful pipeline produced
#[derive(Debug, Clone)]
pub struct GradeReport {
    pub exit_code: i64,
    pub timed_out: bool,
    pub breakdown: ScoreBreakdown,
    pub passed: bool,
    pub visible: Vec<TestOutcome>,
    pub hidden: Vec<TestOutcome>,
    pub violations: Vec<StyleViolation>,
    pub output: String,
}

impl GradeReport {
    pub fn into_outcome(self) -> GradeOutcome {
        GradeOutcome {
            passed: self.passed,
            score: self.breakdown.total,
            visible_results: self.visible,
            hidden_results: self.hidden,
            style_violations: self.violations,
        }
    }

    pub fn to_grader_result(&self, log: String) -> Result<GraderResult, serde_json::Error> {
        Ok(GraderResult {
            passed: self.passed,
            score: self.breakdown.total,
            visible_tests_json: serde_json::to_string(&self.visible)?,
            hidden_tests_json: serde_json::to_string(&self.hidden)?,
            checkstyle_json: serde_json::to_string(&self.violations)?,
            log,
        })
    }
}

/// Receives the human-readable trace of a grading run as it happens
#[async_trait]
pub trait GradeObserver: Send {
    async fn phase(&mut self, line: &str);
}

/// Observer that just accumulates the trace
#[derive(Debug, Default)]
pub struct LogCollector {
    pub log: String,
}

#[async_trait]
impl GradeObserver for LogCollector {
    async fn phase(&mut self, line: &str) {
        self.log.push_str(line);
        if !line.ends_with('\n') {
            self.log.push('\n');
        }
    }
}

pub struct Grader<R: ContainerRuntime> {
    engine: SandboxEngine<R>,
    layout: ProjectLayout,
    limits: ArchiveLimits,
    workspace_root: PathBuf,
}

impl<R: ContainerRuntime> Grader<R> {
    pub fn new(engine: SandboxEngine<R>, limits: ArchiveLimits, workspace_root: PathBuf) -> Self {
        let layout = engine.profile().layout.clone();
        Self {
            engine,
            layout,
            limits,
            workspace_root,
        }
    }

    /// Run the full pipeline, reporting phases to `observer`
    #[instrument(skip_all, fields(archive_bytes = request.archive.len(), hidden_tests = request.hidden_tests.len()))]
    pub async fn grade(
        &self,
        request: GradeRequest,
        observer: &mut dyn GradeObserver,
    ) -> Result<GradeReport, GradeError> {
        observer.phase("[PHASE] Initializing grading environment...").await;
        std::fs::create_dir_all(&self.workspace_root)?;
        let workspace = tempfile::Builder::new()
            .prefix("grader-")
            .tempdir_in(&self.workspace_root)?;

        let result = self.grade_in(workspace.path(), request, observer).await;

        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(workspace = %workspace_path.display(), error = %e, "Failed to remove workspace");
        }
        result
    }

    async fn grade_in(
        &self,
        workspace: &Path,
        request: GradeRequest,
        observer: &mut dyn GradeObserver,
    ) -> Result<GradeReport, GradeError> {
        let GradeRequest {
            archive,
            hidden_tests,
            style_rules,
        } = request;
        let hidden_configured = !hidden_tests.is_empty();

        if !style_rules.is_null() {
            observer
                .phase("[INFO] Custom style rules supplied; the project's own lint configuration applies")
                .await;
        }

        observer.phase("[PHASE] Extracting submission archive...").await;
        let files = {
            let dest = workspace.to_path_buf();
            let limits = self.limits;
            tokio::task::spawn_blocking(move || archive::extract(&archive, &dest, limits))
                .await
                .map_err(|e| GradeError::Internal(e.to_string()))??
        };
        observer.phase(&format!("[INFO] Extracted {} files", files)).await;

        if hidden_configured {
            observer
                .phase(&format!("[PHASE] Injecting {} hidden tests...", hidden_tests.len()))
                .await;
            let dest = workspace.to_path_buf();
            let layout = self.layout.clone();
            tokio::task::spawn_blocking(move || {
                archive::inject_hidden_tests(&dest, &layout, &hidden_tests)
            })
            .await
            .map_err(|e| GradeError::Internal(e.to_string()))??;
        }

        observer.phase("[PHASE] Sending submission to sandbox...").await;
        let sandbox = self.engine.run(workspace).await?;
        if sandbox.timed_out {
            observer
                .phase(&format!("[INFO] Sandbox timed out after {} ms", sandbox.duration_ms))
                .await;
        }

        observer.phase("[PHASE] Parsing test results...").await;
        let (visible, hidden, violations) = {
            let reports_dir = workspace.join(&self.layout.test_reports_dir);
            let style_report = workspace.join(&self.layout.style_report);
            let marker = self.layout.hidden_test_marker.clone();
            tokio::task::spawn_blocking(move || {
                let outcomes = reports::parse_test_reports(&reports_dir);
                let (visible, hidden) = reports::partition_hidden(outcomes, &marker);
                (visible, hidden, reports::parse_style_report(&style_report))
            })
            .await
            .map_err(|e| GradeError::Internal(e.to_string()))?
        };

        observer.phase("[PHASE] Scoring...").await;
        let breakdown = evaluator::score(&visible, &hidden, &violations, hidden_configured);
        let passed = evaluator::is_passing(breakdown.total, sandbox.exit_code);
        observer
            .phase(&format!(
                "[SCORE] {}/100 (visible {}, hidden {}, style {}; {} violations; exit code {})",
                breakdown.total,
                breakdown.visible,
                breakdown.hidden,
                breakdown.style,
                violations.len(),
                sandbox.exit_code
            ))
            .await;

        info!(
            score = breakdown.total,
            passed,
            exit_code = sandbox.exit_code,
            visible = visible.len(),
            hidden = hidden.len(),
            violations = violations.len(),
            "Grading finished"
        );

        observer
            .phase(&format!("[PHASE] Grading complete.\n{}", sandbox.output))
            .await;

        Ok(GradeReport {
            exit_code: sandbox.exit_code,
            timed_out: sandbox.timed_out,
            breakdown,
            passed,
            visible,
            hidden,
            violations,
            output: sandbox.output,
        })
    }

    /// Synchronous contract: always returns a result, never an error
    pub async fn grade_to_result(&self, request: GradeRequest) -> GraderResult {
        let mut collector = LogCollector::default();
        match self.grade(request, &mut collector).await {
            Ok(report) => match report.to_grader_result(collector.log) {
                Ok(result) => result,
                Err(e) => GraderResult::from_error(&e.to_string()),
            },
            Err(e) => GraderResult::from_error(&e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolchainProfile;
    use crate::testing::{build_zip, checkstyle_report, project_zip, surefire_report, FakeRuntime};
    use std::sync::Arc;
    use std::time::Duration;

    const REPORTS: &str = "target/surefire-reports";
    const STYLE: &str = "target/checkstyle-result.xml";

    fn grader(runtime: FakeRuntime, root: &Path) -> Grader<FakeRuntime> {
        let engine = SandboxEngine::new(Arc::new(runtime), ToolchainProfile::maven())
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        Grader::new(
            engine,
            ArchiveLimits {
                max_uncompressed_bytes: 1024 * 1024,
            },
            root.to_path_buf(),
        )
    }

    fn hidden_tests() -> Vec<HiddenTestSpec> {
        vec![HiddenTestSpec {
            class_name: "HiddenCartTest".to_string(),
            code: "package com.challenge; class HiddenCartTest {}".to_string(),
        }]
    }

    fn request(hidden_tests: Vec<HiddenTestSpec>) -> GradeRequest {
        GradeRequest {
            archive: project_zip(),
            hidden_tests,
            style_rules: serde_json::Value::Null,
        }
    }

    fn scenario_a(exit_code: i64) -> FakeRuntime {
        FakeRuntime::new()
            .exit_code(exit_code)
            .output("[INFO] BUILD SUCCESS")
            .with_file(
                &format!("{}/TEST-com.challenge.CartTest.xml", REPORTS),
                &surefire_report("com.challenge.CartTest", &[("adds", None), ("totals", None), ("empties", None)]),
            )
            .with_file(
                &format!("{}/TEST-com.challenge.HiddenCartTest.xml", REPORTS),
                &surefire_report("com.challenge.HiddenCartTest", &[("edge", None), ("overflow", None)]),
            )
            .with_file(STYLE, &checkstyle_report(0))
    }

    #[tokio::test]
    async fn test_scenario_a_full_marks() {
        let root = tempfile::tempdir().unwrap();
        let mut collector = LogCollector::default();

        let report = grader(scenario_a(0), root.path())
            .grade(request(hidden_tests()), &mut collector)
            .await
            .unwrap();

        assert_eq!(report.breakdown.visible, 40);
        assert_eq!(report.breakdown.hidden, 40);
        assert_eq!(report.breakdown.style, 20);
        assert_eq!(report.breakdown.total, 100);
        assert!(report.passed);
        assert_eq!(report.visible.len(), 3);
        assert_eq!(report.hidden.len(), 2);

        assert!(collector.log.contains("[PHASE] Injecting 1 hidden tests..."));
        assert!(collector.log.contains("[SCORE] 100/100"));
        assert!(collector.log.ends_with("[INFO] BUILD SUCCESS\n"));
    }

    #[tokio::test]
    async fn test_scenario_b_nonzero_exit_fails_with_full_score() {
        let root = tempfile::tempdir().unwrap();
        let report = grader(scenario_a(1), root.path())
            .grade(request(hidden_tests()), &mut LogCollector::default())
            .await
            .unwrap();

        assert_eq!(report.breakdown.total, 100);
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn test_scenario_c_half_visible_without_hidden() {
        let root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new()
            .with_file(
                &format!("{}/TEST-com.challenge.CartTest.xml", REPORTS),
                &surefire_report(
                    "com.challenge.CartTest",
                    &[("a", None), ("b", None), ("c", Some("expected 3")), ("d", Some("expected 4"))],
                ),
            )
            .with_file(STYLE, &checkstyle_report(3));

        let report = grader(runtime, root.path())
            .grade(request(Vec::new()), &mut LogCollector::default())
            .await
            .unwrap();

        assert_eq!(report.breakdown.visible, 40);
        assert_eq!(report.breakdown.style, 14);
        assert_eq!(report.breakdown.total, 54);
        assert!(!report.passed);
        assert_eq!(report.violations.len(), 3);
    }

    #[tokio::test]
    async fn test_scenario_d_no_reports_scores_style_only() {
        let root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new().exit_code(1).output("[ERROR] COMPILATION ERROR");

        let report = grader(runtime, root.path())
            .grade(request(hidden_tests()), &mut LogCollector::default())
            .await
            .unwrap();

        assert!(report.visible.is_empty());
        assert!(report.hidden.is_empty());
        assert_eq!(report.breakdown.visible, 0);
        assert_eq!(report.breakdown.total, 20);
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn test_traversal_archive_is_validation_error() {
        let root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new();
        let grader = grader(runtime, root.path());
        let request = GradeRequest {
            archive: build_zip(&[("../../escape.txt", Some("x"))]),
            hidden_tests: Vec::new(),
            style_rules: serde_json::Value::Null,
        };

        let err = grader.grade(request, &mut LogCollector::default()).await.unwrap_err();
        assert!(err.is_validation());
        // Workspace is cleaned up even on failure
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_bad_hidden_fixture_stops_before_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let engine = SandboxEngine::new(runtime.clone(), ToolchainProfile::maven());
        let grader = Grader::new(
            engine,
            ArchiveLimits {
                max_uncompressed_bytes: 1024 * 1024,
            },
            root.path().to_path_buf(),
        );
        let fixtures = vec![HiddenTestSpec {
            class_name: "../Evil".to_string(),
            code: "class Evil {}".to_string(),
        }];

        let err = grader
            .grade(request(fixtures), &mut LogCollector::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(runtime.calls().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_workspace_removed_after_success() {
        let root = tempfile::tempdir().unwrap();
        grader(scenario_a(0), root.path())
            .grade(request(hidden_tests()), &mut LogCollector::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_sandbox_error() {
        let root = tempfile::tempdir().unwrap();
        let err = grader(FakeRuntime::new().fail_create(), root.path())
            .grade(request(Vec::new()), &mut LogCollector::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GradeError::Sandbox(SandboxError::Create(_))));
        assert!(!err.is_validation());
    }

    #[tokio::test]
    async fn test_grade_to_result_success_shape() {
        let root = tempfile::tempdir().unwrap();
        let result = grader(scenario_a(0), root.path())
            .grade_to_result(request(hidden_tests()))
            .await;

        assert!(result.passed);
        assert_eq!(result.score, 100);
        let visible: Vec<TestOutcome> = serde_json::from_str(&result.visible_tests_json).unwrap();
        assert_eq!(visible.len(), 3);
        assert_eq!(result.checkstyle_json, "[]");
        assert!(result.log.contains("[PHASE] Grading complete."));
    }

    #[tokio::test]
    async fn test_grade_to_result_error_shape() {
        let root = tempfile::tempdir().unwrap();
        let result = grader(FakeRuntime::new(), root.path())
            .grade_to_result(GradeRequest {
                archive: b"not a zip".to_vec(),
                hidden_tests: Vec::new(),
                style_rules: serde_json::Value::Null,
            })
            .await;

        assert!(!result.passed);
        assert_eq!(result.score, 0);
        assert_eq!(result.visible_tests_json, "[]");
        assert_eq!(result.hidden_tests_json, "[]");
        assert_eq!(result.checkstyle_json, "[]");
        assert!(result.log.starts_with("Grader error: "));
    }
}
