//! Deciding whether a completed CI run counts as failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{TestCase, WorkflowRun};

/// Raw outcome of one workflow execution, before the failure decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub workflow: String,
    pub build_tool: String,
    pub tests: Vec<TestCase>,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub return_code: Option<i32>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn exited_cleanly(&self) -> bool {
        self.return_code == Some(0)
    }

    pub fn has_failing_tests(&self) -> bool {
        self.tests.iter().any(TestCase::is_failing)
    }

    pub fn into_workflow_run(self, failed: bool) -> WorkflowRun {
        WorkflowRun {
            failed,
            tests: self.tests,
            workflow: self.workflow,
            build_tool: self.build_tool,
            elapsed_time: self.elapsed.as_secs_f64(),
            return_code: self.return_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Pluggable decision over a [`RunReport`].
pub trait FailurePolicy: Send + Sync {
    fn is_failed(&self, report: &RunReport) -> bool;
}

/// Selectable policies (`run_failure` in the configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    /// See [`TestOutcomePolicy`].
    #[default]
    TestOutcomes,
    /// See [`ExitCodePolicy`].
    ExitCode,
}

impl FailurePolicyKind {
    pub fn build(self) -> Box<dyn FailurePolicy> {
        match self {
            Self::TestOutcomes => Box::new(TestOutcomePolicy),
            Self::ExitCode => Box::new(ExitCodePolicy),
        }
    }
}

/// Failed when any test failed or errored, or when the process exited
/// non-zero without reporting a single test.
///
/// A non-zero exit after tests were reported and all passed (an OOM kill
/// during teardown, a lint step after the test step) is not a failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestOutcomePolicy;

impl FailurePolicy for TestOutcomePolicy {
    fn is_failed(&self, report: &RunReport) -> bool {
        report.has_failing_tests() || (report.tests.is_empty() && !report.exited_cleanly())
    }
}

/// Failed on any non-zero exit or failing test.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitCodePolicy;

impl FailurePolicy for ExitCodePolicy {
    fn is_failed(&self, report: &RunReport) -> bool {
        !report.exited_cleanly() || report.has_failing_tests()
    }
}
