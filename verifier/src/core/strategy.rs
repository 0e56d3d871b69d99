//! Classification strategies over the three checkpoint results.
//!
//! Each strategy is a pure predicate. [`classify`] applies an ordered subset
//! and returns the first match; a candidate matching none is dropped.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::candidate::BugCandidate;
use crate::core::types::ExecutionResult;

/// A bug-fix category and the predicate that assigns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Old code passes old tests, fails the new tests, fix passes them.
    PassPass,
    /// Old code fails, fix passes, no test changes.
    FailPass,
    /// Still failing after the fix, but at least one failing test got fixed.
    FailFail,
    /// Old code does not build or run, fix passes.
    FailPassBuild,
}

impl Strategy {
    /// Default evaluation order.
    pub const ALL: [Strategy; 4] = [
        Strategy::PassPass,
        Strategy::FailPass,
        Strategy::FailFail,
        Strategy::FailPassBuild,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PassPass => "PASS_PASS",
            Self::FailPass => "FAIL_PASS",
            Self::FailFail => "FAIL_FAIL",
            Self::FailPassBuild => "FAIL_PASS_BUILD",
        }
    }

    pub fn matches(self, candidate: &BugCandidate) -> bool {
        let view = Checkpoints::of(candidate);
        let patches = candidate.patches();
        match self {
            Self::PassPass => {
                view.passed(0)
                    && view.failed(1)
                    && view.passed(2)
                    && !patches.test.is_empty()
                    && !patches.test_is_deletion_only()
                    && view.fixed(1, 2)
                    && view.count(0) <= view.count(2)
                    && view.count(2) == view.count(1)
            }
            Self::FailPass => {
                view.failed(0)
                    && patches.test.is_empty()
                    && view.passed(2)
                    && view.fixed(0, 2)
                    && view.count(0) == view.count(2)
            }
            Self::FailFail => {
                (view.failed(0)
                    && view.failed(2)
                    && view.any_fixed(0, 2)
                    && view.count(0) == view.count(2))
                    || (view.failed(1)
                        && view.failed(2)
                        && view.any_fixed(1, 2)
                        && view.count(1) == view.count(2))
            }
            Self::FailPassBuild => {
                ((view.failed(0) || view.unsuccessful(0)) && view.passed(2))
                    || ((view.failed(1) || view.unsuccessful(1)) && view.passed(2))
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == normalized)
            .ok_or_else(|| format!("unknown strategy '{value}'"))
    }
}

/// First enabled strategy matching the candidate, in the given order.
pub fn classify(candidate: &BugCandidate, enabled: &[Strategy]) -> Option<Strategy> {
    enabled
        .iter()
        .copied()
        .find(|strategy| strategy.matches(candidate))
}

/// Read-only accessors over a candidate's checkpoint slots.
struct Checkpoints<'a> {
    slots: [Option<&'a ExecutionResult>; 3],
}

impl<'a> Checkpoints<'a> {
    fn of(candidate: &'a BugCandidate) -> Self {
        Self {
            slots: [
                candidate.checkpoint(0),
                candidate.checkpoint(1),
                candidate.checkpoint(2),
            ],
        }
    }

    /// Ran, reported tests (or exited cleanly), and none failed.
    fn passed(&self, i: usize) -> bool {
        self.slots[i]
            .is_some_and(|result| !result.crashed_without_tests() && !result.has_failing_tests())
    }

    /// Ran and at least one test failed.
    fn failed(&self, i: usize) -> bool {
        self.slots[i].is_some_and(ExecutionResult::has_failing_tests)
    }

    /// Ran and at least one workflow run was judged failed.
    fn unsuccessful(&self, i: usize) -> bool {
        self.slots[i].is_some_and(|result| !result.succeeded())
    }

    fn count(&self, i: usize) -> usize {
        self.slots[i].map_or(0, ExecutionResult::test_count)
    }

    fn failing_keys(&self, i: usize) -> HashSet<(&'a str, &'a str)> {
        self.slots[i]
            .map(|result| result.failing_tests().map(|test| test.key()).collect())
            .unwrap_or_default()
    }

    fn passes_at(&self, j: usize, key: (&str, &str)) -> bool {
        self.slots[j].is_some_and(|result| result.has_passing(key.0, key.1))
    }

    /// Every test failing at `i` passes at `j`.
    fn fixed(&self, i: usize, j: usize) -> bool {
        self.failing_keys(i)
            .into_iter()
            .all(|key| self.passes_at(j, key))
    }

    /// Some test failing at `i` passes at `j`.
    fn any_fixed(&self, i: usize, j: usize) -> bool {
        self.failing_keys(i)
            .into_iter()
            .any(|key| self.passes_at(j, key))
    }
}
