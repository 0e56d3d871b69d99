//! Shared deterministic types for the verification core.
//!
//! These types are the contract between mining, differential execution and
//! classification. They carry no I/O and serialize to the persisted record
//! shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary language of a repository, as reported by the metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Kotlin,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Rust,
    Ruby,
    CSharp,
    C,
    Cpp,
    Unknown,
}

impl Language {
    /// Map a metadata language label (e.g. `"C++"`, `"TypeScript"`) to a [`Language`].
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "java" => Self::Java,
            "kotlin" => Self::Kotlin,
            "python" => Self::Python,
            "javascript" => Self::JavaScript,
            "typescript" => Self::TypeScript,
            "go" => Self::Go,
            "rust" => Self::Rust,
            "ruby" => Self::Ruby,
            "c#" | "csharp" => Self::CSharp,
            "c" => Self::C,
            "c++" | "cpp" => Self::Cpp,
            _ => Self::Unknown,
        }
    }

    /// File extensions (without dot) treated as source code for this language.
    pub fn source_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Java => &["java"],
            Self::Kotlin => &["kt", "kts", "java"],
            Self::Python => &["py", "pyx", "pyi"],
            Self::JavaScript => &["js", "jsx", "mjs", "cjs"],
            Self::TypeScript => &["ts", "tsx", "js", "jsx"],
            Self::Go => &["go"],
            Self::Rust => &["rs"],
            Self::Ruby => &["rb"],
            Self::CSharp => &["cs"],
            Self::C => &["c", "h"],
            Self::Cpp => &["cc", "cpp", "cxx", "hpp", "hh", "h", "c"],
            Self::Unknown => &[],
        }
    }
}

/// External repository metadata. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Stable `owner/name` identifier.
    pub full_name: String,
    pub clone_url: String,
    pub language: Language,
    /// Size in kilobytes.
    pub size: u64,
    pub stars: u64,
}

impl Repository {
    /// Filesystem-safe slug (`owner__name`) used for clone and output paths.
    /// Owner names cannot contain `_`, so the first `__` is the boundary.
    pub fn slug(&self) -> String {
        self.full_name.replace('/', "__")
    }
}

/// A commit as read from the VCS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Parent hashes, first parent first. Empty for a root commit.
    pub parents: Vec<String>,
}

impl CommitInfo {
    pub fn first_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

/// Which partitions of a candidate's diff are non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Source non-empty, non-code empty.
    SourceOnly,
    /// Source and non-code both non-empty.
    Mixed,
    /// Source empty.
    NonCodeOnly,
}

impl ChangeType {
    pub fn derive(has_source: bool, has_non_code: bool) -> Self {
        match (has_source, has_non_code) {
            (true, false) => Self::SourceOnly,
            (true, true) => Self::Mixed,
            (false, _) => Self::NonCodeOnly,
        }
    }

    /// Persisted label, e.g. `SOURCE_ONLY`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceOnly => "SOURCE_ONLY",
            Self::Mixed => "MIXED",
            Self::NonCodeOnly => "NON_CODE_ONLY",
        }
    }
}

/// Outcome of a single test result entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultEntry {
    pub result: TestStatus,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// One test case as parsed from a CI run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Suite (class / module) the test belongs to.
    pub classname: String,
    pub name: String,
    #[serde(default)]
    pub time: f64,
    /// Empty means the test passed without any recorded entry.
    #[serde(default)]
    pub results: Vec<TestResultEntry>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl TestCase {
    /// Overall status: the first non-passing entry wins, else passed.
    pub fn status(&self) -> TestStatus {
        self.results
            .iter()
            .map(|entry| entry.result)
            .find(|status| *status != TestStatus::Passed)
            .unwrap_or(TestStatus::Passed)
    }

    /// Failed or errored tests both count as failing.
    pub fn is_failing(&self) -> bool {
        matches!(self.status(), TestStatus::Failed | TestStatus::Errored)
    }

    pub fn is_passing(&self) -> bool {
        self.status() == TestStatus::Passed
    }

    /// Identity used to match a test across checkpoints (suite + name).
    pub fn key(&self) -> (&str, &str) {
        (&self.classname, &self.name)
    }
}

/// One workflow executed at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub failed: bool,
    pub tests: Vec<TestCase>,
    pub workflow: String,
    pub build_tool: String,
    /// Wall-clock seconds.
    pub elapsed_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Outcome of one checkpoint: every workflow run executed there.
///
/// A checkpoint that never ran (or whose runner produced nothing) is
/// represented by `None` at the candidate's slot, never by an empty result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionResult {
    pub runs: Vec<WorkflowRun>,
}

impl ExecutionResult {
    pub fn new(runs: Vec<WorkflowRun>) -> Self {
        Self { runs }
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestCase> {
        self.runs.iter().flat_map(|run| run.tests.iter())
    }

    pub fn test_count(&self) -> usize {
        self.runs.iter().map(|run| run.tests.len()).sum()
    }

    pub fn failing_tests(&self) -> impl Iterator<Item = &TestCase> {
        self.tests().filter(|test| test.is_failing())
    }

    pub fn has_failing_tests(&self) -> bool {
        self.failing_tests().next().is_some()
    }

    /// True when every workflow run was judged successful.
    pub fn succeeded(&self) -> bool {
        self.runs.iter().all(|run| !run.failed)
    }

    /// A run that failed without reporting any test: "no tests", which is
    /// distinct from a run where zero tests failed.
    pub fn crashed_without_tests(&self) -> bool {
        self.test_count() == 0 && !self.succeeded()
    }

    /// True if a test with the same suite and name passes here.
    pub fn has_passing(&self, classname: &str, name: &str) -> bool {
        self.tests()
            .any(|test| test.key() == (classname, name) && test.is_passing())
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.runs.iter().map(|run| run.elapsed_time).sum()
    }
}

/// An issue linked to an accepted candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub url: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(full_name: &str) -> Repository {
        Repository {
            full_name: full_name.to_string(),
            clone_url: String::new(),
            language: Language::Java,
            size: 0,
            stars: 0,
        }
    }

    #[test]
    fn slugs_keep_hyphenated_names_apart() {
        assert_eq!(named("a-b/c").slug(), "a-b__c");
        assert_eq!(named("a/b-c").slug(), "a__b-c");
        assert_ne!(named("a-b/c").slug(), named("a/b-c").slug());
    }

    fn case(name: &str, results: Vec<TestStatus>) -> TestCase {
        TestCase {
            classname: "Suite".to_string(),
            name: name.to_string(),
            time: 0.0,
            results: results
                .into_iter()
                .map(|result| TestResultEntry {
                    result,
                    message: String::new(),
                    kind: String::new(),
                })
                .collect(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn change_type_follows_partition_emptiness() {
        assert_eq!(ChangeType::derive(true, false), ChangeType::SourceOnly);
        assert_eq!(ChangeType::derive(true, true), ChangeType::Mixed);
        assert_eq!(ChangeType::derive(false, true), ChangeType::NonCodeOnly);
        assert_eq!(ChangeType::derive(false, false), ChangeType::NonCodeOnly);
    }

    #[test]
    fn errored_tests_count_as_failing() {
        assert!(case("t", vec![TestStatus::Errored]).is_failing());
        assert!(case("t", vec![TestStatus::Failed]).is_failing());
        assert!(!case("t", vec![TestStatus::Skipped]).is_failing());
        assert!(case("t", vec![]).is_passing());
    }

    #[test]
    fn crashed_run_is_not_zero_failures() {
        let crashed = ExecutionResult::new(vec![WorkflowRun {
            failed: true,
            tests: Vec::new(),
            workflow: "ci.yml".to_string(),
            build_tool: "maven".to_string(),
            elapsed_time: 1.0,
            return_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
        }]);
        assert!(crashed.crashed_without_tests());
        assert!(!crashed.has_failing_tests());
    }

    #[test]
    fn language_labels_map_to_variants() {
        assert_eq!(Language::from_label("C++"), Language::Cpp);
        assert_eq!(Language::from_label("Java"), Language::Java);
        assert_eq!(Language::from_label("Haskell"), Language::Unknown);
    }

    #[test]
    fn execution_result_serializes_as_list() {
        let json = serde_json::to_string(&ExecutionResult::default()).expect("json");
        assert_eq!(json, "[]");
    }
}
