//! Test-only helpers: deterministic fixtures, throwaway git repositories and
//! scripted collaborators.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use crate::core::candidate::{BugCandidate, CHECKPOINTS};
use crate::core::failure::RunReport;
use crate::core::partition::PatchPartition;
use crate::core::types::{
    CommitInfo, ExecutionResult, IssueRecord, Language, Repository, TestCase, TestResultEntry,
    TestStatus, WorkflowRun,
};
use crate::error::{ApiError, InfraError};
use crate::io::ci_runner::{CiRunner, RunRequest, WorkflowDescriptor};
use crate::io::credentials::{Quota, RateLimitSnapshot, Token};
use crate::io::git::Git;
use crate::io::github::{MetadataClient, PullRequestRef};

/// Repository metadata with a fake clone URL.
pub fn repository(full_name: &str, language: Language) -> Repository {
    Repository {
        full_name: full_name.to_string(),
        clone_url: format!("https://github.com/{full_name}.git"),
        language,
        size: 1,
        stars: 0,
    }
}

/// Commit with a timestamp in unix seconds.
pub fn commit_at(hash: &str, message: &str, ts_secs: i64, parents: &[&str]) -> CommitInfo {
    CommitInfo {
        hash: hash.to_string(),
        message: message.to_string(),
        timestamp: DateTime::<Utc>::from_timestamp(ts_secs, 0).unwrap_or_default(),
        parents: parents.iter().map(|parent| (*parent).to_string()).collect(),
    }
}

/// Single-hunk diff replacing the one line of `path` with `body`.
pub fn source_diff(path: &str, body: &str) -> String {
    format!(
        "diff --git a/{path} b/{path}\n\
         index 1111111..2222222 100644\n\
         --- a/{path}\n\
         +++ b/{path}\n\
         @@ -1 +1 @@\n\
         -old\n\
         +{body}\n"
    )
}

fn added_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!(
        "diff --git a/{path} b/{path}\n\
         new file mode 100644\n\
         index 0000000..3333333\n\
         --- /dev/null\n\
         +++ b/{path}\n\
         @@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

fn deleted_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!(
        "diff --git a/{path} b/{path}\n\
         deleted file mode 100644\n\
         index 3333333..0000000\n\
         --- a/{path}\n\
         +++ /dev/null\n\
         @@ -1,{} +0,0 @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('-');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// Test case with a single result entry of `status`.
pub fn test_case(classname: &str, name: &str, status: TestStatus) -> TestCase {
    TestCase {
        classname: classname.to_string(),
        name: name.to_string(),
        time: 0.1,
        results: vec![TestResultEntry {
            result: status,
            message: String::new(),
            kind: String::new(),
        }],
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn suite(tests: &[(&str, TestStatus)]) -> Vec<TestCase> {
    tests
        .iter()
        .map(|(name, status)| test_case("Suite", name, *status))
        .collect()
}

/// One workflow run over suite `Suite`; failed when any test fails.
pub fn result_of(tests: &[(&str, TestStatus)]) -> ExecutionResult {
    let tests = suite(tests);
    let failed = tests.iter().any(TestCase::is_failing);
    ExecutionResult::new(vec![WorkflowRun {
        failed,
        tests,
        workflow: "ci.yml".to_string(),
        build_tool: "maven".to_string(),
        elapsed_time: 1.0,
        return_code: Some(i32::from(failed)),
        stdout: String::new(),
        stderr: String::new(),
    }])
}

/// A run that failed before reporting any test.
pub fn crashed_result() -> ExecutionResult {
    ExecutionResult::new(vec![WorkflowRun {
        failed: true,
        tests: Vec::new(),
        workflow: "ci.yml".to_string(),
        build_tool: "maven".to_string(),
        elapsed_time: 1.0,
        return_code: Some(1),
        stdout: String::new(),
        stderr: "BUILD FAILURE".to_string(),
    }])
}

/// Builds candidates without touching git.
#[derive(Debug, Clone)]
pub struct CandidateBuilder {
    repository: Repository,
    diff: String,
    checkpoints: [Option<ExecutionResult>; CHECKPOINTS],
}

impl CandidateBuilder {
    /// Java candidate with a one-line source fix and no test changes.
    pub fn java() -> Self {
        Self {
            repository: repository("acme/widgets", Language::Java),
            diff: source_diff("src/main/java/Foo.java", "fixed"),
            checkpoints: [None, None, None],
        }
    }

    /// Add a new test file to the test partition.
    pub fn with_test_patch(mut self) -> Self {
        self.diff.push_str(&added_file_diff(
            "src/test/java/FooTest.java",
            &["class FooTest {", "  @Test void t2() {}", "}"],
        ));
        self
    }

    /// Test partition consisting of a deleted test file only.
    pub fn with_deleted_test_patch(mut self) -> Self {
        self.diff.push_str(&deleted_file_diff(
            "src/test/java/LegacyTest.java",
            &["class LegacyTest {", "}"],
        ));
        self
    }

    pub fn checkpoints(mut self, checkpoints: [Option<ExecutionResult>; CHECKPOINTS]) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn build(self) -> BugCandidate {
        let patches = PatchPartition::from_diff(&self.diff, self.repository.language, false);
        let mut candidate = BugCandidate::new(
            self.repository,
            commit_at("f1x", "fix overflow in Foo", 1_700_000_600, &["p4r"]),
            commit_at("p4r", "add Foo", 1_700_000_000, &[]),
            patches,
            BTreeSet::new(),
        );
        candidate.checkpoints = self.checkpoints;
        candidate
    }
}

/// A throwaway git repository with deterministic, increasing commit dates.
pub struct TestRepo {
    dir: TempDir,
    clock: Cell<i64>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self {
            dir,
            clock: Cell::new(1_700_000_000),
        };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.name", "Test User"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write one file and commit it; returns the new commit hash.
    pub fn commit(&self, path: &str, contents: &str, message: &str) -> Result<String> {
        self.commit_files(&[(path, contents)], message)
    }

    /// Write several files and commit them together.
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) -> Result<String> {
        for (path, contents) in files {
            self.write(path, contents)?;
        }
        self.commit_all(message)
    }

    /// Delete a file and commit the removal.
    pub fn remove(&self, path: &str, message: &str) -> Result<String> {
        self.git(&["rm", "--quiet", path])?;
        self.commit_all(message)
    }

    pub fn write(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))
    }

    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.path().join(path)).expect("read file in test repo")
    }

    /// Create and switch to a new branch.
    pub fn branch(&self, name: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", "-b", name])?;
        Ok(())
    }

    pub fn switch(&self, name: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", name])?;
        Ok(())
    }

    /// Merge `branch` with a merge commit; returns its hash.
    pub fn merge(&self, branch: &str, message: &str) -> Result<String> {
        self.git(&["merge", "--quiet", "--no-ff", "-m", message, branch])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn commit_all(&self, message: &str) -> Result<String> {
        self.git(&["add", "--all"])?;
        self.git(&["commit", "--quiet", "-m", message])?;
        self.head()
    }

    /// Run git with author and committer dates one minute past the last call.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let now = self.clock.get() + 60;
        self.clock.set(now);
        let date = format!("{now} +0000");
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_DATE", &date)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Response of [`ScriptedCiRunner`] to one `run` call.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Report {
        tests: Vec<TestCase>,
        return_code: Option<i32>,
    },
    Timeout,
}

impl ScriptedRun {
    /// Completed run over suite `Suite`; exit code 1 when a test fails.
    pub fn tests(tests: &[(&str, TestStatus)]) -> Self {
        let tests = suite(tests);
        let return_code = Some(i32::from(tests.iter().any(TestCase::is_failing)));
        Self::Report { tests, return_code }
    }

    /// Completed run with a non-zero exit and no parsed tests.
    pub fn crash() -> Self {
        Self::Report {
            tests: Vec::new(),
            return_code: Some(1),
        }
    }
}

/// State of the working tree observed by one `run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRun {
    pub head: String,
    /// No tracked or untracked modifications.
    pub clean: bool,
    pub cache_dir: PathBuf,
}

/// [`CiRunner`] that answers `run` calls from a queue.
#[derive(Debug, Default)]
pub struct ScriptedCiRunner {
    workflows: Vec<WorkflowDescriptor>,
    runs: Mutex<VecDeque<ScriptedRun>>,
    observed: Mutex<Vec<ObservedRun>>,
    warmed: Mutex<Vec<BTreeSet<String>>>,
    image: Option<String>,
}

impl ScriptedCiRunner {
    /// One `ci.yml` maven workflow; `runs` are consumed in order.
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            workflows: vec![WorkflowDescriptor {
                path: PathBuf::from(".github/workflows/ci.yml"),
                name: "ci.yml".to_string(),
                build_tool: "maven".to_string(),
            }],
            runs: Mutex::new(runs.into()),
            ..Self::default()
        }
    }

    /// A runner that finds no test workflow in any repository.
    pub fn without_workflows() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    /// Working-tree state seen by each `run` call so far.
    pub fn observed(&self) -> Vec<ObservedRun> {
        self.observed.lock().expect("observed lock").clone()
    }

    /// Scripted runs not consumed yet.
    pub fn remaining(&self) -> usize {
        self.runs.lock().expect("runs lock").len()
    }

    pub fn warmed(&self) -> Vec<BTreeSet<String>> {
        self.warmed.lock().expect("warmed lock").clone()
    }
}

impl CiRunner for ScriptedCiRunner {
    fn workflows(
        &self,
        _repo: &Path,
        _language: Language,
    ) -> Result<Vec<WorkflowDescriptor>, InfraError> {
        Ok(self.workflows.clone())
    }

    fn run(&self, request: &RunRequest) -> Result<RunReport, InfraError> {
        let git = Git::new(&request.workdir);
        self.observed.lock().expect("observed lock").push(ObservedRun {
            head: git.head()?,
            clean: git.is_clean()?,
            cache_dir: request.cache_dir.clone(),
        });
        let next = self.runs.lock().expect("runs lock").pop_front();
        match next {
            Some(ScriptedRun::Report { tests, return_code }) => Ok(RunReport {
                workflow: request.workflow.name.clone(),
                build_tool: request.workflow.build_tool.clone(),
                tests,
                stdout: String::new(),
                stderr: String::new(),
                return_code,
                elapsed: Duration::from_millis(10),
            }),
            Some(ScriptedRun::Timeout) => Err(InfraError::Timeout {
                secs: request.timeout.as_secs(),
            }),
            None => Err(InfraError::Runner("no scripted run left".to_string())),
        }
    }

    fn warm_actions(&self, actions: &BTreeSet<String>, _cache_dir: &Path) -> Result<()> {
        self.warmed.lock().expect("warmed lock").push(actions.clone());
        Ok(())
    }

    fn image(&self) -> Option<String> {
        self.image.clone()
    }
}

/// In-memory [`MetadataClient`].
#[derive(Debug, Default)]
pub struct ScriptedMetadata {
    repositories: HashMap<String, Repository>,
    issues: HashMap<(String, u64), IssueRecord>,
    pulls: HashMap<String, Vec<PullRequestRef>>,
    calls: Mutex<usize>,
}

impl ScriptedMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, repository: Repository) -> Self {
        self.repositories
            .insert(repository.full_name.clone(), repository);
        self
    }

    pub fn with_issue(mut self, full_name: &str, issue: IssueRecord) -> Self {
        self.issues.insert((full_name.to_string(), issue.id), issue);
        self
    }

    pub fn with_pull_request(mut self, sha: &str, pull: PullRequestRef) -> Self {
        self.pulls.entry(sha.to_string()).or_default().push(pull);
        self
    }

    /// Quota-counted calls made so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }

    fn count(&self) {
        *self.calls.lock().expect("calls lock") += 1;
    }
}

impl MetadataClient for ScriptedMetadata {
    fn repository(&self, _token: &Token, full_name: &str) -> Result<Repository, ApiError> {
        self.count();
        self.repositories
            .get(full_name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(full_name.to_string()))
    }

    fn rate_limit(&self, _token: &Token) -> Result<RateLimitSnapshot, ApiError> {
        let now = Utc::now();
        Ok(RateLimitSnapshot {
            core: Quota {
                remaining: 5000,
                limit: 5000,
                reset_at: now + TimeDelta::hours(1),
            },
            search: Quota {
                remaining: 30,
                limit: 30,
                reset_at: now + TimeDelta::minutes(1),
            },
        })
    }

    fn pull_requests_for_commit(
        &self,
        _token: &Token,
        _full_name: &str,
        sha: &str,
    ) -> Result<Vec<PullRequestRef>, ApiError> {
        self.count();
        Ok(self.pulls.get(sha).cloned().unwrap_or_default())
    }

    fn issue(&self, _token: &Token, full_name: &str, number: u64) -> Result<IssueRecord, ApiError> {
        self.count();
        self.issues
            .get(&(full_name.to_string(), number))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{full_name}#{number}")))
    }
}

/// Issue fixture with the canonical web URL.
pub fn issue(full_name: &str, id: u64, title: &str) -> IssueRecord {
    IssueRecord {
        id,
        title: title.to_string(),
        body: String::new(),
        url: format!("https://github.com/{full_name}/issues/{id}"),
        labels: vec!["bug".to_string()],
    }
}
