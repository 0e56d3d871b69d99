//! Differential execution against real git histories with a scripted CI runner.
//!
//! Each test builds a small repository, derives a candidate from two of its
//! commits, executes the three checkpoints and classifies the outcome.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use verifier::core::candidate::BugCandidate;
use verifier::core::failure::FailurePolicyKind;
use verifier::core::partition::PatchPartition;
use verifier::core::strategy::{Strategy, classify};
use verifier::core::types::{ChangeType, Language, TestStatus};
use verifier::error::InfraError;
use verifier::execute::{AbortReason, DifferentialExecutor, ExecutionSettings};
use verifier::io::cache_pool::CachePool;
use verifier::io::ci_runner::CiRunner;
use verifier::io::config::OverflowPolicy;
use verifier::io::git::Git;
use verifier::test_support::{ScriptedCiRunner, ScriptedRun, TestRepo, repository};

const WORKFLOW: &str = "name: ci\non: push\njobs:\n  test:\n    steps:\n      - uses: actions/checkout@v4\n      - run: mvn test\n";
const FOO_V1: &str = "class Foo {\n  int value() { return 1; }\n}\n";
const FOO_V2: &str = "class Foo {\n  int value() { return 2; }\n}\n";
const FOO_TEST: &str = "class FooTest {\n  @Test void t2() {}\n}\n";

fn candidate(repo: &TestRepo, previous: &str, diff_base: &str, fix: &str) -> BugCandidate {
    let git = Git::new(repo.path());
    let diff = git.diff(diff_base, fix).expect("diff");
    BugCandidate::new(
        repository("acme/widgets", Language::Java),
        git.commit_info(fix).expect("fix commit"),
        git.commit_info(previous).expect("previous commit"),
        PatchPartition::from_diff(&diff, Language::Java, true),
        BTreeSet::new(),
    )
}

fn executor(runner: &Arc<ScriptedCiRunner>, work: &Path) -> DifferentialExecutor {
    let cache = CachePool::new(&work.join("cache"), 1, OverflowPolicy::Ephemeral).expect("cache");
    let runner: Arc<dyn CiRunner> = Arc::clone(runner) as Arc<dyn CiRunner>;
    DifferentialExecutor::new(
        runner,
        cache,
        FailurePolicyKind::TestOutcomes.build(),
        ExecutionSettings {
            timeout: Duration::from_secs(60),
            offline: true,
            memory_limit: "1g".to_string(),
            output_limit_bytes: 64 * 1024,
        },
        &work.join("scratch"),
    )
    .expect("executor")
}

fn base_repo() -> (TestRepo, String) {
    let repo = TestRepo::new().expect("repo");
    let root = repo
        .commit_files(
            &[
                (".github/workflows/ci.yml", WORKFLOW),
                ("src/main/java/Foo.java", FOO_V1),
            ],
            "add Foo",
        )
        .expect("root commit");
    (repo, root)
}

fn scratch_is_empty(work: &Path) -> bool {
    fs::read_dir(work.join("scratch"))
        .expect("scratch dir")
        .next()
        .is_none()
}

/// Old code passes old tests, fails the added test, fix passes both.
#[test]
fn scenario_pass_pass() {
    let (repo, previous) = base_repo();
    let fix = repo
        .commit_files(
            &[
                ("src/main/java/Foo.java", FOO_V2),
                ("src/test/java/FooTest.java", FOO_TEST),
            ],
            "fix value and add regression test",
        )
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);
    assert_eq!(candidate.change_type(), ChangeType::SourceOnly);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
        ScriptedRun::tests(&[("t1", TestStatus::Passed), ("t2", TestStatus::Failed)]),
        ScriptedRun::tests(&[("t1", TestStatus::Passed), ("t2", TestStatus::Passed)]),
    ]));
    let report = executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    assert_eq!(report.completed, 3);
    assert!(report.aborted.is_none());
    assert_eq!(classify(&candidate, &Strategy::ALL), Some(Strategy::PassPass));

    let observed = runner.observed();
    let heads: Vec<&str> = observed.iter().map(|run| run.head.as_str()).collect();
    assert_eq!(heads, vec![previous.as_str(), previous.as_str(), fix.as_str()]);
    let clean: Vec<bool> = observed.iter().map(|run| run.clean).collect();
    assert_eq!(clean, vec![true, false, true]);

    let pristine = Git::new(repo.path());
    assert_eq!(pristine.head().expect("head"), fix);
    assert!(pristine.is_clean().expect("status"));
    assert!(scratch_is_empty(work.path()));
}

/// No test changes: old code fails, fix passes the same tests.
#[test]
fn scenario_fail_pass() {
    let (repo, previous) = base_repo();
    let fix = repo
        .commit("src/main/java/Foo.java", FOO_V2, "fix off-by-one in value")
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::tests(&[("t1", TestStatus::Failed)]),
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
    ]));
    let report = executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    assert_eq!(report.completed, 2);
    assert!(candidate.checkpoint(1).is_none());
    assert_eq!(classify(&candidate, &Strategy::ALL), Some(Strategy::FailPass));
    assert_eq!(runner.observed().len(), 2);
}

/// A crash without tests at checkpoint 0 is a completed, failed result.
#[test]
fn scenario_fail_pass_build() {
    let (repo, previous) = base_repo();
    let fix = repo
        .commit("src/main/java/Foo.java", FOO_V2, "fix compile error")
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::crash(),
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
    ]));
    executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    let crashed = candidate.checkpoint(0).expect("checkpoint 0 completed");
    assert!(crashed.crashed_without_tests());
    assert_eq!(
        classify(&candidate, &Strategy::ALL),
        Some(Strategy::FailPassBuild)
    );
}

/// The test patch does not apply on the previous commit: the fix is never
/// run and the candidate is unclassifiable.
#[test]
fn scenario_apply_failure_skips_remaining_checkpoints() {
    let repo = TestRepo::new().expect("repo");
    let previous = repo
        .commit_files(
            &[
                (".github/workflows/ci.yml", WORKFLOW),
                ("src/main/java/Foo.java", FOO_V1),
                ("src/test/java/FooTest.java", "v1\n"),
            ],
            "add Foo",
        )
        .expect("root commit");
    let drifted = repo
        .commit("src/test/java/FooTest.java", "v2\n", "rework FooTest")
        .expect("drift commit");
    let fix = repo
        .commit_files(
            &[
                ("src/main/java/Foo.java", FOO_V2),
                ("src/test/java/FooTest.java", "v3\n"),
            ],
            "fix value",
        )
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &drifted, &fix);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
    ]));
    let report = executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    assert_eq!(report.completed, 1);
    let aborted = report.aborted.expect("aborted");
    assert_eq!(aborted.checkpoint, 1);
    match aborted.reason {
        AbortReason::Apply(err) => assert_eq!(err.files, vec!["src/test/java/FooTest.java"]),
        AbortReason::Infra(err) => panic!("expected apply failure, got {err}"),
    }
    assert!(candidate.checkpoint(0).is_some());
    assert!(candidate.checkpoint(1).is_none());
    assert!(candidate.checkpoint(2).is_none());
    assert_eq!(runner.observed().len(), 1);
    assert_eq!(runner.remaining(), 1);
    assert_eq!(classify(&candidate, &Strategy::ALL), None);
}

#[test]
fn timeout_nulls_every_checkpoint() {
    let (repo, previous) = base_repo();
    let fix = repo
        .commit("src/main/java/Foo.java", FOO_V2, "fix hang")
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::Timeout,
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
    ]));
    let report = executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    let aborted = report.aborted.expect("aborted");
    assert_eq!(aborted.checkpoint, 0);
    assert!(matches!(
        aborted.reason,
        AbortReason::Infra(InfraError::Timeout { secs: 60 })
    ));
    assert!(candidate.checkpoints.iter().all(Option::is_none));
    assert_eq!(runner.remaining(), 1);
}

#[test]
fn missing_workflows_abort_before_running() {
    let (repo, previous) = base_repo();
    let fix = repo
        .commit("src/main/java/Foo.java", FOO_V2, "fix value")
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::without_workflows());
    let report = executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    assert!(matches!(
        report.aborted.map(|aborted| aborted.reason),
        Some(AbortReason::Infra(InfraError::NoWorkflows))
    ));
    assert!(runner.observed().is_empty());
}

/// Build changes travel with the old code so it is judged under the new build.
#[test]
fn mixed_candidate_applies_non_code_at_checkpoint_zero() {
    let repo = TestRepo::new().expect("repo");
    let previous = repo
        .commit_files(
            &[
                (".github/workflows/ci.yml", WORKFLOW),
                ("src/main/java/Foo.java", FOO_V1),
                ("pom.xml", "<project>1</project>\n"),
            ],
            "add Foo",
        )
        .expect("root commit");
    let fix = repo
        .commit_files(
            &[
                ("src/main/java/Foo.java", FOO_V2),
                ("pom.xml", "<project>2</project>\n"),
            ],
            "fix value and bump plugin",
        )
        .expect("fix commit");
    let mut candidate = candidate(&repo, &previous, &previous, &fix);
    assert_eq!(candidate.change_type(), ChangeType::Mixed);

    let work = tempfile::tempdir().expect("work");
    let runner = Arc::new(ScriptedCiRunner::new(vec![
        ScriptedRun::tests(&[("t1", TestStatus::Failed)]),
        ScriptedRun::tests(&[("t1", TestStatus::Passed)]),
    ]));
    executor(&runner, work.path())
        .execute(&mut candidate, repo.path())
        .expect("execute");

    let observed = runner.observed();
    assert_eq!(observed[0].head, previous);
    assert!(!observed[0].clean);
    assert!(observed[1].clean);
    assert_eq!(classify(&candidate, &Strategy::ALL), Some(Strategy::FailPass));
}
