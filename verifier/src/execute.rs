//! Differential Test Executor.
//!
//! Drives a private copy of the pristine clone through three checkpoints:
//!
//! 0. previous commit as-is,
//! 1. previous commit plus the test partition (only with test changes),
//! 2. fixing commit as-is.
//!
//! The first checkpoint that cannot complete leaves its slot and every later
//! slot `None`.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::candidate::BugCandidate;
use crate::core::failure::FailurePolicy;
use crate::core::partition::{PatchPartition, render};
use crate::core::types::{ExecutionResult, Language};
use crate::error::{ApplyError, InfraError};
use crate::io::cache_pool::{CachePool, generate_short_id};
use crate::io::ci_runner::{CiRunner, RunRequest};
use crate::io::config::VerifierConfig;
use crate::io::git::Git;

/// Per-invocation runner settings.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub timeout: Duration,
    pub offline: bool,
    pub memory_limit: String,
    pub output_limit_bytes: usize,
}

impl ExecutionSettings {
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.run_timeout_secs),
            offline: config.offline,
            memory_limit: config.memory_limit.clone(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

/// Why a candidate's remaining checkpoints were skipped.
#[derive(Debug)]
pub enum AbortReason {
    Infra(InfraError),
    Apply(ApplyError),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infra(err) => write!(f, "{err}"),
            Self::Apply(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug)]
pub struct Aborted {
    pub checkpoint: usize,
    pub reason: AbortReason,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Checkpoints that produced a result.
    pub completed: usize,
    pub aborted: Option<Aborted>,
}

pub struct DifferentialExecutor {
    runner: Arc<dyn CiRunner>,
    cache: Arc<CachePool>,
    policy: Box<dyn FailurePolicy>,
    settings: ExecutionSettings,
    scratch_root: PathBuf,
}

impl DifferentialExecutor {
    pub fn new(
        runner: Arc<dyn CiRunner>,
        cache: Arc<CachePool>,
        policy: Box<dyn FailurePolicy>,
        settings: ExecutionSettings,
        scratch_root: &Path,
    ) -> Result<Self> {
        fs::create_dir_all(scratch_root)
            .with_context(|| format!("create scratch root {}", scratch_root.display()))?;
        Ok(Self {
            runner,
            cache,
            policy,
            settings,
            scratch_root: scratch_root.to_path_buf(),
        })
    }

    pub fn runner(&self) -> &Arc<dyn CiRunner> {
        &self.runner
    }

    /// Fill `candidate.checkpoints` from a private copy of `pristine`.
    ///
    /// Checkpoint aborts are reported, not returned as errors; `Err` means the
    /// private copy could not be prepared at all.
    #[instrument(skip_all, fields(repo = %candidate.repository.full_name, commit = %candidate.commit.short_hash()))]
    pub fn execute(&self, candidate: &mut BugCandidate, pristine: &Path) -> Result<ExecutionReport> {
        let scratch = ScratchDir::create(
            &self.scratch_root,
            &format!("{}-{}", candidate.repository.slug(), candidate.commit.short_hash()),
        )?;
        let workdir = scratch.path().join("repo");
        copy_dir_recursive(pristine, &workdir)?;
        let git = Git::new(&workdir);

        let run = CheckpointRun {
            executor: self,
            git: &git,
            language: candidate.repository.language,
            reports: scratch.path().join("reports"),
        };
        let mut report = ExecutionReport::default();
        for (checkpoint, step) in plan(candidate.patches()).into_iter().enumerate() {
            let Some(step) = step else {
                continue;
            };
            let revision = match step.base {
                Base::Previous => candidate.previous.hash.clone(),
                Base::Fix => candidate.commit.hash.clone(),
            };
            match run.checkpoint(checkpoint, &revision, &step.patches) {
                Ok(result) => {
                    candidate.checkpoints[checkpoint] = Some(result);
                    report.completed += 1;
                }
                Err(reason) => {
                    log_abort(checkpoint, &reason);
                    report.aborted = Some(Aborted { checkpoint, reason });
                    break;
                }
            }
        }
        Ok(report)
    }
}

fn log_abort(checkpoint: usize, reason: &AbortReason) {
    match reason {
        AbortReason::Infra(InfraError::Timeout { secs }) => {
            warn!(checkpoint, kind = "timeout", secs, "checkpoint timed out, aborting");
        }
        AbortReason::Infra(err) => {
            warn!(checkpoint, kind = err.kind(), error = %err, "checkpoint infra failure, aborting");
        }
        AbortReason::Apply(err) => {
            info!(checkpoint, files = ?err.files, "patch did not apply, aborting");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Base {
    Previous,
    Fix,
}

/// One checkpoint: which commit to restore and which patches to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    base: Base,
    patches: Vec<String>,
}

/// Checkpoint steps for a candidate; `None` where a checkpoint is skipped.
///
/// The non-code partition is applied on the previous commit only when the
/// source partition is non-empty as well, so a non-code-only candidate sees
/// its non-code changes at checkpoint 2 alone.
fn plan(patches: &PatchPartition) -> [Option<Step>; 3] {
    let mut base_patches = Vec::new();
    if !patches.source.is_empty() && !patches.non_code.is_empty() {
        base_patches.push(render(&patches.non_code));
    }

    let first = Step {
        base: Base::Previous,
        patches: base_patches.clone(),
    };
    let second = (!patches.test.is_empty()).then(|| {
        let mut with_tests = base_patches;
        with_tests.push(render(&patches.test));
        Step {
            base: Base::Previous,
            patches: with_tests,
        }
    });
    let third = Step {
        base: Base::Fix,
        patches: Vec::new(),
    };
    [Some(first), second, Some(third)]
}

struct CheckpointRun<'a> {
    executor: &'a DifferentialExecutor,
    git: &'a Git,
    language: Language,
    reports: PathBuf,
}

impl CheckpointRun<'_> {
    fn checkpoint(
        &self,
        index: usize,
        revision: &str,
        patches: &[String],
    ) -> Result<ExecutionResult, AbortReason> {
        debug!(checkpoint = index, revision, patches = patches.len(), "checkpoint start");
        self.git.restore(revision).map_err(AbortReason::Infra)?;
        for patch in patches {
            self.git.apply(patch).map_err(AbortReason::Apply)?;
        }
        self.run_workflows(index).map_err(AbortReason::Infra)
    }

    /// Run every test workflow, each under its own cache lease.
    fn run_workflows(&self, index: usize) -> Result<ExecutionResult, InfraError> {
        let executor = self.executor;
        let workdir = self.git.workdir();
        let workflows = executor.runner.workflows(workdir, self.language)?;
        if workflows.is_empty() {
            return Err(InfraError::NoWorkflows);
        }

        let mut runs = Vec::with_capacity(workflows.len());
        for (number, workflow) in workflows.into_iter().enumerate() {
            let lease = executor
                .cache
                .acquire()
                .map_err(|err| InfraError::Runner(format!("{err:#}")))?;
            let request = RunRequest {
                workdir: workdir.to_path_buf(),
                workflow,
                cache_dir: lease.path().to_path_buf(),
                report_path: self.reports.join(format!("checkpoint-{index}-{number}.json")),
                timeout: executor.settings.timeout,
                offline: executor.settings.offline,
                memory_limit: executor.settings.memory_limit.clone(),
                output_limit_bytes: executor.settings.output_limit_bytes,
            };
            let report = executor.runner.run(&request)?;
            drop(lease);

            let failed = executor.policy.is_failed(&report);
            debug!(
                checkpoint = index,
                workflow = %report.workflow,
                tests = report.tests.len(),
                failed,
                "workflow finished"
            );
            runs.push(report.into_workflow_run(failed));
        }
        Ok(ExecutionResult::new(runs))
    }
}

/// Per-candidate directory under the scratch root; removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(root: &Path, label: &str) -> Result<Self> {
        loop {
            let path = root.join(format!("{label}-{}", generate_short_id()));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("create scratch {}", path.display()));
                }
            }
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
        }
    }
}

/// Copy a directory tree, preserving symlinks as links.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(anyhow!("missing {}", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_symlink() {
            let link = fs::read_link(&path).with_context(|| format!("readlink {}", path.display()))?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("symlink {}", target.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Language;

    const MIXED: &str = "\
diff --git a/src/Foo.java b/src/Foo.java
--- a/src/Foo.java
+++ b/src/Foo.java
@@ -1 +1 @@
-a
+b
diff --git a/pom.xml b/pom.xml
--- a/pom.xml
+++ b/pom.xml
@@ -1 +1 @@
-<v>1</v>
+<v>2</v>
diff --git a/src/test/java/FooTest.java b/src/test/java/FooTest.java
--- a/src/test/java/FooTest.java
+++ b/src/test/java/FooTest.java
@@ -1 +1,2 @@
 x
+y
";

    const NON_CODE_ONLY: &str = "\
diff --git a/pom.xml b/pom.xml
--- a/pom.xml
+++ b/pom.xml
@@ -1 +1 @@
-<v>1</v>
+<v>2</v>
";

    #[test]
    fn mixed_candidate_applies_non_code_before_tests() {
        let patches = PatchPartition::from_diff(MIXED, Language::Java, true);
        let [first, second, third] = plan(&patches);
        let first = first.expect("checkpoint 0");
        assert_eq!(first.base, Base::Previous);
        assert_eq!(first.patches, vec![render(&patches.non_code)]);
        let second = second.expect("checkpoint 1");
        assert_eq!(
            second.patches,
            vec![render(&patches.non_code), render(&patches.test)]
        );
        let third = third.expect("checkpoint 2");
        assert_eq!(third.base, Base::Fix);
        assert!(third.patches.is_empty());
    }

    #[test]
    fn non_code_only_candidate_withholds_non_code_changes() {
        let patches = PatchPartition::from_diff(NON_CODE_ONLY, Language::Java, true);
        let [first, second, _] = plan(&patches);
        assert!(first.expect("checkpoint 0").patches.is_empty());
        assert!(second.is_none());
    }

    #[test]
    fn copies_tree_with_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).expect("mkdir");
        fs::write(src.join("nested/file.txt"), "hello").expect("write");
        std::os::unix::fs::symlink("nested/file.txt", src.join("link")).expect("symlink");

        let dst = temp.path().join("dst");
        copy_dir_recursive(&src, &dst).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("nested/file.txt")).expect("read"), "hello");
        assert!(
            fs::symlink_metadata(dst.join("link"))
                .expect("meta")
                .file_type()
                .is_symlink()
        );
        assert_eq!(fs::read_to_string(dst.join("link")).expect("read"), "hello");
    }
}
