//! CI-runner collaborator.
//!
//! The [`CiRunner`] trait decouples differential execution from the external
//! tool that instruments and runs a repository's workflows in a container.
//! Tests use a scripted runner that returns predetermined reports without
//! spawning processes.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::failure::RunReport;
use crate::core::types::{Language, TestCase};
use crate::error::InfraError;
use crate::io::process::run_command_with_timeout;

/// Directory holding workflow definitions, relative to the repository root.
pub const WORKFLOW_DIR: &str = ".github/workflows";

static USES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[\s-]*uses:\s*["']?([A-Za-z0-9_.-]+/[A-Za-z0-9_./-]+@[A-Za-z0-9_./-]+)"#)
        .expect("valid regex")
});

/// Build tools and the workflow keywords that vote for them.
const BUILD_TOOLS: &[(&str, &[&str])] = &[
    ("maven", &["mvn ", "mvnw", "maven"]),
    ("gradle", &["gradle", "gradlew"]),
    ("pytest", &["pytest", "py.test"]),
    ("tox", &["tox "]),
    ("npm", &["npm test", "npm run test", "yarn test", "pnpm test"]),
    ("cargo", &["cargo test", "cargo nextest"]),
    ("go", &["go test"]),
    ("rspec", &["rspec", "rake test"]),
    ("dotnet", &["dotnet test"]),
    ("ctest", &["ctest", "make test", "make check"]),
];

/// A test-capable workflow of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDescriptor {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// File name, recorded as the run's `workflow`.
    pub name: String,
    pub build_tool: String,
}

/// Parameters for one workflow execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Checked-out working tree to run in.
    pub workdir: PathBuf,
    pub workflow: WorkflowDescriptor,
    /// Exclusively leased cache directory.
    pub cache_dir: PathBuf,
    /// Where the runner must write its JSON test report.
    pub report_path: PathBuf,
    pub timeout: Duration,
    pub offline: bool,
    pub memory_limit: String,
    pub output_limit_bytes: usize,
}

/// Abstraction over CI-runner backends.
pub trait CiRunner: Send + Sync {
    /// Test-capable workflows of the working tree at `repo`. May be empty.
    fn workflows(&self, repo: &Path, language: Language)
    -> Result<Vec<WorkflowDescriptor>, InfraError>;

    /// Execute one workflow. A completed process is `Ok` whatever its exit
    /// code; only a run that could not be carried out is an error.
    fn run(&self, request: &RunRequest) -> Result<RunReport, InfraError>;

    /// Pre-download CI-action dependencies into the cache.
    fn warm_actions(&self, _actions: &BTreeSet<String>, _cache_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Container image whose exited containers should be reaped.
    fn image(&self) -> Option<String> {
        None
    }
}

/// Runner that shells out to the configured CI-runner command.
#[derive(Debug, Clone)]
pub struct CommandCiRunner {
    command: Vec<String>,
    image: Option<String>,
}

impl CommandCiRunner {
    pub fn new(command: Vec<String>, image: Option<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("runner command must not be empty"));
        }
        Ok(Self { command, image })
    }

    fn base_command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).arg(subcommand);
        cmd
    }
}

impl CiRunner for CommandCiRunner {
    fn workflows(
        &self,
        repo: &Path,
        language: Language,
    ) -> Result<Vec<WorkflowDescriptor>, InfraError> {
        discover_workflows(repo, language)
    }

    #[instrument(skip_all, fields(workflow = %request.workflow.name, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &RunRequest) -> Result<RunReport, InfraError> {
        if let Some(parent) = request.report_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if request.report_path.exists() {
            fs::remove_file(&request.report_path)?;
        }

        let mut cmd = self.base_command("run");
        cmd.arg("--workflow")
            .arg(request.workdir.join(&request.workflow.path))
            .arg("--build-tool")
            .arg(&request.workflow.build_tool)
            .arg("--cache-dir")
            .arg(&request.cache_dir)
            .arg("--report")
            .arg(&request.report_path)
            .arg("--memory-limit")
            .arg(&request.memory_limit)
            .current_dir(&request.workdir);
        if request.offline {
            cmd.arg("--offline");
        }

        info!(workdir = %request.workdir.display(), "starting ci runner");
        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .map_err(|err| InfraError::Spawn {
                program: self.command[0].clone(),
                reason: format!("{err:#}"),
            })?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "ci runner timed out");
            return Err(InfraError::Timeout {
                secs: request.timeout.as_secs(),
            });
        }

        let tests = read_report(&request.report_path)?;
        debug!(
            exit_code = ?output.status.code(),
            tests = tests.len(),
            "ci runner finished"
        );
        Ok(RunReport {
            workflow: request.workflow.name.clone(),
            build_tool: request.workflow.build_tool.clone(),
            tests,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            return_code: output.status.code(),
            elapsed: output.elapsed,
        })
    }

    #[instrument(skip_all, fields(actions = actions.len()))]
    fn warm_actions(&self, actions: &BTreeSet<String>, cache_dir: &Path) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let mut cmd = self.base_command("warm");
        cmd.arg("--cache-dir").arg(cache_dir);
        for action in actions {
            cmd.arg("--action").arg(action);
        }
        let output = run_command_with_timeout(cmd, None, Duration::from_secs(30 * 60), 64 * 1024)
            .context("run ci runner warm")?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!(
                "ci runner warm failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        info!("action cache warmed");
        Ok(())
    }

    fn image(&self) -> Option<String> {
        self.image.clone()
    }
}

/// Missing report means the run produced no parsed tests.
fn read_report(path: &Path) -> Result<Vec<TestCase>, InfraError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw)
        .map_err(|err| InfraError::Runner(format!("parse report {}: {err}", path.display())))
}

/// Scan `.github/workflows` for test-capable workflow files.
pub fn discover_workflows(
    repo: &Path,
    language: Language,
) -> Result<Vec<WorkflowDescriptor>, InfraError> {
    let dir = repo.join(WORKFLOW_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<_, _>>()?;
    paths.sort();

    let mut workflows = Vec::new();
    for path in paths {
        if !is_workflow_file(&path) {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        let Some(build_tool) = detect_build_tool(&text, language) else {
            debug!(path = %path.display(), "workflow has no test step");
            continue;
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        workflows.push(WorkflowDescriptor {
            path: Path::new(WORKFLOW_DIR).join(&name),
            name,
            build_tool: build_tool.to_string(),
        });
    }
    Ok(workflows)
}

pub fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml" | "yaml")
    )
}

/// Highest keyword score wins; tools native to `language` win ties.
pub fn detect_build_tool(workflow: &str, language: Language) -> Option<&'static str> {
    let text = workflow.to_ascii_lowercase();
    BUILD_TOOLS
        .iter()
        .map(|(tool, keywords)| {
            let score: usize = keywords
                .iter()
                .map(|keyword| text.matches(keyword).count())
                .sum();
            let native = usize::from(score > 0 && native_tool(language) == Some(*tool));
            (*tool, score * 2 + native)
        })
        .filter(|(_, score)| *score > 0)
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(tool, _)| tool)
}

fn native_tool(language: Language) -> Option<&'static str> {
    match language {
        Language::Java | Language::Kotlin => Some("maven"),
        Language::Python => Some("pytest"),
        Language::JavaScript | Language::TypeScript => Some("npm"),
        Language::Rust => Some("cargo"),
        Language::Go => Some("go"),
        Language::Ruby => Some("rspec"),
        Language::CSharp => Some("dotnet"),
        Language::C | Language::Cpp => Some("ctest"),
        Language::Unknown => None,
    }
}

/// Remote action references (`owner/name@ref`) used by a workflow file.
/// Local (`./`) and `docker://` actions are not dependencies to pre-fetch.
pub fn workflow_actions(workflow: &str) -> BTreeSet<String> {
    USES.captures_iter(workflow)
        .filter_map(|caps| caps.get(1))
        .map(|found| found.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAVEN_WORKFLOW: &str = "\
name: CI
on: [push]
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: actions/setup-java@v4
        with:
          java-version: 17
      - uses: ./local-action
      - uses: docker://alpine:3
      - run: mvn -B test
";

    #[test]
    fn collects_remote_actions_only() {
        let actions = workflow_actions(MAVEN_WORKFLOW);
        assert_eq!(
            actions.into_iter().collect::<Vec<_>>(),
            vec!["actions/checkout@v4", "actions/setup-java@v4"]
        );
    }

    #[test]
    fn detects_build_tool_by_keywords() {
        assert_eq!(detect_build_tool(MAVEN_WORKFLOW, Language::Java), Some("maven"));
        assert_eq!(
            detect_build_tool("steps:\n  - run: cargo test --all\n", Language::Rust),
            Some("cargo")
        );
        assert_eq!(detect_build_tool("steps:\n  - run: echo hi\n", Language::Java), None);
    }

    #[test]
    fn discovers_only_test_capable_workflows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(WORKFLOW_DIR);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("ci.yml"), MAVEN_WORKFLOW).expect("write");
        fs::write(dir.join("lint.yaml"), "steps:\n  - run: echo lint\n").expect("write");
        fs::write(dir.join("README.md"), "mvn test").expect("write");

        let workflows = discover_workflows(temp.path(), Language::Java).expect("discover");
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].name, "ci.yml");
        assert_eq!(workflows[0].build_tool, "maven");
        assert_eq!(workflows[0].path, Path::new(".github/workflows/ci.yml"));
    }

    #[test]
    fn missing_workflow_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            discover_workflows(temp.path(), Language::Java)
                .expect("discover")
                .is_empty()
        );
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-runner.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn request(temp: &Path, timeout: Duration) -> RunRequest {
        RunRequest {
            workdir: temp.to_path_buf(),
            workflow: WorkflowDescriptor {
                path: PathBuf::from(".github/workflows/ci.yml"),
                name: "ci.yml".to_string(),
                build_tool: "maven".to_string(),
            },
            cache_dir: temp.join("cache"),
            report_path: temp.join("reports/report.json"),
            timeout,
            offline: true,
            memory_limit: "1g".to_string(),
            output_limit_bytes: 4096,
        }
    }

    #[test]
    fn command_runner_reads_report_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        // $1 = run; the report path follows --report.
        let script = write_script(
            temp.path(),
            r#"while [ "$#" -gt 0 ]; do
  if [ "$1" = "--report" ]; then
    printf '[{"classname":"Suite","name":"t1","results":[{"result":"failed"}]}]' > "$2"
  fi
  shift
done
echo ran
exit 1"#,
        );
        let runner =
            CommandCiRunner::new(vec![script.display().to_string()], None).expect("runner");
        let report = runner
            .run(&request(temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert_eq!(report.return_code, Some(1));
        assert_eq!(report.tests.len(), 1);
        assert!(report.has_failing_tests());
        assert!(report.stdout.contains("ran"));
    }

    #[test]
    fn command_runner_without_report_has_no_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(temp.path(), "exit 2");
        let runner =
            CommandCiRunner::new(vec![script.display().to_string()], None).expect("runner");
        let report = runner
            .run(&request(temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert!(report.tests.is_empty());
        assert_eq!(report.return_code, Some(2));
    }

    #[test]
    fn command_runner_timeout_is_infra_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(temp.path(), "exec sleep 5");
        let runner =
            CommandCiRunner::new(vec![script.display().to_string()], None).expect("runner");
        let err = runner
            .run(&request(temp.path(), Duration::from_millis(200)))
            .expect_err("timeout");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandCiRunner::new(
            vec![temp.path().join("does-not-exist").display().to_string()],
            None,
        )
        .expect("runner");
        let err = runner
            .run(&request(temp.path(), Duration::from_secs(1)))
            .expect_err("spawn");
        assert_eq!(err.kind(), "spawn");
    }
}
