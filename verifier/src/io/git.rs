//! Git adapter for mining and checkpoint preparation.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every failure is
//! an [`InfraError`] so the executor can branch on it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::types::CommitInfo;
use crate::error::{ApplyError, InfraError};
use crate::io::process::run_command_with_timeout;

const LOG_FORMAT: &str = "--format=%H%x1f%P%x1f%at%x1f%B%x1e";
const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_OUTPUT_LIMIT: usize = 64 * 1024;

/// Ref namespace pull-request heads are fetched into.
pub const PULL_REQUEST_REFS: &str = "refs/remotes/origin/pr";

static PATCH_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error: patch failed: (.+):\d+$").expect("valid regex"));
static PATH_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^error: (.+?): (?:No such file or directory|does not exist in index|already exists in working directory|patch does not apply)$",
    )
    .expect("valid regex")
});

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest` (full history) and return a handle on it.
    #[instrument(skip_all, fields(url))]
    pub fn clone_into(url: &str, dest: &Path) -> Result<Self, InfraError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let dest_arg = dest.to_string_lossy();
        Git::new(parent).run_checked(&["clone", "--quiet", url, dest_arg.as_ref()])?;
        debug!(dest = %dest.display(), "cloned");
        Ok(Git::new(dest))
    }

    pub fn head(&self) -> Result<String, InfraError> {
        self.resolve("HEAD")
    }

    /// Resolve a revision to a full commit hash.
    pub fn resolve(&self, rev: &str) -> Result<String, InfraError> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    pub fn commit_info(&self, rev: &str) -> Result<CommitInfo, InfraError> {
        let out = self.run_capture(&["log", "-1", LOG_FORMAT, rev])?;
        parse_log(&out)
            .into_iter()
            .next()
            .ok_or_else(|| InfraError::Git {
                command: format!("log -1 {rev}"),
                stderr: "no commit".to_string(),
            })
    }

    /// All commits reachable from `refs`, newest first.
    pub fn commits(&self, refs: &[&str]) -> Result<Vec<CommitInfo>, InfraError> {
        let mut args = vec!["log", LOG_FORMAT];
        args.extend_from_slice(refs);
        args.push("--");
        let out = self.run_capture(&args)?;
        Ok(parse_log(&out))
    }

    /// Unified diff turning `from` into `to`.
    pub fn diff(&self, from: &str, to: &str) -> Result<String, InfraError> {
        self.run_capture(&["diff", "--no-color", "--no-ext-diff", "--binary", from, to])
    }

    /// Fetch open pull-request heads into [`PULL_REQUEST_REFS`].
    pub fn fetch_pull_request_refs(&self) -> Result<(), InfraError> {
        let refspec = format!("+refs/pull/*/head:{PULL_REQUEST_REFS}/*");
        self.run_checked(&["fetch", "--quiet", "origin", &refspec])?;
        Ok(())
    }

    pub fn checkout(&self, commit: &str) -> Result<(), InfraError> {
        self.run_checked(&["checkout", "--quiet", "--force", "--detach", commit])?;
        Ok(())
    }

    pub fn reset_hard(&self, commit: &str) -> Result<(), InfraError> {
        self.run_checked(&["reset", "--quiet", "--hard", commit])?;
        Ok(())
    }

    /// Remove untracked and ignored files.
    pub fn clean_untracked(&self) -> Result<(), InfraError> {
        self.run_checked(&["clean", "-ffdxq"])?;
        Ok(())
    }

    /// Check out `commit` with a pristine tree.
    pub fn restore(&self, commit: &str) -> Result<(), InfraError> {
        self.checkout(commit)?;
        self.reset_hard(commit)?;
        self.clean_untracked()
    }

    /// Apply a unified diff to the working tree.
    #[instrument(skip_all, fields(patch_bytes = patch.len()))]
    pub fn apply(&self, patch: &str) -> Result<(), ApplyError> {
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--whitespace=nowarn", "-"])
            .current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(patch.as_bytes()),
            APPLY_TIMEOUT,
            APPLY_OUTPUT_LIMIT,
        )
        .map_err(|err| ApplyError {
            files: Vec::new(),
            stderr: format!("{err:#}"),
        })?;
        if output.status.success() && !output.timed_out {
            return Ok(());
        }
        let stderr = output.stderr_lossy();
        let files = failed_apply_files(&stderr);
        warn!(files = ?files, "git apply failed");
        Err(ApplyError {
            files,
            stderr: stderr.trim().to_string(),
        })
    }

    /// Paths (relative to the repo root) directly under `dir` at `commit`.
    pub fn list_tree(&self, commit: &str, dir: &str) -> Result<Vec<String>, InfraError> {
        let spec = format!("{}/", dir.trim_end_matches('/'));
        let out = self.run_capture(&["ls-tree", "--name-only", commit, "--", &spec])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Contents of `path` at `commit`.
    pub fn show_file(&self, commit: &str, path: &str) -> Result<String, InfraError> {
        self.run_capture(&["show", &format!("{commit}:{path}")])
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, InfraError> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_status_line)
            .collect())
    }

    pub fn is_clean(&self) -> Result<bool, InfraError> {
        Ok(self.status_porcelain()?.is_empty())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, InfraError> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, InfraError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| InfraError::Spawn {
                program: format!("git {}", args.join(" ")),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(InfraError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn parse_log(out: &str) -> Vec<CommitInfo> {
    out.split('\x1e')
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            if record.trim().is_empty() {
                return None;
            }
            let mut fields = record.splitn(4, '\x1f');
            let hash = fields.next()?.trim().to_string();
            let parents = fields
                .next()?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            let timestamp = fields.next()?.trim().parse::<i64>().ok()?;
            let message = fields.next().unwrap_or_default().trim_end().to_string();
            Some(CommitInfo {
                hash,
                message,
                timestamp: DateTime::<Utc>::from_timestamp(timestamp, 0)?,
                parents,
            })
        })
        .collect()
}

fn failed_apply_files(stderr: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in stderr.lines() {
        let line = line.trim();
        let captured = PATCH_FAILED
            .captures(line)
            .or_else(|| PATH_ERROR.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        if let Some(file) = captured
            && !files.contains(&file)
        {
            files.push(file);
        }
    }
    files
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return None;
    }
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Some(StatusEntry {
        code: line[..2].to_string(),
        path,
    })
}
