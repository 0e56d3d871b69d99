//! Candidate Miner: walk a repository's history and build Bug Candidates.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::candidate::BugCandidate;
use crate::core::dedup::prune_and_deduplicate;
use crate::core::message_filter::MessageFilter;
use crate::core::partition::PatchPartition;
use crate::core::types::{CommitInfo, Repository};
use crate::io::ci_runner::{WORKFLOW_DIR, is_workflow_file, workflow_actions};
use crate::io::clone_gate::CloneGate;
use crate::io::config::MiningConfig;
use crate::io::git::{Git, PULL_REQUEST_REFS};

/// Which commits become candidates.
#[derive(Debug, Clone, Default)]
pub struct MineFilters {
    /// `None` disables the message filter.
    pub message_filter: Option<MessageFilter>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub include_pull_requests: bool,
    pub normalize_non_code: bool,
}

impl MineFilters {
    pub fn from_config(config: &MiningConfig) -> Self {
        Self {
            message_filter: config
                .message_filter
                .then(|| MessageFilter::new(&config.keywords)),
            since: config.since,
            until: config.until,
            include_pull_requests: config.include_pull_requests,
            normalize_non_code: config.normalize_non_code,
        }
    }

    /// Message and time-window checks. Parent resolution happens later.
    pub fn keeps(&self, commit: &CommitInfo) -> bool {
        if let Some(filter) = &self.message_filter
            && !filter.matches(&commit.message)
        {
            return false;
        }
        if self.since.is_some_and(|since| commit.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| commit.timestamp > until) {
            return false;
        }
        true
    }
}

/// Mined candidates of one repository.
#[derive(Debug, Default)]
pub struct MineOutcome {
    /// Merge-pruned, deduplicated, ascending by commit timestamp.
    pub candidates: Vec<BugCandidate>,
    /// Commits walked, before filtering.
    pub total_commits: usize,
}

/// Clone under the gate, retrying network failures up to `attempts` times.
#[instrument(skip_all, fields(repo = %repository.full_name))]
pub fn clone_repository(
    repository: &Repository,
    dest: &Path,
    gate: &Arc<CloneGate>,
    attempts: u32,
) -> Result<Git> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        let _permit = gate.acquire();
        match Git::clone_into(&repository.clone_url, dest) {
            Ok(git) => {
                info!(attempt, "repository cloned");
                return Ok(git);
            }
            Err(err) => {
                warn!(attempt, error = %err, "clone failed");
                if dest.exists() {
                    fs::remove_dir_all(dest)
                        .with_context(|| format!("remove partial clone {}", dest.display()))?;
                }
                last_error = Some(err);
            }
        }
    }
    let err = last_error.map_or_else(|| anyhow!("clone never attempted"), anyhow::Error::from);
    Err(err.context(format!(
        "clone {} after {attempts} attempts",
        repository.clone_url
    )))
}

/// Walk history reachable from HEAD (and pull-request heads when enabled)
/// and build candidates.
#[instrument(skip_all, fields(repo = %repository.full_name))]
pub fn mine_repository(
    git: &Git,
    repository: &Repository,
    filters: &MineFilters,
) -> Result<MineOutcome> {
    let head = git.head().context("resolve HEAD")?;
    let mut refs = vec![head.clone()];
    if filters.include_pull_requests {
        match git.fetch_pull_request_refs() {
            Ok(()) => refs.push(format!("--glob={PULL_REQUEST_REFS}/*")),
            Err(err) => warn!(error = %err, "could not fetch pull request refs"),
        }
    }
    let ref_args: Vec<&str> = refs.iter().map(String::as_str).collect();
    let commits = git.commits(&ref_args).context("walk commits")?;
    let total_commits = commits.len();

    let mut candidates = Vec::new();
    for commit in &commits {
        if !filters.keeps(commit) {
            continue;
        }
        if let Some(candidate) = candidate_for(git, repository, commit, filters) {
            candidates.push(candidate);
        }
        git.reset_hard(&head).context("reset to original head")?;
        git.clean_untracked().context("clean untracked files")?;
    }

    let mined = candidates.len();
    let candidates = prune_and_deduplicate(candidates);
    info!(
        commits = total_commits,
        mined,
        kept = candidates.len(),
        "repository mined"
    );
    Ok(MineOutcome {
        candidates,
        total_commits,
    })
}

/// `None` when the commit is skipped: root commit, unresolvable parent,
/// failed diff, or a change that only touches tests.
fn candidate_for(
    git: &Git,
    repository: &Repository,
    commit: &CommitInfo,
    filters: &MineFilters,
) -> Option<BugCandidate> {
    let Some(parent) = commit.first_parent() else {
        debug!(commit = %commit.short_hash(), "root commit skipped");
        return None;
    };
    let previous = match git.commit_info(parent) {
        Ok(previous) => previous,
        Err(err) => {
            warn!(commit = %commit.short_hash(), error = %err, "parent unresolvable, skipped");
            return None;
        }
    };
    let diff = match git.diff(&previous.hash, &commit.hash) {
        Ok(diff) => diff,
        Err(err) => {
            warn!(commit = %commit.short_hash(), error = %err, "diff failed, skipped");
            return None;
        }
    };

    let patches = PatchPartition::from_diff(&diff, repository.language, filters.normalize_non_code);
    if patches.is_test_only() {
        debug!(commit = %commit.short_hash(), "test-only change skipped");
        return None;
    }

    let mut actions = workflow_actions_at(git, &previous.hash);
    actions.extend(workflow_actions_at(git, &commit.hash));
    Some(BugCandidate::new(
        repository.clone(),
        commit.clone(),
        previous,
        patches,
        actions,
    ))
}

/// Remote actions referenced by the workflow files at `commit`.
fn workflow_actions_at(git: &Git, commit: &str) -> BTreeSet<String> {
    let files = match git.list_tree(commit, WORKFLOW_DIR) {
        Ok(files) => files,
        Err(err) => {
            debug!(commit, error = %err, "no workflow listing");
            return BTreeSet::new();
        }
    };
    let mut actions = BTreeSet::new();
    for file in files.iter().filter(|file| is_workflow_file(Path::new(file))) {
        match git.show_file(commit, file) {
            Ok(text) => actions.extend(workflow_actions(&text)),
            Err(err) => debug!(commit, file = %file, error = %err, "workflow unreadable"),
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::commit_at;

    #[test]
    fn filters_on_message_and_window() {
        let filters = MineFilters {
            message_filter: Some(MessageFilter::default()),
            since: DateTime::<Utc>::from_timestamp(100, 0),
            until: DateTime::<Utc>::from_timestamp(200, 0),
            ..MineFilters::default()
        };
        assert!(filters.keeps(&commit_at("a", "Fixed crash", 150, &["p"])));
        assert!(!filters.keeps(&commit_at("b", "Add feature", 150, &["p"])));
        assert!(!filters.keeps(&commit_at("c", "fix crash", 50, &["p"])));
        assert!(!filters.keeps(&commit_at("d", "fix crash", 250, &["p"])));
    }

    #[test]
    fn disabled_message_filter_keeps_everything() {
        let filters = MineFilters::from_config(&MiningConfig {
            message_filter: false,
            ..MiningConfig::default()
        });
        assert!(filters.keeps(&commit_at("b", "Add feature", 150, &["p"])));
    }
}
