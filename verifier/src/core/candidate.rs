//! The Bug Candidate aggregate and its persisted record shape.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::partition::{PatchPartition, extensions, render, strip_index_lines};
use crate::core::strategy::Strategy;
use crate::core::types::{ChangeType, CommitInfo, ExecutionResult, IssueRecord, Repository};

/// Label of a candidate that has not been classified.
pub const UNKNOWN_STRATEGY: &str = "unknown";

/// Number of checkpoints executed per candidate.
pub const CHECKPOINTS: usize = 3;

/// Patch texts with `index` lines stripped; the candidate's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatchIdentity {
    source: String,
    test: String,
    non_code: String,
}

impl PatchIdentity {
    fn of(patches: &PatchPartition) -> Self {
        Self {
            source: strip_index_lines(&render(&patches.source)),
            test: strip_index_lines(&render(&patches.test)),
            non_code: strip_index_lines(&render(&patches.non_code)),
        }
    }
}

/// A fixing commit paired with its parent, pending or completed verification.
///
/// Equality and hashing only consider the three patch partitions (with
/// `index` lines stripped), so textually identical fixes from different
/// commits collapse under deduplication.
#[derive(Debug, Clone)]
pub struct BugCandidate {
    pub repository: Repository,
    pub commit: CommitInfo,
    pub previous: CommitInfo,
    /// CI-action dependencies referenced by either commit's workflows.
    pub actions: BTreeSet<String>,
    pub strategy: Option<Strategy>,
    pub issues: Option<Vec<IssueRecord>>,
    pub checkpoints: [Option<ExecutionResult>; CHECKPOINTS],
    patches: PatchPartition,
    change_type: ChangeType,
    identity: PatchIdentity,
}

impl BugCandidate {
    pub fn new(
        repository: Repository,
        commit: CommitInfo,
        previous: CommitInfo,
        patches: PatchPartition,
        actions: BTreeSet<String>,
    ) -> Self {
        let change_type = patches.change_type();
        let identity = PatchIdentity::of(&patches);
        Self {
            repository,
            commit,
            previous,
            actions,
            strategy: None,
            issues: None,
            checkpoints: [None, None, None],
            patches,
            change_type,
            identity,
        }
    }

    pub fn patches(&self) -> &PatchPartition {
        &self.patches
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn checkpoint(&self, index: usize) -> Option<&ExecutionResult> {
        self.checkpoints.get(index).and_then(Option::as_ref)
    }

    /// Hex SHA-256 over the identity texts; stable across commits.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identity.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.identity.test.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.identity.non_code.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.map_or(UNKNOWN_STRATEGY, Strategy::name)
    }

    /// Build the persisted JSON record.
    pub fn to_record(&self) -> CandidateRecord {
        CandidateRecord {
            repository: self.repository.full_name.clone(),
            clone_url: self.repository.clone_url.clone(),
            commit_hash: self.commit.hash.clone(),
            commit_message: self.commit.message.clone(),
            commit_timestamp: self.commit.timestamp,
            previous_commit_hash: self.previous.hash.clone(),
            previous_commit_message: self.previous.message.clone(),
            previous_commit_timestamp: self.previous.timestamp,
            time_to_patch: (self.commit.timestamp - self.previous.timestamp).num_seconds(),
            bug_patch: render(&self.patches.source),
            bug_patch_file_extensions: extensions(&self.patches.source),
            test_patch: render(&self.patches.test),
            test_patch_file_extensions: extensions(&self.patches.test),
            non_code_patch: render(&self.patches.non_code),
            non_code_patch_file_extensions: extensions(&self.patches.non_code),
            change_type: self.change_type,
            actions_runs: self.checkpoints.clone(),
            strategy: self.strategy_name().to_string(),
            issues: self.issues.clone(),
        }
    }
}

impl PartialEq for BugCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for BugCandidate {}

impl Hash for BugCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

/// One line of a per-repository output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub repository: String,
    pub clone_url: String,
    pub commit_hash: String,
    pub commit_message: String,
    pub commit_timestamp: DateTime<Utc>,
    pub previous_commit_hash: String,
    pub previous_commit_message: String,
    pub previous_commit_timestamp: DateTime<Utc>,
    /// Seconds between the previous commit and the fix.
    pub time_to_patch: i64,
    pub bug_patch: String,
    pub bug_patch_file_extensions: BTreeSet<String>,
    pub test_patch: String,
    pub test_patch_file_extensions: BTreeSet<String>,
    pub non_code_patch: String,
    pub non_code_patch_file_extensions: BTreeSet<String>,
    pub change_type: ChangeType,
    pub actions_runs: [Option<ExecutionResult>; CHECKPOINTS],
    pub strategy: String,
    pub issues: Option<Vec<IssueRecord>>,
}
