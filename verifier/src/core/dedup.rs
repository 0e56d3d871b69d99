//! Merge-noise pruning and identity deduplication of mined candidates.

use std::collections::{BTreeMap, HashSet};

use crate::core::candidate::BugCandidate;

/// Commit-message prefix of merge commits.
pub const MERGE_MARKER: &str = "Merge ";

/// Drop merge commits that share their previous commit with another candidate.
///
/// A lone merge candidate is kept: it is the only representative of its
/// previous commit.
pub fn prune_merge_duplicates(candidates: Vec<BugCandidate>) -> Vec<BugCandidate> {
    let mut groups: BTreeMap<String, Vec<BugCandidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.previous.hash.clone())
            .or_default()
            .push(candidate);
    }

    let mut kept = Vec::new();
    for (_, group) in groups {
        if group.len() > 1 {
            kept.extend(
                group
                    .into_iter()
                    .filter(|candidate| !candidate.commit.message.starts_with(MERGE_MARKER)),
            );
        } else {
            kept.extend(group);
        }
    }
    kept
}

/// Sort by commit timestamp and keep the earliest candidate of each identity class.
///
/// The result stays sorted ascending by timestamp. Ties keep their input order.
pub fn deduplicate(mut candidates: Vec<BugCandidate>) -> Vec<BugCandidate> {
    candidates.sort_by_key(|candidate| candidate.commit.timestamp);

    let keep: Vec<bool> = {
        let mut seen = HashSet::with_capacity(candidates.len());
        candidates
            .iter()
            .map(|candidate| seen.insert(candidate))
            .collect()
    };

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(candidate, first)| first.then_some(candidate))
        .collect()
}

/// Full post-mining cleanup: merge pruning, then deduplication.
pub fn prune_and_deduplicate(candidates: Vec<BugCandidate>) -> Vec<BugCandidate> {
    deduplicate(prune_merge_duplicates(candidates))
}
