//! Output directory: one JSONL file of accepted candidates per repository
//! plus a run summary.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::candidate::{BugCandidate, CandidateRecord};
use crate::core::types::Repository;

pub const SUMMARY_FILE: &str = "summary.json";
pub const RECORD_EXTENSION: &str = "jsonl";

/// Per-repository counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    /// Commits walked while mining.
    pub commits: usize,
    pub accepted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositorySummary>,
    /// Candidates left after merge pruning and deduplication.
    #[serde(default)]
    pub candidates: usize,
    #[serde(default)]
    pub accepted: usize,
    /// Executed candidates no enabled strategy matched.
    #[serde(default)]
    pub unclassified: usize,
    /// Repositories or candidates whose task failed.
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub strategies: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            repositories: BTreeMap::new(),
            candidates: 0,
            accepted: 0,
            unclassified: 0,
            failed: 0,
            strategies: BTreeMap::new(),
        }
    }

    pub fn record_accepted(&mut self, repository: &str, strategy: &str) {
        self.accepted += 1;
        self.repositories
            .entry(repository.to_string())
            .or_default()
            .accepted += 1;
        *self.strategies.entry(strategy.to_string()).or_default() += 1;
    }
}

/// Appends records to `<dir>/<owner>__<name>.jsonl`.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, repository: &Repository) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", repository.slug()))
    }

    pub fn append(&self, candidate: &BugCandidate) -> Result<()> {
        let mut line =
            serde_json::to_string(&candidate.to_record()).context("serialize candidate record")?;
        line.push('\n');
        let path = self.path_for(&candidate.repository);

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(path = %path.display(), commit = %candidate.commit.short_hash(), "record appended");
        Ok(())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        write_json_atomic(&self.dir.join(SUMMARY_FILE), summary)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

pub fn load_summary(dir: &Path) -> Result<Option<RunSummary>> {
    let path = dir.join(SUMMARY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let summary = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(summary))
}

/// Record files of an output directory, sorted by name.
pub fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.context("read entry")?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_records(path: &Path) -> Result<Vec<CandidateRecord>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}
