use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use verifier::core::candidate::CandidateRecord;
use verifier::io::store::{RunSummary, load_records, load_summary, record_files};

/// Aggregate statistics over an output directory.
#[derive(Debug, Default)]
pub struct DatasetReport {
    pub records: usize,
    pub repositories: BTreeMap<String, usize>,
    pub strategies: BTreeMap<String, usize>,
    pub change_types: BTreeMap<String, usize>,
    /// Keyed by `(strategy, change_type)`.
    pub matrix: BTreeMap<(String, String), usize>,
    /// Records with at least one linked issue.
    pub with_issues: usize,
    pub median_time_to_patch_secs: Option<i64>,
    pub summary: Option<RunSummary>,
}

/// One accepted candidate, as printed by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub repository: String,
    pub commit: String,
    pub strategy: String,
    pub change_type: String,
}

impl From<&CandidateRecord> for ListEntry {
    fn from(record: &CandidateRecord) -> Self {
        Self {
            repository: record.repository.clone(),
            commit: record.commit_hash.chars().take(12).collect(),
            strategy: record.strategy.clone(),
            change_type: record.change_type.as_str().to_string(),
        }
    }
}

/// Every readable record of `dir`; unreadable files become warnings.
pub fn load_all(dir: &Path) -> Result<(Vec<CandidateRecord>, Vec<String>)> {
    let mut records = Vec::new();
    let mut warnings = Vec::new();
    for path in record_files(dir)? {
        match load_records(&path) {
            Ok(mut loaded) => {
                debug!(path = %path.display(), records = loaded.len(), "records loaded");
                records.append(&mut loaded);
            }
            Err(err) => warnings.push(format!("skip {}: {err:#}", path.display())),
        }
    }
    Ok((records, warnings))
}

pub fn list_entries(dir: &Path) -> Result<(Vec<ListEntry>, Vec<String>)> {
    let (records, warnings) = load_all(dir)?;
    Ok((records.iter().map(ListEntry::from).collect(), warnings))
}

pub fn aggregate(dir: &Path) -> Result<(DatasetReport, Vec<String>)> {
    let (records, warnings) = load_all(dir)?;
    let mut report = DatasetReport {
        summary: load_summary(dir)?,
        ..DatasetReport::default()
    };

    let mut patch_times = Vec::with_capacity(records.len());
    for record in &records {
        let change_type = record.change_type.as_str().to_string();
        report.records += 1;
        *report
            .repositories
            .entry(record.repository.clone())
            .or_default() += 1;
        *report
            .strategies
            .entry(record.strategy.clone())
            .or_default() += 1;
        *report.change_types.entry(change_type.clone()).or_default() += 1;
        *report
            .matrix
            .entry((record.strategy.clone(), change_type))
            .or_default() += 1;
        if record.issues.as_ref().is_some_and(|issues| !issues.is_empty()) {
            report.with_issues += 1;
        }
        patch_times.push(record.time_to_patch);
    }
    report.median_time_to_patch_secs = median(&mut patch_times);
    Ok((report, warnings))
}

/// Lower median.
fn median(values: &mut [i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[(values.len() - 1) / 2])
}
