//! CLI command implementations.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::warn;

use crate::report::{aggregate, list_entries};

/// Print one line per accepted candidate.
pub fn list(dir: &Path) -> Result<()> {
    ensure_dir(dir)?;
    let (entries, warnings) = list_entries(dir)?;
    for warning in warnings {
        warn!("{warning}");
    }
    for entry in entries {
        println!(
            "{} {} {} {}",
            entry.repository, entry.commit, entry.strategy, entry.change_type
        );
    }
    Ok(())
}

/// Print aggregate statistics and the run summary.
pub fn report(dir: &Path) -> Result<()> {
    ensure_dir(dir)?;
    let (report, warnings) = aggregate(dir)?;
    for warning in warnings {
        warn!("{warning}");
    }

    println!(
        "report: records={} repositories={} with_issues={}",
        report.records,
        report.repositories.len(),
        report.with_issues
    );
    if let Some(median) = report.median_time_to_patch_secs {
        println!("report: median_time_to_patch_secs={median}");
    }
    for (strategy, count) in &report.strategies {
        println!("report: strategy {strategy} {count}");
    }
    for (change_type, count) in &report.change_types {
        println!("report: change_type {change_type} {count}");
    }
    for ((strategy, change_type), count) in &report.matrix {
        println!("report: {strategy} x {change_type} {count}");
    }
    for (repository, count) in &report.repositories {
        println!("report: repository {repository} {count}");
    }

    match &report.summary {
        Some(summary) => {
            println!(
                "summary: candidates={} accepted={} unclassified={} failed={}",
                summary.candidates, summary.accepted, summary.unclassified, summary.failed
            );
            println!(
                "summary: started_at={} finished_at={}",
                summary.started_at.to_rfc3339(),
                summary
                    .finished_at
                    .map_or_else(|| "-".to_string(), |at| at.to_rfc3339())
            );
        }
        None => println!("summary: none"),
    }
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(())
}
