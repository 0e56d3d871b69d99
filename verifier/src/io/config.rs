//! Verifier configuration (`verifier.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::failure::FailurePolicyKind;
use crate::core::strategy::Strategy;

/// Top-level configuration.
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierConfig {
    /// Worker threads per stage; also the cache-slot pool size.
    pub workers: usize,
    /// Memory limit passed to each CI container (e.g. `"16g"`).
    pub memory_limit: String,
    /// Wall-clock timeout of a single CI-runner invocation.
    pub run_timeout_secs: u64,
    /// Truncate captured runner stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Concurrent clones allowed system-wide.
    pub clone_concurrency: usize,
    pub clone_attempts: u32,
    /// Run workflows without network access.
    pub offline: bool,
    /// Ordered classification strategies; first match wins.
    pub strategies: Vec<Strategy>,
    pub run_failure: FailurePolicyKind,
    pub mining: MiningConfig,
    pub credentials: CredentialConfig,
    pub runner: RunnerCommandConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MiningConfig {
    /// Keep only commits whose message matches a stemmed keyword.
    pub message_filter: bool,
    pub keywords: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Also walk commits reachable from open pull requests.
    pub include_pull_requests: bool,
    /// Drop documentation-only files from the non-code partition.
    pub normalize_non_code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialConfig {
    /// Core-class calls remaining below which a token is skipped.
    pub core_margin: u32,
    pub search_margin: u32,
    /// Attempts per call when the service reports quota exhaustion.
    pub retry_attempts: u32,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerCommandConfig {
    /// CI-runner program and leading arguments; `run` / `warm` is appended.
    pub command: Vec<String>,
    /// Container image the runner uses; exited containers of it are reaped.
    pub image: Option<String>,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub overflow: OverflowPolicy,
}

/// What an exhausted cache-slot pool hands out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// A fresh directory, deleted on release.
    #[default]
    Ephemeral,
    /// The single shared default directory (not safe under contention).
    Shared,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            memory_limit: "16g".to_string(),
            run_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            clone_concurrency: 16,
            clone_attempts: 3,
            offline: false,
            strategies: Strategy::ALL.to_vec(),
            run_failure: FailurePolicyKind::default(),
            mining: MiningConfig::default(),
            credentials: CredentialConfig::default(),
            runner: RunnerCommandConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            message_filter: true,
            keywords: vec!["fix".to_string()],
            since: None,
            until: None,
            include_pull_requests: false,
            normalize_non_code: true,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            core_margin: 200,
            search_margin: 1,
            retry_attempts: 3,
            refresh_interval_secs: 60,
        }
    }
}

impl Default for RunnerCommandConfig {
    fn default() -> Self {
        Self {
            command: vec!["ci-runner".to_string()],
            image: None,
            reap_interval_secs: 5 * 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::Ephemeral,
        }
    }
}

impl VerifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.clone_concurrency == 0 {
            return Err(anyhow!("clone_concurrency must be > 0"));
        }
        if self.clone_attempts == 0 {
            return Err(anyhow!("clone_attempts must be > 0"));
        }
        if self.credentials.retry_attempts == 0 {
            return Err(anyhow!("credentials.retry_attempts must be > 0"));
        }
        if self.strategies.is_empty() {
            return Err(anyhow!("strategies must be a non-empty array"));
        }
        if self.runner.command.is_empty() || self.runner.command[0].trim().is_empty() {
            return Err(anyhow!("runner.command must be a non-empty array"));
        }
        if self.mining.message_filter && self.mining.keywords.is_empty() {
            return Err(anyhow!("mining.keywords must be non-empty when message_filter is on"));
        }
        if let (Some(since), Some(until)) = (self.mining.since, self.mining.until)
            && since > until
        {
            return Err(anyhow!("mining.since must not be after mining.until"));
        }
        Ok(())
    }
}

/// Load config from a TOML file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<VerifierConfig> {
    if !path.exists() {
        let cfg = VerifierConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: VerifierConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &VerifierConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, VerifierConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("verifier.toml");
        let mut cfg = VerifierConfig::default();
        cfg.mining.since = Some("2020-01-01T00:00:00Z".parse().expect("ts"));
        cfg.strategies = vec![Strategy::FailPass];
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("verifier.toml");
        fs::write(
            &path,
            "workers = 8\nstrategies = [\"FAIL_PASS\", \"PASS_PASS\"]\n\n[cache]\noverflow = \"shared\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.strategies, vec![Strategy::FailPass, Strategy::PassPass]);
        assert_eq!(cfg.cache.overflow, OverflowPolicy::Shared);
        assert_eq!(cfg.credentials.core_margin, 200);
    }

    #[test]
    fn rejects_inverted_window() {
        let mut cfg = VerifierConfig::default();
        cfg.mining.since = Some("2021-01-01T00:00:00Z".parse().expect("ts"));
        cfg.mining.until = Some("2020-01-01T00:00:00Z".parse().expect("ts"));
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("mining.since"));
    }
}
