//! Pipeline Orchestrator.
//!
//! Stage 1 mines every repository in parallel; stage 2 executes and
//! classifies every surviving candidate in parallel. A repository or
//! candidate that fails is logged and counted, never fatal to the batch.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::candidate::BugCandidate;
use crate::core::strategy::{Strategy, classify};
use crate::core::types::Repository;
use crate::execute::{DifferentialExecutor, ExecutionSettings};
use crate::exit_codes;
use crate::io::cache_pool::{CacheLease, CachePool};
use crate::io::ci_runner::CiRunner;
use crate::io::clone_gate::CloneGate;
use crate::io::config::VerifierConfig;
use crate::io::credentials::spawn_refresh;
use crate::io::github::MetadataService;
use crate::io::reaper::ContainerReaper;
use crate::io::store::{RecordStore, RepositorySummary, RunSummary};
use crate::mine::{MineFilters, clone_repository, mine_repository};
use crate::workers::parallel_map;

/// A mined repository awaiting stage 2.
struct MinedRepository {
    repository: Repository,
    clone: PathBuf,
    total_commits: usize,
    candidates: Vec<BugCandidate>,
}

/// Outcome of one candidate in stage 2.
enum Verdict {
    Accepted { repository: String, strategy: Strategy },
    Unclassified,
}

pub struct Pipeline {
    config: VerifierConfig,
    metadata: MetadataService,
    runner: Arc<dyn CiRunner>,
    reaper: ContainerReaper,
    gate: Arc<CloneGate>,
    cache: Arc<CachePool>,
    executor: DifferentialExecutor,
    store: RecordStore,
    clones_dir: PathBuf,
    filters: MineFilters,
}

impl Pipeline {
    /// Lay out `work_dir` (clones, cache slots, scratch copies) and open the
    /// output store.
    pub fn new(
        config: VerifierConfig,
        metadata: MetadataService,
        runner: Arc<dyn CiRunner>,
        reaper: ContainerReaper,
        work_dir: &Path,
        output_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let clones_dir = work_dir.join("clones");
        fs::create_dir_all(&clones_dir)
            .with_context(|| format!("create {}", clones_dir.display()))?;
        let cache = CachePool::new(&work_dir.join("cache"), config.workers, config.cache.overflow)?;
        let executor = DifferentialExecutor::new(
            Arc::clone(&runner),
            Arc::clone(&cache),
            config.run_failure.build(),
            ExecutionSettings::from_config(&config),
            &work_dir.join("scratch"),
        )?;
        Ok(Self {
            gate: CloneGate::new(config.clone_concurrency),
            filters: MineFilters::from_config(&config.mining),
            store: RecordStore::new(output_dir)?,
            config,
            metadata,
            runner,
            reaper,
            cache,
            executor,
            clones_dir,
        })
    }

    pub fn cache(&self) -> &Arc<CachePool> {
        &self.cache
    }

    /// Verify every named repository (`owner/name`) and write the summary.
    #[instrument(skip_all, fields(repositories = repositories.len(), workers = self.config.workers))]
    pub fn run(&self, repositories: &[String]) -> Result<RunSummary> {
        let summary = Mutex::new(RunSummary::new(Utc::now()));
        let _refresh = spawn_refresh(
            Arc::clone(self.metadata.pool()),
            Arc::clone(self.metadata.client()),
            Duration::from_secs(self.config.credentials.refresh_interval_secs.max(1)),
        );

        let mined = self.mine_all(repositories, &summary);
        let mut clones = HashMap::new();
        let mut candidates = Vec::new();
        for repository in mined {
            clones.insert(repository.repository.full_name.clone(), repository.clone);
            candidates.extend(repository.candidates);
        }
        lock(&summary).candidates = candidates.len();
        info!(candidates = candidates.len(), "mining complete");

        self.warm_actions(&candidates);
        if let Some(image) = self.runner.image() {
            self.reaper.register(&image);
        }

        self.verify_all(candidates, &clones, &summary);
        self.reaper.shutdown();
        for clone in clones.values() {
            if let Err(err) = fs::remove_dir_all(clone) {
                debug!(path = %clone.display(), error = %err, "clone cleanup failed");
            }
        }

        let mut summary = summary
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        summary.finished_at = Some(Utc::now());
        self.store.write_summary(&summary)?;
        info!(
            accepted = summary.accepted,
            unclassified = summary.unclassified,
            failed = summary.failed,
            "run complete"
        );
        Ok(summary)
    }

    fn mine_all(&self, names: &[String], summary: &Mutex<RunSummary>) -> Vec<MinedRepository> {
        let results = parallel_map(names.to_vec(), self.config.workers, |name| {
            let mined = self.mine_one(&name);
            (name, mined)
        });

        let mut mined = Vec::new();
        for result in results {
            match result {
                Ok((_, Ok(repository))) => {
                    lock(summary).repositories.insert(
                        repository.repository.full_name.clone(),
                        RepositorySummary {
                            commits: repository.total_commits,
                            accepted: 0,
                        },
                    );
                    mined.push(repository);
                }
                Ok((name, Err(err))) => {
                    error!(repo = %name, error = %format!("{err:#}"), "repository failed");
                    lock(summary).failed += 1;
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "repository task failed");
                    lock(summary).failed += 1;
                }
            }
        }
        mined
    }

    #[instrument(skip_all, fields(repo = %name))]
    fn mine_one(&self, name: &str) -> Result<MinedRepository> {
        let repository = self
            .metadata
            .repository(name)
            .with_context(|| format!("look up {name}"))?;
        let dest = self.clones_dir.join(repository.slug());
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .with_context(|| format!("remove stale clone {}", dest.display()))?;
        }
        let git = clone_repository(&repository, &dest, &self.gate, self.config.clone_attempts)?;
        let outcome = mine_repository(&git, &repository, &self.filters)?;
        Ok(MinedRepository {
            repository,
            clone: dest,
            total_commits: outcome.total_commits,
            candidates: outcome.candidates,
        })
    }

    /// Hand the union of action dependencies to the runner, once per pool slot.
    fn warm_actions(&self, candidates: &[BugCandidate]) {
        let actions: BTreeSet<String> = candidates
            .iter()
            .flat_map(|candidate| candidate.actions.iter().cloned())
            .collect();
        if actions.is_empty() {
            return;
        }
        let leases: Vec<CacheLease> = match (0..self.cache.size().max(1))
            .map(|_| self.cache.acquire())
            .collect::<Result<_>>()
        {
            Ok(leases) => leases,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not lease cache for warm-up");
                return;
            }
        };
        for lease in &leases {
            if let Err(err) = self.runner.warm_actions(&actions, lease.path()) {
                warn!(slot = %lease.path().display(), error = %format!("{err:#}"), "action warm-up failed");
            }
        }
        info!(actions = actions.len(), slots = leases.len(), "actions warmed");
    }

    fn verify_all(
        &self,
        candidates: Vec<BugCandidate>,
        clones: &HashMap<String, PathBuf>,
        summary: &Mutex<RunSummary>,
    ) {
        let results = parallel_map(candidates, self.config.workers, |candidate| {
            let label = format!(
                "{}@{}",
                candidate.repository.full_name,
                candidate.commit.short_hash()
            );
            (label, self.verify_one(candidate, clones))
        });

        for result in results {
            match result {
                Ok((_, Ok(Verdict::Accepted {
                    repository,
                    strategy,
                }))) => lock(summary).record_accepted(&repository, strategy.name()),
                Ok((_, Ok(Verdict::Unclassified))) => lock(summary).unclassified += 1,
                Ok((label, Err(err))) => {
                    error!(candidate = %label, error = %format!("{err:#}"), "candidate failed");
                    lock(summary).failed += 1;
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "candidate task failed");
                    lock(summary).failed += 1;
                }
            }
        }
    }

    #[instrument(skip_all, fields(repo = %candidate.repository.full_name, commit = %candidate.commit.short_hash()))]
    fn verify_one(
        &self,
        mut candidate: BugCandidate,
        clones: &HashMap<String, PathBuf>,
    ) -> Result<Verdict> {
        let clone = clones
            .get(&candidate.repository.full_name)
            .with_context(|| format!("no clone for {}", candidate.repository.full_name))?;
        let report = self.executor.execute(&mut candidate, clone)?;
        debug!(completed = report.completed, aborted = report.aborted.is_some(), "executed");

        let Some(strategy) = classify(&candidate, &self.config.strategies) else {
            debug!("no strategy matched");
            return Ok(Verdict::Unclassified);
        };
        candidate.strategy = Some(strategy);
        candidate.issues = match self
            .metadata
            .linked_issues(&candidate.repository, &candidate.commit)
        {
            Ok(issues) => Some(issues),
            Err(err) => {
                warn!(error = %err, "linked issue lookup failed");
                None
            }
        };
        self.store.append(&candidate)?;
        info!(strategy = %strategy, "candidate accepted");
        Ok(Verdict::Accepted {
            repository: candidate.repository.full_name.clone(),
            strategy,
        })
    }
}

/// `PARTIAL` when any repository or candidate failed.
pub fn exit_code(summary: &RunSummary) -> i32 {
    if summary.failed > 0 {
        exit_codes::PARTIAL
    } else {
        exit_codes::OK
    }
}

fn lock(summary: &Mutex<RunSummary>) -> MutexGuard<'_, RunSummary> {
    match summary.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}
