//! Differential bug-verification engine.
//!
//! Mines bug-fixing commits from repositories and re-runs each repository's
//! CI tests at three checkpoints per candidate to decide whether the commit
//! is a reproducible, isolated fix.
//!
//! - **[`core`]**: pure, deterministic logic (diff partitioning, identity and
//!   deduplication, failure policy, classification strategies).
//! - **[`io`]**: side effects (git, child processes, CI runner, metadata
//!   service, credential and cache pools, output store).
//!
//! Orchestration modules ([`mine`], [`execute`], [`pipeline`]) combine the two.

pub mod core;
pub mod error;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mine;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workers;
