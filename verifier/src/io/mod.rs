//! Side-effecting adapters: git, child processes, configuration, external
//! collaborators and the shared resource pools.

pub mod cache_pool;
pub mod ci_runner;
pub mod clone_gate;
pub mod config;
pub mod credentials;
pub mod git;
pub mod github;
pub mod process;
pub mod reaper;
pub mod store;
