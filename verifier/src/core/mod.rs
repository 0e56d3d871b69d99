//! Deterministic, pure logic of the verification engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod candidate;
pub mod dedup;
pub mod failure;
pub mod message_filter;
pub mod partition;
pub mod strategy;
pub mod types;
