//! Testing utilities for dumpflow chains.
//!
//! This module provides:
//! - A temporary directory layout with settings pointing into it
//! - An in-memory stand-in for the PostgreSQL client tools
//! - Stage doubles and an error hook that counts its calls

mod fixtures;
mod mocks;

pub use fixtures::TestRoots;
pub use mocks::{CountingHook, FailingStage, FakeDatabaseTools, SlowStage};
