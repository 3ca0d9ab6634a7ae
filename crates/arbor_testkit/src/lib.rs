//! # Arbor Testkit
//!
//! Test utilities for Arbor.
//!
//! This crate provides:
//! - Test fixtures for opening throwaway databases
//! - Property-based testing generators
//! - A reference model for checking dictionaries against
//! - Tracing setup for tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod model;

pub use fixtures::*;
pub use generators::*;
pub use model::*;

/// Installs a tracing subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG`. Safe to call from every test; only the
/// first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Re-exports for convenient testing.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_tracing;
    pub use crate::model::*;
    pub use arbor_core::{
        CascadeState, ColKey, ColumnType, Config, Database, Dictionary, Mixed, ObjKey, Table,
        TableKey,
    };
    pub use arbor_storage::{InMemoryBackend, StorageBackend};
}
