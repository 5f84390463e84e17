// crates/tga-store-sqlite/src/lib.rs
// ============================================================================
// Crate: tga-store-sqlite
// Description: SQLite-backed implementation of `tga_core::store::StateStore`.
// Purpose: Durable, crash-safe persistence for the execution log.
// ============================================================================

//! ## Overview
//! The reference adapter named in the external interface surface: a local
//! `SQLite` file, write-ahead logging, a single `execution_states` table
//! keyed on `sequence`, secondary indexes on `(trace_id, sequence)` and
//! `(state)`, and file permissions restricted to owner read/write, behind a
//! single-writer mutex matching `tga-core`'s concurrency model.

#![warn(missing_docs)]

mod store;

pub use store::SCHEMA_VERSION;
pub use store::SqliteStateStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
