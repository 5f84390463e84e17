// crates/tga-config/src/lib.rs
// ============================================================================
// Crate: tga-config
// Description: Environment-driven configuration for the Talos Governance Agent.
// Purpose: Load, validate, and hand off a fail-closed `TgaConfig` to the
//          composition root.
// ============================================================================

//! ## Overview
//! Configuration is read from environment variables rather than a file,
//! since TGA runs as a sidecar process where the orchestrator (not an
//! operator editing a TOML file) supplies its settings: a top-level struct
//! composed of per-concern substructs, each with its own `validate()`,
//! `MIN_`/`MAX_`/`DEFAULT_` constants, and a single fail-closed
//! `ConfigError`.

#![warn(missing_docs)]

mod config;

pub use config::ConfigError;
pub use config::SessionCacheConfig;
pub use config::StoreConfig;
pub use config::TgaConfig;
pub use config::DEFAULT_CLOCK_SKEW_SECONDS;
pub use config::DEFAULT_SESSION_CACHE_SIZE;
pub use config::MAX_CLOCK_SKEW_SECONDS;
pub use config::MAX_SESSION_CACHE_SIZE;
pub use config::MIN_CLOCK_SKEW_SECONDS;
pub use config::MIN_SESSION_CACHE_SIZE;
pub use tga_core::CapabilityVerifierConfig;
