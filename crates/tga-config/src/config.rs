// crates/tga-config/src/config.rs
// ============================================================================
// Module: TgaConfig
// Description: Environment-variable configuration loading and validation.
// Purpose: Fail closed on missing or out-of-range settings before any
//          capability is ever verified.
// Dependencies: tga-core, base64, thiserror
// ============================================================================

//! ## Overview
//! `TgaConfig::load` reads the four environment variables named in the
//! external interface surface, applies `MIN_`/`MAX_`/`DEFAULT_` bounds, and
//! builds the substructs each downstream component actually takes a
//! constructor argument of: [`tga_core::CapabilityVerifierConfig`],
//! [`StoreConfig`], [`SessionCacheConfig`]. Nothing here is read twice;
//! `load()` is meant to run exactly once, at process startup, before any
//! capability is ever verified.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::VerifyingKey;
use tga_core::CapabilityVerifierConfig;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable naming the Supervisor's PEM-encoded Ed25519 public key.
const ENV_SUPERVISOR_PUBLIC_KEY: &str = "TGA_SUPERVISOR_PUBLIC_KEY";
/// Environment variable naming the state store's database file path.
const ENV_DB_PATH: &str = "TGA_DB_PATH";
/// Environment variable naming the clock skew tolerance, in seconds.
const ENV_CLOCK_SKEW_SECONDS: &str = "TGA_CLOCK_SKEW_SECONDS";
/// Environment variable naming the session cache capacity.
const ENV_SESSION_CACHE_SIZE: &str = "TGA_SESSION_CACHE_SIZE";
/// Environment variable naming TGA's own audience identity.
const ENV_AUDIENCE: &str = "TGA_AUDIENCE";

/// Default clock skew tolerance in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 5;
/// Minimum accepted clock skew tolerance in seconds.
pub const MIN_CLOCK_SKEW_SECONDS: i64 = 0;
/// Maximum accepted clock skew tolerance in seconds.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// Default session cache capacity.
pub const DEFAULT_SESSION_CACHE_SIZE: usize = 1024;
/// Minimum accepted session cache capacity.
pub const MIN_SESSION_CACHE_SIZE: usize = 1;
/// Maximum accepted session cache capacity.
pub const MAX_SESSION_CACHE_SIZE: usize = 1_000_000;

/// PEM armor opening line accepted for the supervisor public key.
const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
/// PEM armor closing line accepted for the supervisor public key.
const PEM_END: &str = "-----END PUBLIC KEY-----";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    /// An environment variable's value could not be parsed.
    #[error("invalid value for {var}: {detail}")]
    InvalidValue {
        /// The offending variable's name.
        var: &'static str,
        /// A human-readable description of the parse failure.
        detail: String,
    },
    /// A value parsed but fell outside its allowed range.
    #[error("{field} out of range: {detail}")]
    OutOfRange {
        /// The offending field's name.
        field: &'static str,
        /// A human-readable description of the violated bound.
        detail: String,
    },
}

// ============================================================================
// SECTION: CapabilityVerifierConfig loading
// ============================================================================

/// Parses a PEM-armored Ed25519 public key into a [`VerifyingKey`].
///
/// The body between the `BEGIN`/`END PUBLIC KEY` markers is standard-base64
/// encoded raw key bytes (not a full X.509 `SubjectPublicKeyInfo` DER
/// envelope): decoding SPKI DER would need an ASN.1 dependency this
/// workspace does not otherwise carry.
fn parse_supervisor_public_key(pem: &str) -> Result<VerifyingKey, ConfigError> {
    let body = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != PEM_BEGIN && *line != PEM_END)
        .collect::<String>();
    let bytes = STANDARD.decode(body).map_err(|err| ConfigError::InvalidValue {
        var: ENV_SUPERVISOR_PUBLIC_KEY,
        detail: format!("base64 decode failed: {err}"),
    })?;
    let array: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| ConfigError::InvalidValue {
        var: ENV_SUPERVISOR_PUBLIC_KEY,
        detail: format!("expected 32 key bytes, got {}", bytes.len()),
    })?;
    VerifyingKey::from_bytes(&array).map_err(|err| ConfigError::InvalidValue {
        var: ENV_SUPERVISOR_PUBLIC_KEY,
        detail: format!("not a valid Ed25519 public key: {err}"),
    })
}

/// Loads and validates the [`CapabilityVerifierConfig`] substruct.
fn load_capability_verifier_config() -> Result<CapabilityVerifierConfig, ConfigError> {
    let pem = env::var(ENV_SUPERVISOR_PUBLIC_KEY)
        .map_err(|_| ConfigError::MissingVar(ENV_SUPERVISOR_PUBLIC_KEY))?;
    let supervisor_public_key = parse_supervisor_public_key(&pem)?;

    let audience = env::var(ENV_AUDIENCE).map_err(|_| ConfigError::MissingVar(ENV_AUDIENCE))?;
    if audience.is_empty() {
        return Err(ConfigError::OutOfRange {
            field: "audience",
            detail: "must be non-empty".to_string(),
        });
    }

    let clock_skew_seconds = match env::var(ENV_CLOCK_SKEW_SECONDS) {
        Ok(raw) => raw.parse::<i64>().map_err(|err| ConfigError::InvalidValue {
            var: ENV_CLOCK_SKEW_SECONDS,
            detail: err.to_string(),
        })?,
        Err(_) => DEFAULT_CLOCK_SKEW_SECONDS,
    };
    if !(MIN_CLOCK_SKEW_SECONDS..=MAX_CLOCK_SKEW_SECONDS).contains(&clock_skew_seconds) {
        return Err(ConfigError::OutOfRange {
            field: "clock_skew_seconds",
            detail: format!(
                "{clock_skew_seconds} outside [{MIN_CLOCK_SKEW_SECONDS}, {MAX_CLOCK_SKEW_SECONDS}]"
            ),
        });
    }

    Ok(CapabilityVerifierConfig { supervisor_public_key, audience, clock_skew_seconds })
}

// ============================================================================
// SECTION: StoreConfig
// ============================================================================

/// Configuration for the durable execution log backend.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Absolute path to the state store database file.
    pub db_path: PathBuf,
}

impl StoreConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] if `db_path` is not absolute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.db_path.is_absolute() {
            return Err(ConfigError::OutOfRange {
                field: "db_path",
                detail: "must be an absolute path".to_string(),
            });
        }
        Ok(())
    }

    fn load() -> Result<Self, ConfigError> {
        let raw = env::var(ENV_DB_PATH).map_err(|_| ConfigError::MissingVar(ENV_DB_PATH))?;
        let config = Self { db_path: PathBuf::from(raw) };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// SECTION: SessionCacheConfig
// ============================================================================

/// Configuration for the bounded in-memory session cache.
#[derive(Debug, Clone, Copy)]
pub struct SessionCacheConfig {
    /// Maximum number of live sessions retained.
    pub capacity: usize,
}

impl SessionCacheConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] if `capacity` is outside
    /// `[MIN_SESSION_CACHE_SIZE, MAX_SESSION_CACHE_SIZE]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SESSION_CACHE_SIZE..=MAX_SESSION_CACHE_SIZE).contains(&self.capacity) {
            return Err(ConfigError::OutOfRange {
                field: "session_cache.capacity",
                detail: format!(
                    "{} outside [{MIN_SESSION_CACHE_SIZE}, {MAX_SESSION_CACHE_SIZE}]",
                    self.capacity
                ),
            });
        }
        Ok(())
    }

    fn load() -> Result<Self, ConfigError> {
        let capacity = match env::var(ENV_SESSION_CACHE_SIZE) {
            Ok(raw) => raw.parse::<usize>().map_err(|err| ConfigError::InvalidValue {
                var: ENV_SESSION_CACHE_SIZE,
                detail: err.to_string(),
            })?,
            Err(_) => DEFAULT_SESSION_CACHE_SIZE,
        };
        let config = Self { capacity };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// SECTION: TgaConfig
// ============================================================================

/// The fully loaded, validated configuration for one TGA process.
#[derive(Debug, Clone)]
pub struct TgaConfig {
    /// Capability verification settings.
    pub verifier: CapabilityVerifierConfig,
    /// Durable store settings.
    pub store: StoreConfig,
    /// Session cache settings.
    pub session_cache: SessionCacheConfig,
}

impl TgaConfig {
    /// Loads configuration from the process environment, applying defaults
    /// and failing closed on any invalid or out-of-range value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing, a value
    /// fails to parse, or a value falls outside its valid range.
    pub fn load() -> Result<Self, ConfigError> {
        let verifier = load_capability_verifier_config()?;
        let store = StoreConfig::load()?;
        let session_cache = SessionCacheConfig::load()?;
        Ok(Self { verifier, store, session_cache })
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
#[allow(unsafe_code, reason = "Tests mutate process env to exercise config loading.")]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests in this module since they all mutate process env.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Builds a freshly generated Ed25519 public key in this module's PEM form.
    fn sample_pem() -> String {
        let mut csprng = rand::rngs::OsRng;
        let signing = ed25519_dalek::SigningKey::generate(&mut csprng);
        let verifying = signing.verifying_key();
        let encoded = STANDARD.encode(verifying.to_bytes());
        format!("{PEM_BEGIN}\n{encoded}\n{PEM_END}\n")
    }

    /// Removes every TGA environment variable this module's tests touch.
    fn clear_env() {
        for var in [
            ENV_SUPERVISOR_PUBLIC_KEY,
            ENV_DB_PATH,
            ENV_CLOCK_SKEW_SECONDS,
            ENV_SESSION_CACHE_SIZE,
            ENV_AUDIENCE,
        ] {
            // SAFETY-irrelevant: single-threaded test harness guarded by ENV_LOCK.
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn loads_a_complete_valid_configuration() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let pem = sample_pem();
        unsafe {
            env::set_var(ENV_SUPERVISOR_PUBLIC_KEY, pem);
            env::set_var(ENV_DB_PATH, "/var/lib/tga/state.db");
            env::set_var(ENV_AUDIENCE, "tga-sidecar");
        }
        let config = TgaConfig::load().expect("valid configuration loads");
        assert_eq!(config.session_cache.capacity, DEFAULT_SESSION_CACHE_SIZE);
        assert_eq!(config.verifier.clock_skew_seconds, DEFAULT_CLOCK_SKEW_SECONDS);
        clear_env();
    }

    #[test]
    fn rejects_a_relative_db_path() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let pem = sample_pem();
        unsafe {
            env::set_var(ENV_SUPERVISOR_PUBLIC_KEY, pem);
            env::set_var(ENV_DB_PATH, "relative/path.db");
            env::set_var(ENV_AUDIENCE, "tga-sidecar");
        }
        let result = TgaConfig::load();
        assert!(matches!(result, Err(ConfigError::OutOfRange { field: "db_path", .. })));
        clear_env();
    }

    #[test]
    fn rejects_an_out_of_range_clock_skew() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let pem = sample_pem();
        unsafe {
            env::set_var(ENV_SUPERVISOR_PUBLIC_KEY, pem);
            env::set_var(ENV_DB_PATH, "/var/lib/tga/state.db");
            env::set_var(ENV_AUDIENCE, "tga-sidecar");
            env::set_var(ENV_CLOCK_SKEW_SECONDS, "9999");
        }
        let result = TgaConfig::load();
        assert!(matches!(
            result,
            Err(ConfigError::OutOfRange { field: "clock_skew_seconds", .. })
        ));
        clear_env();
    }

    #[test]
    fn missing_supervisor_key_is_a_missing_var_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let result = TgaConfig::load();
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar(var)) if var == ENV_SUPERVISOR_PUBLIC_KEY
        ));
    }
}
