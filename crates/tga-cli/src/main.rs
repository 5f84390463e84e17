// crates/tga-cli/src/main.rs
// ============================================================================
// Module: TGA CLI Entry Point
// Description: Administrative command dispatcher and composition root for TGA.
// Purpose: Drive startup recovery and offer operator subcommands: verify-log,
//          status, recover.
// Dependencies: clap, tga-core, tga-config, tga-store-sqlite, thiserror
// ============================================================================

//! ## Overview
//! `tga-cli` never serves the protocol surface TGA mediates; it wires
//! `Configuration -> CapabilityVerifier -> StateStore ->
//! ExecutionStateMachine -> Recovery` once at startup and
//! offers three operator subcommands against the resulting store. All
//! output goes through explicit `io::Write` handles rather than ad hoc
//! `println!`, since the workspace denies `print_stdout`/`print_stderr`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use tga_config::ConfigError;
use tga_config::TgaConfig;
use tga_core::NoopAuditSink;
use tga_core::Recovery;
use tga_core::RecoveryError;
use tga_core::State;
use tga_core::StateStore;
use tga_core::StateStoreError;
use tga_store_sqlite::SqliteStateStore;
use tga_store_sqlite::SqliteStoreConfig;
use tga_store_sqlite::SqliteStoreError;

// ============================================================================
// SECTION: CLI surface
// ============================================================================

/// The Talos Governance Agent administrative CLI.
#[derive(Debug, Parser)]
#[command(name = "tga-cli", version, about = "Administrative CLI for the Talos Governance Agent")]
struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Administrative subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Loads the execution log and reports whether its hash chain is intact.
    VerifyLog,
    /// Reports the count of traces in each state.
    Status,
    /// Runs startup recovery, resolving any orphaned or unresolvable traces.
    Recover,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// A fatal CLI-level failure; causes a non-zero exit after a diagnostic is
/// written. `RecoveryError` and `StateStoreError` are always fatal here.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] SqliteStoreError),
    /// Recovery failed closed.
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),
    /// The underlying store failed.
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
    /// Writing a diagnostic to stdout/stderr failed.
    #[error("output error: {0}")]
    Output(String),
}

// ============================================================================
// SECTION: Entry point
// ============================================================================

/// CLI entry point returning a process exit code.
fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = write_stderr_line(&err.to_string());
            ExitCode::FAILURE
        }
    }
}

/// Parses arguments and dispatches to the selected subcommand.
fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = TgaConfig::load()?;
    let store = SqliteStateStore::open(&SqliteStoreConfig::new(config.store.db_path.clone()))?;

    match cli.command {
        Command::VerifyLog => command_verify_log(&store),
        Command::Status => command_status(&store),
        Command::Recover => command_recover(&store),
    }
}

// ============================================================================
// SECTION: Subcommands
// ============================================================================

/// Runs `Recovery::run` and reports only whether the hash chain is intact,
/// without writing any resolution records.
fn command_verify_log(store: &SqliteStateStore) -> Result<(), CliError> {
    let records = store.load_all()?;
    match tga_core::hash_chain::verify(&records) {
        Ok(None) => write_stdout_line("OK: hash chain intact"),
        Ok(Some(broken)) => write_stdout_line(&format!(
            "BROKEN: hash chain broken at sequence {} ({})",
            broken.sequence,
            broken.kind.as_str()
        )),
        Err(err) => write_stdout_line(&format!("ERROR: {err}")),
    }
    .map_err(|err| CliError::Output(err.to_string()))
}

/// Reports the count of traces whose latest record is in each state.
fn command_status(store: &SqliteStateStore) -> Result<(), CliError> {
    for state in
        [State::Pending, State::Authorized, State::Executing, State::Completed, State::Rejected, State::Failed]
    {
        let traces = store.traces_in_state(state)?;
        write_stdout_line(&format!("{}: {}", state.as_str(), traces.len()))
            .map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(())
}

/// Runs startup recovery and reports what was resolved.
fn command_recover(store: &SqliteStateStore) -> Result<(), CliError> {
    let audit = NoopAuditSink;
    let recovery = Recovery::new(store, &audit);
    let recovered = recovery.run()?;
    if recovered.resolved.is_empty() {
        write_stdout_line("OK: no orphaned or unresolvable traces found")
            .map_err(|err| CliError::Output(err.to_string()))?;
    }
    for (trace_id, reason) in &recovered.resolved {
        write_stdout_line(&format!("RESOLVED: {trace_id} -> {reason}"))
            .map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Output helpers
// ============================================================================

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}
