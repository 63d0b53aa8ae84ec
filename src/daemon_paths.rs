//! Centralized home-based storage paths for daemon persistence.
//!
//! This module provides helpers for unified storage under `~/.anvil/`:
//! - `daemon/` - Default daemon storage directory (build state, slot lock file)
//! - `logs/daemon-debug.log` - Debug log
//!
//! The home location can be overridden with the `ANVILD_HOME` environment
//! variable, which is essential for test isolation.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::daemon::project::PathKey;

/// The name of the daemon home directory.
const ANVIL_DIR: &str = ".anvil";

/// Returns the daemon home directory: `~/.anvil/` (or `$ANVILD_HOME`).
///
/// Creates the directory if it doesn't exist.
pub fn anvil_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os("ANVILD_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir()
            .context("Could not determine home directory for daemon storage")?
            .join(ANVIL_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create daemon home directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default daemon storage directory: `~/.anvil/daemon/`
///
/// Creates the directory if it doesn't exist.
pub fn default_storage_directory() -> Result<PathBuf> {
    let dir = anvil_home_dir()?.join("daemon");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the debug log path: `~/.anvil/logs/daemon-debug.log`
pub fn daemon_debug_log_path() -> Result<PathBuf> {
    let logs = anvil_home_dir()?.join("logs");
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs.join("daemon-debug.log"))
}

/// Resolves the effective storage directory from an optional configured path.
///
/// Falls back to the default storage directory, creates the directory, and
/// canonicalizes it so that all daemons sharing it agree on the same lock
/// file regardless of symlinks or relative paths.
pub fn resolve_storage_directory(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(path) => path.to_path_buf(),
        None => default_storage_directory()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
    fs::canonicalize(&dir)
        .with_context(|| format!("Failed to canonicalize storage directory: {}", dir.display()))
}

/// Computes the mirror subdirectory name for a working directory path key.
///
/// SHA256 of `<file-provider-uuid>/<working-dir>` truncated to 12 hex
/// characters. The digest only has to be stable; rare collisions merely make
/// two working directories share a mirror area.
pub fn mirror_directory_name(path_key: &PathKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path_key.file_provider_identifier.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(path_key.working_directory.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let mut name = hex;
    name.truncate(12);
    name
}
