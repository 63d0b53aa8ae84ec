//! Daemon launch configuration.
//!
//! `DaemonLaunchParameters` is the immutable configuration bundle a daemon is
//! constructed with; `RuntimeLaunchConfiguration` is the effective
//! configuration captured once `start()` has resolved ports and paths.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::daemon::error::DaemonError;

/// Port the daemon binds when the configuration asks for the default.
pub const DEFAULT_PORT_NUMBER: u16 = 3500;

/// Server port selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPort {
    /// Bind [`DEFAULT_PORT_NUMBER`].
    Default,
    /// Let the OS assign a free port; the chosen port is published in the
    /// slot lock file.
    OsAssigned,
    /// Bind a specific port.
    Fixed(u16),
}

impl ServerPort {
    /// Maps a raw numeric port to a selection: negative selects the default
    /// port, zero an OS-assigned one.
    pub fn from_raw(raw: i32) -> Result<ServerPort, DaemonError> {
        if raw < 0 {
            Ok(ServerPort::Default)
        } else if raw == 0 {
            Ok(ServerPort::OsAssigned)
        } else if raw <= u16::MAX as i32 {
            Ok(ServerPort::Fixed(raw as u16))
        } else {
            Err(DaemonError::configuration(format!(
                "Server port out of range: {}",
                raw
            )))
        }
    }

    /// The port number to hand to the listener bind call.
    pub fn bind_port(self) -> u16 {
        match self {
            ServerPort::Default => DEFAULT_PORT_NUMBER,
            ServerPort::OsAssigned => 0,
            ServerPort::Fixed(port) => port,
        }
    }
}

/// Immutable configuration bundle for one daemon instance.
///
/// Equality is structural, so parameter sets can be compared when deciding
/// whether an already running daemon is suitable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonLaunchParameters {
    /// Build state storage directory. `None` selects `~/.anvil/daemon`.
    #[serde(default)]
    pub storage_directory: Option<PathBuf>,
    /// Server port selection; `None` runs the daemon without an RPC server.
    #[serde(default)]
    pub server_port: Option<ServerPort>,
    /// Worker thread multiplier for the build environment; 0 resolves to the
    /// machine parallelism.
    #[serde(default)]
    pub thread_factor: usize,
    /// Bind on all interfaces instead of loopback only.
    #[serde(default)]
    pub acts_as_server: bool,
    /// Accept cluster work and allow outbound coordinator connections.
    #[serde(default)]
    pub acts_as_cluster: bool,
    /// Scratch area where cluster executions stage coordinator files.
    #[serde(default)]
    pub cluster_mirror_directory: Option<PathBuf>,
    /// Coordinator addresses this daemon dials to offer its capacity.
    #[serde(default)]
    pub connect_to_as_cluster: Vec<String>,
    /// User parameters forwarded to the build environment.
    #[serde(default)]
    pub user_parameters: BTreeMap<String, String>,
    /// Idle shutdown delay. Accepted and reported, but the daemon currently
    /// never shuts itself down; the policy is undecided upstream.
    #[serde(default)]
    pub idle_shutdown_minutes: Option<u32>,
}

impl Default for DaemonLaunchParameters {
    fn default() -> Self {
        Self {
            storage_directory: None,
            server_port: Some(ServerPort::Default),
            thread_factor: 0,
            acts_as_server: false,
            acts_as_cluster: false,
            cluster_mirror_directory: None,
            connect_to_as_cluster: Vec::new(),
            user_parameters: BTreeMap::new(),
            idle_shutdown_minutes: None,
        }
    }
}

impl DaemonLaunchParameters {
    /// Load parameters from a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let params: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        params
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(params)
    }

    /// Validate the parameter combination.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if !self.connect_to_as_cluster.is_empty() && !self.acts_as_cluster {
            return Err(DaemonError::configuration(
                "Cluster coordinator addresses require acting as a cluster",
            ));
        }
        if self.cluster_mirror_directory.is_some() && !self.acts_as_cluster {
            return Err(DaemonError::configuration(
                "Cluster mirror directory requires acting as a cluster",
            ));
        }
        if self.acts_as_server && self.server_port.is_none() {
            return Err(DaemonError::configuration(
                "Acting as a server requires a server port",
            ));
        }
        Ok(())
    }
}

/// Effective configuration of a started daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLaunchConfiguration {
    /// Canonicalized storage directory.
    pub storage_directory: PathBuf,
    /// Port the server actually bound, if any.
    pub actual_port: Option<u16>,
    /// Resolved worker thread count.
    pub thread_factor: usize,
    pub acts_as_server: bool,
    pub acts_as_cluster: bool,
    pub cluster_mirror_directory: Option<PathBuf>,
    pub user_parameters: BTreeMap<String, String>,
}

/// Resolves a configured thread factor to an actual worker count.
pub fn resolve_thread_factor(thread_factor: usize) -> usize {
    if thread_factor == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        thread_factor
    }
}
