//! Error types for the daemon core.

use std::path::PathBuf;

/// Errors produced by the daemon environment and its components.
#[derive(Debug)]
pub enum DaemonError {
    /// Invalid parameter combination or an operation in the wrong lifecycle state.
    Configuration(String),
    /// All 65,535 daemon slots on the storage directory are in use.
    SlotsExhausted,
    /// Filesystem error on the lock file or storage directory.
    LockIo {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Environment construction or server bind failure during start.
    Startup {
        message: String,
        source: Option<std::io::Error>,
    },
    /// Outbound dial failure.
    Connect {
        address: String,
        source: std::io::Error,
    },
    /// Failure while preparing a project for a cluster execution.
    ClusterStart { message: String },
    /// RPC runtime failure on an established connection.
    Rpc { message: String },
}

impl DaemonError {
    pub fn configuration(message: impl Into<String>) -> Self {
        DaemonError::Configuration(message.into())
    }

    pub fn lock_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaemonError::LockIo {
            path: path.into(),
            source,
        }
    }

    pub fn startup(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        DaemonError::Startup {
            message: message.into(),
            source,
        }
    }

    /// True for dial failures that a reconnect loop should retry without
    /// logging a stack of output: the remote end is simply not there yet.
    pub fn is_transient_connect(&self) -> bool {
        match self {
            DaemonError::Connect { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Configuration(message) => {
                write!(f, "Configuration error: {}", message)
            }
            DaemonError::SlotsExhausted => {
                write!(f, "No free daemon slot in the storage directory lock file")
            }
            DaemonError::LockIo { path, source } => {
                write!(f, "Lock file I/O error on {}: {}", path.display(), source)
            }
            DaemonError::Startup { message, source } => match source {
                Some(source) => write!(f, "Daemon startup failed: {}: {}", message, source),
                None => write!(f, "Daemon startup failed: {}", message),
            },
            DaemonError::Connect { address, source } => {
                write!(f, "Failed to connect to {}: {}", address, source)
            }
            DaemonError::ClusterStart { message } => {
                write!(f, "Cluster execution start failed: {}", message)
            }
            DaemonError::Rpc { message } => write!(f, "RPC error: {}", message),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::LockIo { source, .. } => Some(source),
            DaemonError::Connect { source, .. } => Some(source),
            DaemonError::Startup {
                source: Some(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}
