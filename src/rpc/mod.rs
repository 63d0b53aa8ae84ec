//! RPC service definitions for daemon and cluster communication.
//!
//! This module defines the tarpc services for:
//! - Client ↔ Daemon: handshake, introspection, and cluster task invocation
//! - Coordinator ↔ Worker: cluster invoker registration and task dispatch

pub mod daemon_service;
pub mod invoker_service;

use serde::{Deserialize, Serialize};

/// Wire protocol version shared by all daemon RPC surfaces.
///
/// Bumped whenever a service signature or record changes incompatibly; peers
/// with a different version are rejected during the `hello` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors returned by daemon RPC methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRpcError {
    /// Wire protocol version mismatch during handshake.
    ProtocolMismatch { got: u32, expected: u32 },
    /// The daemon does not accept cluster work.
    ClusterNotEnabled,
    /// Failure while preparing a project for a cluster execution.
    ClusterStart { message: String },
    /// The targeted project cache has been closed.
    ProjectClosed,
    /// Internal error.
    Internal { message: String },
}

impl std::fmt::Display for DaemonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonRpcError::ProtocolMismatch { got, expected } => {
                write!(
                    f,
                    "Protocol version mismatch: got {}, expected {}",
                    got, expected
                )
            }
            DaemonRpcError::ClusterNotEnabled => {
                write!(f, "Daemon does not accept cluster work")
            }
            DaemonRpcError::ClusterStart { message } => {
                write!(f, "Cluster execution start failed: {}", message)
            }
            DaemonRpcError::ProjectClosed => write!(f, "Project cache is closed"),
            DaemonRpcError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for DaemonRpcError {}

/// Result type for daemon RPC operations.
pub type DaemonRpcResult<T> = Result<T, DaemonRpcError>;
