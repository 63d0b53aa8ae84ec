//! Cluster invoker service definitions for coordinator ↔ worker RPC.
//!
//! A worker serves `ClusterInvoker` over its registration connection; the
//! coordinator holds the client side and dispatches executions through it.

use crate::rpc::DaemonRpcResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Root name to path mapping of the coordinator's execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfiguration {
    pub roots: BTreeMap<String, PathBuf>,
}

/// Repositories participating in the coordinator's execution, identifier to
/// location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfiguration {
    pub repositories: BTreeMap<String, String>,
}

/// Script language providers, wildcard pattern to provider location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfiguration {
    pub providers: BTreeMap<String, String>,
}

/// Content database settings for the execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    pub database_path: Option<PathBuf>,
}

/// Everything a worker needs to prepare a project for one cluster execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterExecutionContext {
    /// Unique key of this execution; brackets `cluster_starting` /
    /// `cluster_finished` calls on the worker's project cache.
    pub execution_key: Uuid,
    /// Identifier of the coordinator's file provider; together with the
    /// working directory it forms the project path key.
    pub file_provider_identifier: Uuid,
    /// Working directory of the build on the coordinator.
    pub working_directory: PathBuf,
    pub path_configuration: PathConfiguration,
    pub repository_configuration: RepositoryConfiguration,
    pub script_configuration: ScriptConfiguration,
    pub database_configuration: DatabaseConfiguration,
    pub user_parameters: BTreeMap<String, String>,
    /// Key under which the coordinator's file provider is reachable from the
    /// worker.
    pub coordinator_provider_key: String,
}

/// Result of a cluster task invocation on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInvocationOutcome {
    /// The worker environment that ran the invocation.
    pub environment_identifier: Uuid,
    pub execution_key: Uuid,
    /// Mirror directory the worker staged coordinator files under, if a
    /// mirror base was configured.
    pub mirror_directory: Option<PathBuf>,
}

/// Service a worker daemon offers to a cluster coordinator.
///
/// Registration lifetime equals the lifetime of the underlying connection:
/// the coordinator deregisters the invoker when the connection closes.
#[tarpc::service]
pub trait ClusterInvoker {
    /// Identifies the worker environment, so coordinators recognize repeat
    /// workers across reconnects.
    async fn environment_identifier() -> Uuid;

    /// Liveness probe used by the registry sweep.
    async fn ping() -> bool;

    /// Run a cluster task invocation for the given execution.
    async fn invoke(
        context: ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome>;
}
