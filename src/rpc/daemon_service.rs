//! Daemon service definitions for client ↔ daemon RPC.

use crate::config::{DaemonLaunchParameters, RuntimeLaunchConfiguration};
use crate::rpc::invoker_service::{ClusterExecutionContext, ClusterInvocationOutcome};
use crate::rpc::DaemonRpcResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handshake reply identifying the daemon environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    /// Stable identifier of the daemon's build environment.
    pub environment_identifier: Uuid,
    /// Wire protocol version the daemon speaks.
    pub protocol_version: u32,
}

/// Service exposed by the daemon on its published server port.
///
/// A connection's view of the daemon is the per-connection access context:
/// the shared build environment, the connection's client-server registry and,
/// when clustering is enabled, a cluster invoker factory.
#[tarpc::service]
pub trait DaemonService {
    /// Initial handshake. Fails on wire protocol mismatch.
    async fn hello(protocol_version: u32) -> DaemonRpcResult<HelloReply>;

    /// Liveness probe.
    async fn ping() -> bool;

    /// Stable identifier of the daemon's build environment.
    async fn environment_identifier() -> Uuid;

    /// The parameters the daemon was configured with before start.
    async fn launch_parameters() -> DaemonLaunchParameters;

    /// The effective configuration after start (canonical storage path,
    /// resolved thread factor, actual bound port).
    async fn runtime_launch_configuration() -> RuntimeLaunchConfiguration;

    /// Port of the cluster registration listener.
    ///
    /// Workers offering their capacity connect to this port and serve a
    /// `ClusterInvoker` on the connection; the registration lives until the
    /// connection closes.
    async fn cluster_invoker_port() -> Option<u16>;

    /// Environment identifiers of the currently registered client cluster
    /// invokers.
    async fn client_cluster_invokers() -> Vec<Uuid>;

    /// Run a cluster task invocation on this daemon.
    ///
    /// Available when the daemon accepts cluster work; the invocation is
    /// bound to this connection's invoker factory and resolver registry.
    async fn invoke_cluster_task(
        context: ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome>;
}
