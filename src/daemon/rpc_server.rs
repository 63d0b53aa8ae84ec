//! RPC server adapter for the daemon.
//!
//! Wires accepted connections to the daemon: every main-service connection
//! gets a [`DaemonAccess`] context (shared environment, per-connection client
//! server, optional cluster invoker factory), and every cluster registration
//! connection contributes one entry to the client invoker registry for
//! exactly as long as it stays open.
//!
//! Listeners are bound eagerly so the chosen ports are known during
//! initialization, but accepting only begins once the daemon releases the go
//! signal after reaching the started state; the first accepted connection
//! always sees fully initialized dependencies.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{client, context};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::config::{DaemonLaunchParameters, RuntimeLaunchConfiguration};
use crate::daemon::client_server::{ClientInvokerRegistry, DaemonClientServer};
use crate::daemon::error::DaemonError;
use crate::daemon::invoker::ClusterInvokerFactory;
use crate::daemon_log::daemon_log;
use crate::engine::BuildEnvironment;
use crate::rpc::daemon_service::{DaemonService, HelloReply};
use crate::rpc::invoker_service::{
    ClusterExecutionContext, ClusterInvocationOutcome, ClusterInvokerClient,
};
use crate::rpc::{DaemonRpcError, DaemonRpcResult, PROTOCOL_VERSION};

/// Immutable context shared by every accepted connection.
pub struct ServerContext {
    pub environment: Arc<BuildEnvironment>,
    pub launch_parameters: DaemonLaunchParameters,
    pub runtime_configuration: RuntimeLaunchConfiguration,
    pub registry: Arc<ClientInvokerRegistry>,
    pub cluster_invoker_port: u16,
}

/// Per-connection access context.
///
/// This is what a connected peer works against: the shared daemon
/// environment, the connection's client-server view of the invoker registry
/// and, when clustering is enabled, an invoker factory with its own resolver
/// registry.
pub struct DaemonAccess {
    pub environment: Arc<BuildEnvironment>,
    pub launch_parameters: DaemonLaunchParameters,
    pub runtime_configuration: RuntimeLaunchConfiguration,
    pub client_server: DaemonClientServer,
    pub invoker_factory: Option<Arc<ClusterInvokerFactory>>,
}

impl DaemonAccess {
    pub fn for_connection(context: &ServerContext) -> Self {
        let invoker_factory = if context.runtime_configuration.acts_as_cluster {
            Some(Arc::new(ClusterInvokerFactory::new(
                Arc::clone(&context.environment),
                context
                    .runtime_configuration
                    .cluster_mirror_directory
                    .clone(),
            )))
        } else {
            None
        };
        Self {
            environment: Arc::clone(&context.environment),
            launch_parameters: context.launch_parameters.clone(),
            runtime_configuration: context.runtime_configuration.clone(),
            client_server: DaemonClientServer::new(
                Arc::clone(&context.registry),
                context.cluster_invoker_port,
            ),
            invoker_factory,
        }
    }
}

/// Final RPC statistics recorded when a connection closes.
#[derive(Default)]
pub struct ConnectionStats {
    requests: AtomicU64,
}

impl ConnectionStats {
    fn record(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Serves [`DaemonService`] for one accepted connection.
#[derive(Clone)]
pub struct DaemonServiceServer {
    access: Arc<DaemonAccess>,
    stats: Arc<ConnectionStats>,
}

impl DaemonService for DaemonServiceServer {
    async fn hello(self, _: context::Context, protocol_version: u32) -> DaemonRpcResult<HelloReply> {
        self.stats.record();
        if protocol_version != PROTOCOL_VERSION {
            return Err(DaemonRpcError::ProtocolMismatch {
                got: protocol_version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(HelloReply {
            environment_identifier: self.access.environment.environment_identifier(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    async fn ping(self, _: context::Context) -> bool {
        self.stats.record();
        true
    }

    async fn environment_identifier(self, _: context::Context) -> Uuid {
        self.stats.record();
        self.access.environment.environment_identifier()
    }

    async fn launch_parameters(self, _: context::Context) -> DaemonLaunchParameters {
        self.stats.record();
        self.access.launch_parameters.clone()
    }

    async fn runtime_launch_configuration(self, _: context::Context) -> RuntimeLaunchConfiguration {
        self.stats.record();
        self.access.runtime_configuration.clone()
    }

    async fn cluster_invoker_port(self, _: context::Context) -> Option<u16> {
        self.stats.record();
        Some(self.access.client_server.cluster_invoker_port())
    }

    async fn client_cluster_invokers(self, _: context::Context) -> Vec<Uuid> {
        self.stats.record();
        self.access
            .client_server
            .registry()
            .environment_identifiers()
            .await
    }

    async fn invoke_cluster_task(
        self,
        _: context::Context,
        context: ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome> {
        self.stats.record();
        match &self.access.invoker_factory {
            Some(factory) => factory.invoke(context).await,
            None => Err(DaemonRpcError::ClusterNotEnabled),
        }
    }
}

/// A bound listener waiting for its go signal.
///
/// `G` is the payload the accept loop needs before it may accept; dropping
/// the sender keeps the listener from ever accepting, which is the
/// failed-start path.
pub struct ListenerStartup<G> {
    pub local_addr: SocketAddr,
    pub go: oneshot::Sender<G>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Binds the main daemon service listener.
///
/// The shared [`ServerContext`] is delivered through the go signal once the
/// daemon finished initializing; it carries the effective runtime
/// configuration, which is only complete after this bind resolved the port.
pub async fn bind_daemon_server(
    bind_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<ListenerStartup<Arc<ServerContext>>, DaemonError> {
    let mut listener = tarpc::serde_transport::tcp::listen(&bind_addr, Bincode::default)
        .await
        .map_err(|e| {
            DaemonError::startup(format!("Failed to bind daemon server on {}", bind_addr), Some(e))
        })?;
    let local_addr = listener.local_addr();

    let (go, go_rx) = oneshot::channel::<Arc<ServerContext>>();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let task = tokio::spawn(async move {
        let Ok(context) = go_rx.await else {
            return;
        };
        loop {
            tokio::select! {
                accepted = listener.next() => {
                    match accepted {
                        Some(Ok(transport)) => {
                            let peer = transport.peer_addr().ok();
                            let access = Arc::new(DaemonAccess::for_connection(&context));
                            let stats = Arc::new(ConnectionStats::default());
                            let server = DaemonServiceServer {
                                access,
                                stats: Arc::clone(&stats),
                            };
                            let mut conn_shutdown = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                let channel = server::BaseChannel::with_defaults(transport);
                                let serve = channel
                                    .execute(server.serve())
                                    .for_each(|response| async {
                                        tokio::spawn(response);
                                    });
                                tokio::select! {
                                    _ = serve => {}
                                    _ = conn_shutdown.recv() => {}
                                }
                                daemon_log(
                                    "rpc_server",
                                    &format!(
                                        "Connection closed: peer={:?} requests={}",
                                        peer,
                                        stats.requests()
                                    ),
                                );
                            });
                        }
                        Some(Err(e)) => {
                            daemon_log("rpc_server", &format!("Accept error: {}", e));
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    Ok(ListenerStartup {
        local_addr,
        go,
        task,
    })
}

/// Binds the cluster registration listener.
///
/// Each accepted connection is one client cluster invoker registration: the
/// peer serves [`crate::rpc::invoker_service::ClusterInvoker`] on its side,
/// this side wraps the transport into a client, asks for the peer's
/// environment identifier and keeps the registration until the connection
/// closes.
pub async fn bind_cluster_registration_listener(
    bind_addr: SocketAddr,
    registry: Arc<ClientInvokerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<ListenerStartup<()>, DaemonError> {
    let mut listener = tarpc::serde_transport::tcp::listen(&bind_addr, Bincode::default)
        .await
        .map_err(|e| {
            DaemonError::startup(
                format!("Failed to bind cluster registration listener on {}", bind_addr),
                Some(e),
            )
        })?;
    let local_addr = listener.local_addr();

    let (go, go_rx) = oneshot::channel::<()>();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let task = tokio::spawn(async move {
        if go_rx.await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                accepted = listener.next() => {
                    match accepted {
                        Some(Ok(transport)) => {
                            let peer = transport.peer_addr().ok();
                            let client::NewClient { client, dispatch } =
                                ClusterInvokerClient::new(client::Config::default(), transport);

                            // the dispatch future resolves when the
                            // registration connection goes away
                            let (closed_tx, closed_rx) = oneshot::channel::<()>();
                            tokio::spawn(async move {
                                let _ = dispatch.await;
                                let _ = closed_tx.send(());
                            });

                            let registry = Arc::clone(&registry);
                            let mut conn_shutdown = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                let environment_identifier = match client
                                    .environment_identifier(context::current())
                                    .await
                                {
                                    Ok(id) => id,
                                    Err(e) => {
                                        daemon_log(
                                            "rpc_server",
                                            &format!(
                                                "Cluster registration handshake failed: {}",
                                                e
                                            ),
                                        );
                                        return;
                                    }
                                };
                                let id = registry
                                    .add(client, environment_identifier, peer)
                                    .await;
                                daemon_log(
                                    "rpc_server",
                                    &format!(
                                        "Cluster invoker registered: {} (#{})",
                                        environment_identifier, id
                                    ),
                                );
                                tokio::select! {
                                    _ = closed_rx => {}
                                    _ = conn_shutdown.recv() => {}
                                }
                                registry.remove(id).await;
                                daemon_log(
                                    "rpc_server",
                                    &format!(
                                        "Cluster invoker unregistered: {} (#{})",
                                        environment_identifier, id
                                    ),
                                );
                            });
                        }
                        Some(Err(e)) => {
                            daemon_log("rpc_server", &format!("Registration accept error: {}", e));
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    Ok(ListenerStartup {
        local_addr,
        go,
        task,
    })
}
