//! Registry of client-registered cluster invokers.
//!
//! Remote clients offer their compute capacity by connecting to the daemon's
//! cluster registration listener; each such connection contributes one
//! [`ClusterInvokerClient`] here. Registrations are connection-scoped: the
//! listener removes an entry the moment its connection's dispatch ends, and a
//! periodic ping sweep removes entries whose peer stopped answering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::daemon_log::daemon_log;
use crate::rpc::invoker_service::ClusterInvokerClient;

/// Unique registration id within one daemon.
pub type RegistrationId = u64;

/// One registered client cluster invoker.
#[derive(Clone)]
pub struct RegisteredInvoker {
    pub client: ClusterInvokerClient,
    /// Environment identifier reported by the registering daemon; lets a
    /// coordinator recognize repeat workers across reconnects.
    pub environment_identifier: Uuid,
    pub peer: Option<SocketAddr>,
}

/// Daemon-wide registry aggregating registrations from every connection.
pub struct ClientInvokerRegistry {
    invokers: RwLock<HashMap<RegistrationId, RegisteredInvoker>>,
    next_id: AtomicU64,
}

impl ClientInvokerRegistry {
    pub fn new() -> Self {
        Self {
            invokers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers an invoker. Returns the assigned registration id.
    pub async fn add(
        &self,
        client: ClusterInvokerClient,
        environment_identifier: Uuid,
        peer: Option<SocketAddr>,
    ) -> RegistrationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.invokers.write().await.insert(
            id,
            RegisteredInvoker {
                client,
                environment_identifier,
                peer,
            },
        );
        id
    }

    /// Removes a registration. Returns whether it was present.
    pub async fn remove(&self, id: RegistrationId) -> bool {
        self.invokers.write().await.remove(&id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.invokers.read().await.len()
    }

    /// Environment identifiers of the live registrations.
    pub async fn environment_identifiers(&self) -> Vec<Uuid> {
        self.invokers
            .read()
            .await
            .values()
            .map(|invoker| invoker.environment_identifier)
            .collect()
    }

    /// Snapshot of the live registrations for dispatching work.
    pub async fn invokers(&self) -> Vec<RegisteredInvoker> {
        self.invokers.read().await.values().cloned().collect()
    }

    /// Pings every registration and returns the ids of the unresponsive ones.
    pub async fn ping_all(&self) -> Vec<RegistrationId> {
        let snapshot: Vec<(RegistrationId, ClusterInvokerClient)> = {
            let invokers = self.invokers.read().await;
            invokers
                .iter()
                .map(|(id, invoker)| (*id, invoker.client.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, client) in snapshot {
            match client.ping(tarpc::context::current()).await {
                Ok(true) => {}
                _ => failed.push(id),
            }
        }
        failed
    }

    /// Removes every unresponsive registration; returns how many were removed.
    pub async fn prune_dead(&self) -> usize {
        let failed = self.ping_all().await;
        if failed.is_empty() {
            return 0;
        }
        let mut invokers = self.invokers.write().await;
        let mut removed = 0;
        for id in failed {
            if invokers.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for ClientInvokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection view over the shared registry.
///
/// Every accepted daemon connection gets one; it exposes where invoker
/// registrations for this daemon go and lets the connection inspect them.
#[derive(Clone)]
pub struct DaemonClientServer {
    registry: Arc<ClientInvokerRegistry>,
    cluster_invoker_port: u16,
}

impl DaemonClientServer {
    pub fn new(registry: Arc<ClientInvokerRegistry>, cluster_invoker_port: u16) -> Self {
        Self {
            registry,
            cluster_invoker_port,
        }
    }

    /// Port of the registration listener a client connects to in order to
    /// add its cluster invoker.
    pub fn cluster_invoker_port(&self) -> u16 {
        self.cluster_invoker_port
    }

    pub fn registry(&self) -> &Arc<ClientInvokerRegistry> {
        &self.registry
    }
}

/// Background task periodically pruning unresponsive registrations.
pub async fn run_registry_cleanup(
    registry: Arc<ClientInvokerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    interval: std::time::Duration,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if registry.count().await == 0 {
                    continue;
                }
                let removed = registry.prune_dead().await;
                if removed > 0 {
                    daemon_log(
                        "client_server",
                        &format!(
                            "Cleanup: {} dead cluster invokers removed, {} remaining",
                            removed,
                            registry.count().await
                        ),
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}
