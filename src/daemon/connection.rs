//! Outbound connections to other daemons.
//!
//! Connections obtained through [`crate::engine::BuildEnvironment::connect_to`]
//! are cached and shared between callers; callers only ever receive
//! [`DaemonConnectionHandle`] values whose `close` is a no-op, so an
//! incidental caller cannot tear down a connection someone else is using.
//! The cache's eviction path performs the real close.

use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{client, context};
use uuid::Uuid;

use crate::daemon::cache::ResourceKey;
use crate::daemon::error::DaemonError;
use crate::daemon_log::daemon_log;
use crate::rpc::daemon_service::DaemonServiceClient;
use crate::rpc::PROTOCOL_VERSION;

/// Idle linger of a cached daemon connection.
pub const CONNECTION_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Dial timeout for outbound connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates connected [`RemoteDaemonConnection`] values for an address.
///
/// Cache entries are keyed by factory identity, not equivalence: two distinct
/// factories producing equivalent sockets intentionally get separate entries.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<RemoteDaemonConnection, DaemonError>;
}

/// Plain TCP connection factory.
pub struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, address: &str) -> Result<RemoteDaemonConnection, DaemonError> {
        RemoteDaemonConnection::open(address).await
    }
}

/// An established connection to a remote daemon.
///
/// Owns the RPC client for the remote daemon service. `close` closes the
/// connection but never the remote daemon itself.
pub struct RemoteDaemonConnection {
    address: String,
    client: std::sync::Mutex<Option<DaemonServiceClient>>,
    connected: Arc<AtomicBool>,
    remote_environment_identifier: Uuid,
}

impl RemoteDaemonConnection {
    /// Dials `address` and performs the protocol handshake.
    pub async fn open(address: &str) -> Result<RemoteDaemonConnection, DaemonError> {
        let transport = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tarpc::serde_transport::tcp::connect(address, Bincode::default),
        )
        .await
        .map_err(|_| DaemonError::Connect {
            address: address.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::TimedOut),
        })?
        .map_err(|e| DaemonError::Connect {
            address: address.to_string(),
            source: e,
        })?;

        let client::NewClient { client, dispatch } =
            DaemonServiceClient::new(client::Config::default(), transport);

        // The dispatch future resolves when the connection goes away; that
        // drives the connected flag the cache validates against.
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let dispatch_address = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = dispatch.await {
                daemon_log(
                    "connection",
                    &format!("Connection to {} ended: {}", dispatch_address, e),
                );
            }
            flag.store(false, Ordering::Release);
        });

        let reply = client
            .hello(context::current(), PROTOCOL_VERSION)
            .await
            .map_err(|e| DaemonError::Rpc {
                message: e.to_string(),
            })?
            .map_err(|e| DaemonError::Rpc {
                message: e.to_string(),
            })?;

        Ok(RemoteDaemonConnection {
            address: address.to_string(),
            client: std::sync::Mutex::new(Some(client)),
            connected,
            remote_environment_identifier: reply.environment_identifier,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identifier of the remote daemon's build environment.
    pub fn remote_environment_identifier(&self) -> Uuid {
        self.remote_environment_identifier
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.client.lock().unwrap().is_some()
    }

    /// A client for the remote daemon service, if the connection is open.
    pub fn client(&self) -> Option<DaemonServiceClient> {
        self.client.lock().unwrap().clone()
    }

    /// Closes the connection. The remote daemon keeps running.
    pub fn close(&self) {
        self.client.lock().unwrap().take();
        self.connected.store(false, Ordering::Release);
    }
}

/// Caller-facing handle over a shared cached connection.
///
/// `close` is intentionally a no-op: the connection is shared with other
/// callers and its lifetime is governed by the cache linger.
#[derive(Clone)]
pub struct DaemonConnectionHandle {
    connection: Arc<RemoteDaemonConnection>,
}

impl DaemonConnectionHandle {
    pub fn new(connection: Arc<RemoteDaemonConnection>) -> Self {
        Self { connection }
    }

    /// No-op; the shared connection stays open for other callers.
    pub fn close(&self) {}

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn remote_environment_identifier(&self) -> Uuid {
        self.connection.remote_environment_identifier()
    }

    pub fn client(&self) -> Option<DaemonServiceClient> {
        self.connection.client()
    }

    /// True when both handles wrap the same underlying connection.
    pub fn shares_connection_with(&self, other: &DaemonConnectionHandle) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

/// Probes an address for a live daemon.
///
/// Transient RPC and dial failures are swallowed and reported as "no daemon
/// there"; callers use this to decide whether a daemon needs to be launched.
pub async fn probe(address: &str) -> Option<Uuid> {
    match RemoteDaemonConnection::open(address).await {
        Ok(connection) => {
            let identifier = connection.remote_environment_identifier();
            connection.close();
            Some(identifier)
        }
        Err(_) => None,
    }
}

/// Cache key for outbound daemon connections.
#[derive(Clone)]
pub struct RemoteConnectionKey {
    factory: Arc<dyn ConnectionFactory>,
    address: String,
}

impl std::fmt::Debug for RemoteConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnectionKey")
            .field("address", &self.address)
            .finish()
    }
}

impl RemoteConnectionKey {
    pub fn new(factory: Arc<dyn ConnectionFactory>, address: String) -> Self {
        Self { factory, address }
    }

    fn factory_identity(&self) -> usize {
        Arc::as_ptr(&self.factory) as *const () as usize
    }
}

impl PartialEq for RemoteConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.factory_identity() == other.factory_identity() && self.address == other.address
    }
}

impl Eq for RemoteConnectionKey {}

impl Hash for RemoteConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.factory_identity().hash(state);
        self.address.hash(state);
    }
}

#[async_trait]
impl ResourceKey for RemoteConnectionKey {
    type Resource = RemoteDaemonConnection;
    type Handle = DaemonConnectionHandle;

    async fn allocate(&self) -> Result<RemoteDaemonConnection, DaemonError> {
        self.factory.connect(&self.address).await
    }

    fn generate(&self, resource: &Arc<RemoteDaemonConnection>) -> DaemonConnectionHandle {
        DaemonConnectionHandle::new(Arc::clone(resource))
    }

    fn validate(&self, resource: &RemoteDaemonConnection) -> bool {
        resource.is_connected()
    }

    fn expiry(&self) -> Duration {
        CONNECTION_EXPIRY
    }

    async fn close(&self, resource: Arc<RemoteDaemonConnection>) {
        resource.close();
    }
}
