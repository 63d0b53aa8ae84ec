//! Daemon environment lifecycle.
//!
//! The environment is the top-level orchestrator: it owns the shared build
//! environment, the daemon's slot in the storage directory lock file, the RPC
//! listeners, the cluster reconnect loop and the resource caches, and it
//! drives them through the UNSTARTED → STARTED → CLOSED state machine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::{DaemonLaunchParameters, RuntimeLaunchConfiguration, ServerPort};
use crate::daemon::client_server::{run_registry_cleanup, ClientInvokerRegistry};
use crate::daemon::connection::{ConnectionFactory, DaemonConnectionHandle, TcpConnectionFactory};
use crate::daemon::error::DaemonError;
use crate::daemon::project::ProjectCache;
use crate::daemon::reconnect::ClusterReconnector;
use crate::daemon::rpc_server::{
    bind_cluster_registration_listener, bind_daemon_server, ServerContext,
};
#[cfg(target_os = "linux")]
use crate::daemon::slot_lock::{DaemonInstanceSlot, SlotLockFile};
use crate::daemon_log::daemon_log;
use crate::daemon_paths;
use crate::engine::{BuildEnvironment, ExecutionInvoker};

const STATE_UNSTARTED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Interval of the client invoker registry ping sweep.
const REGISTRY_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How long `close` waits for a spawned task to observe the shutdown signal
/// before aborting it.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct StartedState {
    environment: Arc<BuildEnvironment>,
    runtime_configuration: RuntimeLaunchConfiguration,
    registry: Arc<ClientInvokerRegistry>,
    server_addr: Option<SocketAddr>,
    cluster_addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    #[cfg(target_os = "linux")]
    slot: Option<DaemonInstanceSlot>,
}

/// The daemon's top-level environment.
pub struct DaemonEnvironment {
    parameters: DaemonLaunchParameters,
    state: AtomicU8,
    /// Serializes `start` and `close`; they are the only state writers.
    lifecycle: tokio::sync::Mutex<()>,
    started: std::sync::Mutex<Option<StartedState>>,
    connection_factory: Arc<dyn ConnectionFactory>,
}

impl DaemonEnvironment {
    /// Creates an unstarted daemon environment.
    pub fn new(parameters: DaemonLaunchParameters) -> Result<Self, DaemonError> {
        parameters.validate()?;
        Ok(Self {
            parameters,
            state: AtomicU8::new(STATE_UNSTARTED),
            lifecycle: tokio::sync::Mutex::new(()),
            started: std::sync::Mutex::new(None),
            connection_factory: Arc::new(TcpConnectionFactory),
        })
    }

    /// The parameters this daemon was configured with.
    pub fn launch_parameters(&self) -> &DaemonLaunchParameters {
        &self.parameters
    }

    fn require_started(&self) -> Result<(), DaemonError> {
        match self.state.load(Ordering::Acquire) {
            STATE_STARTED => Ok(()),
            STATE_UNSTARTED => Err(DaemonError::configuration("Daemon is not started")),
            _ => Err(DaemonError::configuration("Daemon is closed")),
        }
    }

    /// Starts the daemon.
    ///
    /// With a configured port this acquires a slot in the storage directory
    /// lock file and publishes the bound port inside the slot's data lock, so
    /// an enumerator can never observe a half-initialized daemon. On any
    /// failure the slot is released again before the error propagates.
    pub async fn start(&self) -> Result<(), DaemonError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state.load(Ordering::Acquire) {
            STATE_UNSTARTED => {}
            STATE_STARTED => return Err(DaemonError::configuration("Daemon already started")),
            _ => return Err(DaemonError::configuration("Daemon already closed")),
        }
        self.parameters.validate()?;

        let storage_directory =
            daemon_paths::resolve_storage_directory(self.parameters.storage_directory.as_deref())
                .map_err(|e| {
                    DaemonError::startup(
                        format!("Failed to resolve storage directory: {:#}", e),
                        None,
                    )
                })?;

        match self.parameters.server_port {
            Some(port_config) => self.start_with_server(storage_directory, port_config).await?,
            None => self.start_portless(storage_directory)?,
        }

        self.spawn_reconnectors();

        daemon_log(
            "environment",
            &format!(
                "Daemon started (address {:?})",
                self.server_socket_address().ok().flatten()
            ),
        );
        Ok(())
    }

    fn start_portless(&self, storage_directory: PathBuf) -> Result<(), DaemonError> {
        let shutdown_tx = broadcast::channel(8).0;
        let environment = BuildEnvironment::new(
            storage_directory.clone(),
            self.parameters.thread_factor,
            self.parameters.user_parameters.clone(),
        );
        let runtime_configuration =
            self.runtime_configuration_for(&storage_directory, None, &environment);
        let state = StartedState {
            environment,
            runtime_configuration,
            registry: Arc::new(ClientInvokerRegistry::new()),
            server_addr: None,
            cluster_addr: None,
            shutdown_tx,
            tasks: Vec::new(),
            #[cfg(target_os = "linux")]
            slot: None,
        };
        *self.started.lock().unwrap() = Some(state);
        self.state.store(STATE_STARTED, Ordering::Release);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn start_with_server(
        &self,
        storage_directory: PathBuf,
        port_config: ServerPort,
    ) -> Result<(), DaemonError> {
        let lock_file = SlotLockFile::open(&storage_directory)?;
        let mut slot = lock_file.acquire_slot()?;
        if let Err(e) = slot.lock_data() {
            slot.close();
            return Err(e);
        }

        // everything up to the data unlock runs inside the data lock;
        // enumerators reading this slot block until initialization completes
        let bind_ip: IpAddr = if self.parameters.acts_as_server {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv4Addr::LOCALHOST.into()
        };
        let shutdown_tx = broadcast::channel(8).0;
        let registry = Arc::new(ClientInvokerRegistry::new());

        let cluster_startup = match bind_cluster_registration_listener(
            SocketAddr::new(bind_ip, 0),
            Arc::clone(&registry),
            shutdown_tx.clone(),
        )
        .await
        {
            Ok(startup) => startup,
            Err(e) => {
                slot.close();
                return Err(e);
            }
        };
        let server_startup = match bind_daemon_server(
            SocketAddr::new(bind_ip, port_config.bind_port()),
            shutdown_tx.clone(),
        )
        .await
        {
            Ok(startup) => startup,
            Err(e) => {
                cluster_startup.task.abort();
                slot.close();
                return Err(e);
            }
        };

        let server_addr = server_startup.local_addr;
        let cluster_addr = cluster_startup.local_addr;

        let environment = BuildEnvironment::new(
            storage_directory.clone(),
            self.parameters.thread_factor,
            self.parameters.user_parameters.clone(),
        );
        let runtime_configuration = self.runtime_configuration_for(
            &storage_directory,
            Some(server_addr.port()),
            &environment,
        );
        let context = Arc::new(ServerContext {
            environment: Arc::clone(&environment),
            launch_parameters: self.parameters.clone(),
            runtime_configuration: runtime_configuration.clone(),
            registry: Arc::clone(&registry),
            cluster_invoker_port: cluster_addr.port(),
        });

        if let Err(e) = slot.write_port(server_addr.port()) {
            // dropping the go senders keeps the listeners from ever accepting
            server_startup.task.abort();
            cluster_startup.task.abort();
            environment.close().await;
            slot.close();
            return Err(e);
        }

        let cleanup_task = tokio::spawn(run_registry_cleanup(
            Arc::clone(&registry),
            shutdown_tx.clone(),
            REGISTRY_CLEANUP_INTERVAL,
        ));

        let state = StartedState {
            environment,
            runtime_configuration,
            registry,
            server_addr: Some(server_addr),
            cluster_addr: Some(cluster_addr),
            shutdown_tx,
            tasks: vec![server_startup.task, cluster_startup.task, cleanup_task],
            #[cfg(target_os = "linux")]
            slot: None,
        };
        *self.started.lock().unwrap() = Some(state);
        self.state.store(STATE_STARTED, Ordering::Release);

        // the servers begin accepting only now, with the daemon fully started
        let _ = server_startup.go.send(context);
        let _ = cluster_startup.go.send(());

        if let Err(e) = slot.unlock_data() {
            daemon_log(
                "environment",
                &format!("Failed to release slot data lock: {}", e),
            );
        }
        if let Some(state) = self.started.lock().unwrap().as_mut() {
            state.slot = Some(slot);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn start_with_server(
        &self,
        _storage_directory: PathBuf,
        _port_config: ServerPort,
    ) -> Result<(), DaemonError> {
        Err(DaemonError::configuration(
            "Running a server requires open-file-description byte-range locks, which are only available on Linux",
        ))
    }

    fn runtime_configuration_for(
        &self,
        storage_directory: &Path,
        actual_port: Option<u16>,
        environment: &BuildEnvironment,
    ) -> RuntimeLaunchConfiguration {
        RuntimeLaunchConfiguration {
            storage_directory: storage_directory.to_path_buf(),
            actual_port,
            thread_factor: environment.thread_factor(),
            acts_as_server: self.parameters.acts_as_server,
            acts_as_cluster: self.parameters.acts_as_cluster,
            cluster_mirror_directory: self.parameters.cluster_mirror_directory.clone(),
            user_parameters: self.parameters.user_parameters.clone(),
        }
    }

    /// Spawns one reconnector per configured coordinator address.
    fn spawn_reconnectors(&self) {
        if !self.parameters.acts_as_cluster || self.parameters.connect_to_as_cluster.is_empty() {
            return;
        }
        let mut guard = self.started.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return;
        };
        for address in &self.parameters.connect_to_as_cluster {
            let reconnector = ClusterReconnector::new(
                Arc::clone(&state.environment),
                address.clone(),
                self.parameters.cluster_mirror_directory.clone(),
            );
            let shutdown_rx = state.shutdown_tx.subscribe();
            state.tasks.push(tokio::spawn(reconnector.run(shutdown_rx)));
        }
    }

    /// Closes the daemon. Safe to call repeatedly once started.
    ///
    /// Order: cancel the reconnectors and accept loops, tear down live
    /// connections, close the build environment (which closes every cached
    /// connection and project), then release the slot lock so other
    /// processes observe the slot as free.
    pub async fn close(&self) -> Result<(), DaemonError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state.load(Ordering::Acquire) {
            STATE_STARTED => {}
            STATE_CLOSED => return Ok(()),
            _ => return Err(DaemonError::configuration("Daemon was never started")),
        }
        self.state.store(STATE_CLOSED, Ordering::Release);

        let started = self.started.lock().unwrap().take();
        if let Some(mut state) = started {
            let _ = state.shutdown_tx.send(());
            for task in state.tasks.drain(..) {
                let abort = task.abort_handle();
                if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task)
                    .await
                    .is_err()
                {
                    abort.abort();
                }
            }
            state.environment.close().await;
            #[cfg(target_os = "linux")]
            if let Some(slot) = state.slot.take() {
                slot.close();
            }
        }
        daemon_log("environment", "Daemon closed");
        Ok(())
    }

    /// Address the daemon server is listening on; `None` for a portless
    /// daemon.
    pub fn server_socket_address(&self) -> Result<Option<SocketAddr>, DaemonError> {
        self.require_started()?;
        let guard = self.started.lock().unwrap();
        Ok(guard.as_ref().and_then(|state| state.server_addr))
    }

    /// Address of the cluster registration listener, if a server runs.
    pub fn cluster_registration_address(&self) -> Result<Option<SocketAddr>, DaemonError> {
        self.require_started()?;
        let guard = self.started.lock().unwrap();
        Ok(guard.as_ref().and_then(|state| state.cluster_addr))
    }

    /// Stable identifier of the hosted build environment.
    pub fn environment_identifier(&self) -> Result<Uuid, DaemonError> {
        Ok(self.build_environment()?.environment_identifier())
    }

    /// The effective post-start configuration.
    pub fn runtime_launch_configuration(
        &self,
    ) -> Result<RuntimeLaunchConfiguration, DaemonError> {
        self.require_started()?;
        let guard = self.started.lock().unwrap();
        guard
            .as_ref()
            .map(|state| state.runtime_configuration.clone())
            .ok_or_else(|| DaemonError::configuration("Daemon is not started"))
    }

    /// The hosted build environment.
    pub fn build_environment(&self) -> Result<Arc<BuildEnvironment>, DaemonError> {
        self.require_started()?;
        let guard = self.started.lock().unwrap();
        guard
            .as_ref()
            .map(|state| Arc::clone(&state.environment))
            .ok_or_else(|| DaemonError::configuration("Daemon is not started"))
    }

    /// The build execution invoker bound to the local environment.
    pub fn execution_invoker(&self) -> Result<ExecutionInvoker, DaemonError> {
        Ok(ExecutionInvoker::new(self.build_environment()?))
    }

    /// Registry of client-registered cluster invokers.
    pub fn client_invoker_registry(&self) -> Result<Arc<ClientInvokerRegistry>, DaemonError> {
        self.require_started()?;
        let guard = self.started.lock().unwrap();
        guard
            .as_ref()
            .map(|state| Arc::clone(&state.registry))
            .ok_or_else(|| DaemonError::configuration("Daemon is not started"))
    }

    /// Environment identifiers of the live client cluster invokers.
    pub async fn client_cluster_invokers(&self) -> Result<Vec<Uuid>, DaemonError> {
        let registry = self.client_invoker_registry()?;
        Ok(registry.environment_identifiers().await)
    }

    /// Opens (or reuses) a connection to another daemon.
    ///
    /// The handle is close-protected; closing it does not affect other
    /// callers sharing the underlying cached connection.
    pub async fn connect_to(&self, address: &str) -> Result<DaemonConnectionHandle, DaemonError> {
        let environment = self.build_environment()?;
        environment
            .connect_to(Arc::clone(&self.connection_factory), address.to_string())
            .await
    }

    /// Looks up or creates the project cache of a local working directory.
    pub async fn get_project(
        &self,
        working_directory: PathBuf,
    ) -> Result<Arc<ProjectCache>, DaemonError> {
        let environment = self.build_environment()?;
        let path_key = environment.local_path_key(working_directory);
        environment.get_project(path_key).await
    }
}
