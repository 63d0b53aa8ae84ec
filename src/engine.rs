//! Build environment handle.
//!
//! The build engine proper (compilation, task graph execution, file
//! mirroring, content databases) is an external collaborator; the daemon owns
//! one shared environment per process and amortizes its initialization across
//! builds. The environment carries the stable identifier other daemons use to
//! recognize it and the resource caches for remote connections and project
//! state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::resolve_thread_factor;
use crate::daemon::cache::{ResourceCache, DEFAULT_SWEEP_INTERVAL};
use crate::daemon::connection::{
    ConnectionFactory, DaemonConnectionHandle, RemoteConnectionKey,
};
use crate::daemon::error::DaemonError;
use crate::daemon::project::{PathKey, ProjectCache, ProjectKey};

/// Shared build environment hosted by the daemon.
pub struct BuildEnvironment {
    environment_identifier: Uuid,
    /// Identity of this environment's local file provider; forms the path
    /// keys of local projects.
    file_provider_identifier: Uuid,
    storage_directory: PathBuf,
    thread_factor: usize,
    user_parameters: BTreeMap<String, String>,
    connections: Arc<ResourceCache<RemoteConnectionKey>>,
    projects: Arc<ResourceCache<ProjectKey>>,
}

impl BuildEnvironment {
    /// Creates the environment. Must run inside a tokio runtime; the caches
    /// spawn their sweeper tasks here.
    pub fn new(
        storage_directory: PathBuf,
        thread_factor: usize,
        user_parameters: BTreeMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            environment_identifier: Uuid::new_v4(),
            file_provider_identifier: Uuid::new_v4(),
            storage_directory,
            thread_factor: resolve_thread_factor(thread_factor),
            user_parameters,
            connections: ResourceCache::new(DEFAULT_SWEEP_INTERVAL),
            projects: ResourceCache::new(DEFAULT_SWEEP_INTERVAL),
        })
    }

    /// Stable identifier for the lifetime of this environment.
    pub fn environment_identifier(&self) -> Uuid {
        self.environment_identifier
    }

    pub fn file_provider_identifier(&self) -> Uuid {
        self.file_provider_identifier
    }

    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    /// Resolved worker thread count.
    pub fn thread_factor(&self) -> usize {
        self.thread_factor
    }

    pub fn user_parameters(&self) -> &BTreeMap<String, String> {
        &self.user_parameters
    }

    /// Opens (or reuses) a connection to another daemon.
    ///
    /// The returned handle is close-protected; the underlying connection is
    /// shared and lives until the cache linger expires it.
    pub async fn connect_to(
        &self,
        factory: Arc<dyn ConnectionFactory>,
        address: String,
    ) -> Result<DaemonConnectionHandle, DaemonError> {
        self.connections
            .get(RemoteConnectionKey::new(factory, address))
            .await
    }

    /// Looks up or creates the project cache of a working directory.
    pub async fn get_project(&self, path_key: PathKey) -> Result<Arc<ProjectCache>, DaemonError> {
        self.projects
            .get(ProjectKey {
                path_key,
                storage_directory: self.storage_directory.clone(),
            })
            .await
    }

    /// Path key of a local working directory.
    pub fn local_path_key(&self, working_directory: PathBuf) -> PathKey {
        PathKey {
            file_provider_identifier: self.file_provider_identifier,
            working_directory,
        }
    }

    /// Closes the environment: every cached connection and project is closed.
    pub async fn close(&self) {
        self.connections.close_all().await;
        self.projects.close_all().await;
    }
}

/// Build execution invoker bound to the local environment.
///
/// The actual task graph execution lives in the build engine; this exposes
/// the binding a coordinator needs to schedule work here.
pub struct ExecutionInvoker {
    environment: Arc<BuildEnvironment>,
}

impl ExecutionInvoker {
    pub fn new(environment: Arc<BuildEnvironment>) -> Self {
        Self { environment }
    }

    pub fn environment_identifier(&self) -> Uuid {
        self.environment.environment_identifier()
    }

    /// Number of worker threads an execution on this environment may use.
    pub fn worker_thread_count(&self) -> usize {
        self.environment.thread_factor()
    }
}
