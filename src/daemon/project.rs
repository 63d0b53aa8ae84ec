//! Per-working-directory project caches.
//!
//! A project cache keeps the expensive per-build state (loaded repositories,
//! script providers, mirror handler, content database association) warm
//! between builds of the same working directory. The heavy state itself lives
//! in the build engine; the daemon tracks the cluster execution brackets and
//! the mirror areas it hands out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::daemon::cache::ResourceKey;
use crate::daemon::error::DaemonError;
use crate::rpc::invoker_service::ClusterExecutionContext;

/// Idle linger of a cached project.
pub const PROJECT_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Identity of a working directory: the file provider it lives on plus the
/// path on that provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    pub file_provider_identifier: Uuid,
    pub working_directory: PathBuf,
}

/// State the project tracks for one in-flight cluster execution.
#[derive(Debug, Clone)]
pub struct ClusterExecutionState {
    pub coordinator_provider_key: String,
    pub mirror_directory: Option<PathBuf>,
    pub user_parameters: BTreeMap<String, String>,
}

struct ProjectState {
    cluster_executions: HashMap<Uuid, ClusterExecutionState>,
}

/// Cached per-working-directory project.
pub struct ProjectCache {
    path_key: PathKey,
    state: Mutex<ProjectState>,
    closed: AtomicBool,
    /// Bumped by `reset`; the build engine reloads repositories and the
    /// content database when it observes a new generation.
    generation: AtomicU64,
}

impl ProjectCache {
    pub fn new(path_key: PathKey) -> Self {
        Self {
            path_key,
            state: Mutex::new(ProjectState {
                cluster_executions: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn path_key(&self) -> &PathKey {
        &self.path_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Prepares the project for one cluster execution.
    ///
    /// Creates the mirror directory when one is assigned and records the
    /// execution bracket. Overlapping executions with distinct keys are
    /// supported; reusing an execution key is an error.
    pub async fn cluster_starting(
        &self,
        context: &ClusterExecutionContext,
        mirror_directory: Option<PathBuf>,
    ) -> Result<(), DaemonError> {
        if self.is_closed() {
            return Err(DaemonError::ClusterStart {
                message: format!(
                    "Project cache for {} is closed",
                    self.path_key.working_directory.display()
                ),
            });
        }
        if let Some(mirror) = &mirror_directory {
            std::fs::create_dir_all(mirror).map_err(|e| DaemonError::ClusterStart {
                message: format!(
                    "Failed to create mirror directory {}: {}",
                    mirror.display(),
                    e
                ),
            })?;
        }

        let mut state = self.state.lock().await;
        if state.cluster_executions.contains_key(&context.execution_key) {
            return Err(DaemonError::ClusterStart {
                message: format!("Execution key already active: {}", context.execution_key),
            });
        }
        state.cluster_executions.insert(
            context.execution_key,
            ClusterExecutionState {
                coordinator_provider_key: context.coordinator_provider_key.clone(),
                mirror_directory,
                user_parameters: context.user_parameters.clone(),
            },
        );
        Ok(())
    }

    /// Ends a cluster execution bracket. Returns whether the key was active.
    pub async fn cluster_finished(&self, execution_key: Uuid) -> bool {
        let mut state = self.state.lock().await;
        state.cluster_executions.remove(&execution_key).is_some()
    }

    pub async fn active_cluster_executions(&self) -> usize {
        self.state.lock().await.cluster_executions.len()
    }

    /// Drops cached build state so the next use starts from a clean slate.
    /// Active cluster executions are unaffected.
    pub async fn clean(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops cached build state and the content database association.
    pub async fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Closes the project. Pending cluster brackets are discarded.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        state.cluster_executions.clear();
    }
}

/// Cache key for project caches.
///
/// Equality and hashing use only the path key; the storage directory is
/// transient context for allocation.
#[derive(Clone)]
pub struct ProjectKey {
    pub path_key: PathKey,
    pub storage_directory: PathBuf,
}

impl PartialEq for ProjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.path_key == other.path_key
    }
}

impl Eq for ProjectKey {}

impl std::hash::Hash for ProjectKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path_key.hash(state);
    }
}

#[async_trait]
impl ResourceKey for ProjectKey {
    type Resource = ProjectCache;
    type Handle = Arc<ProjectCache>;

    async fn allocate(&self) -> Result<ProjectCache, DaemonError> {
        Ok(ProjectCache::new(self.path_key.clone()))
    }

    fn generate(&self, resource: &Arc<ProjectCache>) -> Arc<ProjectCache> {
        Arc::clone(resource)
    }

    fn validate(&self, resource: &ProjectCache) -> bool {
        !resource.is_closed()
    }

    fn expiry(&self) -> Duration {
        PROJECT_EXPIRY
    }

    async fn close(&self, resource: Arc<ProjectCache>) {
        resource.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(execution_key: Uuid) -> ClusterExecutionContext {
        ClusterExecutionContext {
            execution_key,
            file_provider_identifier: Uuid::new_v4(),
            working_directory: PathBuf::from("/work/project"),
            path_configuration: Default::default(),
            repository_configuration: Default::default(),
            script_configuration: Default::default(),
            database_configuration: Default::default(),
            user_parameters: BTreeMap::new(),
            coordinator_provider_key: "coordinator".to_string(),
        }
    }

    fn test_project() -> ProjectCache {
        ProjectCache::new(PathKey {
            file_provider_identifier: Uuid::new_v4(),
            working_directory: PathBuf::from("/work/project"),
        })
    }

    #[tokio::test]
    async fn test_overlapping_executions_with_distinct_keys() {
        let project = test_project();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        project
            .cluster_starting(&test_context(first), None)
            .await
            .unwrap();
        project
            .cluster_starting(&test_context(second), None)
            .await
            .unwrap();
        assert_eq!(project.active_cluster_executions().await, 2);

        assert!(project.cluster_finished(first).await);
        assert!(project.cluster_finished(second).await);
        // finishing again reports the bracket as gone
        assert!(!project.cluster_finished(second).await);
        assert_eq!(project.active_cluster_executions().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_execution_key_rejected() {
        let project = test_project();
        let key = Uuid::new_v4();

        project
            .cluster_starting(&test_context(key), None)
            .await
            .unwrap();
        let err = project
            .cluster_starting(&test_context(key), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::ClusterStart { .. }));
    }

    #[tokio::test]
    async fn test_closed_project_rejects_cluster_start() {
        let project = test_project();
        project.close().await;
        assert!(project.is_closed());

        let err = project
            .cluster_starting(&test_context(Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::ClusterStart { .. }));
    }

    #[tokio::test]
    async fn test_cluster_starting_creates_mirror_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror").join("abc123");
        let project = test_project();

        project
            .cluster_starting(&test_context(Uuid::new_v4()), Some(mirror.clone()))
            .await
            .unwrap();
        assert!(mirror.is_dir());
    }

    #[tokio::test]
    async fn test_reset_bumps_generation() {
        let project = test_project();
        let before = project.generation();
        project.reset().await;
        project.clean().await;
        assert_eq!(project.generation(), before + 2);
    }
}
