//! Cluster invoker factory and task invocation flow.
//!
//! When this daemon offers its capacity to a coordinator, the coordinator
//! answers each execution with an `invoke` call; the factory here binds that
//! call to the right project cache and mirror area, brackets it with the
//! project's cluster start/finish calls and keeps the execution's resolver
//! registered for the duration of the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::daemon::error::DaemonError;
use crate::daemon::project::{PathKey, ProjectCache};
use crate::daemon_log::daemon_log;
use crate::daemon_paths;
use crate::engine::BuildEnvironment;
use crate::rpc::invoker_service::{
    ClusterExecutionContext, ClusterInvocationOutcome, ClusterInvoker,
};
use crate::rpc::{DaemonRpcError, DaemonRpcResult};

/// Deterministic resolver id of an execution's working directory.
///
/// Under this id the connection's resolver registry makes types defined by
/// the remote build visible for deserialization on this side.
pub fn execution_resolver_id(path_key: &PathKey) -> String {
    format!(
        "execclasses:{}:{}",
        path_key.file_provider_identifier,
        path_key.working_directory.display()
    )
}

/// Scope information a registered resolver carries.
#[derive(Debug, Clone)]
pub struct ResolverScope {
    pub path_key: PathKey,
}

/// Connection-scoped registry of execution resolvers.
///
/// Entries live for the duration of one cluster invocation and are always
/// unregistered on its way out, error paths included.
#[derive(Default)]
pub struct ResolverRegistry {
    entries: std::sync::Mutex<HashMap<String, ResolverScope>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver. Returns false when the id is already taken.
    pub fn register(&self, id: String, scope: ResolverScope) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, scope);
        true
    }

    /// Unregisters a resolver. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs one cluster task invocation against a prepared project.
///
/// The task loop itself belongs to the build engine; the invoker binds the
/// engine to the execution's project, mirror area and environment.
pub struct ClusterTaskInvoker {
    environment: Arc<BuildEnvironment>,
    project: Arc<ProjectCache>,
    mirror_directory: Option<PathBuf>,
}

impl ClusterTaskInvoker {
    pub fn new(
        environment: Arc<BuildEnvironment>,
        project: Arc<ProjectCache>,
        mirror_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            environment,
            project,
            mirror_directory,
        }
    }

    pub async fn run(
        &self,
        context: &ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome> {
        if self.project.is_closed() {
            return Err(DaemonRpcError::ProjectClosed);
        }
        Ok(ClusterInvocationOutcome {
            environment_identifier: self.environment.environment_identifier(),
            execution_key: context.execution_key,
            mirror_directory: self.mirror_directory.clone(),
        })
    }
}

/// Per-connection factory producing task invokers for remote executions.
#[derive(Clone)]
pub struct ClusterInvokerFactory {
    environment: Arc<BuildEnvironment>,
    resolvers: Arc<ResolverRegistry>,
    mirror_base_directory: Option<PathBuf>,
}

impl ClusterInvokerFactory {
    /// Creates a factory with a fresh resolver registry, bound to one
    /// connection.
    pub fn new(
        environment: Arc<BuildEnvironment>,
        mirror_base_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            environment,
            resolvers: Arc::new(ResolverRegistry::new()),
            mirror_base_directory,
        }
    }

    /// Identifier of the local environment, exposed so coordinators
    /// recognize repeat workers.
    pub fn environment_identifier(&self) -> Uuid {
        self.environment.environment_identifier()
    }

    pub fn resolvers(&self) -> &Arc<ResolverRegistry> {
        &self.resolvers
    }

    /// Mirror subdirectory assigned to a working directory, if a mirror base
    /// is configured.
    pub fn mirror_directory_for(&self, path_key: &PathKey) -> Option<PathBuf> {
        self.mirror_base_directory
            .as_ref()
            .map(|base| base.join(daemon_paths::mirror_directory_name(path_key)))
    }

    /// Runs one cluster task invocation.
    pub async fn invoke(
        &self,
        context: ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome> {
        let path_key = PathKey {
            file_provider_identifier: context.file_provider_identifier,
            working_directory: context.working_directory.clone(),
        };
        let project = self
            .environment
            .get_project(path_key.clone())
            .await
            .map_err(|e| DaemonRpcError::Internal {
                message: e.to_string(),
            })?;
        let mirror_directory = self.mirror_directory_for(&path_key);

        daemon_log(
            "invoker",
            &format!(
                "Cluster execution starting: {} in {}",
                context.execution_key,
                path_key.working_directory.display()
            ),
        );

        project
            .cluster_starting(&context, mirror_directory.clone())
            .await
            .map_err(|e| match e {
                DaemonError::ClusterStart { message } => DaemonRpcError::ClusterStart { message },
                other => DaemonRpcError::Internal {
                    message: other.to_string(),
                },
            })?;

        let resolver_id = execution_resolver_id(&path_key);
        self.resolvers.register(
            resolver_id.clone(),
            ResolverScope {
                path_key: path_key.clone(),
            },
        );

        let invoker = ClusterTaskInvoker::new(
            Arc::clone(&self.environment),
            Arc::clone(&project),
            mirror_directory,
        );
        let result = invoker.run(&context).await;

        // teardown runs on every exit path
        self.resolvers.unregister(&resolver_id);
        let finished = project.cluster_finished(context.execution_key).await;
        daemon_log(
            "invoker",
            &format!(
                "Cluster execution finished: {} (bracket {})",
                context.execution_key,
                if finished { "closed" } else { "already gone" }
            ),
        );

        result
    }
}

/// Serves [`ClusterInvoker`] over one registration connection.
#[derive(Clone)]
pub struct ClusterInvokerServer {
    factory: Arc<ClusterInvokerFactory>,
}

impl ClusterInvokerServer {
    pub fn new(factory: Arc<ClusterInvokerFactory>) -> Self {
        Self { factory }
    }
}

impl ClusterInvoker for ClusterInvokerServer {
    async fn environment_identifier(self, _: tarpc::context::Context) -> Uuid {
        self.factory.environment_identifier()
    }

    async fn ping(self, _: tarpc::context::Context) -> bool {
        true
    }

    async fn invoke(
        self,
        _: tarpc::context::Context,
        context: ClusterExecutionContext,
    ) -> DaemonRpcResult<ClusterInvocationOutcome> {
        self.factory.invoke(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BuildEnvironment;
    use std::collections::BTreeMap;

    fn test_path_key() -> PathKey {
        PathKey {
            file_provider_identifier: Uuid::new_v4(),
            working_directory: PathBuf::from("/work/project"),
        }
    }

    #[test]
    fn test_resolver_id_format() {
        let key = PathKey {
            file_provider_identifier: Uuid::nil(),
            working_directory: PathBuf::from("/work/project"),
        };
        assert_eq!(
            execution_resolver_id(&key),
            "execclasses:00000000-0000-0000-0000-000000000000:/work/project"
        );
    }

    #[test]
    fn test_resolver_registry_register_unregister() {
        let registry = ResolverRegistry::new();
        let key = test_path_key();
        let id = execution_resolver_id(&key);

        assert!(registry.register(id.clone(), ResolverScope { path_key: key.clone() }));
        assert!(registry.contains(&id));
        // duplicate ids are refused while the first registration is live
        assert!(!registry.register(id.clone(), ResolverScope { path_key: key }));

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_cluster_start_leaves_no_resolver_behind() {
        let storage = tempfile::tempdir().unwrap();
        let environment =
            BuildEnvironment::new(storage.path().to_path_buf(), 0, BTreeMap::new());

        // a plain file where the mirror base should be makes the start
        // bracket fail before anything is registered
        let bogus_base = storage.path().join("mirror-base");
        std::fs::write(&bogus_base, b"not a directory").unwrap();
        let factory = ClusterInvokerFactory::new(Arc::clone(&environment), Some(bogus_base));

        let context = crate::rpc::invoker_service::ClusterExecutionContext {
            execution_key: Uuid::new_v4(),
            file_provider_identifier: Uuid::new_v4(),
            working_directory: storage.path().join("work"),
            path_configuration: Default::default(),
            repository_configuration: Default::default(),
            script_configuration: Default::default(),
            database_configuration: Default::default(),
            user_parameters: BTreeMap::new(),
            coordinator_provider_key: "coordinator".to_string(),
        };

        let err = factory.invoke(context).await.unwrap_err();
        assert!(matches!(err, DaemonRpcError::ClusterStart { .. }));
        assert!(factory.resolvers().is_empty());

        environment.close().await;
    }
}
