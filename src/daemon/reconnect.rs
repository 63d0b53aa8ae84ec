//! Outbound cluster coordinator connections.
//!
//! For every configured coordinator address the daemon runs one reconnector:
//! it dials the coordinator, registers this daemon as a cluster task invoker
//! on the remote side and keeps reconnecting with bounded backoff until the
//! daemon shuts down.

use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::context;
use tokio::sync::broadcast;

use crate::daemon::connection::RemoteDaemonConnection;
use crate::daemon::error::DaemonError;
use crate::daemon::invoker::{ClusterInvokerFactory, ClusterInvokerServer};
use crate::daemon_log::daemon_log;
use crate::engine::BuildEnvironment;
use crate::rpc::invoker_service::ClusterInvoker;

/// Dial timeout for the registration connection.
const REGISTRATION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff description.
///
/// The delay grows additively after failed attempts up to the cap. A
/// successful connect resets it to the short reset delay, so a connection
/// that breaks right after registering is retried promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub step: Duration,
    pub max_delay: Duration,
    pub reset_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            step: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            reset_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// The delay to use after one more failed attempt at `current`.
    pub fn advance(&self, current: Duration) -> Duration {
        (current + self.step).min(self.max_delay)
    }
}

enum AttemptOutcome {
    /// Registration succeeded; the connection has since closed.
    Served,
    Failed(DaemonError),
    Shutdown,
}

/// One outbound registration loop bound to a coordinator address.
pub struct ClusterReconnector {
    environment: Arc<BuildEnvironment>,
    address: String,
    mirror_base_directory: Option<PathBuf>,
    backoff: BackoffPolicy,
}

impl ClusterReconnector {
    pub fn new(
        environment: Arc<BuildEnvironment>,
        address: String,
        mirror_base_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            environment,
            address,
            mirror_base_directory,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Overrides the backoff description; tests shrink it.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until the shutdown channel fires. Sleeps between attempts wake on
    /// shutdown too.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut delay = self.backoff.initial_delay;
        let mut logged_failure = false;

        loop {
            match self.connect_and_serve(&mut shutdown).await {
                AttemptOutcome::Shutdown => break,
                AttemptOutcome::Served => {
                    daemon_log(
                        "reconnect",
                        &format!("Coordinator {} disconnected, will reconnect", self.address),
                    );
                    delay = self.backoff.reset_delay;
                    logged_failure = false;
                }
                AttemptOutcome::Failed(e) => {
                    if e.is_transient_connect() {
                        // the coordinator is simply not there yet
                    } else if !logged_failure {
                        daemon_log(
                            "reconnect",
                            &format!(
                                "Connection to {} failed: {} (will retry silently)",
                                self.address, e
                            ),
                        );
                        logged_failure = true;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
            delay = self.backoff.advance(delay);
        }

        daemon_log(
            "reconnect",
            &format!("Reconnector for {} exiting", self.address),
        );
    }

    /// One iteration: dial, register, serve invocations until the connection
    /// closes.
    async fn connect_and_serve(&self, shutdown: &mut broadcast::Receiver<()>) -> AttemptOutcome {
        // main-service handshake tells us where registrations go
        let connection = tokio::select! {
            result = RemoteDaemonConnection::open(&self.address) => match result {
                Ok(connection) => connection,
                Err(e) => return AttemptOutcome::Failed(e),
            },
            _ = shutdown.recv() => return AttemptOutcome::Shutdown,
        };

        let Some(client) = connection.client() else {
            return AttemptOutcome::Failed(DaemonError::Rpc {
                message: "Connection closed during handshake".to_string(),
            });
        };
        let port = match client.cluster_invoker_port(context::current()).await {
            Ok(Some(port)) => port,
            Ok(None) => {
                connection.close();
                return AttemptOutcome::Failed(DaemonError::Rpc {
                    message: format!(
                        "Daemon at {} does not accept cluster registrations",
                        self.address
                    ),
                });
            }
            Err(e) => {
                connection.close();
                return AttemptOutcome::Failed(DaemonError::Rpc {
                    message: e.to_string(),
                });
            }
        };
        connection.close();

        let host = self
            .address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.address.as_str());
        let registration_address = format!("{}:{}", host, port);

        let transport = match tokio::time::timeout(
            REGISTRATION_CONNECT_TIMEOUT,
            tarpc::serde_transport::tcp::connect(&registration_address, Bincode::default),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                return AttemptOutcome::Failed(DaemonError::Connect {
                    address: registration_address,
                    source: e,
                })
            }
            Err(_) => {
                return AttemptOutcome::Failed(DaemonError::Connect {
                    address: registration_address,
                    source: std::io::Error::from(std::io::ErrorKind::TimedOut),
                })
            }
        };

        // a fresh factory per connection, with its own resolver registry
        let factory = Arc::new(ClusterInvokerFactory::new(
            Arc::clone(&self.environment),
            self.mirror_base_directory.clone(),
        ));
        let server = ClusterInvokerServer::new(factory);

        daemon_log(
            "reconnect",
            &format!(
                "Registered as cluster invoker at {} (registration port {})",
                self.address, port
            ),
        );

        let channel = server::BaseChannel::with_defaults(transport);
        let serve = channel
            .execute(server.serve())
            .for_each(|response| async {
                tokio::spawn(response);
            });

        tokio::select! {
            _ = serve => AttemptOutcome::Served,
            _ = shutdown.recv() => AttemptOutcome::Shutdown,
        }
    }
}
