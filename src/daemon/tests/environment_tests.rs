use std::path::PathBuf;

use crate::config::{DaemonLaunchParameters, ServerPort};
use crate::daemon::environment::DaemonEnvironment;
use crate::daemon::error::DaemonError;
use crate::daemon::slot_lock::running_daemon_ports;

fn server_params(storage: &std::path::Path) -> DaemonLaunchParameters {
    DaemonLaunchParameters {
        storage_directory: Some(storage.to_path_buf()),
        server_port: Some(ServerPort::OsAssigned),
        ..Default::default()
    }
}

fn portless_params(storage: &std::path::Path) -> DaemonLaunchParameters {
    DaemonLaunchParameters {
        storage_directory: Some(storage.to_path_buf()),
        server_port: None,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_portless_daemon_lifecycle() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(portless_params(storage.path())).unwrap();

    daemon.start().await.unwrap();
    assert_eq!(daemon.server_socket_address().unwrap(), None);
    assert_eq!(daemon.cluster_registration_address().unwrap(), None);
    let runtime = daemon.runtime_launch_configuration().unwrap();
    assert_eq!(runtime.actual_port, None);
    assert!(runtime.thread_factor >= 1);

    // no server port, no lock file usage
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());

    daemon.environment_identifier().unwrap();
    let invoker = daemon.execution_invoker().unwrap();
    assert_eq!(
        invoker.environment_identifier(),
        daemon.environment_identifier().unwrap()
    );
    assert!(invoker.worker_thread_count() >= 1);

    daemon.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_require_started_state() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(portless_params(storage.path())).unwrap();

    assert!(matches!(
        daemon.environment_identifier(),
        Err(DaemonError::Configuration(_))
    ));
    assert!(matches!(
        daemon.server_socket_address(),
        Err(DaemonError::Configuration(_))
    ));
    assert!(matches!(
        daemon.connect_to("127.0.0.1:3500").await,
        Err(DaemonError::Configuration(_))
    ));
    // closing an unstarted daemon is a configuration error
    assert!(matches!(
        daemon.close().await,
        Err(DaemonError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_state_machine_is_monotonic() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(portless_params(storage.path())).unwrap();

    daemon.start().await.unwrap();
    assert!(matches!(
        daemon.start().await,
        Err(DaemonError::Configuration(_))
    ));

    daemon.close().await.unwrap();
    // close is safe to repeat, start is not
    daemon.close().await.unwrap();
    assert!(matches!(
        daemon.start().await,
        Err(DaemonError::Configuration(_))
    ));
    assert!(matches!(
        daemon.environment_identifier(),
        Err(DaemonError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_server_daemon_publishes_port_until_closed() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(server_params(storage.path())).unwrap();

    daemon.start().await.unwrap();
    let addr = daemon.server_socket_address().unwrap().expect("server address");
    assert!(addr.ip().is_loopback());

    let runtime = daemon.runtime_launch_configuration().unwrap();
    assert_eq!(runtime.actual_port, Some(addr.port()));

    assert_eq!(
        running_daemon_ports(storage.path()).unwrap(),
        vec![addr.port()]
    );

    daemon.close().await.unwrap();
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());
}

#[tokio::test]
#[serial_test::serial]
async fn test_port_conflict_fails_start_and_leaves_first_daemon_running() {
    let storage = tempfile::tempdir().unwrap();
    let first = DaemonEnvironment::new(server_params(storage.path())).unwrap();
    first.start().await.unwrap();
    let port = first.server_socket_address().unwrap().unwrap().port();

    let second = DaemonEnvironment::new(DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        server_port: Some(ServerPort::Fixed(port)),
        ..Default::default()
    })
    .unwrap();

    let err = second.start().await.unwrap_err();
    assert!(matches!(err, DaemonError::Startup { .. }));

    // the failed start released its slot; the first daemon's port is still
    // the only published one
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), vec![port]);

    first.close().await.unwrap();
    assert_eq!(running_daemon_ports(storage.path()).unwrap(), Vec::<u16>::new());
}

#[tokio::test]
async fn test_two_daemons_share_a_storage_directory() {
    let storage = tempfile::tempdir().unwrap();
    let first = DaemonEnvironment::new(server_params(storage.path())).unwrap();
    let second = DaemonEnvironment::new(server_params(storage.path())).unwrap();

    first.start().await.unwrap();
    second.start().await.unwrap();

    let first_port = first.server_socket_address().unwrap().unwrap().port();
    let second_port = second.server_socket_address().unwrap().unwrap().port();
    assert_ne!(
        first.environment_identifier().unwrap(),
        second.environment_identifier().unwrap()
    );

    let mut ports = running_daemon_ports(storage.path()).unwrap();
    ports.sort_unstable();
    let mut expected = vec![first_port, second_port];
    expected.sort_unstable();
    assert_eq!(ports, expected);

    second.close().await.unwrap();
    assert_eq!(
        running_daemon_ports(storage.path()).unwrap(),
        vec![first_port]
    );
    first.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_returns_close_protected_shared_handles() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(server_params(storage.path())).unwrap();
    daemon.start().await.unwrap();
    let addr = daemon.server_socket_address().unwrap().unwrap();
    let address = format!("127.0.0.1:{}", addr.port());

    let first = daemon.connect_to(&address).await.unwrap();
    let second = daemon.connect_to(&address).await.unwrap();

    assert!(first.shares_connection_with(&second));
    assert_eq!(
        first.remote_environment_identifier(),
        daemon.environment_identifier().unwrap()
    );

    // closing handles never tears down the shared cached connection
    first.close();
    second.close();
    assert!(first.is_connected());

    let third = daemon.connect_to(&address).await.unwrap();
    assert!(third.shares_connection_with(&first));

    daemon.close().await.unwrap();
}

#[tokio::test]
async fn test_portless_daemon_still_dials_out() {
    let storage_server = tempfile::tempdir().unwrap();
    let server = DaemonEnvironment::new(server_params(storage_server.path())).unwrap();
    server.start().await.unwrap();
    let addr = server.server_socket_address().unwrap().unwrap();

    let storage_client = tempfile::tempdir().unwrap();
    let client = DaemonEnvironment::new(portless_params(storage_client.path())).unwrap();
    client.start().await.unwrap();

    let handle = client
        .connect_to(&format!("127.0.0.1:{}", addr.port()))
        .await
        .unwrap();
    assert_eq!(
        handle.remote_environment_identifier(),
        server.environment_identifier().unwrap()
    );

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_get_project_is_cached_per_working_directory() {
    let storage = tempfile::tempdir().unwrap();
    let daemon = DaemonEnvironment::new(portless_params(storage.path())).unwrap();
    daemon.start().await.unwrap();

    let first = daemon
        .get_project(PathBuf::from("/work/project"))
        .await
        .unwrap();
    let again = daemon
        .get_project(PathBuf::from("/work/project"))
        .await
        .unwrap();
    let other = daemon
        .get_project(PathBuf::from("/work/other"))
        .await
        .unwrap();

    assert!(std::sync::Arc::ptr_eq(&first, &again));
    assert!(!std::sync::Arc::ptr_eq(&first, &other));

    daemon.close().await.unwrap();
    // closing the daemon closed the cached projects
    assert!(first.is_closed());
    assert!(other.is_closed());
}
