mod cli;
mod config;
mod daemon;
mod daemon_log;
mod daemon_paths;
mod engine;
mod rpc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use config::{DaemonLaunchParameters, ServerPort};
use daemon::environment::DaemonEnvironment;
use std::path::PathBuf;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    let result = runtime.block_on(async_main());

    // don't wait for lingering background tasks on the way out
    runtime.shutdown_timeout(std::time::Duration::from_millis(100));

    result
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            storage_dir,
            port,
            no_server,
            server,
            cluster,
            connect_cluster,
            cluster_mirror_dir,
            thread_factor,
            user_parameter,
            config,
        } => {
            let mut params = match config {
                Some(path) => DaemonLaunchParameters::load(&path)?,
                None => DaemonLaunchParameters::default(),
            };
            if let Some(dir) = storage_dir {
                params.storage_directory = Some(dir);
            }
            if no_server {
                params.server_port = None;
            } else if let Some(raw) = port {
                params.server_port = Some(ServerPort::from_raw(raw)?);
            }
            if server {
                params.acts_as_server = true;
            }
            if cluster {
                params.acts_as_cluster = true;
            }
            if !connect_cluster.is_empty() {
                params.connect_to_as_cluster = connect_cluster;
            }
            if let Some(dir) = cluster_mirror_dir {
                params.cluster_mirror_directory = Some(dir);
            }
            if thread_factor != 0 {
                params.thread_factor = thread_factor;
            }
            params.user_parameters.extend(user_parameter);

            run_daemon(params).await
        }

        Command::Running { storage_dir } => list_running(storage_dir),

        Command::Ping { address } => match daemon::connection::probe(&address).await {
            Some(identifier) => {
                println!("Daemon at {}: environment {}", address, identifier);
                Ok(())
            }
            None => anyhow::bail!("No daemon reachable at {}", address),
        },
    }
}

async fn run_daemon(params: DaemonLaunchParameters) -> Result<()> {
    let environment = DaemonEnvironment::new(params)?;
    environment.start().await?;

    match environment.server_socket_address()? {
        Some(addr) => println!("Daemon listening on {}", addr),
        None => println!("Daemon running without an RPC server"),
    }
    println!(
        "Environment identifier: {}",
        environment.environment_identifier()?
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&environment.runtime_launch_configuration()?)?
    );

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    environment.close().await?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn list_running(storage_dir: Option<PathBuf>) -> Result<()> {
    let storage = daemon_paths::resolve_storage_directory(storage_dir.as_deref())?;
    let ports = daemon::slot_lock::running_daemon_ports(&storage)?;
    if ports.is_empty() {
        println!("No daemons running in {}", storage.display());
    } else {
        for port in ports {
            println!("{}", port);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn list_running(_storage_dir: Option<PathBuf>) -> Result<()> {
    anyhow::bail!(
        "Enumerating daemons requires open-file-description byte-range locks, which are only available on Linux"
    )
}
