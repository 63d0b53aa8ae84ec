use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "anvild")]
#[command(about = "Build daemon hosting a shared build environment")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground until interrupted.
    Start {
        /// Build state storage directory. Defaults to ~/.anvil/daemon.
        #[arg(long)]
        storage_dir: Option<PathBuf>,

        /// Server port. Negative selects the default port, 0 an OS-assigned
        /// one. Defaults to the default port.
        #[arg(long, allow_hyphen_values = true)]
        port: Option<i32>,

        /// Run without an RPC server.
        #[arg(long, conflicts_with = "port")]
        no_server: bool,

        /// Bind on all interfaces instead of loopback only.
        #[arg(long)]
        server: bool,

        /// Accept cluster work and allow outbound coordinator connections.
        #[arg(long)]
        cluster: bool,

        /// Coordinator address to dial and offer this daemon's capacity to.
        /// May be given multiple times.
        #[arg(long = "connect-cluster", value_name = "ADDRESS")]
        connect_cluster: Vec<String>,

        /// Scratch area where cluster executions stage coordinator files.
        #[arg(long, value_name = "DIR")]
        cluster_mirror_dir: Option<PathBuf>,

        /// Worker thread multiplier; 0 uses the machine parallelism.
        #[arg(long, default_value_t = 0)]
        thread_factor: usize,

        /// User parameter forwarded to the build environment, as key=value.
        /// May be given multiple times.
        #[arg(short = 'U', value_name = "KEY=VALUE", value_parser = parse_user_parameter)]
        user_parameter: Vec<(String, String)>,

        /// YAML configuration file; command line flags override its values.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// List the ports of daemons running on a storage directory.
    Running {
        /// Build state storage directory. Defaults to ~/.anvil/daemon.
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Probe an address for a live daemon.
    Ping {
        /// Daemon address as host:port.
        address: String,
    },
}

fn parse_user_parameter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}
