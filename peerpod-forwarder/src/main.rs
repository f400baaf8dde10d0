use anyhow::Context;
use clap::Parser;
use peerpod_forwarder::daemon::{
    DEFAULT_CONFIG_PATH, DEFAULT_KATA_AGENT_SOCKET, DEFAULT_LISTEN_ADDR, Daemon, DaemonConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-protocol-forwarder")]
#[command(about = "Forwards the kata agent protocol from the worker into the pod VM")]
struct Args {
    /// Path to the daemon config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Kata agent socket; a leading `@` denotes an abstract socket
    #[arg(long, default_value = DEFAULT_KATA_AGENT_SOCKET)]
    kata_agent_socket: String,

    /// Network namespace the kata agent runs in
    #[arg(long)]
    kata_agent_namespace: Option<PathBuf>,

    /// Network interface used for tunnel traffic
    #[arg(long)]
    host_interface: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("peerpod_forwarder=info".parse()?)
                .add_directive("peerpod_tunnel=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = DaemonConfig::load(&args.config)?;
    info!(
        pod_namespace = config.pod_namespace,
        pod_name = config.pod_name,
        config = %args.config.display(),
        "Starting agent-protocol-forwarder"
    );

    let daemon = Daemon::new(
        &config,
        args.listen,
        &args.kata_agent_socket,
        args.kata_agent_namespace,
        args.host_interface,
    );

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;

    daemon
        .run(async {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
        })
        .await
        .context("agent-protocol-forwarder failed")?;

    info!("agent-protocol-forwarder stopped");
    Ok(())
}
