//! Pod VM daemon: pod network setup plus the agent protocol forwarder.

use crate::error::{ForwarderError, Result};
use crate::forwarder::Forwarder;
use peerpod_tunnel::{Config as TunnelConfig, PodNode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/peerpod/daemon.json";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:15150";
pub const DEFAULT_KATA_AGENT_SOCKET: &str = "@/run/kata-containers/agent.sock";

/// Contents of the daemon config file written when the pod VM is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_network: Option<TunnelConfig>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|source| ForwarderError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ForwarderError::ConfigDecode {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub struct Daemon {
    listen_addr: SocketAddr,
    forwarder: Forwarder,
    pod_node: Option<PodNode>,
}

impl Daemon {
    /// `agent_ns` is the network namespace the kata agent listens in; the
    /// pod network is set up there when the config carries one.
    pub fn new(
        config: &DaemonConfig,
        listen_addr: SocketAddr,
        agent_socket: &str,
        agent_ns: Option<PathBuf>,
        host_interface: Option<String>,
    ) -> Self {
        let pod_node = match (&config.pod_network, &agent_ns) {
            (Some(network), Some(ns_path)) => Some(PodNode::new(
                ns_path.clone(),
                host_interface,
                network.clone(),
            )),
            (Some(_), None) => {
                warn!("Pod network config present but no agent namespace given, skipping network setup");
                None
            }
            (None, _) => None,
        };

        Self {
            listen_addr,
            forwarder: Forwarder::new(agent_socket, agent_ns),
            pod_node,
        }
    }

    /// Set up the pod network, then forward until `shutdown` completes or
    /// the forwarder fails. The pod network is torn down on the way out.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if let Some(pod_node) = &self.pod_node {
            pod_node.setup().await?;
        }

        let result = self.serve(shutdown).await;

        if let Some(pod_node) = &self.pod_node
            && let Err(e) = pod_node.teardown().await
        {
            error!(error = %e, "Failed to tear down pod network");
        }
        result
    }

    async fn serve(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| ForwarderError::Bind {
                addr: self.listen_addr,
                source,
            })?;
        info!(addr = %self.listen_addr, "Listening for agent protocol connections");

        let start = self.forwarder.start(listener);
        tokio::pin!(start);

        tokio::select! {
            result = &mut start => result,
            _ = shutdown => {
                info!("Shutting down agent protocol forwarder");
                let (result, ()) = tokio::join!(&mut start, self.forwarder.shutdown());
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "pod-namespace": "default",
                "pod-name": "nginx",
                "pod-network": {{
                    "podip": "10.128.0.2/24",
                    "interface": "eth0",
                    "worker-node-ip": "192.168.0.1/24",
                    "tunnel-type": "vxlan",
                    "routes": [{{"dst": "0.0.0.0/0", "gw": "10.128.0.1", "dev": "eth0"}}],
                    "mtu": 1500,
                    "vxlan-port": 4789,
                    "vxlan-id": 555001
                }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.pod_namespace, "default");
        assert_eq!(config.pod_name, "nginx");
        let network = config.pod_network.unwrap();
        assert_eq!(network.pod_ip, "10.128.0.2/24".parse().unwrap());
        assert_eq!(network.vxlan_id, Some(555001));
        assert_eq!(network.default_gateway(), Some("10.128.0.1".parse().unwrap()));
    }

    #[test]
    fn test_load_config_without_network() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pod-namespace": "default", "pod-name": "nginx"}}"#).unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.pod_network, None);
    }

    #[test]
    fn test_load_missing_config() {
        let err = DaemonConfig::load(Path::new("/nonexistent/daemon.json")).unwrap_err();
        assert!(matches!(err, ForwarderError::Config { .. }));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let daemon = Daemon::new(
            &DaemonConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "/nonexistent/agent.sock",
            None,
            None,
        );
        daemon.run(async {}).await.unwrap();
    }
}
