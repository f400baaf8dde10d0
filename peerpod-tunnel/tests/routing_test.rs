//! Routing tunnel setup and teardown against throwaway namespaces.
//!
//! The worker host gets a dedicated interface `eth1` (192.168.10.1) wired to
//! the pod VM host (192.168.10.2); the worker pod namespace has the pod
//! interface `eth0` (10.128.0.2).
//!
//! Requires root and the `iptables` binary - run with:
//!   sudo -E cargo test --package peerpod-tunnel --test routing_test --features test-util

use ipnet::Ipv4Net;
use peerpod_netops::test_util::{TestNamespace, is_root, veth_between};
use peerpod_netops::{Ns, RT_TABLE_LOCAL, RouteFilter, Rule};
use peerpod_tunnel::keepalive::{KeepAlive, KeepAliveConfig, Side};
use peerpod_tunnel::tunneler::routing::{
    PodNodeTunneler, VRF1_NAME, VRF2_NAME, VRF2_TABLE_ID, WorkerNodeTunneler,
};
use peerpod_tunnel::{Config, Route, TunnelType, Tunneler};
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const PRIMARY_POD_VM_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
const DEDICATED_POD_VM_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 2);
const POD_IP: Ipv4Addr = Ipv4Addr::new(10, 128, 0, 2);
const POD_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 128, 0, 1);

fn skip() -> bool {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return true;
    }
    if Command::new("iptables").arg("--version").output().is_err() {
        eprintln!("Skipping test: iptables not installed");
        return true;
    }
    false
}

fn test_keepalive() -> Arc<KeepAlive> {
    Arc::new(KeepAlive::new(KeepAliveConfig {
        interval: Duration::from_secs(60),
        ..KeepAliveConfig::default()
    }))
}

fn pod32() -> Ipv4Net {
    Ipv4Net::from(POD_IP)
}

fn tunnel_config() -> Config {
    Config {
        pod_ip: "10.128.0.2/24".parse().unwrap(),
        interface_name: "eth0".to_string(),
        worker_node_ip: "192.168.10.1/24".parse().unwrap(),
        tunnel_type: TunnelType::Routing,
        routes: vec![Route {
            gw: Some(POD_GATEWAY),
            dev: "eth0".to_string(),
            ..Default::default()
        }],
        mtu: 1500,
        dedicated: true,
        ..Default::default()
    }
}

async fn source_rules(ns: &Ns) -> Vec<Rule> {
    ns.rule_list(&Rule {
        src: Some(pod32()),
        iif: Some(VRF1_NAME.to_string()),
        priority: Some(505),
        ..Default::default()
    })
    .await
    .unwrap()
}

/// Worker setup builds the VRFs, veth, routes, rules and keepalive, and
/// teardown removes the per-pod state, twice without error.
#[tokio::test]
async fn test_worker_setup_and_teardown() {
    if skip() {
        return;
    }

    let worker = TestNamespace::create("pprt-worker").unwrap();
    let pod_vm = TestNamespace::create("pprt-podvm").unwrap();
    let pod = TestNamespace::create("pprt-pod").unwrap();
    let client = TestNamespace::create("pprt-client").unwrap();

    veth_between(
        &worker,
        "eth1",
        "192.168.10.1/24".parse().unwrap(),
        &pod_vm,
        "eth1",
        "192.168.10.2/24".parse().unwrap(),
    )
    .await
    .unwrap();
    veth_between(
        &client,
        "eth0",
        "10.128.0.1/24".parse().unwrap(),
        &pod,
        "eth0",
        "10.128.0.2/24".parse().unwrap(),
    )
    .await
    .unwrap();

    let keepalive = test_keepalive();
    let tunneler =
        WorkerNodeTunneler::with_host_namespace(worker.path()).with_keepalive(keepalive.clone());
    let config = tunnel_config();
    let peers = [PRIMARY_POD_VM_IP, DEDICATED_POD_VM_IP];

    tunneler.setup(pod.path(), &peers, &config).await.unwrap();

    let vrf1 = worker.link_find(VRF1_NAME).await.unwrap();
    let vrf2 = worker.link_find(VRF2_NAME).await.unwrap();
    assert_eq!(vrf1.kind(), Some("vrf"));
    assert_eq!(
        worker.link_find("eth1").await.unwrap().master(),
        Some(vrf1.index())
    );

    let veth = worker.link_find("ppveth0").await.unwrap();
    assert_eq!(veth.master(), Some(vrf2.index()));
    assert_eq!(
        veth.hw_addr(),
        pod.link_find("eth0").await.unwrap().hw_addr()
    );
    assert_eq!(veth.addresses().await.unwrap(), vec![pod32()]);
    assert_eq!(pod.link_find("eth1").await.unwrap().kind(), Some("veth"));

    let to_vm = worker
        .route_list(&RouteFilter {
            destination: Some(pod32()),
            table: Some(VRF2_TABLE_ID),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(to_vm.len(), 1);
    assert_eq!(to_vm[0].gateway, Some(DEDICATED_POD_VM_IP));
    assert_eq!(to_vm[0].device.as_deref(), Some("eth1"));

    let rules = source_rules(&worker).await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].table, 50000);
    let back = worker
        .route_list(&RouteFilter {
            table: Some(50000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].gateway, Some(POD_GATEWAY));
    assert_eq!(back[0].device.as_deref(), Some("ppveth0"));

    let local = worker
        .rule_list(&Rule {
            table: RT_TABLE_LOCAL,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].priority, Some(32765));

    assert_eq!(worker.sysctl_get("net/ipv4/ip_forward").unwrap(), "1");
    assert_eq!(
        worker.sysctl_get("net/ipv4/conf/ppveth0/proxy_arp").unwrap(),
        "1"
    );
    assert_eq!(
        worker.sysctl_get("net/ipv4/neigh/ppveth0/proxy_delay").unwrap(),
        "0"
    );

    assert!(keepalive.is_registered(POD_IP, Side::Worker).await);
    assert_eq!(
        keepalive.server_addr().await,
        Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 10345)))
    );

    // A second setup for the same pod fails without touching the first
    assert!(tunneler.setup(pod.path(), &peers, &config).await.is_err());
    assert_eq!(source_rules(&worker).await.len(), 1);
    assert!(keepalive.is_registered(POD_IP, Side::Worker).await);

    tunneler.teardown(pod.path(), "eth1", &config).await.unwrap();

    assert!(pod.link_find("eth1").await.unwrap_err().is_not_found());
    assert!(worker.link_find("ppveth0").await.unwrap_err().is_not_found());
    assert!(source_rules(&worker).await.is_empty());
    assert!(
        worker
            .route_list(&RouteFilter {
                destination: Some(pod32()),
                table: Some(VRF2_TABLE_ID),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty()
    );
    assert!(!keepalive.is_registered(POD_IP, Side::Worker).await);
    assert_eq!(keepalive.server_addr().await, None);

    // Shared VRFs stay for other pods
    assert!(worker.link_find(VRF1_NAME).await.is_ok());

    tunneler.teardown(pod.path(), "eth1", &config).await.unwrap();
}

/// Worker setup refuses shared mode and a missing dedicated peer address.
#[tokio::test]
async fn test_worker_setup_requires_dedicated_peer() {
    let tunneler = WorkerNodeTunneler::new().with_keepalive(test_keepalive());
    let mut config = tunnel_config();

    let err = tunneler
        .setup(
            std::path::Path::new("/run/netns/unused"),
            &[PRIMARY_POD_VM_IP],
            &config,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("secondary pod node IP is not available"));

    config.dedicated = false;
    let err = tunneler
        .setup(
            std::path::Path::new("/run/netns/unused"),
            &[PRIMARY_POD_VM_IP, DEDICATED_POD_VM_IP],
            &config,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("shared subnet is not supported"));
}

/// Pod VM setup links the pod namespace to the host with `veth0`/`eth0`
/// and routes pod traffic by source back to the worker.
#[tokio::test]
async fn test_pod_setup_and_teardown() {
    if skip() {
        return;
    }

    let pod_vm = TestNamespace::create("pprt-vmhost").unwrap();
    let worker = TestNamespace::create("pprt-vmworker").unwrap();
    let pod = TestNamespace::create("pprt-vmpod").unwrap();

    veth_between(
        &pod_vm,
        "eth1",
        "192.168.10.2/24".parse().unwrap(),
        &worker,
        "eth1",
        "192.168.10.1/24".parse().unwrap(),
    )
    .await
    .unwrap();

    let keepalive = test_keepalive();
    let tunneler =
        PodNodeTunneler::with_host_namespace(pod_vm.path()).with_keepalive(keepalive.clone());
    let config = tunnel_config();

    tunneler
        .setup(pod.path(), &[PRIMARY_POD_VM_IP, DEDICATED_POD_VM_IP], &config)
        .await
        .unwrap();

    let eth0 = pod.link_find("eth0").await.unwrap();
    assert_eq!(eth0.kind(), Some("veth"));
    assert_eq!(eth0.mtu(), 1500);
    assert_eq!(
        eth0.addresses().await.unwrap(),
        vec!["10.128.0.2/24".parse::<Ipv4Net>().unwrap()]
    );
    let defaults = pod.default_routes().await.unwrap();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].gateway, Some(POD_GATEWAY));

    let veth0 = pod_vm.link_find("veth0").await.unwrap();
    assert_eq!(
        veth0.addresses().await.unwrap(),
        vec![Ipv4Net::from(POD_GATEWAY)]
    );

    let to_pod = pod_vm
        .route_list(&RouteFilter {
            table: Some(45001),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(to_pod.len(), 1);
    assert_eq!(to_pod[0].destination, Some(pod32()));
    assert_eq!(to_pod[0].device.as_deref(), Some("veth0"));

    let to_worker = pod_vm
        .route_list(&RouteFilter {
            table: Some(45002),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(to_worker.len(), 1);
    assert_eq!(to_worker[0].gateway, Some(Ipv4Addr::new(192, 168, 10, 1)));
    assert_eq!(to_worker[0].device.as_deref(), Some("eth1"));

    let by_source = pod_vm
        .rule_list(&Rule {
            src: Some(pod32()),
            iif: Some("veth0".to_string()),
            priority: Some(505),
            table: 45002,
        })
        .await
        .unwrap();
    assert_eq!(by_source.len(), 1);
    assert_eq!(
        pod_vm.sysctl_get("net/ipv4/conf/veth0/proxy_arp").unwrap(),
        "1"
    );

    assert!(keepalive.is_registered(POD_IP, Side::Pod).await);
    // Pod-side clients never start the server
    assert_eq!(keepalive.server_addr().await, None);

    tunneler.teardown(pod.path(), "eth1", &config).await.unwrap();
    assert!(!keepalive.is_registered(POD_IP, Side::Pod).await);
    tunneler.teardown(pod.path(), "eth1", &config).await.unwrap();
}

/// Pod VM setup needs a default route gateway among the pod routes.
#[tokio::test]
async fn test_pod_setup_without_gateway() {
    if skip() {
        return;
    }

    let pod_vm = TestNamespace::create("pprt-nogw-host").unwrap();
    let worker = TestNamespace::create("pprt-nogw-worker").unwrap();
    let pod = TestNamespace::create("pprt-nogw-pod").unwrap();

    veth_between(
        &pod_vm,
        "eth1",
        "192.168.10.2/24".parse().unwrap(),
        &worker,
        "eth1",
        "192.168.10.1/24".parse().unwrap(),
    )
    .await
    .unwrap();

    let keepalive = test_keepalive();
    let tunneler =
        PodNodeTunneler::with_host_namespace(pod_vm.path()).with_keepalive(keepalive.clone());
    let config = Config {
        routes: Vec::new(),
        ..tunnel_config()
    };

    let err = tunneler
        .setup(pod.path(), &[PRIMARY_POD_VM_IP, DEDICATED_POD_VM_IP], &config)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("no default route gateway is specified"),
        "{err}"
    );
    assert!(!keepalive.is_registered(POD_IP, Side::Pod).await);
}
