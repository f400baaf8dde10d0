//! Namespace lifecycle and run-in-namespace tests.
//!
//! Requires root - run with:
//!   sudo -E cargo test --package peerpod-netops --test ns_test --features test-util

use peerpod_netops::test_util::{TestNamespace, is_root};
use peerpod_netops::{ErrorKind, NetopsError, Ns};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

const THREAD_NS: &str = "/proc/thread-self/ns/net";

fn ns_inode(path: impl AsRef<Path>) -> u64 {
    std::fs::metadata(path).unwrap().ino()
}

/// A created namespace is bind-mounted under /run/netns and removed on delete.
#[tokio::test]
async fn test_create_and_delete() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = Ns::create("ppnetops-lifecycle").unwrap();
    let path = ns.path().to_path_buf();
    assert_eq!(path, Path::new("/run/netns/ppnetops-lifecycle"));
    assert_eq!(ns.name(), Some("ppnetops-lifecycle"));
    assert!(path.exists());
    assert_ne!(ns_inode(&path), ns_inode(THREAD_NS));

    ns.delete().unwrap();
    assert!(!path.exists());
}

/// The closure sees the target namespace and the caller never leaves its own.
#[tokio::test]
async fn test_run_restores_namespace() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppnetops-run").unwrap();
    let before = ns_inode(THREAD_NS);
    let target = ns_inode(ns.path());

    let inside = ns.run(|| Ok(ns_inode(THREAD_NS))).unwrap();
    assert_eq!(inside, target);
    assert_eq!(ns_inode(THREAD_NS), before);

    let failed: Result<(), NetopsError> =
        ns.run(|| Err(NetopsError::Invalid("closure failed".to_string())));
    let err = failed.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(err.to_string().contains("closure failed"));
    assert_eq!(ns_inode(THREAD_NS), before);
}

/// Opening by the legacy /var/run path yields the canonical path.
#[tokio::test]
async fn test_open_rewrites_var_run() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppnetops-open").unwrap();
    let name = ns.name().unwrap().to_string();

    let opened = Ns::open(format!("/var/run/netns/{name}")).unwrap();
    assert_eq!(opened.path(), ns.path());
    assert_eq!(opened.name(), None);
    assert_eq!(ns_inode(opened.path()), ns_inode(ns.path()));
}

/// A clone owns its own handles; closing it leaves the original usable.
#[tokio::test]
async fn test_clone_is_independent() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppnetops-clone").unwrap();
    let clone = ns.try_clone().unwrap();
    assert_eq!(clone.path(), ns.path());
    assert!(clone.delete().is_err());

    let clone = ns.try_clone().unwrap();
    clone.link_find("lo").await.unwrap();
    clone.close();

    ns.link_find("lo").await.unwrap();
}

/// Sysctls are read and written inside the namespace.
#[tokio::test]
async fn test_sysctl_is_namespaced() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppnetops-sysctl").unwrap();
    let host = Ns::open_current().unwrap();
    let host_forward = host.sysctl_get("net.ipv4.ip_forward").unwrap();

    ns.sysctl_set("net.ipv4.ip_forward", "1").unwrap();
    assert_eq!(ns.sysctl_get("net.ipv4.ip_forward").unwrap(), "1");
    assert_eq!(host.sysctl_get("net.ipv4.ip_forward").unwrap(), host_forward);
}
