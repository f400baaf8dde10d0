//! Test utilities for peerpod-netops integration tests.
//!
//! Provides throwaway named namespaces and a veth helper for wiring two of
//! them together.

use crate::{LinkKind, Ns, Result};
use ipnet::Ipv4Net;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::ops::Deref;

/// Whether the process can create namespaces and links.
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Named namespace under `/run/netns` that is deleted on drop.
#[derive(Debug)]
pub struct TestNamespace {
    ns: Option<Ns>,
}

impl TestNamespace {
    /// Create `/run/netns/<prefix>-<random>`.
    pub fn create(prefix: &str) -> Result<Self> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();

        let ns = Ns::create(&format!("{prefix}-{suffix}"))?;
        Ok(Self { ns: Some(ns) })
    }

    /// Bring up `lo` so local sockets work.
    pub async fn with_loopback(self) -> Result<Self> {
        self.link_find("lo").await?.set_up().await?;
        Ok(self)
    }
}

impl Deref for TestNamespace {
    type Target = Ns;

    fn deref(&self) -> &Ns {
        // Only taken in drop
        self.ns.as_ref().expect("namespace already deleted")
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        if let Some(ns) = self.ns.take() {
            let path = ns.path().to_path_buf();
            if let Err(e) = ns.delete() {
                eprintln!("failed to delete test namespace {}: {e}", path.display());
            }
        }
    }
}

/// Connect `a` and `b` with a veth pair, address both ends and bring them up.
pub async fn veth_between(
    a: &Ns,
    a_name: &str,
    a_addr: Ipv4Net,
    b: &Ns,
    b_name: &str,
    b_addr: Ipv4Net,
) -> Result<()> {
    let a_link = a
        .link_add(
            a_name,
            LinkKind::Veth {
                peer_name: b_name.to_string(),
                peer_ns: Some(b),
            },
        )
        .await?;
    a_link.add_address(a_addr).await?;
    a_link.set_up().await?;

    let b_link = b.link_find(b_name).await?;
    b_link.add_address(b_addr).await?;
    b_link.set_up().await?;
    Ok(())
}
