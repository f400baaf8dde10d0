//! Per-namespace sysctl access through `/proc/sys`.

use crate::error::{Context, NetopsError, Result, io_error};
use crate::ns::Ns;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const PROC_SYS: &str = "/proc/sys";

/// Map a sysctl key to its `/proc/sys` path.
///
/// Keys may use `/` (`net/ipv4/conf/eth0.100/proxy_arp`) or `.`
/// (`net.ipv4.ip_forward`) as separator. The slash form is required for
/// interface names that contain dots.
fn sysctl_path(key: &str) -> Result<PathBuf> {
    let relative = if key.contains('/') {
        key.trim_start_matches('/').to_string()
    } else {
        key.replace('.', "/")
    };

    if relative.is_empty() || relative.split('/').any(|part| part.is_empty() || part == "..") {
        return Err(NetopsError::Invalid(format!("invalid sysctl key {key:?}")));
    }

    Ok(PathBuf::from(PROC_SYS).join(relative))
}

impl Ns {
    pub fn sysctl_get(&self, key: &str) -> Result<String> {
        let path = sysctl_path(key)?;
        self.run(|| {
            fs::read_to_string(&path)
                .map(|value| value.trim().to_string())
                .map_err(io_error)
        })
        .with_context(|| format!("failed to read sysctl {key} on {}", self.path().display()))
    }

    pub fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        let path = sysctl_path(key)?;
        self.run(|| fs::write(&path, value).map_err(io_error))
            .with_context(|| {
                format!("failed to set sysctl {key}={value} on {}", self.path().display())
            })?;

        debug!(key, value, ns = %self.path().display(), "Sysctl set");
        Ok(())
    }
}
