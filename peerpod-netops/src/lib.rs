//! peerpod-netops: typed network namespace operations.
//!
//! Every operation is issued through the netlink socket owned by an [`Ns`],
//! so it lands in that namespace regardless of where the calling thread is.
//!
//! ```text
//! Ns ──┬── links      veth / vrf / vxlan / bridge, up, master, netns, mac, mtu
//!      ├── addresses  add (idempotent), list
//!      ├── routes     add, add onlink, delete by filter, list, detect pod ip
//!      ├── rules      add, delete, list, available table id
//!      ├── tc         ingress qdisc + mirred redirect
//!      └── run        closure on a thread inside the namespace (sysctl, iptables, sockets)
//! ```

mod addr;
pub mod error;
pub mod link;
pub mod mac;
pub mod ns;
pub mod route;
pub mod rule;
pub mod sysctl;
pub mod tc;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use error::{Context, ErrorKind, NetopsError, Result, io_error};
pub use link::{Link, LinkKind};
pub use mac::MacAddr;
pub use ns::{NETNS_RUN_DIR, Ns};
pub use route::{
    RT_TABLE_LOCAL, RT_TABLE_MAIN, Route, RouteFilter, RouteProtocol, RouteScope, RouteType,
};
pub use rule::Rule;
