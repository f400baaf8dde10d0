//! Network namespace handles.
//!
//! An [`Ns`] owns two kernel objects: a file descriptor referring to the
//! namespace and a netlink socket that was created while inside it. Every
//! netlink request issued through the handle therefore lands in that
//! namespace, no matter which namespace the calling thread happens to be in.
//!
//! Entering a namespace is confined to [`Ns::run`], which executes a
//! synchronous closure on a dedicated OS thread. That thread saves its
//! namespace, switches, runs the closure and switches back; it is then
//! discarded, so a runtime worker thread never observes a foreign namespace.

use crate::error::{Context, NetopsError, Result, io_error};
use futures::StreamExt;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
    NetlinkPayload,
};
use netlink_packet_route::RouteNetlinkMessage;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use rtnetlink::Handle;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Directory holding bind mounts of named namespaces.
pub const NETNS_RUN_DIR: &str = "/run/netns";

/// Legacy location of [`NETNS_RUN_DIR`].
const NETNS_VAR_RUN_DIR: &str = "/var/run/netns";

/// Namespace of the calling thread.
const THREAD_NS_PATH: &str = "/proc/thread-self/ns/net";

/// Handle to a network namespace.
pub struct Ns {
    name: Option<String>,
    path: PathBuf,
    fd: OwnedFd,
    handle: Handle,
    connection: JoinHandle<()>,
}

impl fmt::Debug for Ns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ns")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl Ns {
    /// Open an existing namespace bind-mounted under `/run/netns`.
    ///
    /// Paths under `/var/run/netns` are rewritten to their `/run/netns`
    /// equivalent. Any other path is rejected.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = canonical_path(path.as_ref())?;

        let file = File::open(&path)
            .map_err(io_error)
            .with_context(|| format!("failed to open network namespace {}", path.display()))?;

        Self::from_fd(None, path, file.into())
    }

    /// Open the namespace of the calling thread.
    pub fn open_current() -> Result<Self> {
        let task = fs::read_link("/proc/thread-self")
            .map_err(io_error)
            .context("failed to resolve /proc/thread-self")?;
        let path = Path::new("/proc").join(task).join("ns/net");

        let file = File::open(THREAD_NS_PATH)
            .map_err(io_error)
            .context("failed to open the current network namespace")?;

        Self::from_fd(None, path, file.into())
    }

    /// Create a new namespace and bind-mount it at `/run/netns/<name>`.
    pub fn create(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(NetopsError::Invalid(format!(
                "invalid network namespace name {name:?}"
            )));
        }

        fs::create_dir_all(NETNS_RUN_DIR)
            .map_err(io_error)
            .with_context(|| format!("failed to create {NETNS_RUN_DIR}"))?;

        let path = Path::new(NETNS_RUN_DIR).join(name);

        // Mount point for the bind mount
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_error)
            .with_context(|| format!("failed to create {}", path.display()))?;

        let target = path.clone();
        let created = on_dedicated_thread(move || {
            switch_and_run(
                || nix::sched::unshare(CloneFlags::CLONE_NEWNET).map_err(NetopsError::from),
                "a new network namespace",
                || {
                    nix::mount::mount(
                        Some(THREAD_NS_PATH),
                        &target,
                        None::<&str>,
                        MsFlags::MS_BIND,
                        None::<&str>,
                    )
                    .map_err(NetopsError::from)
                    .with_context(|| format!("failed to bind mount {}", target.display()))
                },
            )
        });

        if let Err(e) = created {
            let _ = fs::remove_file(&path);
            return Err(e.context(format!("failed to create network namespace {name}")));
        }

        let file = File::open(&path)
            .map_err(io_error)
            .with_context(|| format!("failed to open network namespace {}", path.display()))?;

        info!(name, path = %path.display(), "Network namespace created");

        Self::from_fd(Some(name.to_string()), path, file.into())
    }

    /// Open an independent handle to the same namespace.
    ///
    /// The clone gets its own kernel handle and its own netlink socket; it
    /// shares only the path and never owns the bind mount.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(io_error)
            .with_context(|| format!("failed to clone handle of {}", self.path.display()))?;

        Self::from_fd(None, self.path.clone(), fd)
    }

    fn from_fd(name: Option<String>, path: PathBuf, fd: OwnedFd) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            NetopsError::Invalid(format!("netlink handles require a tokio runtime: {e}"))
        })?;

        let (connection, handle, _) = in_namespace(fd.as_fd(), &path, || {
            let _guard = runtime.enter();
            rtnetlink::new_connection().map_err(io_error)
        })
        .with_context(|| format!("failed to open netlink socket in {}", path.display()))?;

        let connection = tokio::spawn(connection);

        debug!(path = %path.display(), "Network namespace opened");

        Ok(Self {
            name,
            path,
            fd,
            handle,
            connection,
        })
    }

    /// Symbolic name, present only for namespaces created by this process.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Run `f` with a thread that is inside this namespace.
    ///
    /// `f` must not suspend or spawn background work: it runs on a
    /// short-lived OS thread that is discarded once it returns.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        in_namespace(self.fd.as_fd(), &self.path, f)
    }

    /// Release the kernel handle and the netlink socket.
    pub fn close(self) {
        debug!(path = %self.path.display(), "Network namespace closed");
    }

    /// Close the handle and remove the bind mount of a namespace created by
    /// [`Ns::create`].
    pub fn delete(self) -> Result<()> {
        let Some(name) = self.name.clone() else {
            return Err(NetopsError::Invalid(format!(
                "network namespace {} was not created by this process",
                self.path.display()
            )));
        };
        let path = self.path.clone();
        drop(self);

        nix::mount::umount2(&path, MntFlags::MNT_DETACH)
            .map_err(NetopsError::from)
            .with_context(|| format!("failed to unmount {}", path.display()))?;

        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove namespace mount point");
        }

        info!(name, path = %path.display(), "Network namespace deleted");
        Ok(())
    }

    /// Send a request that expects only an acknowledgement.
    pub(crate) async fn nl_ack(&self, message: RouteNetlinkMessage) -> Result<()> {
        self.nl_request(message, NLM_F_REQUEST | NLM_F_ACK).await?;
        Ok(())
    }

    /// Send a request that creates a new object, failing if it exists.
    pub(crate) async fn nl_new(&self, message: RouteNetlinkMessage) -> Result<()> {
        self.nl_request(message, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
            .await?;
        Ok(())
    }

    /// Send a dump request and collect every message of the reply.
    pub(crate) async fn nl_dump(
        &self,
        message: RouteNetlinkMessage,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        self.nl_request(message, NLM_F_REQUEST | NLM_F_DUMP).await
    }

    async fn nl_request(
        &self,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        let mut request = NetlinkMessage::from(message);
        request.header.flags = flags;

        let mut handle = self.handle.clone();
        let mut response = handle.request(request)?;

        let mut replies = Vec::new();
        while let Some(message) = response.next().await {
            match message.payload {
                NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(rtnetlink::Error::NetlinkError(err).into());
                }
                _ => {}
            }
        }
        Ok(replies)
    }
}

impl Drop for Ns {
    fn drop(&mut self) {
        // Dropping the connection task closes the netlink socket; the
        // namespace fd is closed by OwnedFd.
        self.connection.abort();
    }
}

/// Map `/var/run/netns/x` to `/run/netns/x` and reject anything else
/// outside `/run/netns`.
pub fn canonical_path(path: &Path) -> Result<PathBuf> {
    let name = if let Ok(rest) = path.strip_prefix(NETNS_RUN_DIR) {
        rest
    } else if let Ok(rest) = path.strip_prefix(NETNS_VAR_RUN_DIR) {
        rest
    } else {
        return Err(NetopsError::UnsupportedPath(path.to_path_buf()));
    };

    if name.as_os_str().is_empty() {
        return Err(NetopsError::UnsupportedPath(path.to_path_buf()));
    }

    Ok(Path::new(NETNS_RUN_DIR).join(name))
}

fn in_namespace<F, T>(target: BorrowedFd<'_>, path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let desc = path.display().to_string();
    on_dedicated_thread(move || {
        switch_and_run(
            || nix::sched::setns(target, CloneFlags::CLONE_NEWNET).map_err(NetopsError::from),
            &desc,
            f,
        )
    })
}

/// Run `f` on a fresh OS thread and wait for it.
///
/// The thread is never handed back to a pool, so a failed namespace restore
/// ends with the thread.
fn on_dedicated_thread<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("netns".to_string())
            .spawn_scoped(scope, f)
            .map_err(io_error)
            .context("failed to spawn namespace thread")?;

        worker.join().map_err(|_| {
            NetopsError::Invalid("namespace thread panicked".to_string())
        })?
    })
}

/// Save the thread's namespace, switch with `enter`, run `f`, switch back.
fn switch_and_run<E, F, T>(enter: E, desc: &str, f: F) -> Result<T>
where
    E: FnOnce() -> Result<()>,
    F: FnOnce() -> Result<T>,
{
    let saved = File::open(THREAD_NS_PATH)
        .map_err(io_error)
        .context("failed to save the current network namespace")?;

    enter().with_context(|| format!("failed to enter {desc}"))?;

    let result = f();

    match nix::sched::setns(saved.as_fd(), CloneFlags::CLONE_NEWNET) {
        Ok(()) => result,
        Err(errno) => {
            let restore = NetopsError::from(errno)
                .context(format!("failed to restore network namespace after entering {desc}"));
            match result {
                Ok(_) => Err(restore),
                Err(inner) => Err(inner.context(restore.to_string())),
            }
        }
    }
}
