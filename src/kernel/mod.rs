//! Host primitives: narrow, mockable wrappers over the OS calls the
//! orchestrator provisions with.
//!
//! Everything here is synchronous and may block on the kernel. Fatal
//! failures carry the primitive name and the underlying cause; the
//! best-effort operations (`principal_destroy`, `unmount`,
//! `dir_remove_recursive`, `container_destroy`) never fail the caller.

pub mod mock;
pub mod unix;

use crate::types::Result;
use std::path::{Path, PathBuf};

pub use mock::MockHost;
pub use unix::UnixHost;

/// Access mode for bind mounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Network stance of a confinement container. The only mode the host
/// primitive offers today is inheriting the host stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkMode {
    InheritHost,
}

/// Resource-accounting metric selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountingMetric {
    Memory,
    Processes,
    OpenFiles,
    CpuPercent,
}

impl AccountingMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountingMetric::Memory => "memory",
            AccountingMetric::Processes => "processes",
            AccountingMetric::OpenFiles => "open_files",
            AccountingMetric::CpuPercent => "cpu_percent",
        }
    }
}

/// Parameters for container creation.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub root: PathBuf,
    pub network_mode: NetworkMode,
    pub ipc_allowed: bool,
    pub raw_sockets_allowed: bool,
    pub af_sockets_allowed: bool,
}

/// Opaque confinement handle returned by `container_create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerId {
    name: String,
    root: PathBuf,
}

impl ContainerId {
    pub(crate) fn new(name: String, root: PathBuf) -> Self {
        Self { name, root }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// The host-primitive surface consumed by the orchestrator.
///
/// One implementation talks to the real kernel (`UnixHost`); the mock
/// records calls for pipeline tests. All operations are synchronous.
pub trait HostPrimitives {
    /// Resolve an existing principal to its `(uid, gid)` pair.
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>>;

    /// Create a per-invocation principal. Idempotent: an existing
    /// principal with `name` is returned unmodified.
    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32)>;

    /// Remove an ephemeral principal. Best-effort.
    fn principal_destroy(&self, name: &str);

    /// Replace any previous directory at `path` with a fresh 0755 one.
    fn root_dir_create(&self, path: &Path) -> Result<()>;

    /// Bind `source` onto `target` with the given access mode.
    fn bind_mount(&self, source: &Path, target: &Path, mode: MountMode) -> Result<()>;

    /// Mount a device-node filesystem at `target` providing at minimum
    /// stdin/stdout/stderr/null.
    fn overlay_mount_dev(&self, target: &Path) -> Result<()>;

    /// Unmount `target`. Best-effort.
    fn unmount(&self, target: &Path);

    /// Remove a directory tree. Best-effort.
    fn dir_remove_recursive(&self, path: &Path);

    /// Create the confinement container described by `spec`.
    fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Move the current process into the container. Subsequent
    /// filesystem references resolve inside the sandbox.
    fn container_attach(&self, id: &ContainerId) -> Result<()>;

    /// Tear the container down. Best-effort.
    fn container_destroy(&self, id: &ContainerId);

    /// Install one resource-accounting rule for the named container.
    fn accounting_add_rule(
        &self,
        container: &str,
        metric: AccountingMetric,
        limit: u64,
    ) -> Result<()>;

    /// Drop to the given credentials, gid first. Atomic from the
    /// caller's perspective: either both ids change or neither does.
    fn credential_switch(&self, uid: u32, gid: u32) -> Result<()>;

    /// Write a file with the given mode (passwd/group stubs, payload copy).
    fn file_write(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<()>;
}

/// System page size; the smallest meaningful memory limit.
pub fn page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) reads a static configuration value.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
