/// Per-invocation isolation context
use crate::kernel::ContainerId;
use std::path::PathBuf;

/// Ephemeral aggregate describing one fully provisioned sandbox.
///
/// Created by the orchestrator, consumed by the launcher, reclaimed
/// through the journal. The journal itself stays with the orchestrator;
/// the context carries only the resolved identities and handles.
#[derive(Clone, Debug)]
pub struct IsolationContext {
    /// Unique invocation tag; container, principal and root directory
    /// names all derive from it.
    pub tag: String,
    /// Name of the principal the payload runs as.
    pub principal_name: String,
    pub uid: u32,
    pub gid: u32,
    /// Private root directory on the host.
    pub root_path: PathBuf,
    /// Confinement handle.
    pub container: ContainerId,
    /// Payload basename; the in-container invocation path is `/<basename>`.
    pub payload_name: String,
}

impl IsolationContext {
    /// Invocation path of the payload as seen from inside the sandbox.
    pub fn payload_path(&self) -> PathBuf {
        PathBuf::from("/").join(&self.payload_name)
    }
}
