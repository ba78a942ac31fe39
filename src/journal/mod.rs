//! Transaction journal: append-only record of acquired resources with
//! guaranteed reverse-order release.
//!
//! The orchestrator records every acquisition immediately after it
//! succeeds. Rollback walks the entries in strict LIFO order and maps
//! each kind onto the matching host release primitive; a failed release
//! is logged and rollback continues. Rollback is idempotent.

use crate::kernel::{AccountingMetric, ContainerId, HostPrimitives};
use log::debug;
use std::path::PathBuf;

/// One acquired resource, in the order kinds may appear in a journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    PrincipalCreated(String),
    RootDirCreated(PathBuf),
    WorkspaceMounted(PathBuf),
    BindMounted(PathBuf),
    DevMounted(PathBuf),
    ContainerCreated(ContainerId),
    AccountingRuleAdded {
        container: String,
        metric: AccountingMetric,
    },
}

impl JournalEntry {
    /// Stable name for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            JournalEntry::PrincipalCreated(_) => "PrincipalCreated",
            JournalEntry::RootDirCreated(_) => "RootDirCreated",
            JournalEntry::WorkspaceMounted(_) => "WorkspaceMounted",
            JournalEntry::BindMounted(_) => "BindMounted",
            JournalEntry::DevMounted(_) => "DevMounted",
            JournalEntry::ContainerCreated(_) => "ContainerCreated",
            JournalEntry::AccountingRuleAdded { .. } => "AccountingRuleAdded",
        }
    }
}

/// Ordered acquisition log owned by the orchestrator for the lifetime
/// of one invocation.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    rolled_back: bool,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. No deduplication.
    pub fn record(&mut self, entry: JournalEntry) {
        debug!("journal: recorded {}", entry.kind());
        self.entries.push(entry);
    }

    /// Discard all entries without releasing anything. Only legal once
    /// responsibility for teardown has moved elsewhere.
    pub fn commit(&mut self) {
        debug!("journal: committed {} entries", self.entries.len());
        self.entries.clear();
    }

    /// Release every recorded resource in strict reverse order.
    /// Safe to call twice; the second call observes an empty journal.
    pub fn rollback(&mut self, host: &dyn HostPrimitives) {
        if self.entries.is_empty() {
            if self.rolled_back {
                debug!("journal: rollback already performed");
            }
            return;
        }
        self.rolled_back = true;

        debug!("journal: rolling back {} entries", self.entries.len());
        while let Some(entry) = self.entries.pop() {
            match &entry {
                JournalEntry::PrincipalCreated(name) => host.principal_destroy(name),
                JournalEntry::RootDirCreated(path) => host.dir_remove_recursive(path),
                JournalEntry::WorkspaceMounted(target)
                | JournalEntry::BindMounted(target)
                | JournalEntry::DevMounted(target) => host.unmount(target),
                JournalEntry::ContainerCreated(id) => host.container_destroy(id),
                JournalEntry::AccountingRuleAdded { container, metric } => {
                    // Reclaimed when the owning container is torn down.
                    debug!(
                        "journal: accounting rule {} on {} released with its container",
                        metric.as_str(),
                        container
                    );
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Recorded entries in acquisition order.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockHost;

    #[test]
    fn rollback_releases_in_reverse_order() {
        let host = MockHost::new();
        let mut journal = Journal::new();
        journal.record(JournalEntry::PrincipalCreated("isolate-t".to_string()));
        journal.record(JournalEntry::RootDirCreated("/tmp/isolate-t".into()));
        journal.record(JournalEntry::BindMounted("/tmp/isolate-t/lib".into()));

        journal.rollback(&host);

        assert!(journal.is_empty());
        assert_eq!(
            host.call_names(),
            vec!["unmount", "dir_remove_recursive", "principal_destroy"]
        );
    }

    #[test]
    fn rollback_is_idempotent() {
        let host = MockHost::new();
        let mut journal = Journal::new();
        journal.record(JournalEntry::RootDirCreated("/tmp/isolate-t".into()));

        journal.rollback(&host);
        let after_first = host.calls().len();
        journal.rollback(&host);

        assert_eq!(host.calls().len(), after_first);
    }

    #[test]
    fn commit_discards_without_release() {
        let host = MockHost::new();
        let mut journal = Journal::new();
        journal.record(JournalEntry::RootDirCreated("/tmp/isolate-t".into()));

        journal.commit();
        journal.rollback(&host);

        assert!(host.calls().is_empty());
    }

    #[test]
    fn accounting_entries_release_with_container() {
        let host = MockHost::new();
        let mut journal = Journal::new();
        journal.record(JournalEntry::AccountingRuleAdded {
            container: "isolate-t".to_string(),
            metric: AccountingMetric::Memory,
        });

        journal.rollback(&host);

        // No direct host call; the rule dies with its container.
        assert!(host.calls().is_empty());
        assert!(journal.is_empty());
    }
}
