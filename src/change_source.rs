use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ReplicatorError;
use crate::model::{Revision, RevisionList};

/// A predicate applied to each candidate revision before it enters the
/// replicator's inbox (spec §4.2). `Arc` rather than `Box` because a
/// resolved filter is shared between the initial scan and every
/// change-notification callback in continuous mode, not consumed once.
pub type Filter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// One scan of the change feed: the revisions that passed the filter, plus
/// the highest local sequence the scan looked at (including filtered-out
/// sequences), so the caller can acknowledge those as implicitly checkpointed
/// (spec §4.2).
pub struct ChangesPage {
    pub revisions: RevisionList,
    pub highest_sequence_scanned: u64,
}

/// A single change-notification delivered outside the initial scan, for
/// continuous-mode replication (spec §4.2, §9: "notification-center
/// observation... becomes an explicit producer-consumer channel owned by
/// the replicator").
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub revision: Revision,
    /// The remote URL this revision was last pulled from, if any. The
    /// replicator skips revisions whose `source` matches its own remote to
    /// break pull/push replication cycles (spec §4.2).
    pub source: Option<String>,
}

/// The local document store's change-feed surface, as the replicator
/// consumes it (spec §3, §6). A real Couchbase Lite database backs this with
/// its sequence-ordered B-tree; `MemoryStore` below is a reference
/// implementation for tests and the CLI demo.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Returns every revision with `sequence > since`, in ascending sequence
    /// order, with history included so ancestor negotiation has what it
    /// needs (spec §4.5). Revisions rejected by `filter` are still scanned
    /// (and counted in `highest_sequence_scanned`) but excluded from the
    /// returned list.
    async fn changes_since_sequence(
        &self,
        since: u64,
        filter: Option<&Filter>,
    ) -> Result<ChangesPage, ReplicatorError>;

    /// Loads a single revision's full properties and history by ID, used
    /// when `new_edits=false` rejection forces a retry against fresh state.
    async fn load_revision(&self, doc_id: &str, rev_id: &str) -> Result<Option<Revision>, ReplicatorError>;

    /// Resolves a named filter against the store's registered filters (spec
    /// §4.2, §6: `compileFilterNamed`). The default implementation resolves
    /// nothing, matching a store with no filter registry.
    fn compile_filter_named(&self, _name: &str) -> Option<Filter> {
        None
    }

    /// Subscribes to the store's change-notification stream for continuous
    /// mode (spec §4.2, §6). The default implementation never delivers
    /// anything, which is correct for one-shot-only stores.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        let (_tx, rx) = broadcast::channel(1);
        rx
    }
}

/// Loads attachment bytes for a document's `_attachments` entry, abstracting
/// over however the local store locates blob data (spec §4.6, §6:
/// `fileForAttachmentDict`).
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn load_attachment_bytes(&self, doc_id: &str, name: &str) -> Result<Vec<u8>, ReplicatorError>;
}

struct MemoryStoreInner {
    revisions: BTreeMap<u64, Revision>,
    attachments: BTreeMap<(String, String), Vec<u8>>,
    filters: BTreeMap<String, Filter>,
}

/// An in-memory `ChangeSource`/`AttachmentSource` used by tests and the CLI
/// demo binary. Uses a blocking `std::sync::Mutex` rather than an async
/// lock: the lock is never held across an `.await` point here, so a
/// blocking mutex is simpler and avoids the reentrancy hazards of driving a
/// nested runtime from a sync trait method.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    notifications: broadcast::Sender<ChangeNotification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifications, _rx) = broadcast::channel(256);
        Self {
            inner: Mutex::new(MemoryStoreInner {
                revisions: BTreeMap::new(),
                attachments: BTreeMap::new(),
                filters: BTreeMap::new(),
            }),
            notifications,
        }
    }

    /// Appends a new revision at the next sequence number, mirroring how a
    /// real store assigns sequences monotonically on write (spec §3), and
    /// broadcasts it to any continuous-mode subscriber.
    pub fn put(&self, revision: Revision) -> u64 {
        self.put_with_source(revision, None)
    }

    /// Same as [`MemoryStore::put`], but lets a test stamp the revision's
    /// notification with a `source`, so the pull/push cycle-break behavior
    /// (spec §4.2) can be exercised without a real pull replicator.
    pub fn put_with_source(&self, revision: Revision, source: Option<String>) -> u64 {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let sequence = inner.revisions.keys().next_back().copied().unwrap_or(0) + 1;
        let mut revision = revision;
        revision.sequence = sequence;
        inner.revisions.insert(sequence, revision.clone());
        drop(inner);

        // No subscribers is the common case for one-shot replication; the
        // broadcast channel reports that as an error we can ignore.
        let _ = self.notifications.send(ChangeNotification { revision, source });
        sequence
    }

    pub fn put_attachment(&self, doc_id: impl Into<String>, name: impl Into<String>, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.attachments.insert((doc_id.into(), name.into()), bytes);
    }

    /// Registers a named filter so `compile_filter_named` can resolve it
    /// (spec §4.2, §6).
    pub fn register_filter(&self, name: impl Into<String>, filter: Filter) {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.filters.insert(name.into(), filter);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeSource for MemoryStore {
    async fn changes_since_sequence(
        &self,
        since: u64,
        filter: Option<&Filter>,
    ) -> Result<ChangesPage, ReplicatorError> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let mut revisions = RevisionList::new();
        let mut highest_sequence_scanned = since;

        for (&sequence, revision) in inner.revisions.range((since + 1)..) {
            highest_sequence_scanned = sequence;
            if filter.map(|f| f(revision)).unwrap_or(true) {
                revisions.push(revision.clone());
            }
        }

        Ok(ChangesPage {
            revisions,
            highest_sequence_scanned,
        })
    }

    async fn load_revision(&self, doc_id: &str, rev_id: &str) -> Result<Option<Revision>, ReplicatorError> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner
            .revisions
            .values()
            .find(|r| r.doc_id == doc_id && r.rev_id == rev_id)
            .cloned())
    }

    fn compile_filter_named(&self, name: &str) -> Option<Filter> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.filters.get(name).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }
}

#[async_trait]
impl AttachmentSource for MemoryStore {
    async fn load_attachment_bytes(&self, doc_id: &str, name: &str) -> Result<Vec<u8>, ReplicatorError> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner
            .attachments
            .get(&(doc_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ReplicatorError::LocalStore {
                doc_id: doc_id.to_string(),
                rev_id: String::new(),
                reason: format!("no attachment named {name:?}"),
            })
    }
}
