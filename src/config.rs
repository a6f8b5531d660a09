use std::path::PathBuf;
use std::time::Duration;

use eyre::{eyre, Result};
use sha1::{Digest, Sha1};

/// Tunables for a single [`crate::replicator::PushReplicator`] run. Built
/// through [`ReplicatorConfig::new`] rather than constructed directly so
/// invalid or merely-unwise values (a zero batch size, a negative-looking
/// retry ceiling) are caught or clamped in one place.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub remote_url: reqwest::Url,
    pub checkpoint_file: PathBuf,

    pub batch_capacity: usize,
    pub batch_timeout: Duration,

    /// If true, the replicator keeps watching the change feed after the
    /// initial backlog drains instead of stopping (spec §4.9).
    pub continuous: bool,

    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// An identifier unique to this replication's (source, target, filter)
    /// triple, used to derive the `_local/<sessionID>` checkpoint document
    /// ID (spec §4.8).
    pub replication_id_seed: String,

    /// If true, `start()` issues `PUT /` to the remote before replicating,
    /// accepting `201`, `412 Precondition Failed`, and a `"duplicate"`
    /// error body as success (spec §4.1, §6).
    pub create_target: bool,

    /// A filter name to resolve against the local store's filter registry
    /// before replication begins (spec §4.2). Mutually exclusive in
    /// practice with passing a filter closure straight into
    /// [`crate::replicator::PushReplicator::new`], but both are accepted so
    /// tests can use an inline predicate without a store-side registry.
    pub filter_name: Option<String>,
}

impl ReplicatorConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote_url: reqwest::Url,
        checkpoint_file: PathBuf,
        batch_capacity: usize,
        batch_timeout_millis: u64,
        continuous: bool,
        max_retries: u32,
        retry_base_delay_millis: u64,
        retry_max_delay_millis: u64,
        replication_id_seed: String,
    ) -> Result<Self> {
        if batch_capacity == 0 {
            return Err(eyre!("batch capacity must be > 0"));
        }

        if retry_max_delay_millis > 0 && retry_base_delay_millis > retry_max_delay_millis {
            tracing::warn!(
                base_ms = retry_base_delay_millis,
                max_ms = retry_max_delay_millis,
                "retry base delay > max; clamping base to max"
            );
        }

        Ok(Self {
            remote_url,
            checkpoint_file,
            batch_capacity,
            batch_timeout: Duration::from_millis(batch_timeout_millis.max(1)),
            continuous,
            max_retries,
            retry_base_delay: Duration::from_millis(
                retry_base_delay_millis
                    .max(1)
                    .min(retry_max_delay_millis.max(1)),
            ),
            retry_max_delay: Duration::from_millis(retry_max_delay_millis.max(1)),
            replication_id_seed,
            create_target: false,
            filter_name: None,
        })
    }

    /// Requests that `start()` create the target database if it does not
    /// already exist (spec §4.1).
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the named filter to resolve against the local store when
    /// replication begins (spec §4.2).
    pub fn with_filter_name(mut self, filter_name: impl Into<String>) -> Self {
        self.filter_name = Some(filter_name.into());
        self
    }

    /// Derives the `_local/<sessionID>` document ID from the replication's
    /// identity seed, matching the original's scheme of hashing the
    /// (source, target, filter, docIDs) tuple into a stable session ID
    /// (spec §4.8).
    pub fn session_id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.replication_id_seed.as_bytes());
        let digest = hasher.finalize();
        hex_encode(&digest)
    }

    pub fn checkpoint_document_id(&self) -> String {
        format!("_local/{}", self.session_id())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
