use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use tokio::sync::{Mutex, OnceCell};

use crate::batcher::InboxBatcher;
use crate::change_source::{AttachmentSource, ChangeSource, Filter};
use crate::checkpoint_cache::{CheckpointCache, CheckpointDocument};
use crate::config::ReplicatorConfig;
use crate::diff::{partition_batch, revs_diff};
use crate::error::ReplicatorError;
use crate::model::RevisionList;
use crate::pending::{CheckpointAdvance, PendingSequences};
use crate::transport::RemoteTransport;
use crate::uploader::{BulkDocStatus, Uploader};

/// The replicator's coarse lifecycle state, named to match the
/// `Stopped`/`Offline`/`Connecting`/`Idle`/`Busy` vocabulary a Couchbase
/// Lite replication status reports (spec §4.9, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
}

/// An inline predicate, or a name the replicator resolves against the local
/// store's filter registry when it starts (spec §3, §4.2). Resolution
/// happens exactly once per `run()`; an unresolved name is fatal before any
/// batch is produced (spec §7).
pub enum FilterSpec {
    None,
    Inline(Filter),
}

/// An observable snapshot of replicator progress, analogous to
/// `ReplicatorStatus` (spec §6).
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub state: LifecycleState,
    pub checkpoint: u64,
    pub pending_count: usize,
    pub completed: u64,
    pub last_error: Option<String>,
}

/// Streams local revisions to a remote CouchDB-compatible endpoint (spec
/// §1-§9 in full). Owns a push strategy rather than inheriting from a base
/// replicator class: the composition mirrors the `ReplicatorCore` +
/// strategy split called out as a redesign target (spec §9).
pub struct PushReplicator<C: ChangeSource, A: AttachmentSource> {
    config: ReplicatorConfig,
    change_source: Arc<C>,
    uploader: Uploader,
    attachments: Arc<A>,
    transport: Arc<dyn RemoteTransport>,
    checkpoint_cache: CheckpointCache,
    filter_spec: FilterSpec,
    resolved_filter: OnceCell<Option<Filter>>,

    offline: AtomicBool,

    state: Mutex<ReplicatorInner>,
}

struct ReplicatorInner {
    lifecycle: LifecycleState,
    pending: PendingSequences,
    completed: u64,
    last_error: Option<String>,
}

impl<C: ChangeSource, A: AttachmentSource + 'static> PushReplicator<C, A> {
    pub fn new(
        config: ReplicatorConfig,
        change_source: Arc<C>,
        attachments: Arc<A>,
        transport: Arc<dyn RemoteTransport>,
        filter: Option<Filter>,
    ) -> Self {
        let checkpoint_cache = CheckpointCache::new(config.checkpoint_file.clone());
        let uploader = Uploader::new(transport.clone(), attachments.clone() as Arc<dyn AttachmentSource>);
        let filter_spec = match filter {
            Some(f) => FilterSpec::Inline(f),
            None => FilterSpec::None,
        };

        Self {
            config,
            change_source,
            uploader,
            attachments,
            transport,
            checkpoint_cache,
            filter_spec,
            resolved_filter: OnceCell::new(),
            offline: AtomicBool::new(false),
            state: Mutex::new(ReplicatorInner {
                lifecycle: LifecycleState::Stopped,
                pending: PendingSequences::new(0),
                completed: 0,
                last_error: None,
            }),
        }
    }

    /// Resolves the filter exactly once per run: a configured
    /// `filter_name` wins over an inline filter passed to `new`, and an
    /// unresolved name is reported as a fatal `FilterResolution` error
    /// before any batch is produced (spec §4.2, §7).
    async fn resolve_filter(&self) -> Result<Option<Filter>, ReplicatorError> {
        self.resolved_filter
            .get_or_try_init(|| async {
                if let Some(name) = &self.config.filter_name {
                    return self
                        .change_source
                        .compile_filter_named(name)
                        .map(Some)
                        .ok_or_else(|| ReplicatorError::FilterResolution(name.clone()));
                }
                Ok(match &self.filter_spec {
                    FilterSpec::None => None,
                    FilterSpec::Inline(f) => Some(f.clone()),
                })
            })
            .await
            .map(|filter| filter.clone())
    }

    /// Resolves the starting checkpoint: ask the remote for
    /// `_local/<sessionID>` first, falling back to the local cache only if
    /// the remote is unreachable or has no record (spec §4.8).
    async fn resolve_starting_checkpoint(&self) -> u64 {
        let doc_id = self.config.checkpoint_document_id();
        match self
            .transport
            .send_json(reqwest::Method::GET, &doc_id, None)
            .await
        {
            Ok((200, body)) => {
                if let Some(sequence) = body.get("last_sequence").and_then(|v| v.as_u64()) {
                    return sequence;
                }
                tracing::warn!(doc_id, "remote checkpoint document had no last_sequence field");
            }
            Ok((status, _)) if status != 404 => {
                tracing::warn!(doc_id, status, "unexpected status fetching remote checkpoint");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(doc_id, error = %err, "could not reach remote for checkpoint; falling back to local cache");
            }
        }

        match self.checkpoint_cache.load() {
            Ok(Some(doc)) => doc.last_sequence,
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(error = %err, "could not read local checkpoint cache; starting from 0");
                0
            }
        }
    }

    /// Issues `PUT /` against the remote base to create the target
    /// database, accepting `201`, `412 Precondition Failed`, and a
    /// `"duplicate"` error body as success (spec §4.1, §6).
    async fn create_target_if_requested(&self) -> Result<(), ReplicatorError> {
        if !self.config.create_target {
            return Ok(());
        }

        match self.transport.send_json(reqwest::Method::PUT, "", None).await {
            Ok((201, _)) => {
                tracing::info!("created target database");
                Ok(())
            }
            Ok((412, _)) => Ok(()),
            Ok((status, body)) => {
                let is_duplicate = body
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .map(|e| e.contains("duplicate"))
                    .unwrap_or(false);
                if is_duplicate {
                    Ok(())
                } else {
                    Err(ReplicatorError::Transport(crate::error::TransportError::Http {
                        status,
                        body: body.to_string(),
                    }))
                }
            }
            Err(err) => Err(ReplicatorError::Transport(err)),
        }
    }

    /// Runs the replication to completion: drains the current backlog, then
    /// either stops (one-shot) or keeps watching for new changes
    /// (`continuous`) until `stop` resolves (spec §4.1, §4.9).
    pub async fn run(&self, stop: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(stop);

        {
            let mut inner = self.state.lock().await;
            inner.lifecycle = LifecycleState::Connecting;
        }

        if let Err(err) = self.resolve_filter().await {
            let mut inner = self.state.lock().await;
            inner.last_error = Some(err.to_string());
            inner.lifecycle = LifecycleState::Stopped;
            tracing::error!(error = %err, "filter resolution failed; replication will not start");
            return Err(err.into());
        }

        if let Err(err) = self.create_target_if_requested().await {
            let mut inner = self.state.lock().await;
            inner.last_error = Some(err.to_string());
            inner.lifecycle = LifecycleState::Stopped;
            tracing::error!(error = %err, "failed to create target database");
            return Err(err.into());
        }

        let starting_checkpoint = self.resolve_starting_checkpoint().await;
        {
            let mut inner = self.state.lock().await;
            inner.pending = PendingSequences::new(starting_checkpoint);
            inner.lifecycle = LifecycleState::Busy;
        }

        let mut consecutive_failures: u32 = 0;
        let mut notifications = self.config.continuous.then(|| self.change_source.subscribe());

        loop {
            let cycle_result = tokio::select! {
                result = self.run_one_cycle() => result,
                _ = &mut stop => {
                    self.finish().await?;
                    return Ok(());
                }
            };

            let made_progress = match cycle_result {
                Ok(made_progress) => {
                    consecutive_failures = 0;
                    {
                        let mut inner = self.state.lock().await;
                        inner.last_error = None;
                    }
                    made_progress
                }
                Err(err) => {
                    consecutive_failures += 1;
                    {
                        let mut inner = self.state.lock().await;
                        inner.last_error = Some(err.to_string());
                        inner.lifecycle = LifecycleState::Offline;
                    }

                    if consecutive_failures > self.config.max_retries {
                        self.finish().await?;
                        return Err(eyre::eyre!(
                            "push replication gave up after {consecutive_failures} consecutive failures: {err}"
                        ));
                    }

                    let delay = self.backoff_delay(consecutive_failures);
                    tracing::warn!(
                        error = %err,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "push replication cycle failed; retrying after backoff"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut stop => {
                            self.finish().await?;
                            return Ok(());
                        }
                    }

                    {
                        let mut inner = self.state.lock().await;
                        inner.lifecycle = LifecycleState::Busy;
                    }
                    continue;
                }
            };

            if made_progress {
                continue;
            }

            if !self.config.continuous {
                self.finish().await?;
                return Ok(());
            }

            {
                let mut inner = self.state.lock().await;
                inner.lifecycle = LifecycleState::Idle;
            }

            // Idle: either a change notification wakes us early, the idle
            // timer expires and we re-scan as a fallback (catching any
            // writes a lagged/dropped broadcast missed), or stop resolves.
            let rx = notifications.as_mut().expect("continuous mode always subscribes");
            tokio::select! {
                notification = rx.recv() => {
                    match notification {
                        Ok(notification) => self.handle_notification(notification).await?,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "change notification channel lagged; falling back to rescan");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            tracing::warn!("change notification channel closed; continuing on rescan timer alone");
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.batch_timeout) => {}
                _ = &mut stop => {
                    self.finish().await?;
                    return Ok(());
                }
            }

            let mut inner = self.state.lock().await;
            inner.lifecycle = LifecycleState::Busy;
        }
    }

    /// Applies the continuous-mode cycle-break and filter to one
    /// notification and, if it survives both, pushes it through the same
    /// diff/upload pipeline a scanned batch uses (spec §4.2).
    async fn handle_notification(
        &self,
        notification: crate::change_source::ChangeNotification,
    ) -> Result<(), ReplicatorError> {
        if self.offline.load(Ordering::SeqCst) {
            // Suspended: drop it rather than process it. The next backlog
            // scan after `go_online()` will pick up anything missed, since
            // the change source's own sequence-ordered scan is the source
            // of truth (spec §4.1 `goOffline`).
            return Ok(());
        }

        if notification.source.as_deref() == Some(self.config.remote_url.as_str()) {
            // Cycle break: this revision was just pulled from the peer we'd
            // be pushing it back to (spec §4.2). Acknowledge the sequence
            // as if it had been filtered out, so a later backlog rescan
            // (which has no notion of `source`) doesn't rediscover it and
            // push it back anyway.
            let advance = {
                let mut inner = self.state.lock().await;
                inner.pending.acknowledge_filtered(notification.revision.sequence)
            };
            if let CheckpointAdvance::To(checkpoint) = advance {
                self.persist_checkpoint(checkpoint).await;
            }
            return Ok(());
        }

        let filter = self.resolve_filter().await?;
        if let Some(filter) = &filter {
            if !filter(&notification.revision) {
                let advance = {
                    let mut inner = self.state.lock().await;
                    inner.pending.acknowledge_filtered(notification.revision.sequence)
                };
                if let CheckpointAdvance::To(checkpoint) = advance {
                    self.persist_checkpoint(checkpoint).await;
                }
                return Ok(());
            }
        }

        let mut batch = RevisionList::new();
        batch.push(notification.revision);
        self.process_batch(batch).await
    }

    /// Exponential backoff with a hard ceiling, matching the shape of the
    /// teacher's own retry/backoff scheme (spec §7).
    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let max = self.config.retry_max_delay.as_millis() as u64;
        let exp = attempt.saturating_sub(1).min(31);
        let delay = base.saturating_mul(1u64 << exp).min(max.max(1));
        std::time::Duration::from_millis(delay.max(1))
    }

    /// Scans for new revisions since the current checkpoint, splits them
    /// into capacity-bounded batches via the inbox batcher, diffs and
    /// uploads each, and advances the checkpoint as far as the results
    /// allow. Returns `false` when the scan found nothing new, the signal
    /// the caller uses to decide whether to idle or stop (spec §4.2, §4.3).
    async fn run_one_cycle(&self) -> Result<bool, ReplicatorError> {
        let since = {
            let inner = self.state.lock().await;
            inner.pending.checkpoint()
        };

        let filter = self.resolve_filter().await?;
        let page = self
            .change_source
            .changes_since_sequence(since, filter.as_ref())
            .await?;

        if page.revisions.is_empty() {
            if page.highest_sequence_scanned <= since {
                return Ok(false);
            }

            let advance = {
                let mut inner = self.state.lock().await;
                inner.pending.acknowledge_filtered(page.highest_sequence_scanned)
            };
            if let CheckpointAdvance::To(new_checkpoint) = advance {
                self.persist_checkpoint(new_checkpoint).await;
            }
            return Ok(true);
        }

        let mut batcher = InboxBatcher::new(self.config.batch_capacity, self.config.batch_timeout);
        for revision in page.revisions.into_vec() {
            if let Some(batch) = batcher.push(revision) {
                self.process_batch(batch).await?;
            }
        }
        let remainder = batcher.take();
        if !remainder.is_empty() {
            self.process_batch(remainder).await?;
        }

        let advance = {
            let mut inner = self.state.lock().await;
            inner.pending.acknowledge_filtered(page.highest_sequence_scanned)
        };
        if let CheckpointAdvance::To(new_checkpoint) = advance {
            self.persist_checkpoint(new_checkpoint).await;
        }

        Ok(true)
    }

    /// Diffs and uploads one already-batched group of revisions: commits
    /// them to `PendingSequences`, negotiates `_revs_diff`, stubs
    /// attachments against the returned `possible_ancestors`, and uploads
    /// whatever the remote still lacks (spec §4.3-§4.6).
    async fn process_batch(&self, batch: RevisionList) -> Result<(), ReplicatorError> {
        if batch.is_empty() {
            return Ok(());
        }

        {
            let mut inner = self.state.lock().await;
            for revision in batch.iter() {
                inner.pending.add(revision.sequence);
            }
        }

        let diff = revs_diff(self.transport.as_ref(), &batch).await?;
        let (mut missing, already_present) = partition_batch(batch, &diff);

        for revision in already_present.into_vec() {
            self.acknowledge(revision.sequence, true).await;
        }

        for revision in missing.iter_mut() {
            self.uploader.stub_attachments(revision, &diff).await?;
        }

        let results = self.uploader.upload_batch(missing.into_vec()).await?;

        for (revision, status) in results {
            match status {
                BulkDocStatus::Ok => {
                    self.acknowledge(revision.sequence, true).await;
                }
                BulkDocStatus::Rejected { error, reason } => {
                    tracing::warn!(
                        doc_id = %revision.doc_id,
                        rev_id = %revision.rev_id,
                        error,
                        reason,
                        "remote rejected revision; not retrying"
                    );
                    self.acknowledge(revision.sequence, false).await;
                }
                BulkDocStatus::NeedsMultipart => {
                    tracing::info!(
                        doc_id = %revision.doc_id,
                        rev_id = %revision.rev_id,
                        "remote requested full attachment bodies; this revision was already retried inline"
                    );
                    self.acknowledge(revision.sequence, false).await;
                }
            }
        }

        Ok(())
    }

    async fn acknowledge(&self, sequence: u64, succeeded: bool) {
        let advance = {
            let mut inner = self.state.lock().await;
            if succeeded {
                inner.completed += 1;
            }
            inner.pending.remove(sequence)
        };
        if let CheckpointAdvance::To(new_checkpoint) = advance {
            self.persist_checkpoint(new_checkpoint).await;
        }
    }

    async fn persist_checkpoint(&self, sequence: u64) {
        let doc = CheckpointDocument {
            last_sequence: sequence,
            session_id: self.config.session_id(),
        };

        if let Err(err) = self.checkpoint_cache.save(&doc) {
            tracing::warn!(error = %err, "failed to persist checkpoint to local cache");
        }

        let body = serde_json::json!({ "last_sequence": sequence });
        if let Err(err) = self
            .transport
            .send_json(
                reqwest::Method::PUT,
                &self.config.checkpoint_document_id(),
                Some(body),
            )
            .await
        {
            tracing::warn!(error = %err, sequence, "failed to push checkpoint to remote");
        }
    }

    /// Flushes the current checkpoint one last time before the replicator
    /// transitions to `Stopped` (spec §4.1).
    async fn finish(&self) -> Result<()> {
        let checkpoint = {
            let mut inner = self.state.lock().await;
            inner.lifecycle = LifecycleState::Stopped;
            inner.pending.checkpoint()
        };
        self.persist_checkpoint(checkpoint).await;
        Ok(())
    }

    /// Suspends the change-notification subscription and reports `Offline`
    /// until `go_online()` is called (spec §4.1 `goOffline`).
    pub async fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
        let mut inner = self.state.lock().await;
        if inner.lifecycle != LifecycleState::Stopped {
            inner.lifecycle = LifecycleState::Offline;
        }
    }

    /// Resumes processing change notifications after `go_offline()` (spec
    /// §4.1 `goOnline`).
    pub async fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
        let mut inner = self.state.lock().await;
        if inner.lifecycle == LifecycleState::Offline {
            inner.lifecycle = LifecycleState::Busy;
        }
    }

    pub async fn status(&self) -> ReplicatorStatus {
        let inner = self.state.lock().await;
        ReplicatorStatus {
            state: inner.lifecycle,
            checkpoint: inner.pending.checkpoint(),
            pending_count: inner.pending.count(),
            completed: inner.completed,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Produces a `stop` future that never resolves, for one-shot runs that
/// should only end when [`PushReplicator::run_one_cycle`] reports no more
/// progress.
pub fn never_stop() -> impl std::future::Future<Output = ()> {
    std::future::pending()
}
