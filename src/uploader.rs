use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use crate::ancestor::find_common_ancestor;
use crate::canonical_json::{attachment_key_order, canonicalize};
use crate::change_source::AttachmentSource;
use crate::diff::DiffResult;
use crate::error::{ReplicatorError, TransportError};
use crate::model::Revision;
use crate::transport::{MultipartPart, RemoteTransport};

/// Attachments at or above this size are streamed as a `multipart/related`
/// part instead of being base64-inlined into the JSON body; smaller ones
/// ride along in `_bulk_docs` (spec §2(4): "big attachments follow").
const BIG_ATTACHMENT_THRESHOLD_BYTES: u64 = 8192;

/// What the remote reported for one document in a `_bulk_docs` response
/// (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkDocStatus {
    Ok,
    /// A conflict or validation failure the remote will never accept a
    /// retry for without caller intervention.
    Rejected { error: String, reason: String },
    /// The remote asked for the full attachment bodies instead of stubs;
    /// this revision must be retried as a multipart upload.
    NeedsMultipart,
}

/// Parses one entry of a `_bulk_docs` response array into a [`BulkDocStatus`]
/// (spec §4.5): a numeric `status` ≥ 400 always wins, since it's the
/// server's own word on the matter; only then do the magic `"error"`
/// strings get interpreted.
pub fn status_from_bulk_docs_response_item(item: &Value) -> BulkDocStatus {
    if item.get("error").and_then(Value::as_str) == Some("missing_attachment") {
        return BulkDocStatus::NeedsMultipart;
    }

    let reason = || {
        item.get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    if let Some(status) = item.get("status").and_then(Value::as_u64) {
        if status >= 400 {
            let error = item
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string();
            return BulkDocStatus::Rejected { error, reason: reason() };
        }
    }

    if let Some(error) = item.get("error").and_then(Value::as_str) {
        return BulkDocStatus::Rejected {
            error: error.to_string(),
            reason: reason(),
        };
    }

    BulkDocStatus::Ok
}

/// Uploads revisions to the remote via `_bulk_docs`, falling back to a
/// `multipart/related` PUT per-document when attachments must be sent
/// inline (spec §4.4, §4.6).
pub struct Uploader {
    transport: Arc<dyn RemoteTransport>,
    attachments: Arc<dyn AttachmentSource>,
    /// Serializes multipart uploads to one at a time, since a Couchbase Lite
    /// database (and this replicator) only ever has one upload task running
    /// against a single-threaded executor (spec §5).
    multipart_gate: Semaphore,
    /// Once the remote has rejected one document in this session for
    /// lacking multipart support, stop trying the cheaper inline path for
    /// this run (spec §4.6: "sticky" fallback).
    dont_send_multipart: std::sync::atomic::AtomicBool,
}

impl Uploader {
    pub fn new(transport: Arc<dyn RemoteTransport>, attachments: Arc<dyn AttachmentSource>) -> Self {
        Self {
            transport,
            attachments,
            multipart_gate: Semaphore::new(1),
            dont_send_multipart: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Rewrites `revision`'s `_attachments` entries so that anything the
    /// remote already has (per `find_common_ancestor`) is sent as a stub
    /// (`"stub": true`) instead of a full body. Of what's new: only
    /// attachments at or above [`BIG_ATTACHMENT_THRESHOLD_BYTES`] are marked
    /// `"follows": true` to be streamed as a multipart part; anything
    /// smaller is loaded now and embedded as base64 `"data"` so it rides
    /// along in the ordinary `_bulk_docs` batch instead of forcing a
    /// one-document-at-a-time multipart upload (spec §2(4), §4.5/§4.6: "big
    /// attachments follow").
    pub async fn stub_attachments(&self, revision: &mut Revision, diff: &DiffResult) -> Result<(), ReplicatorError> {
        let ancestor_generation = find_common_ancestor(revision, diff.possible_ancestors(&revision.doc_id));

        let names: Vec<String> = match revision.attachments() {
            Some(attachments) => attachments.keys().cloned().collect(),
            None => return Ok(()),
        };

        let mut to_inline = Vec::new();
        for name in &names {
            let attachments = revision.attachments_mut().expect("checked above");
            let Some(entry) = attachments.get_mut(name).and_then(Value::as_object_mut) else {
                continue;
            };
            let revpos = entry.get("revpos").and_then(Value::as_u64).unwrap_or(u64::MAX);
            if revpos <= ancestor_generation as u64 {
                entry.insert("stub".to_string(), Value::Bool(true));
                entry.remove("follows");
                continue;
            }

            let length = entry.get("length").and_then(Value::as_u64);
            // An attachment whose declared length is unknown is treated as
            // big: we can't prove it's small enough to inline safely.
            if length.map(|len| len >= BIG_ATTACHMENT_THRESHOLD_BYTES).unwrap_or(true) {
                entry.insert("follows".to_string(), Value::Bool(true));
                entry.remove("stub");
            } else {
                entry.remove("follows");
                entry.remove("stub");
                to_inline.push(name.clone());
            }
        }

        for name in to_inline {
            let bytes = self.attachments.load_attachment_bytes(&revision.doc_id, &name).await?;
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            if let Some(entry) = revision
                .attachments_mut()
                .and_then(|attachments| attachments.get_mut(&name))
                .and_then(Value::as_object_mut)
            {
                entry.insert("data".to_string(), Value::String(data));
            }
        }

        Ok(())
    }

    /// Uploads one batch of already-diffed, already-stubbed revisions.
    /// Revisions with no remaining attachment bodies to stream go through
    /// `_bulk_docs` together; revisions still marked `"follows"` are sent
    /// individually via multipart, one at a time.
    pub async fn upload_batch(
        &self,
        revisions: Vec<Revision>,
    ) -> Result<Vec<(Revision, BulkDocStatus)>, ReplicatorError> {
        let (needs_multipart, rest): (Vec<Revision>, Vec<Revision>) = revisions
            .into_iter()
            .partition(|r| r.has_following_attachments() && !self.multipart_disabled());

        // Anything left with `"follows"` attachments here is only because
        // multipart got disabled mid-session (spec §4.6 sticky fallback),
        // not because it never had attachments: inline those as base64
        // before the bulk round, same as a single 415-triggered retry would.
        let mut inline = Vec::with_capacity(rest.len());
        for revision in rest {
            if revision.has_following_attachments() {
                inline.push(self.base64_inline_attachments(revision).await?);
            } else {
                inline.push(revision);
            }
        }

        let mut results = Vec::new();

        if !inline.is_empty() {
            results.extend(self.upload_inline_json(inline).await?);
        }

        for revision in needs_multipart {
            let status = self.upload_multipart(revision.clone()).await?;
            results.push((revision, status));
        }

        Ok(results)
    }

    fn multipart_disabled(&self) -> bool {
        self.dont_send_multipart.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Sends a batch through `POST /_bulk_docs` with `new_edits=false`, so
    /// the remote accepts these exact revision IDs instead of minting new
    /// ones (spec §4.4).
    async fn upload_inline_json(
        &self,
        revisions: Vec<Revision>,
    ) -> Result<Vec<(Revision, BulkDocStatus)>, ReplicatorError> {
        let docs: Vec<Value> = revisions
            .iter()
            .map(|r| canonicalize(&Value::Object(r.properties.clone())))
            .collect();

        let body = json!({ "docs": docs, "new_edits": false });
        let (status, response) = self
            .transport
            .send_json(reqwest::Method::POST, "_bulk_docs", Some(body))
            .await?;

        if status >= 300 {
            return Err(ReplicatorError::Transport(TransportError::Http {
                status,
                body: response.to_string(),
            }));
        }

        let items = response
            .as_array()
            .ok_or_else(|| ReplicatorError::ProtocolViolation("_bulk_docs response was not an array".into()))?;

        if items.len() != revisions.len() {
            return Err(ReplicatorError::ProtocolViolation(format!(
                "_bulk_docs returned {} results for {} documents",
                items.len(),
                revisions.len()
            )));
        }

        Ok(revisions
            .into_iter()
            .zip(items.iter().map(status_from_bulk_docs_response_item))
            .collect())
    }

    /// Uploads a single document as `multipart/related`: JSON first part
    /// (with attachments marked `"follows": true`), then one MIME part per
    /// following attachment, in the same order as `_attachments`'s
    /// canonical key order (spec §4.6).
    async fn upload_multipart(&self, revision: Revision) -> Result<BulkDocStatus, ReplicatorError> {
        let _permit = self
            .multipart_gate
            .acquire()
            .await
            .expect("multipart gate semaphore is never closed");

        let properties = Value::Object(revision.properties.clone());
        let attachment_names = attachment_key_order(&properties);

        let mut parts = vec![MultipartPart {
            name: "0".to_string(),
            content_type: Some("application/json".to_string()),
            content_encoding: None,
            bytes: canonical_bytes_for_multipart(&properties),
        }];

        for name in &attachment_names {
            let entry = properties.get("_attachments").and_then(|a| a.get(name));
            let is_following = entry
                .and_then(|entry| entry.get("follows"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !is_following {
                continue;
            }

            let content_type = entry
                .and_then(|entry| entry.get("content_type").or_else(|| entry.get("type")))
                .and_then(Value::as_str)
                .map(str::to_string);
            let content_encoding = entry
                .and_then(|entry| entry.get("encoding"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let bytes = self.attachments.load_attachment_bytes(&revision.doc_id, name).await?;
            parts.push(MultipartPart {
                name: name.clone(),
                content_type,
                content_encoding,
                bytes,
            });
        }

        let path = format!("{}?new_edits=false", escaped_doc_path(&revision.doc_id));

        let (status, response) = self.transport.put_multipart(&path, parts).await?;

        if status == 415 || status == 400 {
            self.dont_send_multipart.store(true, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!(
                doc_id = %revision.doc_id,
                status,
                "remote rejected multipart upload; disabling multipart for this session and retrying inline"
            );
            let revision = self.base64_inline_attachments(revision).await?;
            let path = format!("{}?new_edits=false", escaped_doc_path(&revision.doc_id));
            let body = canonicalize(&Value::Object(revision.properties.clone()));
            let (status, response) = self
                .transport
                .send_json(reqwest::Method::PUT, &path, Some(body))
                .await?;

            if status >= 300 {
                return Err(ReplicatorError::Transport(TransportError::Http {
                    status,
                    body: response.to_string(),
                }));
            }
            return Ok(BulkDocStatus::Ok);
        }

        if status >= 300 {
            return Err(ReplicatorError::Transport(TransportError::Http {
                status,
                body: response.to_string(),
            }));
        }

        Ok(BulkDocStatus::Ok)
    }

    /// Replaces every `"follows": true` attachment entry on `revision` with
    /// a base64-encoded `"data"` entry, for the `415` fallback and for any
    /// later revision caught by the sticky `dontSendMultipart` flag before
    /// it would otherwise reach `_bulk_docs` still marked `"follows"`
    /// (spec §4.6).
    async fn base64_inline_attachments(&self, mut revision: Revision) -> Result<Revision, ReplicatorError> {
        let following: Vec<String> = revision
            .attachments()
            .map(|attachments| {
                attachments
                    .iter()
                    .filter(|(_, entry)| entry.get("follows").and_then(Value::as_bool).unwrap_or(false))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut inlined = Vec::with_capacity(following.len());
        for name in following {
            let bytes = self.attachments.load_attachment_bytes(&revision.doc_id, &name).await?;
            inlined.push((name, base64::engine::general_purpose::STANDARD.encode(bytes)));
        }

        if let Some(attachments) = revision.attachments_mut() {
            for (name, data) in inlined {
                if let Some(entry) = attachments.get_mut(&name).and_then(Value::as_object_mut) {
                    entry.remove("follows");
                    entry.insert("data".to_string(), Value::String(data));
                }
            }
        }

        Ok(revision)
    }
}

fn canonical_bytes_for_multipart(properties: &Value) -> Vec<u8> {
    crate::canonical_json::canonical_bytes(properties)
}

/// Percent-encodes `doc_id` for use as a URL path segment (spec §4.6:
/// `<docID-escaped>`), since a docID may itself contain `/`, `?`, or `#`.
fn escaped_doc_path(doc_id: &str) -> String {
    percent_encoding::utf8_percent_encode(doc_id, percent_encoding::NON_ALPHANUMERIC).to_string()
}
