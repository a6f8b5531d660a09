use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ReplicatorError, TransportError};
use crate::model::RevisionList;
use crate::transport::RemoteTransport;

/// What the remote reported for one document in a `_revs_diff` response
/// (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct DocDiff {
    pub missing: Vec<String>,
    pub possible_ancestors: Vec<String>,
}

/// The outcome of diffing a batch: which revisions the remote is missing
/// (and therefore need uploading) and which it already has (and therefore
/// can be dropped from this cycle without consuming a retry).
#[derive(Debug, Default)]
pub struct DiffResult {
    pub diffs: HashMap<String, DocDiff>,
}

impl DiffResult {
    pub fn is_missing(&self, doc_id: &str, rev_id: &str) -> bool {
        self.diffs
            .get(doc_id)
            .map(|diff| diff.missing.iter().any(|r| r == rev_id))
            .unwrap_or(false)
    }

    pub fn possible_ancestors(&self, doc_id: &str) -> &[String] {
        self.diffs
            .get(doc_id)
            .map(|diff| diff.possible_ancestors.as_slice())
            .unwrap_or(&[])
    }
}

/// Asks the remote which of `batch`'s `(docID, revID)` pairs it is missing,
/// via `POST /_revs_diff` (spec §4.3). Multiple revisions of the same
/// document are merged into one request entry, since `_revs_diff` expects
/// `{docID: [revID, ...]}`.
pub async fn revs_diff(
    transport: &dyn RemoteTransport,
    batch: &RevisionList,
) -> Result<DiffResult, ReplicatorError> {
    let mut request_body = serde_json::Map::new();
    for revision in batch.iter() {
        request_body
            .entry(revision.doc_id.clone())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("entry is always inserted as an array")
            .push(Value::String(revision.rev_id.clone()));
    }

    if request_body.is_empty() {
        return Ok(DiffResult::default());
    }

    let (status, body) = transport
        .send_json(
            reqwest::Method::POST,
            "_revs_diff",
            Some(Value::Object(request_body)),
        )
        .await?;

    if status >= 300 {
        return Err(ReplicatorError::Transport(TransportError::Http {
            status,
            body: body.to_string(),
        }));
    }

    let response = body
        .as_object()
        .ok_or_else(|| ReplicatorError::ProtocolViolation("_revs_diff response was not an object".into()))?;

    let mut diffs = HashMap::new();
    for (doc_id, entry) in response {
        let entry = entry.as_object().ok_or_else(|| {
            ReplicatorError::ProtocolViolation(format!("_revs_diff entry for {doc_id} was not an object"))
        })?;

        let missing = entry
            .get("missing")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let possible_ancestors = entry
            .get("possible_ancestors")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        diffs.insert(doc_id.clone(), DocDiff { missing, possible_ancestors });
    }

    Ok(DiffResult { diffs })
}

/// Splits `batch` into revisions the remote is missing (to upload) and
/// revisions it already has (to acknowledge immediately, without spending a
/// round of `_bulk_docs`), per the diff result.
pub fn partition_batch(batch: RevisionList, diff: &DiffResult) -> (RevisionList, RevisionList) {
    let mut missing = RevisionList::new();
    let mut already_present = RevisionList::new();

    for revision in batch.into_vec() {
        if diff.is_missing(&revision.doc_id, &revision.rev_id) {
            missing.push(revision);
        } else {
            already_present.push(revision);
        }
    }

    (missing, already_present)
}
