use std::collections::HashSet;

use serde_json::{Map, Value};

/// A document's raw CouchDB-style property map (`_id`, `_rev`,
/// `_attachments`, `_revisions`, `_deleted`, plus application fields).
pub type Properties = Map<String, Value>;

/// A parsed `<generation>-<hash>` revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    pub generation: u32,
    pub hash: String,
}

impl RevisionId {
    pub fn parse(s: &str) -> Option<Self> {
        let (generation, hash) = s.split_once('-')?;
        Some(Self {
            generation: generation.parse().ok()?,
            hash: hash.to_string(),
        })
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

/// An immutable revision: `(docID, revID)` plus the monotonic local
/// `sequence` the store assigned it when it was written (spec §3).
#[derive(Debug, Clone)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub properties: Properties,
}

impl Revision {
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        sequence: u64,
        mut properties: Properties,
    ) -> Self {
        let doc_id = doc_id.into();
        let rev_id = rev_id.into();
        properties.insert("_id".to_string(), Value::String(doc_id.clone()));
        properties.insert("_rev".to_string(), Value::String(rev_id.clone()));
        Self {
            doc_id,
            rev_id,
            sequence,
            properties,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the `_revisions.{start,ids}` history, if the revision was
    /// loaded with history included (spec §4.5 loads with `includeRevs`).
    pub fn revisions_history(&self) -> Option<(u32, Vec<String>)> {
        let revisions = self.properties.get("_revisions")?.as_object()?;
        let start = revisions.get("start")?.as_u64()? as u32;
        let ids = revisions
            .get("ids")?
            .as_array()?
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect();
        Some((start, ids))
    }

    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.properties.get("_attachments")?.as_object()
    }

    pub fn attachments_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.properties.get_mut("_attachments")?.as_object_mut()
    }

    /// True if any attachment entry is still marked `"follows": true`,
    /// meaning it was not stubbed out and must be streamed separately
    /// (spec §4.5/§4.6).
    pub fn has_following_attachments(&self) -> bool {
        self.attachments()
            .map(|attachments| {
                attachments
                    .values()
                    .any(|a| a.get("follows").and_then(Value::as_bool).unwrap_or(false))
            })
            .unwrap_or(false)
    }
}

/// An ordered batch of revisions with docID/revID-pair uniqueness, used as
/// the inbox batcher's unit of work (spec §3).
#[derive(Debug, Clone, Default)]
pub struct RevisionList {
    revisions: Vec<Revision>,
    seen: HashSet<(String, String)>,
}

impl RevisionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `revision`, returning `false` if its `(docID, revID)` pair was
    /// already present in this list.
    pub fn push(&mut self, revision: Revision) -> bool {
        let key = (revision.doc_id.clone(), revision.rev_id.clone());
        if !self.seen.insert(key) {
            return false;
        }
        self.revisions.push(revision);
        true
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Revision> {
        self.revisions.iter_mut()
    }

    pub fn into_vec(self) -> Vec<Revision> {
        self.revisions
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.into_iter()
    }
}
