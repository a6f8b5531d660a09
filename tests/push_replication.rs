//! End-to-end tests against a hand-written `RemoteTransport` double, rather
//! than a real HTTP server: the transport trait is the whole surface the
//! replicator needs to drive correctly, so a double is enough to exercise
//! the diff/upload/checkpoint pipeline without a network dependency.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use couch_push_replicator::{
    CheckpointDocument, Filter, MemoryStore, PushReplicator, ReplicatorConfig, TransportError,
};
use serde_json::{json, Map, Value};

struct FakeRemote {
    // Keyed by docID, holding the bodies the remote has already accepted.
    accepted: Mutex<HashMap<String, Vec<String>>>,
    checkpoint: Mutex<Option<u64>>,
    /// If set, the Nth call to `_bulk_docs` rejects this doc/rev pair once.
    reject_once: Mutex<Option<(String, String)>>,
    multipart_calls: Mutex<VecDeque<String>>,
    create_target_calls: Mutex<u32>,
    bulk_docs_calls: Mutex<u32>,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            accepted: Mutex::new(HashMap::new()),
            checkpoint: Mutex::new(None),
            reject_once: Mutex::new(None),
            multipart_calls: Mutex::new(VecDeque::new()),
            create_target_calls: Mutex::new(0),
            bulk_docs_calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl couch_push_replicator::RemoteTransport for FakeRemote {
    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), TransportError> {
        if path.is_empty() {
            return match method {
                reqwest::Method::PUT => {
                    *self.create_target_calls.lock().unwrap() += 1;
                    Ok((201, json!({ "ok": true })))
                }
                _ => Ok((405, json!({ "error": "method_not_allowed" }))),
            };
        }

        if path.starts_with("_local/") {
            return match method {
                reqwest::Method::GET => match *self.checkpoint.lock().unwrap() {
                    Some(sequence) => Ok((200, json!({ "last_sequence": sequence }))),
                    None => Ok((404, json!({ "error": "not_found" }))),
                },
                reqwest::Method::PUT => {
                    let sequence = body
                        .and_then(|b| b.get("last_sequence").and_then(Value::as_u64))
                        .unwrap_or(0);
                    *self.checkpoint.lock().unwrap() = Some(sequence);
                    Ok((201, json!({ "ok": true })))
                }
                _ => Ok((405, json!({ "error": "method_not_allowed" }))),
            };
        }

        if path == "_revs_diff" {
            let request = body.unwrap_or(Value::Null);
            let mut response = Map::new();
            let accepted = self.accepted.lock().unwrap();
            if let Some(request) = request.as_object() {
                for (doc_id, revs) in request {
                    let known = accepted.get(doc_id).cloned().unwrap_or_default();
                    let missing: Vec<Value> = revs
                        .as_array()
                        .unwrap()
                        .iter()
                        .filter(|rev| !known.contains(&rev.as_str().unwrap().to_string()))
                        .cloned()
                        .collect();
                    response.insert(
                        doc_id.clone(),
                        json!({ "missing": missing, "possible_ancestors": known }),
                    );
                }
            }
            return Ok((200, Value::Object(response)));
        }

        if path == "_bulk_docs" {
            *self.bulk_docs_calls.lock().unwrap() += 1;
            let request = body.unwrap_or(Value::Null);
            let docs = request.get("docs").and_then(Value::as_array).cloned().unwrap_or_default();
            let mut results = Vec::new();
            let mut accepted = self.accepted.lock().unwrap();
            let mut reject_once = self.reject_once.lock().unwrap();

            for doc in &docs {
                let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
                let rev_id = doc.get("_rev").and_then(Value::as_str).unwrap_or_default().to_string();

                if reject_once.as_ref() == Some(&(doc_id.clone(), rev_id.clone())) {
                    *reject_once = None;
                    results.push(json!({ "id": doc_id, "error": "conflict", "reason": "document update conflict" }));
                    continue;
                }

                accepted.entry(doc_id.clone()).or_default().push(rev_id.clone());
                results.push(json!({ "id": doc_id, "rev": rev_id, "ok": true }));
            }

            return Ok((200, Value::Array(results)));
        }

        Ok((404, json!({ "error": "not_found" })))
    }

    async fn put_multipart(
        &self,
        path: &str,
        parts: Vec<couch_push_replicator::MultipartPart>,
    ) -> Result<(u16, Value), TransportError> {
        self.multipart_calls.lock().unwrap().push_back(path.to_string());
        let doc_id = path.split('?').next().unwrap_or_default().to_string();
        let rev_id = parts
            .first()
            .and_then(|part| serde_json::from_slice::<Value>(&part.bytes).ok())
            .and_then(|doc| doc.get("_rev").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        self.accepted.lock().unwrap().entry(doc_id).or_default().push(rev_id);
        Ok((201, json!({ "ok": true })))
    }
}

fn revision_with_text(doc_id: &str, rev_id: &str, text: &str) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("text".to_string(), Value::String(text.to_string()));
    properties
}

fn config(checkpoint_path: std::path::PathBuf, seed: &str) -> ReplicatorConfig {
    ReplicatorConfig::new(
        reqwest::Url::parse("http://localhost:5984/db/").unwrap(),
        checkpoint_path,
        10,
        50,
        false,
        3,
        10,
        200,
        seed.to_string(),
    )
    .unwrap()
}

fn tmp_checkpoint_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("push-replicator-test-{}-{name}.json", std::process::id()))
}

#[tokio::test]
async fn pushes_a_simple_backlog_and_advances_the_checkpoint() {
    let store = Arc::new(MemoryStore::new());
    store.put(couch_push_replicator::Revision::new(
        "doc1",
        "1-a",
        0,
        revision_with_text("doc1", "1-a", "hello"),
    ));
    store.put(couch_push_replicator::Revision::new(
        "doc2",
        "1-b",
        0,
        revision_with_text("doc2", "1-b", "world"),
    ));

    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("basic");
    let cfg = config(checkpoint_path.clone(), "push:basic");

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.ok();

    let status = replicator.status().await;
    assert_eq!(status.checkpoint, 2);
    assert_eq!(status.completed, 2);

    let accepted = remote.accepted.lock().unwrap();
    assert_eq!(accepted.get("doc1").unwrap(), &vec!["1-a".to_string()]);
    assert_eq!(accepted.get("doc2").unwrap(), &vec!["1-b".to_string()]);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn filtered_revisions_are_skipped_but_checkpoint_still_advances() {
    let store = Arc::new(MemoryStore::new());
    store.put(couch_push_replicator::Revision::new(
        "keep1",
        "1-a",
        0,
        revision_with_text("keep1", "1-a", "keep"),
    ));
    store.put(couch_push_replicator::Revision::new(
        "skip1",
        "1-b",
        0,
        revision_with_text("skip1", "1-b", "skip"),
    ));

    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("filter");
    let cfg = config(checkpoint_path.clone(), "push:filter");

    let filter: Filter = Arc::new(|r: &couch_push_replicator::Revision| r.doc_id.starts_with("keep"));
    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), Some(filter));
    replicator.run(couch_push_replicator::never_stop()).await.ok();

    let status = replicator.status().await;
    assert_eq!(status.checkpoint, 2);

    let accepted = remote.accepted.lock().unwrap();
    assert!(accepted.get("skip1").is_none());
    assert_eq!(accepted.get("keep1").unwrap(), &vec!["1-a".to_string()]);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn a_rejected_revision_does_not_block_the_checkpoint_past_it() {
    let store = Arc::new(MemoryStore::new());
    store.put(couch_push_replicator::Revision::new(
        "docA",
        "1-a",
        0,
        revision_with_text("docA", "1-a", "first"),
    ));
    store.put(couch_push_replicator::Revision::new(
        "docB",
        "1-b",
        0,
        revision_with_text("docB", "1-b", "conflicted"),
    ));

    let remote = Arc::new(FakeRemote::new());
    *remote.reject_once.lock().unwrap() = Some(("docB".to_string(), "1-b".to_string()));

    let checkpoint_path = tmp_checkpoint_path("partial-failure");
    let cfg = config(checkpoint_path.clone(), "push:partial-failure");

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.ok();

    let status = replicator.status().await;
    // docB was permanently rejected (not retried), so the checkpoint still
    // advances past it once both outstanding sequences are resolved.
    assert_eq!(status.checkpoint, 2);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn checkpoint_document_round_trips_through_the_local_cache_on_restart() {
    let checkpoint_path = tmp_checkpoint_path("restart");
    let cache = couch_push_replicator::CheckpointCache::new(checkpoint_path.clone());
    cache
        .save(&CheckpointDocument {
            last_sequence: 5,
            session_id: "abc".to_string(),
        })
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    for i in 1..=7u64 {
        store.put(couch_push_replicator::Revision::new(
            format!("doc{i}"),
            "1-a",
            0,
            revision_with_text(&format!("doc{i}"), "1-a", "x"),
        ));
    }

    // Remote has no checkpoint of its own, so the replicator should fall
    // back to the local cache's last_sequence of 5 and only push docs 6-7.
    let remote = Arc::new(FakeRemote::new());
    let cfg = config(checkpoint_path.clone(), "push:restart");
    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.ok();

    let accepted = remote.accepted.lock().unwrap();
    assert!(accepted.get("doc1").is_none());
    assert!(accepted.get("doc6").is_some());
    assert!(accepted.get("doc7").is_some());

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn create_target_issues_a_put_to_the_database_root_before_replicating() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("create-target");
    let cfg = config(checkpoint_path.clone(), "push:create-target").with_create_target(true);

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.unwrap();

    assert_eq!(*remote.create_target_calls.lock().unwrap(), 1);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn create_target_is_skipped_when_not_requested() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("no-create-target");
    let cfg = config(checkpoint_path.clone(), "push:no-create-target");

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.unwrap();

    assert_eq!(*remote.create_target_calls.lock().unwrap(), 0);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn an_unresolved_named_filter_is_fatal_before_any_batch_is_produced() {
    let store = Arc::new(MemoryStore::new());
    store.put(couch_push_replicator::Revision::new(
        "doc1",
        "1-a",
        0,
        revision_with_text("doc1", "1-a", "hello"),
    ));

    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("filter-fatal");
    let cfg = config(checkpoint_path.clone(), "push:filter-fatal").with_filter_name("nope");

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    let result = replicator.run(couch_push_replicator::never_stop()).await;
    assert!(result.is_err());

    let accepted = remote.accepted.lock().unwrap();
    assert!(accepted.get("doc1").is_none());

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn a_registered_named_filter_is_resolved_and_applied() {
    let store = Arc::new(MemoryStore::new());
    store.register_filter(
        "keep-only",
        Arc::new(|r: &couch_push_replicator::Revision| r.doc_id == "keep1"),
    );
    store.put(couch_push_replicator::Revision::new(
        "keep1",
        "1-a",
        0,
        revision_with_text("keep1", "1-a", "keep"),
    ));
    store.put(couch_push_replicator::Revision::new(
        "skip1",
        "1-b",
        0,
        revision_with_text("skip1", "1-b", "skip"),
    ));

    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("named-filter");
    let cfg = config(checkpoint_path.clone(), "push:named-filter").with_filter_name("keep-only");

    let replicator = PushReplicator::new(cfg, store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.unwrap();

    let accepted = remote.accepted.lock().unwrap();
    assert!(accepted.get("skip1").is_none());
    assert_eq!(accepted.get("keep1").unwrap(), &vec!["1-a".to_string()]);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn continuous_mode_skips_notifications_sourced_from_the_remote_to_avoid_pull_push_cycles() {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("cycle-break");
    let mut cfg = config(checkpoint_path.clone(), "push:cycle-break");
    cfg.continuous = true;

    let replicator = Arc::new(PushReplicator::new(
        cfg,
        store.clone(),
        store.clone(),
        remote.clone(),
        None,
    ));
    let stop = Arc::new(tokio::sync::Notify::new());
    let stop_wait = stop.clone();
    let replicator_task = replicator.clone();
    let handle = tokio::spawn(async move {
        replicator_task
            .run(async move { stop_wait.notified().await })
            .await
    });

    // Let the replicator drain the (empty) backlog and settle into Idle,
    // waiting on the change-notification channel.
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    store.put_with_source(
        couch_push_replicator::Revision::new(
            "fromRemote",
            "1-a",
            0,
            revision_with_text("fromRemote", "1-a", "x"),
        ),
        Some("http://localhost:5984/db/".to_string()),
    );
    store.put_with_source(
        couch_push_replicator::Revision::new(
            "fromLocal",
            "1-b",
            0,
            revision_with_text("fromLocal", "1-b", "y"),
        ),
        None,
    );

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    stop.notify_one();
    handle.await.unwrap().unwrap();

    let accepted = remote.accepted.lock().unwrap();
    assert!(accepted.get("fromRemote").is_none());
    assert_eq!(accepted.get("fromLocal").unwrap(), &vec!["1-b".to_string()]);

    let _ = std::fs::remove_file(&checkpoint_path);
}

#[tokio::test]
async fn rerunning_a_completed_one_shot_replication_uploads_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    store.put(couch_push_replicator::Revision::new(
        "doc1",
        "1-a",
        0,
        revision_with_text("doc1", "1-a", "hello"),
    ));

    let remote = Arc::new(FakeRemote::new());
    let checkpoint_path = tmp_checkpoint_path("rerun-idempotent");
    let cfg = config(checkpoint_path.clone(), "push:rerun-idempotent");

    let replicator = PushReplicator::new(cfg.clone(), store.clone(), store.clone(), remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.unwrap();
    assert_eq!(*remote.bulk_docs_calls.lock().unwrap(), 1);

    // A second replicator built fresh against the same checkpoint file and
    // the same (unchanged) local store must find nothing left to diff, and
    // so must never call `_bulk_docs` again.
    let replicator = PushReplicator::new(cfg, store.clone(), store, remote.clone(), None);
    replicator.run(couch_push_replicator::never_stop()).await.unwrap();
    assert_eq!(*remote.bulk_docs_calls.lock().unwrap(), 1);

    let _ = std::fs::remove_file(&checkpoint_path);
}
