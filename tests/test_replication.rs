mod common;

use common::{book_fields, doc, replica_settings, title_fields, Schema};
use griddle::{
    AnalyzerDefinition, FieldDefinition, FilterDefinition, GriddleError, IndexSettings, Query,
    QueryDefinition, Role,
};
use griddle::replication::RevisionSession;
use griddle::{
    AnalyzerMap, FieldMap, IndexInstanceManager, InstanceContext, LocalConnector,
    ReplicationConnector, ReplicationSource, ResourceInfo, RemoteMaster,
};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Local transport that counts resource downloads.
#[derive(Default)]
struct CountingConnector {
    local: LocalConnector,
    fetches: Arc<AtomicUsize>,
}

struct CountingSource {
    inner: Arc<dyn ReplicationSource>,
    fetches: Arc<AtomicUsize>,
}

impl ReplicationSource for CountingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }

    fn check_master_uuid(&self, claimed: Uuid) -> griddle::Result<()> {
        self.inner.check_master_uuid(claimed)
    }

    fn get_resources(&self) -> griddle::Result<IndexMap<String, ResourceInfo>> {
        self.inner.get_resources()
    }

    fn get_resource(&self, name: &str) -> griddle::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.get_resource(name)
    }

    fn get_fields(&self) -> griddle::Result<FieldMap> {
        self.inner.get_fields()
    }

    fn get_analyzers(&self) -> griddle::Result<AnalyzerMap> {
        self.inner.get_analyzers()
    }

    fn checkout(&self, claimed: Uuid) -> griddle::Result<Option<RevisionSession>> {
        self.inner.checkout(claimed)
    }

    fn open_file(&self, generation: u64, name: &str) -> griddle::Result<Vec<u8>> {
        self.inner.open_file(generation, name)
    }

    fn release(&self, generation: u64) {
        self.inner.release(generation)
    }
}

impl ReplicationConnector for CountingConnector {
    fn connect(&self, master: &RemoteMaster) -> griddle::Result<Arc<dyn ReplicationSource>> {
        let inner = self.local.connect(master)?;
        Ok(Arc::new(CountingSource {
            inner,
            fetches: Arc::clone(&self.fetches),
        }))
    }

    fn publish(&self, name: &str, source: Weak<dyn ReplicationSource>) {
        self.local.publish(name, source)
    }

    fn withdraw(&self, name: &str, uuid: Uuid) {
        self.local.withdraw(name, uuid)
    }
}

fn stop_analyzer() -> AnalyzerDefinition {
    AnalyzerDefinition {
        filters: vec![
            FilterDefinition::Lowercase,
            FilterDefinition::StopWords {
                resource: "stop.txt".into(),
            },
        ],
        ..Default::default()
    }
}

// ── full cycle ──────────────────────────────────────────────────────────

#[test]
fn test_post_backup_then_replicate() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    assert_eq!(
        master
            .post_mapped_document(doc(json!({"title": "hello world"})))
            .unwrap(),
        1
    );
    let result = master.search(&QueryDefinition::default()).unwrap();
    assert_eq!(result.total_hits, 1);

    let backup = master.backup(&schema.dir.path().join("backup")).unwrap();
    assert!(backup.file_count.unwrap() > 0);
    assert_eq!(backup.version, Some(master.get_status().unwrap().generation));

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();
    assert_eq!(replica.get_fields(), master.get_fields());
    assert_eq!(
        replica.get_status().unwrap().num_docs,
        master.get_status().unwrap().num_docs
    );
}

#[test]
fn test_replica_mirrors_master() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.post_resource("stop.txt", 1_700_000_000_000, b"the\n").unwrap();
    master.set_analyzer("stops", stop_analyzer()).unwrap();
    let mut fields = book_fields();
    fields.insert(
        "title".into(),
        FieldDefinition::Text {
            analyzer: Some("stops".into()),
            query_analyzer: None,
        },
    );
    master.set_fields(fields).unwrap();
    master
        .post_mapped_documents(vec![
            doc(json!({"_id": "1", "title": "The Dune", "genre": "sf", "year": 1965})),
            doc(json!({"_id": "2", "title": "Emma", "genre": "classic", "year": 1815})),
        ])
        .unwrap();

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    assert_eq!(replica.role(), Role::Replica);
    replica.replication_check().unwrap();

    assert_eq!(replica.get_fields(), master.get_fields());
    assert_eq!(replica.get_analyzers(), master.get_analyzers());
    assert_eq!(replica.get_resources().unwrap(), master.get_resources().unwrap());
    assert_eq!(replica.get_resource("stop.txt").unwrap(), b"the\n");

    let status = replica.get_status().unwrap();
    assert_eq!(status.num_docs, 2);
    assert_eq!(status.master_uuid, Some(master.uuid()));
    assert_eq!(status.generation, master.get_status().unwrap().generation);

    let result = replica
        .search(&QueryDefinition::new(Query::Text {
            field: "title".into(),
            text: "dune".into(),
            all: false,
        }))
        .unwrap();
    assert_eq!(result.total_hits, 1);
    assert_eq!(result.documents[0].id, "1");
}

#[test]
fn test_replica_follows_updates_and_deletes() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_document(json!({"_id": "1", "title": "one"})).unwrap();
    master.post_resource("words.txt", 1_000, b"a\n").unwrap();

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();
    assert_eq!(replica.get_status().unwrap().num_docs, 1);

    master.post_document(json!({"_id": "2", "title": "two"})).unwrap();
    master.delete_resource("words.txt").unwrap();
    let mut fields = master.get_fields();
    fields.insert("year".into(), FieldDefinition::Long);
    master.set_fields(fields).unwrap();

    replica.replication_check().unwrap();
    assert_eq!(replica.get_status().unwrap().num_docs, 2);
    assert!(replica.get_resources().unwrap().is_empty());
    assert!(replica.get_fields().contains_key("year"));

    master.delete_all().unwrap();
    replica.replication_check().unwrap();
    assert_eq!(replica.search(&QueryDefinition::default()).unwrap().total_hits, 0);
}

#[test]
fn test_empty_master_replicates_definitions_only() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();
    assert_eq!(replica.get_fields(), title_fields());
    assert_eq!(replica.get_status().unwrap().num_docs, 0);
}

// ── guards ──────────────────────────────────────────────────────────────

#[test]
fn test_replica_rejects_edits() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_document(json!({"_id": "1", "title": "one"})).unwrap();
    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();

    let unsupported = |result: griddle::Result<()>| {
        assert!(matches!(
            result.unwrap_err(),
            GriddleError::UnsupportedOperation(_)
        ));
    };
    unsupported(replica.post_document(json!({"_id": "1"})).map(|_| ()));
    unsupported(replica.set_fields(title_fields()));
    unsupported(replica.set_analyzer("a", AnalyzerDefinition::default()));
    unsupported(replica.post_resource("r.txt", 0, b"x").map(|_| ()));
    unsupported(replica.delete_all().map(|_| ()));
    unsupported(
        replica
            .update_doc_values(doc(json!({"_id": "1", "title": "changed"})))
            .map(|_| ()),
    );
    unsupported(replica.delete_by_query(&Query::MatchAll).map(|_| ()));
    assert_eq!(replica.get_status().unwrap().num_docs, 1);
}

#[test]
fn test_master_without_source_rejects_replication_check() {
    let schema = Schema::new();
    let (_manager, master) = schema.master("books");
    let err = master.replication_check().unwrap_err();
    assert!(matches!(err, GriddleError::NotAcceptable(_)));
}

#[test]
fn test_missing_master_is_not_found() {
    let schema = Schema::new();
    let (_replica_manager, replica) = schema.replica("books_copy", "nowhere");
    let err = replica.replication_check().unwrap_err();
    assert!(matches!(err, GriddleError::NotFound(_)));
}

#[test]
fn test_recreated_master_is_refused() {
    let schema = Schema::new();
    let (master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_document(json!({"_id": "1", "title": "one"})).unwrap();

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();
    let bound = master.uuid();
    drop(master);

    master_manager.delete().unwrap();
    let recreated = master_manager
        .create_update(common::master_settings())
        .unwrap();
    assert_ne!(recreated.uuid(), bound);

    let err = replica.replication_check().unwrap_err();
    assert!(matches!(err, GriddleError::NotAcceptable(_)));
    assert_eq!(replica.get_status().unwrap().num_docs, 1);
    assert_eq!(replica.get_status().unwrap().master_uuid, Some(bound));
}

#[test]
fn test_failed_resource_keeps_previous_definitions() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_resource("ok.txt", 1_000, b"a\n").unwrap();

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();

    // a directory squatting on the resource path makes the replica's write fail
    let squatted = schema
        .dir
        .path()
        .join("books_copy")
        .join("resources")
        .join("blocked.txt");
    std::fs::create_dir_all(squatted.join("inner")).unwrap();
    master.post_resource("blocked.txt", 2_000, b"b\n").unwrap();
    let mut fields = title_fields();
    fields.insert("year".into(), FieldDefinition::Long);
    master.set_fields(fields).unwrap();

    let err = replica.replication_check().unwrap_err();
    match err {
        GriddleError::Replication { resource, index, .. } => {
            assert_eq!(resource, "blocked.txt");
            assert_eq!(index, "books_copy");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!replica.get_fields().contains_key("year"));
    assert!(replica.get_resources().unwrap().contains_key("ok.txt"));
}

// ── concurrency ─────────────────────────────────────────────────────────

#[test]
fn test_concurrent_checks_converge() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_resource("stop.txt", 1_000, b"a\n").unwrap();
    for i in 0..5 {
        master
            .post_document(json!({"_id": i.to_string(), "title": format!("book {}", i)}))
            .unwrap();
    }

    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let replica = Arc::clone(&replica);
            thread::spawn(move || replica.replication_check())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let status = replica.get_status().unwrap();
    assert_eq!(status.num_docs, 5);
    assert_eq!(status.generation, 5);
    assert_eq!(replica.get_resources().unwrap(), master.get_resources().unwrap());
}

#[test]
fn test_replica_readers_survive_cycles() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_document(json!({"_id": "0", "title": "start"})).unwrap();
    let (_replica_manager, replica) = schema.replica("books_copy", "books");
    replica.replication_check().unwrap();

    let reader = {
        let replica = Arc::clone(&replica);
        thread::spawn(move || {
            for _ in 0..50 {
                let hits = replica
                    .search(&QueryDefinition::default())
                    .unwrap()
                    .total_hits;
                assert!(hits >= 1);
            }
        })
    };
    for i in 1..5 {
        master
            .post_document(json!({"_id": i.to_string(), "title": "more"}))
            .unwrap();
        replica.replication_check().unwrap();
    }
    reader.join().unwrap();
    assert_eq!(replica.get_status().unwrap().num_docs, 5);
}

#[test]
fn test_unchanged_resources_fetched_once() {
    let schema = Schema::new();
    let connector = Arc::new(CountingConnector::default());
    let fetches = Arc::clone(&connector.fetches);
    let context = InstanceContext::new(Arc::clone(&schema.context.gate), connector);

    let master_manager =
        IndexInstanceManager::new(schema.dir.path().join("books"), context.clone()).unwrap();
    let master = master_manager
        .create_update(common::master_settings())
        .unwrap();
    master.post_resource("stop.txt", 1_000, b"the\n").unwrap();
    master.post_resource("syn.txt", 2_000, b"a,b\n").unwrap();

    let replica_manager =
        IndexInstanceManager::new(schema.dir.path().join("books_copy"), context).unwrap();
    let replica = replica_manager
        .create_update(replica_settings("books"))
        .unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let replica = Arc::clone(&replica);
            thread::spawn(move || replica.replication_check())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    replica.replication_check().unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(replica.get_resources().unwrap(), master.get_resources().unwrap());

    master.post_resource("syn.txt", 3_000, b"a,b,c\n").unwrap();
    replica.replication_check().unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 3);
}

// ── scheduled replication ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poller_pulls_on_schedule() {
    let schema = Schema::new();
    let (_master_manager, master) = schema.master("books");
    master.set_fields(title_fields()).unwrap();
    master.post_document(json!({"_id": "1", "title": "one"})).unwrap();

    let replica_manager = schema.manager("books_copy");
    let replica = replica_manager
        .create_update(IndexSettings {
            replication_interval_secs: 1,
            ..replica_settings("books")
        })
        .unwrap();

    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if replica.get_status().unwrap().num_docs == 1 {
            synced = true;
            break;
        }
    }
    assert!(synced, "replica never pulled");
    assert_eq!(replica.get_fields(), title_fields());

    replica_manager.close();
    assert!(replica.is_closed());
}
