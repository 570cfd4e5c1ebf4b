#![allow(dead_code)]

use griddle::{
    AdmissionConfig, FieldDefinition, FieldMap, IndexInstance, IndexInstanceManager,
    IndexSettings, InstanceContext, LocalConnector, MappedDocument, SchemaGate,
};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A schema directory with its own gate and in-process transport.
pub struct Schema {
    pub dir: TempDir,
    pub context: InstanceContext,
}

impl Schema {
    pub fn new() -> Self {
        init_tracing();
        let gate = SchemaGate::new(AdmissionConfig {
            timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .unwrap();
        Schema {
            dir: TempDir::new().unwrap(),
            context: InstanceContext::new(Arc::new(gate), LocalConnector::new()),
        }
    }

    pub fn manager(&self, name: &str) -> IndexInstanceManager {
        IndexInstanceManager::new(self.dir.path().join(name), self.context.clone()).unwrap()
    }

    pub fn master(&self, name: &str) -> (IndexInstanceManager, Arc<IndexInstance>) {
        let manager = self.manager(name);
        let instance = manager.create_update(master_settings()).unwrap();
        (manager, instance)
    }

    pub fn replica(&self, name: &str, master: &str) -> (IndexInstanceManager, Arc<IndexInstance>) {
        let manager = self.manager(name);
        let instance = manager.create_update(replica_settings(master)).unwrap();
        (manager, instance)
    }
}

pub fn master_settings() -> IndexSettings {
    IndexSettings {
        writer_threads: Some(1),
        ..Default::default()
    }
}

/// Replica without a background poller; tests drive cycles explicitly.
pub fn replica_settings(master: &str) -> IndexSettings {
    IndexSettings {
        replication_interval_secs: 0,
        ..IndexSettings::replica_of(master)
    }
}

pub fn title_fields() -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(
        "title".into(),
        FieldDefinition::Text {
            analyzer: None,
            query_analyzer: None,
        },
    );
    fields
}

pub fn book_fields() -> FieldMap {
    let mut fields = title_fields();
    fields.insert("genre".into(), FieldDefinition::Facet);
    fields.insert("year".into(), FieldDefinition::Long);
    fields.insert("price".into(), FieldDefinition::Double);
    fields.insert("author".into(), FieldDefinition::String);
    fields
}

pub fn doc(value: serde_json::Value) -> MappedDocument {
    value.as_object().cloned().unwrap()
}
