//! Master/replica synchronization.
//!
//! A master publishes every commit through its [`publisher::LocalReplicator`]
//! and answers [`ReplicationSource`] calls. A replica resolves its configured
//! [`RemoteMaster`] through a [`ReplicationConnector`], diffs resources and
//! definitions, then pulls segment files with [`client::pull`].

pub mod client;
pub mod poller;
pub mod publisher;

pub use publisher::LocalReplicator;

use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerMap;
use crate::index::fields::FieldMap;
use crate::index::resources::ResourceInfo;
use crate::index::settings::RemoteMaster;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// A published revision checked out by a replica.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionSession {
    pub generation: u64,
    /// File name -> length in bytes.
    pub files: BTreeMap<String, u64>,
}

/// What a master exposes to its replicas.
pub trait ReplicationSource: Send + Sync {
    fn name(&self) -> &str;

    fn uuid(&self) -> Uuid;

    /// Fails with NotAcceptable unless `claimed` is this master's identity.
    fn check_master_uuid(&self, claimed: Uuid) -> Result<()>;

    fn get_resources(&self) -> Result<IndexMap<String, ResourceInfo>>;

    fn get_resource(&self, name: &str) -> Result<Vec<u8>>;

    fn get_fields(&self) -> Result<FieldMap>;

    fn get_analyzers(&self) -> Result<AnalyzerMap>;

    /// Pins the current revision for `claimed`'s replica. `None` when nothing
    /// has been published yet.
    fn checkout(&self, claimed: Uuid) -> Result<Option<RevisionSession>>;

    fn open_file(&self, generation: u64, name: &str) -> Result<Vec<u8>>;

    /// Gives back a revision obtained from `checkout`.
    fn release(&self, generation: u64);
}

/// Resolves a configured master to a live source.
pub trait ReplicationConnector: Send + Sync {
    fn connect(&self, master: &RemoteMaster) -> Result<Arc<dyn ReplicationSource>>;

    /// Called by a master once it is open. Transports that only dial out
    /// have nothing to do here.
    fn publish(&self, _name: &str, _source: Weak<dyn ReplicationSource>) {}

    fn withdraw(&self, _name: &str, _uuid: Uuid) {}
}

/// In-process transport: a registry of live masters keyed by index name.
#[derive(Default)]
pub struct LocalConnector {
    masters: DashMap<String, Weak<dyn ReplicationSource>>,
}

impl LocalConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalConnector::default())
    }

    pub fn masters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .masters
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl ReplicationConnector for LocalConnector {
    fn connect(&self, master: &RemoteMaster) -> Result<Arc<dyn ReplicationSource>> {
        self.masters
            .get(&master.index)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| GriddleError::NotFound(format!("master index: {}", master.index)))
    }

    fn publish(&self, name: &str, source: Weak<dyn ReplicationSource>) {
        self.masters.insert(name.to_string(), source);
    }

    fn withdraw(&self, name: &str, uuid: Uuid) {
        self.masters.remove_if(name, |_, source| {
            source.upgrade().map_or(true, |source| source.uuid() == uuid)
        });
    }
}
