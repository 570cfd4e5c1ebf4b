use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_writer_buffer_mb() -> usize {
    50
}

fn default_replication_interval_secs() -> u64 {
    60
}

/// Location of the master a replica pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMaster {
    pub index: String,
}

impl RemoteMaster {
    pub fn new(index: impl Into<String>) -> Self {
        RemoteMaster {
            index: index.into(),
        }
    }
}

/// Per-index settings persisted as `settings.json`.
///
/// Settings are never applied to a live instance: any change goes through a
/// full close and reopen in [`crate::IndexInstanceManager::create_update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    #[serde(rename = "master", skip_serializing_if = "Option::is_none")]
    pub master: Option<RemoteMaster>,

    #[serde(rename = "writerBufferMb", default = "default_writer_buffer_mb")]
    pub writer_buffer_mb: usize,

    #[serde(rename = "writerThreads", skip_serializing_if = "Option::is_none")]
    pub writer_threads: Option<usize>,

    #[serde(
        rename = "replicationIntervalSecs",
        default = "default_replication_interval_secs"
    )]
    pub replication_interval_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            master: None,
            writer_buffer_mb: default_writer_buffer_mb(),
            writer_threads: None,
            replication_interval_secs: default_replication_interval_secs(),
        }
    }
}

impl IndexSettings {
    pub fn replica_of(master: impl Into<String>) -> Self {
        IndexSettings {
            master: Some(RemoteMaster::new(master)),
            ..Default::default()
        }
    }

    pub fn is_replica(&self) -> bool {
        self.master.is_some()
    }

    pub fn writer_buffer_bytes(&self) -> usize {
        // tantivy refuses arenas under 15MB per thread
        self.writer_buffer_mb.max(15) * 1024 * 1024
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: IndexSettings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<()> {
        crate::index::file_set::write_json_atomic(path.as_ref(), self)
    }
}
