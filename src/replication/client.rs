//! Replica-side segment pull.

use crate::error::Result;
use crate::index::engine::Engine;
use crate::index::file_set::write_bytes_atomic;
use crate::index::snapshot::META_FILE;
use crate::index::storage_size::index_files;
use crate::replication::{ReplicationSource, RevisionSession};
use uuid::Uuid;

/// What one pull did to the local data directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    pub generation: u64,
    pub copied: usize,
    pub removed: usize,
}

/// Brings `engine`'s data directory to the master's current revision.
///
/// Returns `None` when the master has nothing published or the replica is
/// already at that generation.
pub fn pull(
    engine: &Engine,
    source: &dyn ReplicationSource,
    master_uuid: Uuid,
) -> Result<Option<PullReport>> {
    let Some(session) = source.checkout(master_uuid)? else {
        return Ok(None);
    };
    let local = engine.committed_generation();
    let result = match local {
        Ok(generation) if generation == session.generation && generation > 0 => Ok(None),
        _ => apply(engine, source, &session).map(Some),
    };
    source.release(session.generation);

    let report = result?;
    if let Some(report) = &report {
        engine.sync_generation()?;
        tracing::info!(
            "[REPL {}] pulled generation {}: {} copied, {} removed",
            engine.name(),
            report.generation,
            report.copied,
            report.removed
        );
    }
    Ok(report)
}

fn apply(
    engine: &Engine,
    source: &dyn ReplicationSource,
    session: &RevisionSession,
) -> Result<PullReport> {
    let data_dir = engine.data_dir();
    std::fs::create_dir_all(data_dir)?;
    let existing = index_files(data_dir)?;

    let mut copied = 0;
    for (name, length) in &session.files {
        if name == META_FILE || existing.get(name) == Some(length) {
            continue;
        }
        let bytes = source.open_file(session.generation, name)?;
        write_bytes_atomic(&data_dir.join(name), &bytes)?;
        copied += 1;
    }

    // the new meta.json makes the copied segments visible in one step
    let meta = source.open_file(session.generation, META_FILE)?;
    write_bytes_atomic(&data_dir.join(META_FILE), &meta)?;
    copied += 1;

    let mut removed = 0;
    for name in existing.keys() {
        if !session.files.contains_key(name) {
            std::fs::remove_file(data_dir.join(name))?;
            removed += 1;
        }
    }

    Ok(PullReport {
        generation: session.generation,
        copied,
        removed,
    })
}
