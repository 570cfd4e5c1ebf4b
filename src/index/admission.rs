use crate::error::{GriddleError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tantivy::Executor;

/// Per-schema load limits shared by every index of the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub max_concurrent_reads: usize,
    pub max_concurrent_writes: usize,
    pub timeout: Duration,
    /// Documents across all indices of the schema. 0 disables the quota.
    pub max_docs: u64,
    /// Threads of the shared search executor. 0 runs searches inline.
    pub search_threads: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            max_concurrent_reads: 64,
            max_concurrent_writes: 8,
            timeout: Duration::from_millis(30_000),
            max_docs: 0,
            search_threads: 0,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AdmissionConfig {
    pub fn from_env() -> Self {
        let defaults = AdmissionConfig::default();
        AdmissionConfig {
            max_concurrent_reads: env_or(
                "GRIDDLE_MAX_CONCURRENT_READS",
                defaults.max_concurrent_reads,
            ),
            max_concurrent_writes: env_or(
                "GRIDDLE_MAX_CONCURRENT_WRITES",
                defaults.max_concurrent_writes,
            ),
            timeout: Duration::from_millis(env_or("GRIDDLE_ADMISSION_TIMEOUT_MS", 30_000)),
            max_docs: env_or("GRIDDLE_MAX_DOCS_PER_SCHEMA", defaults.max_docs),
            search_threads: env_or("GRIDDLE_SEARCH_THREADS", defaults.search_threads),
        }
    }
}

/// Admission capability injected into every instance of a schema.
///
/// Permits are released when the returned [`Permit`] drops, so every exit
/// path of the guarded operation gives its permit back exactly once.
pub trait AdmissionGate: Send + Sync {
    fn acquire_read(&self) -> Result<Permit>;
    fn acquire_write(&self) -> Result<Permit>;
    /// Fails when adding `added` documents to `index` would break the quota.
    fn check_size(&self, index: &str, added: usize) -> Result<()>;
    fn record_docs(&self, index: &str, num_docs: u64);
    fn forget(&self, index: &str);
    /// Thread pool for query sub-tasks.
    fn executor(&self) -> Executor;
}

/// A counting semaphore whose waits give up after a timeout.
pub struct PermitPool {
    kind: &'static str,
    max: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl PermitPool {
    pub fn new(kind: &'static str, max: usize) -> Arc<Self> {
        Arc::new(PermitPool {
            kind,
            max: max.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Permit> {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.in_use.lock();
        while *in_use >= self.max {
            if self.released.wait_until(&mut in_use, deadline).timed_out() && *in_use >= self.max
            {
                return Err(GriddleError::Interrupted(format!(
                    "no {} permit after {:?} ({} in use)",
                    self.kind, timeout, self.max
                )));
            }
        }
        *in_use += 1;
        Ok(Permit {
            pool: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.released.notify_one();
    }
}

pub struct Permit {
    pool: Arc<PermitPool>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// The default gate: bounded read/write pools plus a document quota.
pub struct SchemaGate {
    reads: Arc<PermitPool>,
    writes: Arc<PermitPool>,
    timeout: Duration,
    max_docs: u64,
    docs: DashMap<String, u64>,
    executor: Executor,
}

impl SchemaGate {
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        let executor = if config.search_threads > 0 {
            Executor::multi_thread(config.search_threads, "griddle-search-")?
        } else {
            Executor::single_thread()
        };
        Ok(SchemaGate {
            reads: PermitPool::new("read", config.max_concurrent_reads),
            writes: PermitPool::new("write", config.max_concurrent_writes),
            timeout: config.timeout,
            max_docs: config.max_docs,
            docs: DashMap::new(),
            executor,
        })
    }

    pub fn from_env() -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(AdmissionConfig::from_env())?))
    }

    pub fn active_reads(&self) -> usize {
        self.reads.in_use()
    }

    pub fn active_writes(&self) -> usize {
        self.writes.in_use()
    }

    pub fn total_docs(&self) -> u64 {
        self.docs.iter().map(|entry| *entry.value()).sum()
    }
}

impl AdmissionGate for SchemaGate {
    fn acquire_read(&self) -> Result<Permit> {
        self.reads.acquire(self.timeout)
    }

    fn acquire_write(&self) -> Result<Permit> {
        self.writes.acquire(self.timeout)
    }

    fn check_size(&self, index: &str, added: usize) -> Result<()> {
        if self.max_docs == 0 {
            return Ok(());
        }
        let current = self.total_docs();
        if current + added as u64 > self.max_docs {
            return Err(GriddleError::QuotaExceeded {
                index: index.to_string(),
                current,
                max: self.max_docs,
            });
        }
        Ok(())
    }

    fn record_docs(&self, index: &str, num_docs: u64) {
        self.docs.insert(index.to_string(), num_docs);
    }

    fn forget(&self, index: &str) {
        self.docs.remove(index);
    }

    fn executor(&self) -> Executor {
        self.executor.clone()
    }
}
