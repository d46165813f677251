//! Worker identities for correlating concurrent activity in logs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker name must not be empty")]
    EmptyName,
}

/// Identity of one worker thread.
///
/// A plain data carrier: it holds no handle to the thread, so log records can
/// keep it after the worker has gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    tid: u64,
    number: u64,
    name: String,
}

impl WorkerRecord {
    /// The OS thread id.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The sequence number assigned at registration.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} (tid {})", self.name, self.number, self.tid)
    }
}

/// Assigns and remembers worker identities.
pub struct WorkerRegistry {
    next_number: AtomicU64,
    workers: RwLock<HashMap<ThreadId, Arc<WorkerRecord>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            next_number: AtomicU64::new(0),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the calling thread under `name`.
    ///
    /// Each thread is registered once; calling this again from the same
    /// thread returns the record created the first time.
    pub fn register_current(&self, name: &str) -> Result<Arc<WorkerRecord>, WorkerError> {
        if name.is_empty() {
            return Err(WorkerError::EmptyName);
        }

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let id = thread::current().id();
        if let Some(existing) = workers.get(&id) {
            return Ok(Arc::clone(existing));
        }

        // Numbers are drawn under the write lock, so registrations complete
        // in number order.
        let record = Arc::new(WorkerRecord {
            tid: os_thread_id(),
            number: self.next_number.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
        });
        workers.insert(id, Arc::clone(&record));
        drop(workers);

        debug!("registered worker {}", record);
        Ok(record)
    }

    /// Returns the calling thread's record, if it registered.
    pub fn current(&self) -> Option<Arc<WorkerRecord>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread::current().id())
            .cloned()
    }

    /// Forgets the calling thread. Call when the worker ends.
    pub fn unregister_current(&self) -> Option<Arc<WorkerRecord>> {
        let removed = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread::current().id());
        if let Some(ref record) = removed {
            debug!("unregistered worker {}", record);
        }
        removed
    }

    /// Number of currently registered workers.
    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn os_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}
