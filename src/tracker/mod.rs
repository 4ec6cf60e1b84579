//! Active query tracker
//!
//! Bounds the number of queries that evaluate at the same time and keeps
//! a memory-mapped record of the ones currently running. If the process
//! dies, the next tracker opened on the same directory reports the
//! queries that never finished.
//!
//! # File layout
//!
//! ```text
//! [                                     1 byte
//! {"query":"up","timestamp_sec":1}\0…,  slot 0, ENTRY_SIZE bytes
//! \0\0\0…                               slot 1, free
//! …
//! ```
//!
//! An occupied slot holds a JSON object padded with zero bytes and ends
//! with a comma, so stripping the zeros and closing the trailing comma
//! with `]` gives a JSON array of the queries in flight.

pub mod error;

pub use error::{TrackerError, TrackerResult};

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bytes reserved for each query
pub const ENTRY_SIZE: usize = 1000;

/// Name of the memory-mapped file inside the tracker directory
pub const ACTIVE_QUERY_FILE: &str = "queries.active";

/// One query as recorded in a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveQueryEntry {
    pub query: String,
    pub timestamp_sec: i64,
}

/// Memory-mapped admission control for concurrent queries
#[derive(Debug)]
pub struct ActiveQueryTracker {
    path: PathBuf,
    capacity: usize,
    mmap: Mutex<MmapMut>,
    free: Mutex<VecDeque<usize>>,
    permits: Arc<Semaphore>,
    recovered: Vec<ActiveQueryEntry>,
}

impl ActiveQueryTracker {
    /// Open the tracker file in `dir`, creating the directory if needed
    ///
    /// Queries left behind by a previous process are read before the file
    /// is reset and are available from [`recovered_queries`].
    ///
    /// [`recovered_queries`]: ActiveQueryTracker::recovered_queries
    pub fn new(dir: impl AsRef<Path>, capacity: usize) -> TrackerResult<Self> {
        if capacity == 0 {
            return Err(TrackerError::InvalidCapacity(capacity));
        }

        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(ACTIVE_QUERY_FILE);

        let recovered = recover_unfinished(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((1 + capacity * ENTRY_SIZE) as u64)?;

        // The file stays private to this tracker for as long as the mapping lives
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[0] = b'[';

        tracing::debug!(path = %path.display(), capacity, "Active query tracker opened");

        Ok(Self {
            path,
            capacity,
            mmap: Mutex::new(mmap),
            free: Mutex::new((0..capacity).collect()),
            permits: Arc::new(Semaphore::new(capacity)),
            recovered,
        })
    }

    /// Maximum number of queries admitted at once
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queries that were still running when the previous process stopped
    pub fn recovered_queries(&self) -> &[ActiveQueryEntry] {
        &self.recovered
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot and record `query` in it
    ///
    /// Waiters are admitted in arrival order. Dropping the returned future
    /// gives up the place in line without taking a slot; dropping the
    /// returned slot frees it again.
    pub async fn insert(self: &Arc<Self>, query: &str) -> TrackerResult<ActiveQuerySlot> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TrackerError::Closed)?;

        let index = lock(&self.free)?
            .pop_front()
            .ok_or(TrackerError::NoFreeSlot)?;
        let slot = ActiveQuerySlot {
            tracker: Arc::clone(self),
            index,
            _permit: permit,
        };

        let entry = encode_entry(query, chrono::Utc::now().timestamp())?;
        self.write_slot(index, &entry)?;
        tracing::debug!(slot = index, query = %query, "Query admitted");

        Ok(slot)
    }

    fn write_slot(&self, index: usize, entry: &[u8]) -> TrackerResult<()> {
        let mut mmap = lock(&self.mmap)?;
        let start = slot_offset(index);
        let slot = &mut mmap[start..start + ENTRY_SIZE];
        slot.fill(0);
        slot[..entry.len()].copy_from_slice(entry);
        slot[ENTRY_SIZE - 1] = b',';
        Ok(())
    }

    fn release(&self, index: usize) {
        {
            let mut mmap = self.mmap.lock().unwrap_or_else(|e| e.into_inner());
            let start = slot_offset(index);
            mmap[start..start + ENTRY_SIZE].fill(0);
        }
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(index);
        tracing::debug!(slot = index, "Query slot released");
    }

    /// Raw view of every slot, for inspection
    pub fn snapshot(&self) -> TrackerResult<Vec<u8>> {
        Ok(lock(&self.mmap)?.to_vec())
    }
}

/// A held admission slot; the slot is cleared and freed on drop
#[derive(Debug)]
pub struct ActiveQuerySlot {
    tracker: Arc<ActiveQueryTracker>,
    index: usize,
    // Released after the slot is back on the free list
    _permit: OwnedSemaphorePermit,
}

impl ActiveQuerySlot {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ActiveQuerySlot {
    fn drop(&mut self) {
        self.tracker.release(self.index);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> TrackerResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| TrackerError::Lock(e.to_string()))
}

fn slot_offset(index: usize) -> usize {
    1 + index * ENTRY_SIZE
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary
fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Serialize an entry that leaves room for the slot's trailing comma
fn encode_entry(query: &str, timestamp_sec: i64) -> TrackerResult<Vec<u8>> {
    let mut text = query;
    loop {
        let entry = serde_json::to_vec(&ActiveQueryEntry {
            query: text.to_string(),
            timestamp_sec,
        })?;
        if entry.len() < ENTRY_SIZE {
            return Ok(entry);
        }
        // Escaping can make the JSON longer than the text, so shrink by the overflow
        let overflow = entry.len() - (ENTRY_SIZE - 1);
        text = truncate_to_boundary(text, text.len().saturating_sub(overflow));
    }
}

/// Turn the contents of an old tracker file into a JSON array, if it
/// recorded any queries
fn parse_unfinished(bytes: &[u8]) -> Option<String> {
    let mut queries: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != '\0')
        .collect();
    // A lone '[' means no slot was occupied
    if queries.chars().count() <= 1 {
        return None;
    }
    queries.pop();
    queries.push(']');
    Some(queries)
}

fn recover_unfinished(path: &Path) -> Vec<ActiveQueryEntry> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read active query file");
            return Vec::new();
        }
    };

    let Some(queries) = parse_unfinished(&bytes) else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<ActiveQueryEntry>>(&queries) {
        Ok(entries) => {
            tracing::info!(queries = %queries, "These queries didn't finish in the last run");
            entries
        }
        Err(e) => {
            tracing::warn!(error = %e, contents = %queries, "Active query file is corrupt");
            Vec::new()
        }
    }
}
