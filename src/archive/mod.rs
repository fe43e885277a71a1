//! Content-addressable archive of recorded HTTP exchanges

mod format;
mod reader;
mod writer;

pub use format::{
    decode_record, encode_record, ResponseRecord, FILE_HEADER_SIZE, FILE_MAGIC, FRAME_OVERHEAD,
    SCHEMA_VERSION,
};
pub use reader::{ArchiveReader, RecordIter};
pub use writer::{epoch_millis, ArchiveWriter};

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::fingerprint::RequestKey;
use crate::Result;

/// In-memory replay index over an archive file
///
/// Duplicate keys are kept in insertion order; each key carries an atomic
/// cursor so N identical requests observe the N successive recorded
/// responses, saturating at the last one. Lookups never write.
pub struct Archive {
    slots: DashMap<RequestKey, ReplaySlot>,
    record_count: u64,
    identity: String,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

struct ReplaySlot {
    responses: Vec<Arc<ResponseRecord>>,
    cursor: AtomicUsize,
}

impl Archive {
    /// Load an archive file into the replay index
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or any record is invalid;
    /// replay fails fast rather than serving a damaged archive.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = ArchiveReader::open(path)?;
        let identity = reader.identity();

        let slots: DashMap<RequestKey, ReplaySlot> = DashMap::new();
        let mut record_count = 0u64;
        for record in reader.records() {
            let (key, response) = record?;
            slots
                .entry(key)
                .or_insert_with(|| ReplaySlot {
                    responses: Vec::with_capacity(1),
                    cursor: AtomicUsize::new(0),
                })
                .responses
                .push(Arc::new(response));
            record_count += 1;
        }

        info!(
            archive = %path.display(),
            identity = %&identity[..16],
            records = record_count,
            keys = slots.len(),
            "archive loaded"
        );

        Ok(Self {
            slots,
            record_count,
            identity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        })
    }

    /// Build an empty index (used while recording, for statistics only)
    #[must_use]
    pub fn empty(identity: String) -> Self {
        Self {
            slots: DashMap::new(),
            record_count: 0,
            identity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Look up the next recorded response for a key
    ///
    /// Advances the key's insertion-order cursor; repeated lookups past
    /// the last duplicate keep returning the last recorded response.
    #[must_use]
    pub fn lookup(&self, key: &RequestKey) -> Option<Arc<ResponseRecord>> {
        match self.slots.get(key) {
            Some(slot) => {
                let index = slot.cursor.fetch_add(1, Ordering::Relaxed);
                let index = index.min(slot.responses.len() - 1);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&slot.responses[index]))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Total number of records in the archive
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of distinct request keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }

    /// Archive identity (hex SHA-256 of the file bytes)
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Replay hits observed this session
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Replay misses observed this session
    #[must_use]
    pub fn miss_count(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Compute an archive file's identity: hex SHA-256 of its bytes
///
/// # Errors
///
/// Returns error if the file cannot be read
pub fn archive_identity(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
