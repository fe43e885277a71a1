//! Append-only archive writer

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::format::{encode_record, ResponseRecord, FILE_MAGIC, SCHEMA_VERSION};
use crate::fingerprint::RequestKey;
use crate::Result;

/// Writer for archive files
///
/// Records are only ever appended; bytes already written never change.
/// Every append flushes before returning so the record is durable before
/// the proxy answers the client.
pub struct ArchiveWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    record_count: u64,
}

impl ArchiveWriter {
    /// Create a new archive file, truncating any existing one
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or the header written
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&FILE_MAGIC)?;
        writer.write_all(&[SCHEMA_VERSION])?;
        writer.flush()?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            record_count: 0,
        })
    }

    /// Append one recorded exchange and flush it to disk
    ///
    /// # Errors
    ///
    /// Returns error if the write or flush fails
    pub fn append(&mut self, key: &RequestKey, response: &ResponseRecord) -> Result<()> {
        let payload = encode_record(key, response);
        let crc = crc32fast::hash(&payload);

        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(&crc.to_be_bytes())?;
        self.writer.flush()?;

        self.record_count += 1;
        debug!(
            key = %key.short_digest(),
            status = response.status,
            records = self.record_count,
            "archived exchange"
        );
        Ok(())
    }

    /// Number of records appended so far
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Path of the archive file being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the file and return the archive identity (hex SHA-256 of the
    /// file bytes)
    ///
    /// # Errors
    ///
    /// Returns error if the sync or the identity read fails
    pub fn finalize(mut self) -> Result<String> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        super::archive_identity(&self.path)
    }
}

/// Current time as Unix epoch milliseconds
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}
