//! Archive file reader

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use super::format::{
    decode_record, ResponseRecord, FILE_HEADER_SIZE, FILE_MAGIC, SCHEMA_VERSION,
};
use crate::fingerprint::RequestKey;
use crate::{ReplayError, Result};

/// Reader for archive files
#[derive(Debug)]
pub struct ArchiveReader {
    _file: File,
    mmap: Mmap,
}

impl ArchiveReader {
    /// Open an existing archive file
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, cannot be mapped, or does
    /// not start with the expected magic and schema version
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ReplayError::FileNotFound(path.display().to_string()));
        }
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FILE_HEADER_SIZE {
            return Err(ReplayError::InvalidFormat(
                "file too small to contain header".to_string(),
            ));
        }
        if mmap[..8] != FILE_MAGIC {
            return Err(ReplayError::InvalidFormat(format!(
                "bad magic: expected {:?}, got {:?}",
                FILE_MAGIC,
                &mmap[..8]
            )));
        }
        if mmap[8] != SCHEMA_VERSION {
            return Err(ReplayError::InvalidFormat(format!(
                "unsupported schema version: {} (expected {SCHEMA_VERSION})",
                mmap[8]
            )));
        }

        Ok(Self { _file: file, mmap })
    }

    /// Iterate the records in file order
    #[must_use]
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            data: &self.mmap,
            pos: FILE_HEADER_SIZE,
        }
    }

    /// Archive identity: hex SHA-256 of the file bytes
    #[must_use]
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.mmap[..]);
        hex::encode(hasher.finalize())
    }
}

/// Iterator over `(RequestKey, ResponseRecord)` pairs in an archive
pub struct RecordIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<(RequestKey, ResponseRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        Some(self.read_frame())
    }
}

impl RecordIter<'_> {
    fn read_frame(&mut self) -> Result<(RequestKey, ResponseRecord)> {
        let frame_offset = self.pos as u64;

        if self.pos + 4 > self.data.len() {
            return Err(ReplayError::InvalidFormat(format!(
                "truncated frame length at offset {frame_offset}"
            )));
        }
        let len = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]) as usize;
        self.pos += 4;

        if self.pos + len + 4 > self.data.len() {
            return Err(ReplayError::InvalidFormat(format!(
                "truncated frame payload at offset {frame_offset}"
            )));
        }
        let payload = &self.data[self.pos..self.pos + len];
        self.pos += len;

        let expected = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(ReplayError::CorruptedData {
                offset: frame_offset,
                expected,
                actual,
            });
        }

        decode_record(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::{epoch_millis, ArchiveWriter};
    use tempfile::TempDir;

    fn write_archive(path: &Path, bodies: &[&[u8]]) {
        let mut writer = ArchiveWriter::create(path).unwrap();
        let key = RequestKey::new("GET", "example.test", "/a", &[], b"");
        for body in bodies {
            let response = ResponseRecord {
                status: 200,
                reason: "OK".to_string(),
                headers: vec![],
                body: body.to_vec(),
                recorded_at_ms: epoch_millis(),
            };
            writer.append(&key, &response).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_roundtrip_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wpr");
        write_archive(&path, &[b"one", b"two", b"three"]);

        let reader = ArchiveReader::open(&path).unwrap();
        let records: Vec<_> = reader.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].1.body, b"one");
        assert_eq!(records[1].1.body, b"two");
        assert_eq!(records[2].1.body, b"three");
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ArchiveReader::open(&dir.path().join("absent.wpr")).unwrap_err();
        assert!(matches!(err, ReplayError::FileNotFound(_)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wpr");
        std::fs::write(&path, b"NOTMAGIC\x01").unwrap();
        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(matches!(err, ReplayError::InvalidFormat(_)));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wpr");
        write_archive(&path, &[b"payload"]);

        // flip one byte inside the first frame payload
        let mut bytes = std::fs::read(&path).unwrap();
        let target = FILE_HEADER_SIZE + 4 + 10;
        bytes[target] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        let err = reader.records().next().unwrap().unwrap_err();
        assert!(matches!(err, ReplayError::CorruptedData { .. }));
    }

    #[test]
    fn test_identity_matches_helper() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wpr");
        write_archive(&path, &[b"x"]);

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.identity(), crate::archive::archive_identity(&path).unwrap());
    }
}
