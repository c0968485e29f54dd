//! Reassembly of chunked file writes.
//!
//! A write arrives as `file.write.start`, any number of base64
//! `file.write.chunk`s, then `file.write.end`, at which point the payload
//! is decoded and written to disk. Pending writes belong to a single
//! connection and are discarded with it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// Largest decoded payload accepted for one write.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No pending file write with id {0}")]
    UnknownId(String),
    #[error("File write {id} exceeds {limit} bytes")]
    TooLarge { id: String, limit: usize },
    #[error("File write {id} has invalid base64 data: {source}")]
    InvalidBase64 {
        id: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct PendingWrite {
    path: PathBuf,
    chunks: Vec<String>,
    encoded_len: usize,
}

impl PendingWrite {
    fn decode(&self, id: &str) -> Result<Vec<u8>, UploadError> {
        // Senders either split one base64 string at arbitrary points or
        // encode each chunk separately; accept both.
        let joined = self.chunks.concat();
        if let Ok(bytes) = BASE64.decode(joined.as_bytes()) {
            return Ok(bytes);
        }
        let mut bytes = Vec::with_capacity(self.encoded_len / 4 * 3);
        for chunk in &self.chunks {
            BASE64
                .decode_vec(chunk.as_bytes(), &mut bytes)
                .map_err(|source| UploadError::InvalidBase64 {
                    id: id.to_string(),
                    source,
                })?;
        }
        Ok(bytes)
    }
}

/// In-flight file writes for one connection, keyed by write id.
#[derive(Debug)]
pub struct FileWrites {
    working_dir: PathBuf,
    pending: HashMap<String, PendingWrite>,
}

impl FileWrites {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            pending: HashMap::new(),
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Target path for `path`; relative paths land under the working
    /// directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Open a write. Restarting an id discards what it had buffered.
    pub fn begin(&mut self, id: &str, path: &Path) {
        let target = self.resolve(path);
        tracing::debug!(id, path = %target.display(), "File write started");
        let previous = self.pending.insert(
            id.to_string(),
            PendingWrite {
                path: target,
                chunks: Vec::new(),
                encoded_len: 0,
            },
        );
        if previous.is_some() {
            tracing::warn!(id, "File write restarted, earlier chunks discarded");
        }
    }

    /// Buffer one base64 chunk.
    ///
    /// # Errors
    /// Returns error if the id is unknown or the payload grows past
    /// [`MAX_UPLOAD_BYTES`]; an oversized write is abandoned.
    pub fn append(&mut self, id: &str, data: &str) -> Result<(), UploadError> {
        let pending = self
            .pending
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownId(id.to_string()))?;
        let encoded_len = pending.encoded_len + data.len();
        if encoded_len / 4 * 3 > MAX_UPLOAD_BYTES {
            self.pending.remove(id);
            return Err(UploadError::TooLarge {
                id: id.to_string(),
                limit: MAX_UPLOAD_BYTES,
            });
        }
        pending.encoded_len = encoded_len;
        pending.chunks.push(data.to_string());
        Ok(())
    }

    /// Decode the buffered payload and write it, creating parent
    /// directories. Returns the path written.
    ///
    /// # Errors
    /// Returns error if the id is unknown, the data is not base64, or the
    /// filesystem write fails.
    pub async fn finish(&mut self, id: &str) -> Result<PathBuf, UploadError> {
        let pending = self
            .pending
            .remove(id)
            .ok_or_else(|| UploadError::UnknownId(id.to_string()))?;
        let bytes = pending.decode(id)?;
        let path = pending.path;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| UploadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| UploadError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::info!(id, path = %path.display(), bytes = bytes.len(), "File written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    use super::*;

    #[tokio::test]
    async fn test_relative_path_with_new_parents() {
        let dir = TempDir::new().unwrap();
        let mut writes = FileWrites::new(dir.path());
        writes.begin("w1", Path::new("nested/deeper/hello.txt"));
        assert_ok!(writes.append("w1", &BASE64.encode("hello ")));
        assert_ok!(writes.append("w1", &BASE64.encode("world")));
        let path = assert_ok!(writes.finish("w1").await);

        assert_eq!(path, dir.path().join("nested/deeper/hello.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello world");
        assert_eq!(writes.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_split_base64_string() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.bin");
        let encoded = BASE64.encode([0u8, 1, 2, 3, 254, 255, 7]);
        let (head, tail) = encoded.split_at(5);

        let mut writes = FileWrites::new("/unused");
        writes.begin("w1", &target);
        writes.append("w1", head).unwrap();
        writes.append("w1", tail).unwrap();
        writes.finish("w1").await.unwrap();

        assert_eq!(std::fs::read(target).unwrap(), [0u8, 1, 2, 3, 254, 255, 7]);
    }

    #[tokio::test]
    async fn test_empty_write_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut writes = FileWrites::new(dir.path());
        writes.begin("w1", Path::new("empty"));
        let path = writes.finish("w1").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_writes() {
        let mut writes = FileWrites::new("/tmp");
        assert!(matches!(writes.append("nope", "AA=="), Err(UploadError::UnknownId(_))));
        assert!(matches!(writes.finish("nope").await, Err(UploadError::UnknownId(_))));

        writes.begin("bad", Path::new("x"));
        writes.append("bad", "!!!not base64!!!").unwrap();
        assert!(matches!(
            writes.finish("bad").await,
            Err(UploadError::InvalidBase64 { .. })
        ));
    }

    #[test]
    fn test_oversized_write_is_abandoned() {
        let mut writes = FileWrites::new("/tmp");
        writes.begin("big", Path::new("big.bin"));
        let chunk = "A".repeat(MAX_UPLOAD_BYTES / 3 * 4 / 2 + 4);
        writes.append("big", &chunk).unwrap();
        assert!(matches!(
            writes.append("big", &chunk),
            Err(UploadError::TooLarge { .. })
        ));
        assert_eq!(writes.pending_count(), 0);
    }
}
